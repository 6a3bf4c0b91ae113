// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log record hub: fan-out of server log records to streaming subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::clock::epoch_ms;
use crate::session::SessionId;

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// One log record as shipped to streaming clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl LogRecord {
    pub fn info(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ts_ms: epoch_ms(),
            level: "INFO".to_owned(),
            target: target.into(),
            message: message.into(),
            session_id: None,
        }
    }

    pub fn for_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Broadcast hub for log records.
///
/// Records are dropped when no sink is subscribed; slow subscribers lag
/// and lose the oldest records, never blocking the producer.
pub struct LogRecorder {
    tx: broadcast::Sender<LogRecord>,
}

impl Default for LogRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl LogRecorder {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn add_log_record(&self, record: LogRecord) {
        if self.tx.receiver_count() == 0 {
            return;
        }
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogRecord> {
        self.tx.subscribe()
    }

    pub fn sink_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
#[path = "logrec_tests.rs"]
mod tests;
