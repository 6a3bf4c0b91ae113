// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! External interface shim: translates request/response operations into
//! core calls. Transport adapters (gRPC, HTTP) sit on top of this layer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{ErrorCode, LabError};
use crate::event::SessionNotification;
use crate::logrec::{LogRecord, LogRecorder};
use crate::session::manager::{AddResult, SessionFilter, SessionManager};
use crate::session::{SessionConfigSpec, SessionDetail, SessionId};

/// Requested field paths. Responses may carry more fields than requested;
/// the mask is accepted for wire compatibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMask {
    pub paths: Vec<String>,
}

/// Request/response surface exposed to transports.
pub struct LabApi {
    sessions: Arc<SessionManager>,
    recorder: Arc<LogRecorder>,
}

impl LabApi {
    pub fn new(sessions: Arc<SessionManager>, recorder: Arc<LogRecorder>) -> Self {
        Self { sessions, recorder }
    }

    /// Synchronous submission; fails `QUEUE_FULL` past queue capacity.
    pub fn create_session(&self, config: SessionConfigSpec) -> anyhow::Result<SessionDetail> {
        Ok(self.sessions.add(config)?.detail)
    }

    /// Submission that also hands back the final-result future.
    pub fn create_session_tracked(&self, config: SessionConfigSpec) -> anyhow::Result<AddResult> {
        self.sessions.add(config)
    }

    pub fn get_session(
        &self,
        id: &SessionId,
        _mask: Option<&FieldMask>,
    ) -> anyhow::Result<SessionDetail> {
        self.sessions.get(id)
    }

    pub fn list_sessions(
        &self,
        _mask: Option<&FieldMask>,
        filter: Option<&SessionFilter>,
    ) -> Vec<SessionDetail> {
        self.sessions.list(filter)
    }

    /// Returns `false` when the session no longer accepts notifications.
    pub fn notify_session(
        &self,
        id: &SessionId,
        notification: SessionNotification,
    ) -> anyhow::Result<bool> {
        self.sessions.notify(id, notification)
    }

    /// Idempotent; aborting a finished session succeeds without effect.
    pub fn abort_session(&self, id: &SessionId) -> anyhow::Result<()> {
        self.sessions.abort(id)
    }

    /// Stream of server log records. Records published while no stream is
    /// open are dropped.
    pub fn subscribe_log_records(&self) -> BroadcastStream<LogRecord> {
        BroadcastStream::new(self.recorder.subscribe())
    }

    pub fn add_log_record(&self, record: LogRecord) {
        self.recorder.add_log_record(record);
    }

    // Declared by the session service but intentionally not supported,
    // matching the upstream contract.

    pub fn open_job(&self, _session_id: &SessionId) -> anyhow::Result<()> {
        Err(LabError::new(ErrorCode::Unimplemented, "open_job is not supported").into())
    }

    pub fn kill_job(&self, _job_id: &str) -> anyhow::Result<()> {
        Err(LabError::new(ErrorCode::Unimplemented, "kill_job is not supported").into())
    }

    pub fn upsert_device_temp_required_dimensions(
        &self,
        _device_id: &str,
    ) -> anyhow::Result<()> {
        Err(LabError::new(
            ErrorCode::Unimplemented,
            "upsert_device_temp_required_dimensions is not supported",
        )
        .into())
    }
}

#[cfg(test)]
#[path = "api_tests.rs"]
mod tests;
