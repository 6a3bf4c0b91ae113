// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide started-running gate: bounds how many sessions sit between
//! `started` and `ended`, independently of the running-set capacity.

use std::collections::HashSet;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{ErrorCode, LabError};
use crate::session::{SessionCell, SessionId};

pub struct StartedRunningGate {
    max: usize,
    started: Mutex<HashSet<SessionId>>,
    wake: Notify,
}

impl StartedRunningGate {
    pub fn new(max: usize) -> Self {
        Self { max: max.max(1), started: Mutex::new(HashSet::new()), wake: Notify::new() }
    }

    /// Wait for a free slot between `starting` and `started`.
    ///
    /// An abort while waiting fails with `SESSION_ABORTED_WHEN_QUEUEING`;
    /// the caller terminates the session without emitting `started`.
    pub async fn acquire(&self, cell: &SessionCell) -> anyhow::Result<()> {
        loop {
            if cell.is_aborted() {
                return Err(LabError::new(
                    ErrorCode::SessionAbortedWhenQueueing,
                    format!("session {} aborted while waiting to start", cell.id()),
                )
                .into());
            }

            // Register for wakeups before checking capacity so a release
            // landing in between cannot be missed.
            let notified = self.wake.notified();
            {
                let mut started = self.started.lock();
                if started.len() < self.max {
                    started.insert(cell.id().clone());
                    return Ok(());
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cell.aborted_wait() => {}
            }
        }
    }

    /// Remove the session from the started set and wake waiters.
    pub fn release(&self, id: &SessionId) {
        if self.started.lock().remove(id) {
            self.wake.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.started.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.started.lock().is_empty()
    }
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
