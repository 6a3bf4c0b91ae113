// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session manager: bounded submission queue, bounded running set, bounded
//! FIFO archive, all guarded by one coarse mutex.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{info, warn, Instrument};

use crate::error::{ErrorCode, LabError};
use crate::event::SessionNotification;
use crate::logrec::LogRecord;
use crate::session::runner::{SessionDeps, SessionRunner};
use crate::session::{SessionCell, SessionConfigSpec, SessionDetail, SessionId};

/// Capacity knobs, all enforced.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub running_capacity: usize,
    pub queue_capacity: usize,
    pub archive_capacity: usize,
}

impl ManagerSettings {
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            running_capacity: config.running_session_capacity,
            queue_capacity: config.session_queue_capacity,
            archive_capacity: config.archived_sessions_capacity,
        }
    }
}

/// Result of a successful `add`.
pub struct AddResult {
    /// Snapshot taken at submission.
    pub detail: SessionDetail,
    /// Resolves with the final snapshot when the session finishes.
    pub done: oneshot::Receiver<SessionDetail>,
}

/// Status/name regex filter for `list`; invalid patterns are logged and
/// become permissive.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status_regex: Option<String>,
    pub name_regex: Option<String>,
}

impl SessionFilter {
    fn compile(pattern: Option<&str>) -> Option<Regex> {
        let pattern = pattern?;
        match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(err) => {
                warn!(%pattern, %err, "invalid session filter pattern ignored");
                None
            }
        }
    }

    pub fn matches(&self, detail: &SessionDetail) -> bool {
        let status_ok = Self::compile(self.status_regex.as_deref())
            .map(|r| r.is_match(detail.status.as_str()))
            .unwrap_or(true);
        let name_ok = Self::compile(self.name_regex.as_deref())
            .map(|r| r.is_match(&detail.name))
            .unwrap_or(true);
        status_ok && name_ok
    }
}

#[derive(Default)]
struct ManagerState {
    queue: VecDeque<Arc<SessionCell>>,
    running: HashMap<SessionId, Arc<SessionCell>>,
    archive: IndexMap<SessionId, SessionDetail>,
}

/// Owns every session in the process.
pub struct SessionManager {
    settings: ManagerSettings,
    deps: Arc<SessionDeps>,
    state: Mutex<ManagerState>,
    tracker: TaskTracker,
    /// Handle to ourselves for the completion callbacks of spawned runners.
    weak: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(settings: ManagerSettings, deps: Arc<SessionDeps>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            settings,
            deps,
            state: Mutex::new(ManagerState::default()),
            tracker: TaskTracker::new(),
            weak: weak.clone(),
        })
    }

    /// Submit a session. Plugin specs are validated here so bad configs
    /// fail before touching the queue.
    pub fn add(&self, config: SessionConfigSpec) -> anyhow::Result<AddResult> {
        self.deps.plugins.check_specs(&config.plugins)?;

        let mut state = self.state.lock();
        if state.queue.len() >= self.settings.queue_capacity {
            return Err(LabError::new(
                ErrorCode::QueueFull,
                format!("session queue is at capacity ({})", self.settings.queue_capacity),
            )
            .into());
        }

        let (cell, done) = SessionCell::new(config, self.deps.clock.now_ms());
        let detail = cell.detail();
        info!(session_id = %cell.id(), name = %cell.info.name, "session submitted");
        self.deps.recorder.add_log_record(
            LogRecord::info("session", "session submitted").for_session(cell.id().clone()),
        );
        state.queue.push_back(cell);
        self.admit_locked(&mut state);

        Ok(AddResult { detail, done })
    }

    /// Pop queued sessions into free running slots and spawn their runners.
    fn admit_locked(&self, state: &mut ManagerState) {
        while state.running.len() < self.settings.running_capacity {
            let Some(manager) = self.weak.upgrade() else { break };
            let Some(cell) = state.queue.pop_front() else { break };
            let id = cell.id().clone();
            state.running.insert(id.clone(), Arc::clone(&cell));

            let deps = Arc::clone(&self.deps);
            let span = tracing::info_span!("session-runner", session_id = %id);
            self.tracker.spawn(
                async move {
                    let detail = SessionRunner::new(Arc::clone(&cell), deps).run().await;
                    manager.finish(&cell, detail);
                }
                .instrument(span),
            );
        }
    }

    /// Completion callback: archive, resolve the final-result future, and
    /// re-run admission.
    fn finish(&self, cell: &Arc<SessionCell>, detail: SessionDetail) {
        {
            let mut state = self.state.lock();
            state.running.remove(cell.id());
            if !cell.config.remove_after_finish {
                state.archive.insert(cell.id().clone(), detail.clone());
                while state.archive.len() > self.settings.archive_capacity {
                    if state.archive.shift_remove_index(0).is_none() {
                        break;
                    }
                }
            }
            self.admit_locked(&mut state);
        }
        if let Some(done) = cell.take_done_tx() {
            let _ = done.send(detail);
        }
    }

    /// Look up a session: archive first, then running, then queued.
    pub fn get(&self, id: &SessionId) -> anyhow::Result<SessionDetail> {
        let state = self.state.lock();
        if let Some(detail) = state.archive.get(id) {
            return Ok(detail.clone());
        }
        if let Some(cell) = state.running.get(id) {
            return Ok(cell.detail());
        }
        if let Some(cell) = state.queue.iter().find(|c| c.id() == id) {
            return Ok(cell.detail());
        }
        Err(LabError::new(ErrorCode::SessionNotFound, format!("no session {id}")).into())
    }

    pub fn list(&self, filter: Option<&SessionFilter>) -> Vec<SessionDetail> {
        let state = self.state.lock();
        let mut details: Vec<SessionDetail> = state
            .archive
            .values()
            .cloned()
            .chain(state.running.values().map(|c| c.detail()))
            .chain(state.queue.iter().map(|c| c.detail()))
            .collect();
        if let Some(filter) = filter {
            details.retain(|d| filter.matches(d));
        }
        details.sort_by_key(|d| d.created_ms);
        details
    }

    /// Route a notification; `Ok(false)` means the session no longer
    /// accepts deliveries.
    pub fn notify(
        &self,
        id: &SessionId,
        notification: SessionNotification,
    ) -> anyhow::Result<bool> {
        let cell = {
            let state = self.state.lock();
            state
                .running
                .get(id)
                .cloned()
                .or_else(|| state.queue.iter().find(|c| c.id() == id).cloned())
        };
        match cell {
            Some(cell) => Ok(cell.notify(notification)),
            None => {
                let state = self.state.lock();
                if state.archive.contains_key(id) {
                    Ok(false)
                } else {
                    Err(LabError::new(ErrorCode::SessionNotFound, format!("no session {id}"))
                        .into())
                }
            }
        }
    }

    /// Idempotent abort; aborting a finished session is a successful no-op.
    pub fn abort(&self, id: &SessionId) -> anyhow::Result<()> {
        let cell = {
            let state = self.state.lock();
            state
                .running
                .get(id)
                .cloned()
                .or_else(|| state.queue.iter().find(|c| c.id() == id).cloned())
        };
        match cell {
            Some(cell) => {
                info!(session_id = %id, "session abort requested");
                cell.abort();
                Ok(())
            }
            None => {
                let state = self.state.lock();
                if state.archive.contains_key(id) {
                    Ok(())
                } else {
                    Err(LabError::new(ErrorCode::SessionNotFound, format!("no session {id}"))
                        .into())
                }
            }
        }
    }

    /// Any session still queued or running?
    pub fn has_unarchived(&self) -> bool {
        let state = self.state.lock();
        !state.queue.is_empty() || !state.running.is_empty()
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.queue.len(), state.running.len(), state.archive.len())
    }

    /// Wait for every admitted session to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
