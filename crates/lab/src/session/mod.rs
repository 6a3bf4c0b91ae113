// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session model: the client-submitted work package and its shared,
//! registry-owned mutable state.

pub mod gate;
pub mod manager;
pub mod runner;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

use crate::bus::PluginErrorRecord;
use crate::event::SessionNotification;
use crate::job::{JobId, JobSpec, TestResult};
use crate::plugin::PluginSpec;

pub type SessionId = String;

/// Session lifecycle status as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Submitted,
    Running,
    Finished,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
        }
    }
}

/// Identity of a session, embedded in lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
}

/// User-supplied session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfigSpec {
    pub name: String,
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Skip archival entirely; the session is unavailable after it finishes.
    #[serde(default)]
    pub remove_after_finish: bool,
}

/// Point-in-time snapshot of a session, returned by `get`/`list` and moved
/// into the archive on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    pub created_ms: u64,
    pub properties: BTreeMap<String, String>,
    pub plugin_errors: Vec<PluginErrorRecord>,
    pub runner_error: Option<String>,
    pub job_results: BTreeMap<JobId, TestResult>,
    pub gen_dir: Option<String>,
    pub tmp_dir: Option<String>,
}

/// Capacity of the per-session asynchronous notification channel.
const NOTIFY_CHANNEL_CAPACITY: usize = 256;

/// Registry-owned mutable state of one session.
///
/// The manager, the session runner, and the API layer all hold `Arc`s to
/// the same cell; subscribers reference sessions by id and resolve them
/// through the manager, never by pointer.
pub struct SessionCell {
    pub info: SessionInfo,
    pub config: SessionConfigSpec,
    pub created_ms: u64,
    status: Mutex<SessionStatus>,
    properties: Mutex<BTreeMap<String, String>>,
    plugin_errors: Mutex<Vec<PluginErrorRecord>>,
    runner_error: Mutex<Option<String>>,
    job_results: Mutex<BTreeMap<JobId, TestResult>>,
    /// Notifications received while the session is still queued; drained
    /// synchronously when the runner starts.
    cached_notifications: Mutex<Vec<SessionNotification>>,
    /// Live notification channel while the runner accepts deliveries.
    notify_tx: Mutex<Option<mpsc::Sender<SessionNotification>>>,
    /// Payload type names declared by plugins, for decoding diagnostics.
    type_registry: Mutex<BTreeMap<String, String>>,
    gen_dir: Mutex<Option<PathBuf>>,
    tmp_dir: Mutex<Option<PathBuf>>,
    /// Set once `ended` dispatch begins; notifications are refused after.
    notifications_closed: AtomicBool,
    aborted: AtomicBool,
    abort_wake: Notify,
    done_tx: Mutex<Option<oneshot::Sender<SessionDetail>>>,
}

impl SessionCell {
    pub fn new(config: SessionConfigSpec, created_ms: u64) -> (Arc<Self>, oneshot::Receiver<SessionDetail>) {
        let (done_tx, done_rx) = oneshot::channel();
        let cell = Arc::new(Self {
            info: SessionInfo { id: Uuid::new_v4().to_string(), name: config.name.clone() },
            config,
            created_ms,
            status: Mutex::new(SessionStatus::Submitted),
            properties: Mutex::new(BTreeMap::new()),
            plugin_errors: Mutex::new(Vec::new()),
            runner_error: Mutex::new(None),
            job_results: Mutex::new(BTreeMap::new()),
            cached_notifications: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
            type_registry: Mutex::new(BTreeMap::new()),
            gen_dir: Mutex::new(None),
            tmp_dir: Mutex::new(None),
            notifications_closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            abort_wake: Notify::new(),
            done_tx: Mutex::new(Some(done_tx)),
        });
        (cell, done_rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.info.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    pub fn put_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.lock().insert(name.into(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.properties.lock().get(name).cloned()
    }

    pub fn add_plugin_errors(&self, errors: Vec<PluginErrorRecord>) {
        if !errors.is_empty() {
            self.plugin_errors.lock().extend(errors);
        }
    }

    pub fn set_runner_error(&self, message: impl Into<String>) {
        *self.runner_error.lock() = Some(message.into());
    }

    pub fn record_job_result(&self, job_id: JobId, result: TestResult) {
        self.job_results.lock().insert(job_id, result);
    }

    pub fn register_payload_type(&self, name: impl Into<String>, plugin_label: impl Into<String>) {
        self.type_registry.lock().insert(name.into(), plugin_label.into());
    }

    pub fn lookup_payload_type(&self, name: &str) -> Option<String> {
        self.type_registry.lock().get(name).cloned()
    }

    pub fn set_dirs(&self, gen_dir: PathBuf, tmp_dir: PathBuf) {
        *self.gen_dir.lock() = Some(gen_dir);
        *self.tmp_dir.lock() = Some(tmp_dir);
    }

    // -- Notifications ------------------------------------------------------

    /// Queue a notification while the session has not started yet.
    pub fn cache_notification(&self, notification: SessionNotification) {
        self.cached_notifications.lock().push(notification);
    }

    pub fn drain_cached_notifications(&self) -> Vec<SessionNotification> {
        std::mem::take(&mut *self.cached_notifications.lock())
    }

    /// Open the live notification channel; called by the runner at start.
    pub fn open_notifications(&self) -> mpsc::Receiver<SessionNotification> {
        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        *self.notify_tx.lock() = Some(tx);
        rx
    }

    /// Stop accepting notifications; called before `ended` dispatch begins.
    pub fn close_notifications(&self) {
        self.notifications_closed.store(true, Ordering::Release);
        *self.notify_tx.lock() = None;
    }

    /// Deliver a notification. Returns `false` once the runner no longer
    /// accepts deliveries (or the channel is saturated).
    pub fn notify(&self, notification: SessionNotification) -> bool {
        if self.notifications_closed.load(Ordering::Acquire) {
            return false;
        }
        match self.status() {
            SessionStatus::Submitted => {
                self.cache_notification(notification);
                true
            }
            SessionStatus::Running => {
                let tx = self.notify_tx.lock();
                match tx.as_ref() {
                    Some(tx) => match tx.try_send(notification) {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::warn!(session_id = %self.info.id, %err, "notification dropped");
                            false
                        }
                    },
                    // Running but channel not open yet: the runner drains
                    // the cache synchronously before opening the channel.
                    None => {
                        self.cache_notification(notification);
                        true
                    }
                }
            }
            SessionStatus::Finished => false,
        }
    }

    // -- Abort --------------------------------------------------------------

    /// Idempotent abort: records the request and wakes gate/job-loop waits.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            self.put_property("session_aborted", "true");
        }
        self.abort_wake.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub async fn aborted_wait(&self) {
        loop {
            // Register the waiter before checking the flag so an abort
            // landing in between cannot be missed.
            let notified = self.abort_wake.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    // -- Completion ---------------------------------------------------------

    pub fn take_done_tx(&self) -> Option<oneshot::Sender<SessionDetail>> {
        self.done_tx.lock().take()
    }

    pub fn detail(&self) -> SessionDetail {
        SessionDetail {
            id: self.info.id.clone(),
            name: self.info.name.clone(),
            status: self.status(),
            created_ms: self.created_ms,
            properties: self.properties.lock().clone(),
            plugin_errors: self.plugin_errors.lock().clone(),
            runner_error: self.runner_error.lock().clone(),
            job_results: self.job_results.lock().clone(),
            gen_dir: self.gen_dir.lock().as_ref().map(|p| p.display().to_string()),
            tmp_dir: self.tmp_dir.lock().as_ref().map(|p| p.display().to_string()),
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
