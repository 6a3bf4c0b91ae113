// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session runner: owns one admitted session end-to-end, from environment
//! preparation through plugin load, job execution, and finalization.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::bus::{Direction, EventBus, Scope};
use crate::clock::Clock;
use crate::config::ExecMode;
use crate::device::DeviceQuery;
use crate::dispatch::JobClient;
use crate::event::{Event, SessionNotification};
use crate::job::{Job, JobCreator, JobSpec, StartedJob};
use crate::logrec::{LogRecord, LogRecorder};
use crate::persist::{PersistedSession, PersistedStatus, SessionPersister};
use crate::plugin::{ContextSeed, PluginRegistry, SessionPlugin};
use crate::session::gate::StartedRunningGate;
use crate::session::{SessionCell, SessionDetail, SessionStatus};

/// Collaborators shared by every session runner in the process.
pub struct SessionDeps {
    pub plugins: Arc<PluginRegistry>,
    pub job_creator: Arc<dyn JobCreator>,
    pub job_client: Arc<dyn JobClient>,
    pub persister: Arc<dyn SessionPersister>,
    pub gate: Arc<StartedRunningGate>,
    pub clock: Arc<dyn Clock>,
    pub device_query: Arc<dyn DeviceQuery>,
    pub recorder: Arc<LogRecorder>,
    pub server_start_ms: u64,
    pub base_dir: PathBuf,
    pub mode: ExecMode,
    pub shutdown: CancellationToken,
    /// Gap between job-runner loop iterations.
    pub job_poll_interval: Duration,
}

/// Per-session orchestrator. `run` never panics or escapes: any error is
/// recorded on the final snapshot and `ended` still fires.
pub struct SessionRunner {
    cell: Arc<SessionCell>,
    deps: Arc<SessionDeps>,
}

struct RunnerState {
    plugins: Vec<SessionPlugin>,
    notify_worker: Option<JoinHandle<()>>,
    job_specs: Vec<JobSpec>,
}

impl SessionRunner {
    pub fn new(cell: Arc<SessionCell>, deps: Arc<SessionDeps>) -> Self {
        Self { cell, deps }
    }

    pub async fn run(self) -> SessionDetail {
        let cell = Arc::clone(&self.cell);
        let deps = Arc::clone(&self.deps);
        cell.set_status(SessionStatus::Running);
        deps.recorder.add_log_record(
            LogRecord::info("session", "session running").for_session(cell.id().clone()),
        );

        let persisted = match deps.persister.load(cell.id()) {
            Ok(record) => record,
            Err(err) => {
                warn!(session_id = %cell.id(), error = %format!("{err:#}"), "failed to load persisted session");
                None
            }
        };
        let persisted_status = persisted.as_ref().map(|p| p.status);

        let bus = Arc::new(EventBus::new());
        let mut state = RunnerState {
            plugins: Vec::new(),
            notify_worker: None,
            job_specs: Vec::new(),
        };

        let result = self.drive(&bus, &mut state, persisted).await;

        self.finalize(&bus, state, persisted_status, result).await;
        cell.detail()
    }

    /// Steps 1-9; every error path falls through to `finalize`.
    async fn drive(
        &self,
        bus: &Arc<EventBus>,
        state: &mut RunnerState,
        persisted: Option<PersistedSession>,
    ) -> anyhow::Result<()> {
        let cell = &self.cell;
        let deps = &self.deps;

        if persisted.as_ref().is_some_and(|p| p.status == PersistedStatus::SessionEnded) {
            debug!(session_id = %cell.id(), "session already persisted as ended; nothing to run");
            return Ok(());
        }
        let resumed = persisted
            .as_ref()
            .is_some_and(|p| p.status >= PersistedStatus::SessionStarted);

        // 1. Environment.
        let session_dir = deps.base_dir.join("sessions").join(cell.id());
        let gen_dir = session_dir.join("gen");
        let tmp_dir = session_dir.join("tmp");
        std::fs::create_dir_all(&gen_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;
        cell.set_dirs(gen_dir.clone(), tmp_dir.clone());

        // 2. Plugins.
        let seed = ContextSeed {
            session: cell.info.clone(),
            device_query: Arc::clone(&deps.device_query),
            server_start_ms: deps.server_start_ms,
            gen_dir,
            tmp_dir,
            clock: Arc::clone(&deps.clock),
        };
        for spec in &cell.config.plugins {
            let plugin = deps.plugins.create(spec, &seed)?;
            // 3. Session-scoped type registry from plugin declarations.
            for type_name in &plugin.payload_types {
                cell.register_payload_type(type_name.clone(), plugin.label.clone());
            }
            bus.register(plugin.scope, plugin.label.clone(), Arc::clone(&plugin.subscriber));
            if plugin.subscribe_test_messages {
                bus.register(
                    Scope::TestMessage,
                    plugin.label.clone(),
                    Arc::clone(&plugin.subscriber),
                );
            }
            state.plugins.push(plugin);
        }

        // 4. Jobs: create fresh, or reload from persistence on resume.
        state.job_specs = match &persisted {
            Some(record) if resumed => record.jobs.clone(),
            _ => cell.config.jobs.clone(),
        };
        let jobs = deps.job_creator.create_jobs(cell.id(), &state.job_specs);
        if !resumed {
            self.persist(PersistedStatus::SessionSubmitted, &state.job_specs);
        }

        // 5. Drain notifications cached between admission and start.
        for notification in cell.drain_cached_notifications() {
            self.post_notification(bus, notification);
        }

        // 6. Starting.
        if !resumed {
            let outcome = bus.post(
                &Event::SessionStarting { session: cell.info.clone() },
                Direction::Forward,
            );
            cell.add_plugin_errors(outcome.errors);
        }

        // 7. The started-running gate; an abort here terminates the session.
        deps.gate.acquire(cell).await?;

        // 8. Started.
        if !resumed {
            let outcome = bus.post(
                &Event::SessionStarted { session: cell.info.clone() },
                Direction::Forward,
            );
            cell.add_plugin_errors(outcome.errors);
            self.persist(PersistedStatus::SessionStarted, &state.job_specs);
        }

        // Live notifications: a dedicated worker drains the channel.
        let notify_rx = cell.open_notifications();
        // Anything cached between the first drain and the channel opening
        // is delivered now, still ahead of any channel delivery.
        for notification in cell.drain_cached_notifications() {
            self.post_notification(bus, notification);
        }
        state.notify_worker = Some(self.spawn_notify_worker(bus, notify_rx));

        // 9. Run all jobs.
        self.job_loop(bus, jobs).await
    }

    /// The always-runs tail: close notifications, emit `ended`, persist,
    /// close plugins, release the gate slot.
    async fn finalize(
        &self,
        bus: &Arc<EventBus>,
        state: RunnerState,
        persisted_status: Option<PersistedStatus>,
        result: anyhow::Result<()>,
    ) {
        let cell = &self.cell;
        let deps = &self.deps;

        let error_message = result.err().map(|err| format!("{err:#}"));
        if let Some(message) = &error_message {
            warn!(session_id = %cell.id(), error = %message, "session runner failed");
            cell.set_runner_error(message.clone());
        }

        // Notifications delivered before `ended` must land before `ended`:
        // stop admission, then drain the worker.
        cell.close_notifications();
        if let Some(worker) = state.notify_worker {
            let _ = worker.await;
        }

        if persisted_status != Some(PersistedStatus::SessionEnded) {
            let outcome = bus.post(
                &Event::SessionEnded {
                    session: cell.info.clone(),
                    error: error_message.clone(),
                },
                Direction::Reverse,
            );
            cell.add_plugin_errors(outcome.errors);
        }

        cell.set_status(SessionStatus::Finished);
        self.persist(PersistedStatus::SessionEnded, &state.job_specs);

        // Close plugin resources in reverse registration order, matching
        // the `ended` fan-out.
        for plugin in state.plugins.iter().rev() {
            plugin.close().await;
        }

        deps.gate.release(cell.id());
        deps.recorder.add_log_record(
            LogRecord::info("session", "session finished").for_session(cell.id().clone()),
        );
        info!(session_id = %cell.id(), "session finished");
    }

    /// Job-runner loop: poll new jobs, start them, kill on abort, finish
    /// when every started job is done.
    async fn job_loop(&self, bus: &Arc<EventBus>, jobs: Vec<Arc<Job>>) -> anyhow::Result<()> {
        let cell = &self.cell;
        let deps = &self.deps;

        let mut pending: Vec<Arc<Job>> = jobs;
        let mut started: Vec<StartedJob> = Vec::new();
        let mut killed = false;

        loop {
            // Poll newly-added jobs while polling is still enabled.
            if !cell.is_aborted() {
                for job in pending.drain(..) {
                    match deps.job_client.start_job(cell, job, Arc::clone(bus)) {
                        Ok(started_job) => started.push(started_job),
                        Err(err) => {
                            self.kill_started(&started);
                            return Err(err.context("failed to start job"));
                        }
                    }
                }
            }

            if cell.is_aborted() && !killed {
                killed = true;
                pending.clear();
                self.kill_started(&started);
            }

            if pending.is_empty() && started.iter().all(|s| s.job.is_done()) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(deps.job_poll_interval) => {}
                _ = cell.aborted_wait(), if !killed => {}
                _ = deps.shutdown.cancelled() => {
                    self.kill_started(&started);
                    anyhow::bail!("process shutting down");
                }
            }
        }
        Ok(())
    }

    fn kill_started(&self, started: &[StartedJob]) {
        for job in started {
            self.deps.job_client.kill_job(&job.job.id);
        }
    }

    fn spawn_notify_worker(
        &self,
        bus: &Arc<EventBus>,
        mut rx: tokio::sync::mpsc::Receiver<SessionNotification>,
    ) -> JoinHandle<()> {
        let cell = Arc::clone(&self.cell);
        let bus = Arc::clone(bus);
        let span = tracing::info_span!("session-notifier", session_id = %cell.id());
        tokio::spawn(
            async move {
                while let Some(notification) = rx.recv().await {
                    let event = Event::SessionNotification {
                        session: cell.info.clone(),
                        notification: notification.clone(),
                    };
                    let outcome = match &notification.plugin_label {
                        Some(label) => bus.post_to_label(&event, Direction::Forward, label),
                        None => bus.post(&event, Direction::Forward),
                    };
                    cell.add_plugin_errors(outcome.errors);
                    if let Some(type_name) = &notification.type_name {
                        if cell.lookup_payload_type(type_name).is_none() {
                            debug!(%type_name, "notification payload type not in session registry");
                        }
                    }
                }
            }
            .instrument(span),
        )
    }

    /// Synchronous delivery used for the cached backlog.
    fn post_notification(&self, bus: &Arc<EventBus>, notification: SessionNotification) {
        let event = Event::SessionNotification {
            session: self.cell.info.clone(),
            notification: notification.clone(),
        };
        let outcome = match &notification.plugin_label {
            Some(label) => bus.post_to_label(&event, Direction::Forward, label),
            None => bus.post(&event, Direction::Forward),
        };
        self.cell.add_plugin_errors(outcome.errors);
    }

    fn persist(&self, status: PersistedStatus, job_specs: &[JobSpec]) {
        let record = PersistedSession {
            status,
            snapshot: self.cell.detail(),
            jobs: job_specs.to_vec(),
        };
        if let Err(err) = self.deps.persister.save(&record) {
            warn!(session_id = %self.cell.id(), error = %format!("{err:#}"), "failed to persist session");
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
