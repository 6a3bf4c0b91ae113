// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Builders and fakes for tests: a fully wired lab with fast timings,
//! recording subscribers, and veto plugins.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::api::LabApi;
use crate::bus::Subscriber;
use crate::clock::SystemClock;
use crate::device::manager::{DeviceManager, DeviceManagerBuilder, NoOpDetector, NoOpDispatcher};
use crate::device::runner::RunnerSettings;
use crate::dispatch::DeviceJobClient;
use crate::driver::DriverRegistry;
use crate::event::{Event, SkipResult, SkipSignal};
use crate::job::{DeviceRequirement, JobSpec, SpecJobCreator};
use crate::logrec::LogRecorder;
use crate::persist::{MemoryPersister, SessionPersister};
use crate::plugin::{CreatedPlugin, PluginContext, PluginFactory, PluginRegistry};
use crate::config::ExecMode;
use crate::session::gate::StartedRunningGate;
use crate::session::manager::{ManagerSettings, SessionManager};
use crate::session::runner::SessionDeps;
use crate::session::SessionConfigSpec;

/// Runner settings tightened for tests.
pub fn fast_runner_settings() -> RunnerSettings {
    RunnerSettings {
        expire_after: Duration::from_secs(60),
        lease_ttl: Duration::from_secs(5),
        check_interval: Duration::from_millis(50),
        idle_sleep: Duration::from_millis(5),
        tear_down_extension: Duration::from_secs(60),
        force_reboot_after_test: false,
        disable_reboot: false,
        prepare_after_test: false,
        handle_failed_device: true,
    }
}

/// A job spec that passes on any no-op device.
pub fn noop_job(name: &str) -> JobSpec {
    JobSpec {
        name: name.to_owned(),
        driver: "no_op_driver".to_owned(),
        decorators: vec![],
        params: BTreeMap::new(),
        files: vec![],
        timeout_ms: 30_000,
        device: DeviceRequirement::default(),
    }
}

/// A job spec that sleeps for `sleep_ms` before passing.
pub fn sleep_job(name: &str, sleep_ms: u64) -> JobSpec {
    let mut spec = noop_job(name);
    spec.driver = "sleep_driver".to_owned();
    spec.params.insert("sleep_ms".to_owned(), sleep_ms.to_string());
    spec
}

/// Session config with N no-op jobs and no plugins.
pub fn noop_session(name: &str, jobs: usize) -> SessionConfigSpec {
    SessionConfigSpec {
        name: name.to_owned(),
        plugins: vec![],
        jobs: (0..jobs).map(|n| noop_job(&format!("{name}-job-{n}"))).collect(),
        options: BTreeMap::new(),
        remove_after_finish: false,
    }
}

/// Subscriber that journals `label:event_name` lines and optionally vetoes
/// one event kind.
pub struct RecordingSubscriber {
    pub label: String,
    pub journal: Arc<Mutex<Vec<String>>>,
    pub veto_on: Option<(&'static str, SkipResult, &'static str)>,
}

impl Subscriber for RecordingSubscriber {
    fn handle(&self, event: &Event) -> anyhow::Result<Option<SkipSignal>> {
        self.journal.lock().push(format!("{}:{}", self.label, event.name()));
        if let Some((veto_event, result, reason)) = self.veto_on {
            if event.name() == veto_event {
                return Ok(Some(SkipSignal::new(result, reason)));
            }
        }
        Ok(None)
    }
}

/// Factory producing a [`RecordingSubscriber`] that shares `journal`.
pub fn recording_factory(journal: Arc<Mutex<Vec<String>>>) -> PluginFactory {
    Arc::new(move |cx: &PluginContext| {
        Ok(CreatedPlugin::subscriber_only(Arc::new(RecordingSubscriber {
            label: cx.label.clone(),
            journal: Arc::clone(&journal),
            veto_on: None,
        }))
        .with_test_messages())
    })
}

/// Factory whose subscriber vetoes the named event.
pub fn veto_factory(
    journal: Arc<Mutex<Vec<String>>>,
    veto_event: &'static str,
    result: SkipResult,
    reason: &'static str,
) -> PluginFactory {
    Arc::new(move |cx: &PluginContext| {
        Ok(CreatedPlugin::subscriber_only(Arc::new(RecordingSubscriber {
            label: cx.label.clone(),
            journal: Arc::clone(&journal),
            veto_on: Some((veto_event, result, reason)),
        })))
    })
}

/// Factory whose subscriber fails on every event.
pub fn failing_factory() -> PluginFactory {
    struct AlwaysFails;
    impl Subscriber for AlwaysFails {
        fn handle(&self, event: &Event) -> anyhow::Result<Option<SkipSignal>> {
            anyhow::bail!("handler failed on {}", event.name())
        }
    }
    Arc::new(|_cx: &PluginContext| Ok(CreatedPlugin::subscriber_only(Arc::new(AlwaysFails))))
}

/// A wired lab with fast timings and synthetic devices.
pub struct TestLab {
    pub api: LabApi,
    pub sessions: Arc<SessionManager>,
    pub devices: Arc<DeviceManager>,
    pub deps: Arc<SessionDeps>,
    pub shutdown: CancellationToken,
    _base_dir: tempfile::TempDir,
}

pub struct TestLabBuilder {
    running_capacity: usize,
    queue_capacity: usize,
    archive_capacity: usize,
    max_started_running: usize,
    noop_devices: usize,
    plugins: PluginRegistry,
    persister: Option<Arc<dyn SessionPersister>>,
    mode: ExecMode,
}

impl Default for TestLabBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestLabBuilder {
    pub fn new() -> Self {
        Self {
            running_capacity: 4,
            queue_capacity: 16,
            archive_capacity: 16,
            max_started_running: 4,
            noop_devices: 1,
            plugins: PluginRegistry::new(),
            persister: None,
            mode: ExecMode::Lab,
        }
    }

    pub fn running_capacity(mut self, capacity: usize) -> Self {
        self.running_capacity = capacity;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn archive_capacity(mut self, capacity: usize) -> Self {
        self.archive_capacity = capacity;
        self
    }

    pub fn max_started_running(mut self, max: usize) -> Self {
        self.max_started_running = max;
        self
    }

    pub fn noop_devices(mut self, count: usize) -> Self {
        self.noop_devices = count;
        self
    }

    pub fn plugin(mut self, class_name: &str, factory: PluginFactory) -> Self {
        self.plugins.register(class_name, factory);
        self
    }

    pub fn persister(mut self, persister: Arc<dyn SessionPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub async fn start(self) -> anyhow::Result<TestLab> {
        let base_dir = tempfile::tempdir()?;
        let shutdown = CancellationToken::new();

        let mut devices_builder = DeviceManagerBuilder::new(fast_runner_settings())
            .detect_interval(Duration::from_millis(10))
            .shutdown(shutdown.child_token())
            .dispatcher(Arc::new(NoOpDispatcher));
        if self.noop_devices > 0 {
            devices_builder =
                devices_builder.detector(Arc::new(NoOpDetector { count: self.noop_devices }));
        }
        let devices = devices_builder.start().await?;

        let job_client = DeviceJobClient::with_poll_interval(
            Arc::clone(&devices),
            Arc::new(DriverRegistry::with_builtins()),
            self.mode,
            shutdown.child_token(),
            Duration::from_millis(10),
        );

        let persister: Arc<dyn SessionPersister> =
            self.persister.unwrap_or_else(|| Arc::new(MemoryPersister::new()));
        let recorder = Arc::new(LogRecorder::new());
        let clock = Arc::new(SystemClock);

        let deps = Arc::new(SessionDeps {
            plugins: Arc::new(self.plugins),
            job_creator: Arc::new(SpecJobCreator),
            job_client,
            persister,
            gate: Arc::new(StartedRunningGate::new(self.max_started_running)),
            clock,
            device_query: Arc::clone(&devices) as _,
            recorder: Arc::clone(&recorder),
            server_start_ms: crate::clock::epoch_ms(),
            base_dir: base_dir.path().to_path_buf(),
            mode: self.mode,
            shutdown: shutdown.child_token(),
            job_poll_interval: Duration::from_millis(20),
        });

        let settings = ManagerSettings {
            running_capacity: self.running_capacity,
            queue_capacity: self.queue_capacity,
            archive_capacity: self.archive_capacity,
        };
        let sessions = SessionManager::new(settings, Arc::clone(&deps));
        let api = LabApi::new(Arc::clone(&sessions), recorder);

        Ok(TestLab { api, sessions, devices, deps, shutdown, _base_dir: base_dir })
    }
}
