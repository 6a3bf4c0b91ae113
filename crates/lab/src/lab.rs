// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-scoped container: every subsystem is wired here at boot and
//! torn down during drain. Subsystems receive references, never globals.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::LabApi;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::device::manager::{DeviceManager, DeviceManagerBuilder};
use crate::device::DeviceArbiter;
use crate::dispatch::DeviceJobClient;
use crate::driver::DriverRegistry;
use crate::job::SpecJobCreator;
use crate::logrec::LogRecorder;
use crate::persist::{FilePersister, SessionPersister};
use crate::plugin::PluginRegistry;
use crate::session::gate::StartedRunningGate;
use crate::session::manager::{ManagerSettings, SessionManager};
use crate::session::runner::SessionDeps;

/// A fully wired devlab process.
pub struct Lab {
    pub api: LabApi,
    pub sessions: Arc<SessionManager>,
    pub devices: Arc<DeviceManager>,
    pub recorder: Arc<LogRecorder>,
    pub gate: Arc<StartedRunningGate>,
    pub shutdown: CancellationToken,
}

impl Lab {
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        LabBuilder::new(config).start().await
    }

    pub fn builder(config: Config) -> LabBuilder {
        LabBuilder::new(config)
    }

    /// Graceful drain: wait (bounded) for unarchived sessions, then stop
    /// the device layer and session tasks.
    pub async fn drain(&self, deadline: Duration) {
        let wait = async {
            while self.sessions.has_unarchived() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            info!("drain deadline reached with sessions still unarchived");
        }
        self.shutdown.cancel();
        self.sessions.drain().await;
        self.devices.drain().await;
    }
}

/// Explicit wiring for [`Lab`]; tests swap collaborators here.
pub struct LabBuilder {
    config: Config,
    plugins: PluginRegistry,
    drivers: DriverRegistry,
    persister: Option<Arc<dyn SessionPersister>>,
    arbiter: Option<Arc<dyn DeviceArbiter>>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl LabBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            plugins: PluginRegistry::new(),
            drivers: DriverRegistry::with_builtins(),
            persister: None,
            arbiter: None,
            clock: Arc::new(SystemClock),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn persister(mut self, persister: Arc<dyn SessionPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    pub fn arbiter(mut self, arbiter: Arc<dyn DeviceArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub async fn start(self) -> anyhow::Result<Lab> {
        let config = self.config;
        config.validate()?;
        let mode = config.mode_enum()?;
        let base_dir = config.base_dir();
        std::fs::create_dir_all(&base_dir)?;

        let recorder = Arc::new(LogRecorder::new());
        let server_start_ms = self.clock.now_ms();

        let mut devices_builder = DeviceManagerBuilder::from_config(&config, mode)
            .shutdown(self.shutdown.child_token());
        if let Some(arbiter) = self.arbiter {
            devices_builder = devices_builder.arbiter(arbiter);
        }
        let devices = devices_builder.start().await?;

        let drivers = Arc::new(self.drivers);
        let job_client = DeviceJobClient::new(
            Arc::clone(&devices),
            drivers,
            mode,
            self.shutdown.child_token(),
        );

        let persister: Arc<dyn SessionPersister> = match self.persister {
            Some(persister) => persister,
            None => Arc::new(FilePersister::new(base_dir.join("state"))?),
        };

        let gate = Arc::new(StartedRunningGate::new(config.max_started_running_sessions));
        let deps = Arc::new(SessionDeps {
            plugins: Arc::new(self.plugins),
            job_creator: Arc::new(SpecJobCreator),
            job_client,
            persister,
            gate: Arc::clone(&gate),
            clock: self.clock,
            device_query: Arc::clone(&devices) as _,
            recorder: Arc::clone(&recorder),
            server_start_ms,
            base_dir,
            mode,
            shutdown: self.shutdown.child_token(),
            job_poll_interval: Duration::from_secs(2),
        });

        let sessions = SessionManager::new(ManagerSettings::from_config(&config), deps);
        let api = LabApi::new(Arc::clone(&sessions), Arc::clone(&recorder));

        info!(mode = mode.as_str(), "devlab wired");
        Ok(Lab {
            api,
            sessions,
            devices,
            recorder,
            gate,
            shutdown: self.shutdown,
        })
    }
}
