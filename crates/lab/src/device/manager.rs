// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device manager: polls detectors, classifies observations through the
//! dispatcher DAG, and owns the table of live device runners.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, ExecMode};
use crate::device::runner::{spawn_runner, DeviceSignal, Reservation, RunnerHandle, RunnerSettings};
use crate::device::{
    Device, DeviceAdapter, DeviceArbiter, DeviceId, DeviceQuery, DeviceSnapshot, DeviceType,
    FailedAdapter, LocalArbiter, NoOpAdapter,
};
use crate::job::{Allocation, DeviceRequirement, Job};

/// One identifier as seen by one detector, with detector-specific
/// attributes.
#[derive(Debug, Clone)]
pub struct DeviceObservation {
    pub id: DeviceId,
    pub detector: String,
    pub attributes: BTreeMap<String, String>,
}

/// A source of device observations.
///
/// The precondition is evaluated once at startup; detectors whose
/// precondition fails are dropped with a warning.
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    fn precondition(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    fn detect(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<DeviceObservation>>> + Send + '_>>;
}

/// Maps an observation (plus upstream dispatcher verdicts) to a device
/// class. Dispatchers form a DAG via [`Dispatcher::depends_on`] and run in
/// topologically-sorted order; a downstream verdict refines an upstream
/// one.
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    fn dispatch(
        &self,
        observation: &DeviceObservation,
        upstream: &BTreeMap<String, DeviceType>,
    ) -> Option<DeviceType>;
}

/// Emits `noop-<n>` synthetic device ids.
pub struct NoOpDetector {
    pub count: usize,
}

impl Detector for NoOpDetector {
    fn name(&self) -> &'static str {
        "no_op_detector"
    }

    fn precondition(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn detect(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<DeviceObservation>>> + Send + '_>> {
        let count = self.count;
        Box::pin(async move {
            Ok((0..count)
                .map(|n| DeviceObservation {
                    id: format!("noop-{n}"),
                    detector: "no_op_detector".to_owned(),
                    attributes: BTreeMap::from([(
                        "synthetic".to_owned(),
                        "true".to_owned(),
                    )]),
                })
                .collect())
        })
    }
}

/// Observes serials through `adb devices`.
pub struct AdbDetector;

impl Detector for AdbDetector {
    fn name(&self) -> &'static str {
        "adb_detector"
    }

    fn precondition(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async {
            let output = tokio::process::Command::new("adb")
                .arg("version")
                .output()
                .await
                .map_err(|err| anyhow::anyhow!("adb not runnable: {err}"))?;
            anyhow::ensure!(output.status.success(), "adb version exited nonzero");
            Ok(())
        })
    }

    fn detect(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<DeviceObservation>>> + Send + '_>> {
        Box::pin(async {
            let output = tokio::process::Command::new("adb").arg("devices").output().await?;
            anyhow::ensure!(output.status.success(), "adb devices exited nonzero");
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(parse_adb_devices(&stdout))
        })
    }
}

/// Parse `adb devices` output into observations; only `device`-state
/// serials count as observed.
pub fn parse_adb_devices(stdout: &str) -> Vec<DeviceObservation> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            if state != "device" {
                return None;
            }
            Some(DeviceObservation {
                id: serial.to_owned(),
                detector: "adb_detector".to_owned(),
                attributes: BTreeMap::new(),
            })
        })
        .collect()
}

/// Classifies synthetic ids.
pub struct NoOpDispatcher;

impl Dispatcher for NoOpDispatcher {
    fn name(&self) -> &'static str {
        "no_op_dispatcher"
    }

    fn dispatch(
        &self,
        observation: &DeviceObservation,
        _upstream: &BTreeMap<String, DeviceType>,
    ) -> Option<DeviceType> {
        observation.id.starts_with("noop-").then_some(DeviceType::NoOp)
    }
}

/// Classifies adb serials as real hardware.
pub struct AdbRealDispatcher;

impl Dispatcher for AdbRealDispatcher {
    fn name(&self) -> &'static str {
        "android_real_dispatcher"
    }

    fn dispatch(
        &self,
        observation: &DeviceObservation,
        _upstream: &BTreeMap<String, DeviceType>,
    ) -> Option<DeviceType> {
        (observation.detector == "adb_detector").then_some(DeviceType::AndroidReal)
    }
}

/// Refines adb observations whose serials look like local emulators.
pub struct EmulatorDispatcher;

impl Dispatcher for EmulatorDispatcher {
    fn name(&self) -> &'static str {
        "android_emulator_dispatcher"
    }

    fn depends_on(&self) -> Vec<String> {
        vec!["android_real_dispatcher".to_owned()]
    }

    fn dispatch(
        &self,
        observation: &DeviceObservation,
        upstream: &BTreeMap<String, DeviceType>,
    ) -> Option<DeviceType> {
        let saw_real = upstream.get("android_real_dispatcher") == Some(&DeviceType::AndroidReal);
        (saw_real && observation.id.starts_with("emulator-"))
            .then_some(DeviceType::AndroidEmulator)
    }
}

/// Wrapper declaring its inner dispatcher downstream of every named
/// dispatcher; used for dispatchers registered as dependencies-of-all.
pub struct AfterAll {
    inner: Arc<dyn Dispatcher>,
    upstream: Vec<String>,
}

impl Dispatcher for AfterAll {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn depends_on(&self) -> Vec<String> {
        self.upstream.clone()
    }

    fn dispatch(
        &self,
        observation: &DeviceObservation,
        upstream: &BTreeMap<String, DeviceType>,
    ) -> Option<DeviceType> {
        self.inner.dispatch(observation, upstream)
    }
}

/// Kahn's algorithm over dispatcher dependency edges. Edges naming unknown
/// dispatchers are ignored with a warning; cycles are an error.
pub fn topo_sort(
    dispatchers: Vec<Arc<dyn Dispatcher>>,
) -> anyhow::Result<Vec<Arc<dyn Dispatcher>>> {
    let names: HashSet<String> =
        dispatchers.iter().map(|d| d.name().to_owned()).collect();

    let mut in_degree: HashMap<String, usize> = HashMap::new();
    let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
    for dispatcher in &dispatchers {
        let name = dispatcher.name().to_owned();
        in_degree.entry(name.clone()).or_insert(0);
        for dep in dispatcher.depends_on() {
            if !names.contains(&dep) {
                warn!(dispatcher = %name, missing = %dep, "dependency on unknown dispatcher ignored");
                continue;
            }
            *in_degree.entry(name.clone()).or_insert(0) += 1;
            downstream.entry(dep).or_default().push(name.clone());
        }
    }

    let mut by_name: HashMap<String, Arc<dyn Dispatcher>> = dispatchers
        .into_iter()
        .map(|d| (d.name().to_owned(), d))
        .collect();

    // Seed with in-degree-zero nodes in registration order for stability.
    let mut ready: Vec<String> = Vec::new();
    let mut order: Vec<String> = by_name.keys().cloned().collect();
    order.sort();
    for name in &order {
        if in_degree.get(name).copied().unwrap_or(0) == 0 {
            ready.push(name.clone());
        }
    }

    let mut sorted = Vec::new();
    while let Some(name) = ready.pop() {
        if let Some(dispatcher) = by_name.remove(&name) {
            sorted.push(dispatcher);
        }
        for next in downstream.remove(&name).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(&next) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push(next);
                }
            }
        }
    }

    if !by_name.is_empty() {
        let stuck: Vec<String> = by_name.keys().cloned().collect();
        anyhow::bail!("dispatcher dependency cycle involving: {}", stuck.join(", "));
    }
    Ok(sorted)
}

/// Detector set for the configured profile.
///
/// Local mode always hosts at least one synthetic device so a
/// client-embedded runtime works with zero hardware.
pub fn build_detectors(config: &Config, mode: ExecMode) -> Vec<Arc<dyn Detector>> {
    let mut detectors: Vec<Arc<dyn Detector>> = Vec::new();
    let noop_count = match mode {
        ExecMode::Local => config.no_op_device_num.max(1),
        ExecMode::Lab => config.no_op_device_num,
    };
    if noop_count > 0 {
        detectors.push(Arc::new(NoOpDetector { count: noop_count }));
    }
    if config.detect_adb_device {
        detectors.push(Arc::new(AdbDetector));
    }
    detectors
}

/// Dispatcher set for the configured profile.
pub fn build_dispatchers(config: &Config, mode: ExecMode) -> Vec<Arc<dyn Dispatcher>> {
    let mut dispatchers: Vec<Arc<dyn Dispatcher>> = Vec::new();
    if config.no_op_device_num > 0 || mode == ExecMode::Local {
        dispatchers.push(Arc::new(NoOpDispatcher));
    }
    if config.detect_adb_device {
        dispatchers.push(Arc::new(AdbRealDispatcher));
        if config.enable_emulator_detection {
            dispatchers.push(Arc::new(EmulatorDispatcher));
        }
    }
    dispatchers
}

/// Builder for [`DeviceManager`].
pub struct DeviceManagerBuilder {
    detectors: Vec<Arc<dyn Detector>>,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    adapters: HashMap<DeviceType, Arc<dyn DeviceAdapter>>,
    arbiter: Arc<dyn DeviceArbiter>,
    settings: RunnerSettings,
    detect_interval: Duration,
    shutdown: CancellationToken,
}

impl DeviceManagerBuilder {
    pub fn new(settings: RunnerSettings) -> Self {
        let mut adapters: HashMap<DeviceType, Arc<dyn DeviceAdapter>> = HashMap::new();
        adapters.insert(DeviceType::NoOp, Arc::new(NoOpAdapter));
        Self {
            detectors: Vec::new(),
            dispatchers: Vec::new(),
            adapters,
            arbiter: Arc::new(LocalArbiter),
            settings,
            detect_interval: Duration::from_secs(5),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &Config, mode: ExecMode) -> Self {
        let mut builder = Self::new(RunnerSettings::from_config(config));
        builder.detectors = build_detectors(config, mode);
        builder.dispatchers = build_dispatchers(config, mode);
        builder.detect_interval = config.detect_device_interval();
        builder
    }

    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    /// Insert a dispatcher downstream of every dispatcher added so far.
    pub fn dispatcher_after_all(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let upstream = self.dispatchers.iter().map(|d| d.name().to_owned()).collect();
        self.dispatchers.push(Arc::new(AfterAll { inner: dispatcher, upstream }));
        self
    }

    pub fn adapter(mut self, device_type: DeviceType, adapter: Arc<dyn DeviceAdapter>) -> Self {
        self.adapters.insert(device_type, adapter);
        self
    }

    pub fn arbiter(mut self, arbiter: Arc<dyn DeviceArbiter>) -> Self {
        self.arbiter = arbiter;
        self
    }

    pub fn detect_interval(mut self, interval: Duration) -> Self {
        self.detect_interval = interval;
        self
    }

    pub fn shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Evaluate detector preconditions, topo-sort the dispatchers, and
    /// start the polling loop.
    pub async fn start(self) -> anyhow::Result<Arc<DeviceManager>> {
        let dispatchers = topo_sort(self.dispatchers)?;

        let mut live = Vec::new();
        for detector in self.detectors {
            let precondition = detector.precondition().await;
            match precondition {
                Ok(()) => live.push(detector),
                Err(err) => {
                    warn!(detector = detector.name(), error = %format!("{err:#}"), "detector precondition failed; dropping");
                }
            }
        }

        let (signal_tx, signal_rx) = mpsc::channel(64);
        let manager = Arc::new(DeviceManager {
            detectors: live,
            dispatchers,
            adapters: self.adapters,
            arbiter: self.arbiter,
            settings: self.settings,
            detect_interval: self.detect_interval,
            runners: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashMap::new()),
            signal_tx,
            shutdown: self.shutdown,
            tracker: TaskTracker::new(),
        });

        let loop_manager = Arc::clone(&manager);
        manager.tracker.spawn(loop_manager.poll_loop(signal_rx));
        Ok(manager)
    }
}

/// Owns the runner table and drives detection.
pub struct DeviceManager {
    detectors: Vec<Arc<dyn Detector>>,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    adapters: HashMap<DeviceType, Arc<dyn DeviceAdapter>>,
    arbiter: Arc<dyn DeviceArbiter>,
    settings: RunnerSettings,
    detect_interval: Duration,
    runners: Mutex<HashMap<DeviceId, Arc<RunnerHandle>>>,
    /// Devices whose initialization failed, keyed to the failure reason.
    failed: Mutex<HashMap<DeviceId, String>>,
    signal_tx: mpsc::Sender<DeviceSignal>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl DeviceManager {
    async fn poll_loop(self: Arc<Self>, mut signal_rx: mpsc::Receiver<DeviceSignal>) {
        let mut tick = tokio::time::interval(self.detect_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                signal = signal_rx.recv() => {
                    match signal {
                        Some(signal) => self.handle_signal(signal),
                        None => break,
                    }
                }
                _ = tick.tick() => {
                    self.detect_once().await;
                    self.sweep();
                }
            }
        }
        debug!("device manager poll loop exited");
    }

    /// One detector round: merge observations, classify new ids, spawn
    /// runners, prune dead entries.
    pub async fn detect_once(&self) {
        let mut observations: HashMap<DeviceId, DeviceObservation> = HashMap::new();
        for detector in &self.detectors {
            match detector.detect().await {
                Ok(list) => {
                    for observation in list {
                        // Multiple detectors may observe the same device;
                        // attributes merge, first detector tag wins.
                        match observations.entry(observation.id.clone()) {
                            std::collections::hash_map::Entry::Occupied(mut entry) => {
                                entry.get_mut().attributes.extend(observation.attributes);
                            }
                            std::collections::hash_map::Entry::Vacant(slot) => {
                                slot.insert(observation);
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(detector = detector.name(), error = %format!("{err:#}"), "detector poll failed");
                }
            }
        }

        self.runners.lock().retain(|_, handle| handle.is_alive());

        for (id, observation) in observations {
            if self.runners.lock().contains_key(&id) {
                continue;
            }

            if let Some(reason) = self.failed.lock().get(&id).cloned() {
                self.spawn_for(
                    id.clone(),
                    DeviceType::Failed,
                    Arc::new(FailedAdapter { reason }),
                );
                continue;
            }

            match self.classify(&observation) {
                Some(device_type) => {
                    let Some(adapter) = self.adapters.get(&device_type).cloned() else {
                        warn!(device_id = %id, device_type = %device_type, "no adapter registered for device class");
                        continue;
                    };
                    self.spawn_for(id, device_type, adapter);
                }
                None => {
                    debug!(device_id = %id, "observation not claimed by any dispatcher");
                }
            }
        }
    }

    fn classify(&self, observation: &DeviceObservation) -> Option<DeviceType> {
        let mut upstream: BTreeMap<String, DeviceType> = BTreeMap::new();
        let mut verdict = None;
        for dispatcher in &self.dispatchers {
            if let Some(device_type) = dispatcher.dispatch(observation, &upstream) {
                upstream.insert(dispatcher.name().to_owned(), device_type);
                verdict = Some(device_type);
            }
        }
        verdict
    }

    fn spawn_for(&self, id: DeviceId, device_type: DeviceType, adapter: Arc<dyn DeviceAdapter>) {
        info!(device_id = %id, device_type = %device_type, "starting device runner");
        let device = Device::new(id.clone(), device_type);
        let handle = spawn_runner(
            device,
            adapter,
            Arc::clone(&self.arbiter),
            self.settings.clone(),
            self.signal_tx.clone(),
        );
        self.runners.lock().insert(id, handle);
    }

    fn handle_signal(&self, signal: DeviceSignal) {
        match signal {
            DeviceSignal::InitFailed { device_id, reason } => {
                warn!(device_id = %device_id, %reason, "device failed to initialize");
                self.failed.lock().insert(device_id, reason);
            }
            DeviceSignal::CheckError { device_id, message } => {
                warn!(device_id = %device_id, %message, "device check error reported");
            }
            DeviceSignal::WorkerExited { device_id, rebooted } => {
                debug!(device_id = %device_id, rebooted, "device worker exited");
                self.runners.lock().retain(|_, handle| handle.is_alive());
            }
        }
    }

    /// Watchdog sweep: cancel expired runners, abort stuck tear-downs.
    fn sweep(&self) {
        let runners: Vec<Arc<RunnerHandle>> =
            self.runners.lock().values().cloned().collect();
        for handle in runners {
            if handle.force_abort_due() {
                handle.force_abort();
            } else if handle.expired() {
                warn!(device_id = %handle.device().control_id, "device runner watchdog expired; cancelling");
                handle.cancel();
            }
        }
    }

    /// Find an idle device matching the requirement and reserve it.
    pub fn try_allocate(
        &self,
        requirement: &DeviceRequirement,
        job: &Job,
    ) -> Option<(Arc<RunnerHandle>, Reservation, Allocation)> {
        let runners: Vec<Arc<RunnerHandle>> =
            self.runners.lock().values().cloned().collect();
        for handle in runners {
            let device = handle.device();
            if !handle.allocatable()
                || device.device_type != requirement.device_type
                || !device.matches_dimensions(&requirement.dimensions)
            {
                continue;
            }
            let allocation = Allocation {
                test_id: Uuid::new_v4().to_string(),
                job_id: job.id.clone(),
                session_id: job.session_id.clone(),
                device_ids: vec![device.control_id.clone()],
            };
            match handle.reserve(allocation.clone()) {
                Ok(reservation) => return Some((handle, reservation, allocation)),
                Err(_) => continue,
            }
        }
        None
    }

    /// Number of live runners, for tests and drain checks.
    pub fn live_runner_count(&self) -> usize {
        self.runners.lock().values().filter(|h| h.is_alive()).count()
    }

    pub fn failed_devices(&self) -> HashMap<DeviceId, String> {
        self.failed.lock().clone()
    }

    /// Cancel every runner and wait for workers to exit.
    pub async fn drain(&self) {
        self.shutdown.cancel();
        let runners: Vec<Arc<RunnerHandle>> =
            self.runners.lock().values().cloned().collect();
        for handle in &runners {
            handle.cancel();
        }
        for handle in &runners {
            handle.join().await;
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl DeviceQuery for DeviceManager {
    fn list_devices(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<DeviceSnapshot> = self
            .runners
            .lock()
            .values()
            .map(|handle| handle.device().snapshot())
            .collect();
        devices.sort_by(|a, b| a.control_id.cmp(&b.control_id));
        devices
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
