// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-device lifecycle runner: one long-running worker per device driving
//! init → idle → reserved → busy → tear-down, with watchdog deadlines and
//! a post-test reboot policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{
    Device, DeviceAdapter, DeviceArbiter, DeviceId, DeviceStatus, LeaseError, PostTestOp,
};
use crate::error::{ErrorCode, LabError};
use crate::job::{Allocation, TestId, TestResult};
use crate::test_runner::{TestOutcome, TestRun};

/// Timing and policy knobs for device runners.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Watchdog: inactivity budget before the runner is killed.
    pub expire_after: Duration,
    /// TTL requested from the external arbiter each iteration.
    pub lease_ttl: Duration,
    /// Minimum gap between periodic device checks.
    pub check_interval: Duration,
    /// Sleep between worker iterations.
    pub idle_sleep: Duration,
    /// Grace after cancel before the sweep force-aborts the worker.
    pub tear_down_extension: Duration,
    pub force_reboot_after_test: bool,
    pub disable_reboot: bool,
    pub prepare_after_test: bool,
    /// Convert prepare() failures into failed-device placeholders.
    pub handle_failed_device: bool,
}

impl RunnerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            expire_after: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(5),
            check_interval: config.check_device_interval(),
            idle_sleep: Duration::from_secs(10),
            tear_down_extension: Duration::from_secs(180),
            force_reboot_after_test: config.force_device_reboot_after_test,
            disable_reboot: config.disable_device_reboot,
            prepare_after_test: config.prepare_device_after_test,
            handle_failed_device: true,
        }
    }
}

/// Out-of-band notifications from runners to the device manager.
#[derive(Debug)]
pub enum DeviceSignal {
    /// prepare() failed; the manager swaps in a failed-device placeholder.
    InitFailed { device_id: DeviceId, reason: String },
    /// A periodic check failed; a device-error event was recorded.
    CheckError { device_id: DeviceId, message: String },
    /// The worker loop exited; the runner entry can be dropped.
    WorkerExited { device_id: DeviceId, rebooted: bool },
}

/// A fully-built test execution handed to the device worker.
pub struct TestAssignment {
    pub run: TestRun,
    pub outcome_tx: oneshot::Sender<TestOutcome>,
}

struct Shared {
    device: Arc<Device>,
    adapter: Arc<dyn DeviceAdapter>,
    /// Present while a test holds the device. Only callers presenting a
    /// valid allocation may attach a test.
    reserved: Mutex<Option<Allocation>>,
    expire_at: Mutex<Instant>,
    cancel: CancellationToken,
    cancel_requested_at: Mutex<Option<Instant>>,
    need_reboot: AtomicBool,
    assignment_tx: mpsc::Sender<TestAssignment>,
    alive: AtomicBool,
}

/// RAII reservation of a device for one test.
///
/// Dropping the reservation releases the device unless the worker already
/// released it after running the test.
pub struct Reservation {
    shared: Arc<Shared>,
    test_id: TestId,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut reserved = self.shared.reserved.lock();
        if reserved.as_ref().is_some_and(|a| a.test_id == self.test_id) {
            *reserved = None;
            if self.shared.device.status() == DeviceStatus::Busy {
                self.shared.device.set_status(DeviceStatus::Idle);
            }
        }
    }
}

/// Handle to a running device worker, owned by the device manager.
pub struct RunnerHandle {
    shared: Arc<Shared>,
    settings: RunnerSettings,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RunnerHandle {
    pub fn device(&self) -> Arc<Device> {
        Arc::clone(&self.shared.device)
    }

    pub fn adapter(&self) -> Arc<dyn DeviceAdapter> {
        Arc::clone(&self.shared.adapter)
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    pub fn is_reserved(&self) -> bool {
        self.shared.reserved.lock().is_some()
    }

    /// True when the device may be allocated to a new test.
    pub fn allocatable(&self) -> bool {
        self.is_alive()
            && !self.is_reserved()
            && self.shared.device.status() == DeviceStatus::Idle
    }

    /// Atomically reserve the device for the test named by the allocation.
    pub fn reserve(&self, allocation: Allocation) -> anyhow::Result<Reservation> {
        if !self.is_alive() {
            return Err(LabError::new(
                ErrorCode::DeviceDraining,
                format!("device {} is tearing down", self.shared.device.control_id),
            )
            .into());
        }
        let mut reserved = self.shared.reserved.lock();
        if reserved.is_some() {
            return Err(LabError::new(
                ErrorCode::DeviceBusy,
                format!("device {} already reserved", self.shared.device.control_id),
            )
            .into());
        }
        let test_id = allocation.test_id.clone();
        *reserved = Some(allocation);
        Ok(Reservation { shared: Arc::clone(&self.shared), test_id })
    }

    /// Hand the test to the worker and wait for the outcome. The caller
    /// must hold the reservation for the same test.
    pub async fn run_test(
        &self,
        reservation: &Reservation,
        run: TestRun,
    ) -> anyhow::Result<TestOutcome> {
        let matches = self
            .shared
            .reserved
            .lock()
            .as_ref()
            .is_some_and(|a| a.test_id == reservation.test_id);
        if !matches {
            anyhow::bail!(
                "reservation for test {} is no longer held on device {}",
                reservation.test_id,
                self.shared.device.control_id
            );
        }
        let (outcome_tx, outcome_rx) = oneshot::channel();
        self.shared
            .assignment_tx
            .send(TestAssignment { run, outcome_tx })
            .await
            .map_err(|_| anyhow::anyhow!("device worker has exited"))?;
        outcome_rx
            .await
            .map_err(|_| anyhow::anyhow!("device worker dropped the test"))
    }

    /// Request cooperative shutdown. Safe to call repeatedly.
    pub fn cancel(&self) {
        let mut requested = self.shared.cancel_requested_at.lock();
        if requested.is_none() {
            *requested = Some(Instant::now());
        }
        self.shared.cancel.cancel();
    }

    /// Watchdog: the runner blew its inactivity deadline.
    pub fn expired(&self) -> bool {
        self.is_alive() && Instant::now() >= *self.shared.expire_at.lock()
    }

    /// The runner ignored cancellation past the tear-down extension.
    pub fn force_abort_due(&self) -> bool {
        self.is_alive()
            && self
                .shared
                .cancel_requested_at
                .lock()
                .is_some_and(|at| at.elapsed() >= self.settings.tear_down_extension)
    }

    /// Last resort: abort the worker task outright.
    pub fn force_abort(&self) {
        if let Some(join) = self.join.lock().take() {
            join.abort();
        }
        self.shared.alive.store(false, Ordering::Release);
        *self.shared.reserved.lock() = None;
        self.shared.device.set_status(DeviceStatus::Dying);
        warn!(device_id = %self.shared.device.control_id, "device worker force-aborted");
    }

    /// Wait for the worker to finish after a cancel.
    pub async fn join(&self) {
        let join = self.join.lock().take();
        if let Some(join) = join {
            let _ = join.await;
        }
    }
}

/// Spawn a worker for one device and return its handle.
pub fn spawn_runner(
    device: Arc<Device>,
    adapter: Arc<dyn DeviceAdapter>,
    arbiter: Arc<dyn DeviceArbiter>,
    settings: RunnerSettings,
    signal_tx: mpsc::Sender<DeviceSignal>,
) -> Arc<RunnerHandle> {
    let (assignment_tx, assignment_rx) = mpsc::channel(1);
    let shared = Arc::new(Shared {
        device,
        adapter,
        reserved: Mutex::new(None),
        expire_at: Mutex::new(Instant::now() + settings.expire_after),
        cancel: CancellationToken::new(),
        cancel_requested_at: Mutex::new(None),
        need_reboot: AtomicBool::new(false),
        assignment_tx,
        alive: AtomicBool::new(true),
    });

    let worker = Worker {
        shared: Arc::clone(&shared),
        arbiter,
        settings: settings.clone(),
        signal_tx,
        assignment_rx,
    };
    let join = tokio::spawn(worker.run());

    Arc::new(RunnerHandle { shared, settings, join: Mutex::new(Some(join)) })
}

struct Worker {
    shared: Arc<Shared>,
    arbiter: Arc<dyn DeviceArbiter>,
    settings: RunnerSettings,
    signal_tx: mpsc::Sender<DeviceSignal>,
    assignment_rx: mpsc::Receiver<TestAssignment>,
}

impl Worker {
    async fn run(mut self) {
        let device = Arc::clone(&self.shared.device);
        let device_id = device.control_id.clone();

        device.set_status(DeviceStatus::Init);
        if let Err(err) = self.shared.adapter.prepare(&device) {
            warn!(device_id = %device_id, error = %format!("{err:#}"), "device prepare failed");
            device.set_status(DeviceStatus::Dying);
            self.shared.alive.store(false, Ordering::Release);
            if self.settings.handle_failed_device {
                let _ = self
                    .signal_tx
                    .send(DeviceSignal::InitFailed {
                        device_id: device_id.clone(),
                        reason: format!("{err:#}"),
                    })
                    .await;
            }
            let _ = self
                .signal_tx
                .send(DeviceSignal::WorkerExited { device_id, rebooted: false })
                .await;
            return;
        }
        device.set_status(DeviceStatus::Idle);
        debug!(device_id = %device_id, "device prepared");

        // First idle iteration runs a check immediately.
        let mut last_check = Instant::now()
            .checked_sub(self.settings.check_interval)
            .unwrap_or_else(Instant::now);
        let mut reboot_on_exit = false;

        loop {
            self.renew_deadline(self.settings.expire_after);
            if self.shared.cancel.is_cancelled() {
                break;
            }

            match self.arbiter.try_lease(&device_id, self.settings.lease_ttl) {
                Ok(()) => {}
                Err(LeaseError::Draining) => {
                    info!(device_id = %device_id, "arbiter draining device; exiting worker");
                    break;
                }
                Err(LeaseError::Denied(reason)) => {
                    warn!(device_id = %device_id, %reason, "device lease denied; retrying");
                    if self.idle_wait().await {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                assignment = self.assignment_rx.recv() => {
                    let Some(assignment) = assignment else { break };
                    match self.execute_assignment(assignment).await {
                        Some(reboot) if reboot => {
                            reboot_on_exit = true;
                            break;
                        }
                        _ => {}
                    }
                }
                _ = self.shared.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.idle_sleep) => {
                    self.periodic_check(&mut last_check).await;
                }
            }
        }

        self.tear_down(reboot_on_exit).await;
    }

    /// Execute one attached test; returns `Some(reboot)` with the reboot
    /// decision, or `None` when no decision applies.
    async fn execute_assignment(&mut self, assignment: TestAssignment) -> Option<bool> {
        let device = Arc::clone(&self.shared.device);
        let device_id = device.control_id.clone();
        let TestAssignment { run, outcome_tx } = assignment;

        self.arbiter.mark_running_test(&device_id);
        device.set_status(DeviceStatus::Busy);
        // Tests may legitimately outlive the idle watchdog budget.
        self.renew_deadline(run.job.spec.timeout() + self.settings.expire_after);

        let outcome = run.execute().await;
        let result = outcome.result;
        let post_op = outcome.post_op;
        let _ = outcome_tx.send(outcome);

        *self.shared.reserved.lock() = None;

        let reboot = decide_reboot(
            result,
            post_op,
            &self.settings,
            device.device_type.supports_reboot(),
            self.arbiter.manages_lifecycle(&device_id),
        );

        if reboot {
            debug!(device_id = %device_id, result = result.as_str(), "post-test reboot requested");
            return Some(true);
        }

        if self.settings.prepare_after_test {
            if let Err(err) = self.shared.adapter.prepare(&device) {
                warn!(device_id = %device_id, error = %format!("{err:#}"), "post-test prepare failed");
                return Some(true);
            }
        }
        device.set_status(DeviceStatus::Idle);
        Some(false)
    }

    /// Run the periodic device check when unreserved and due.
    async fn periodic_check(&mut self, last_check: &mut Instant) {
        if self.shared.reserved.lock().is_some() {
            return;
        }
        if last_check.elapsed() < self.settings.check_interval {
            return;
        }
        *last_check = Instant::now();

        let device = &self.shared.device;
        match self.shared.adapter.check(device) {
            Ok(()) => {
                let next = if device.has_not_ready_dimension() {
                    DeviceStatus::Prepping
                } else {
                    DeviceStatus::Idle
                };
                device.set_status(next);
            }
            Err(err) => {
                warn!(device_id = %device.control_id, error = %format!("{err:#}"), "periodic device check failed");
                self.shared.need_reboot.store(true, Ordering::Release);
                let _ = self
                    .signal_tx
                    .send(DeviceSignal::CheckError {
                        device_id: device.control_id.clone(),
                        message: format!("{err:#}"),
                    })
                    .await;
            }
        }
    }

    /// Sleep for the idle interval; returns true when cancelled.
    async fn idle_wait(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.idle_sleep) => false,
            _ = self.shared.cancel.cancelled() => true,
        }
    }

    fn renew_deadline(&self, budget: Duration) {
        *self.shared.expire_at.lock() = Instant::now() + budget;
    }

    async fn tear_down(self, reboot_on_exit: bool) {
        let device = Arc::clone(&self.shared.device);
        let device_id = device.control_id.clone();
        device.set_status(DeviceStatus::Dying);

        // reboot_on_exit already went through policy; the deferred
        // check-error reboot is gated here.
        let deferred = self.shared.need_reboot.load(Ordering::Acquire)
            && !self.settings.disable_reboot
            && device.device_type.supports_reboot()
            && !self.arbiter.manages_lifecycle(&device_id);
        let reboot = reboot_on_exit || deferred;

        if reboot {
            if let Err(err) = self.shared.adapter.reboot(&device) {
                warn!(device_id = %device_id, error = %format!("{err:#}"), "device reboot failed");
            }
        }

        self.shared.alive.store(false, Ordering::Release);
        *self.shared.reserved.lock() = None;
        let _ = self
            .signal_tx
            .send(DeviceSignal::WorkerExited { device_id, rebooted: reboot })
            .await;
    }
}

/// Post-test reboot policy.
///
/// Reboot when the test errored or timed out on a reboot-capable class,
/// when the fleet-wide flag forces it, or when the device itself asked.
/// `disable_reboot` vetoes everything; externally-managed lifecycles are
/// left to the arbiter.
pub fn decide_reboot(
    result: TestResult,
    post_op: PostTestOp,
    settings: &RunnerSettings,
    supports_reboot: bool,
    externally_managed: bool,
) -> bool {
    if settings.disable_reboot || externally_managed {
        return false;
    }
    let wants_reboot = matches!(result, TestResult::Error | TestResult::Timeout) && supports_reboot;
    wants_reboot || settings.force_reboot_after_test || post_op == PostTestOp::Reboot
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
