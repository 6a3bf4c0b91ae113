// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{decide_reboot, spawn_runner, DeviceSignal, RunnerHandle, RunnerSettings};
use crate::bus::EventBus;
use crate::config::ExecMode;
use crate::device::{
    Device, DeviceAdapter, DeviceArbiter, DeviceType, LeaseError, LocalArbiter, PostTestOp,
};
use crate::driver::{DriverRegistry, NoOpDriver};
use crate::error::{error_code, ErrorCode};
use crate::job::{Allocation, Job, JobSpec, Test, TestResult};
use crate::test_runner::TestRun;

fn fast_settings() -> RunnerSettings {
    RunnerSettings {
        expire_after: Duration::from_secs(60),
        lease_ttl: Duration::from_secs(5),
        check_interval: Duration::from_millis(1),
        idle_sleep: Duration::from_millis(5),
        tear_down_extension: Duration::from_secs(60),
        force_reboot_after_test: false,
        disable_reboot: false,
        prepare_after_test: false,
        handle_failed_device: true,
    }
}

struct StubAdapter {
    device_type: DeviceType,
    fail_prepare: bool,
    fail_check: bool,
    reboots: Arc<AtomicUsize>,
}

impl StubAdapter {
    fn healthy(device_type: DeviceType) -> Arc<Self> {
        Arc::new(Self {
            device_type,
            fail_prepare: false,
            fail_check: false,
            reboots: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl DeviceAdapter for StubAdapter {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn prepare(&self, device: &Device) -> anyhow::Result<()> {
        if self.fail_prepare {
            anyhow::bail!("prepare exploded");
        }
        device.set_supported_dimension("pool", "shared");
        Ok(())
    }

    fn check(&self, _device: &Device) -> anyhow::Result<()> {
        if self.fail_check {
            anyhow::bail!("check exploded");
        }
        Ok(())
    }

    fn pre_run_test(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_run_test(&self, _device: &Device) -> anyhow::Result<PostTestOp> {
        Ok(PostTestOp::None)
    }

    fn reboot(&self, _device: &Device) -> anyhow::Result<()> {
        self.reboots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct DrainingArbiter;

impl DeviceArbiter for DrainingArbiter {
    fn try_lease(&self, _device_id: &str, _ttl: Duration) -> Result<(), LeaseError> {
        Err(LeaseError::Draining)
    }
    fn mark_running_test(&self, _device_id: &str) {}
    fn manages_lifecycle(&self, _device_id: &str) -> bool {
        false
    }
}

fn spawn(
    adapter: Arc<StubAdapter>,
    settings: RunnerSettings,
) -> (Arc<RunnerHandle>, mpsc::Receiver<DeviceSignal>) {
    let device = Device::new("dev-1", adapter.device_type);
    let (signal_tx, signal_rx) = mpsc::channel(16);
    let handle = spawn_runner(device, adapter, Arc::new(LocalArbiter), settings, signal_tx);
    (handle, signal_rx)
}

fn allocation(test: &Test) -> Allocation {
    Allocation {
        test_id: test.info.id.clone(),
        job_id: test.info.job_id.clone(),
        session_id: test.info.session_id.clone(),
        device_ids: vec!["dev-1".to_owned()],
    }
}

fn build_run(handle: &RunnerHandle, result_param: Option<&str>) -> (Arc<Test>, TestRun) {
    let mut params = std::collections::BTreeMap::new();
    if let Some(result) = result_param {
        params.insert("result".to_owned(), result.to_owned());
    }
    let driver_name =
        if result_param.is_some() { "fixed_result_driver" } else { "no_op_driver" };
    let spec = JobSpec {
        name: "runner-test".to_owned(),
        driver: driver_name.to_owned(),
        decorators: vec![],
        params,
        files: vec![],
        timeout_ms: 10_000,
        device: Default::default(),
    };
    let job = Job::new("s-1".to_owned(), spec);
    let test = Test::new(&job, vec![handle.device().control_id.clone()]);
    let registry = DriverRegistry::with_builtins();
    let driver: Arc<dyn crate::driver::Driver> =
        registry.driver(driver_name).unwrap_or_else(|_| Arc::new(NoOpDriver));
    let run = TestRun {
        test: Arc::clone(&test),
        job,
        device: handle.device(),
        adapter: handle.adapter(),
        bus: Arc::new(EventBus::new()),
        driver,
        decorators: vec![],
        mode: ExecMode::Lab,
        kill: CancellationToken::new(),
        process_shutdown: CancellationToken::new(),
    };
    (test, run)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn prepare_failure_reports_failed_device() -> anyhow::Result<()> {
    let adapter = Arc::new(StubAdapter {
        device_type: DeviceType::NoOp,
        fail_prepare: true,
        fail_check: false,
        reboots: Arc::new(AtomicUsize::new(0)),
    });
    let (handle, mut signal_rx) = spawn(adapter, fast_settings());

    let Some(DeviceSignal::InitFailed { device_id, reason }) = signal_rx.recv().await else {
        anyhow::bail!("expected InitFailed first");
    };
    assert_eq!(device_id, "dev-1");
    assert!(reason.contains("prepare exploded"));

    let Some(DeviceSignal::WorkerExited { rebooted, .. }) = signal_rx.recv().await else {
        anyhow::bail!("expected WorkerExited");
    };
    assert!(!rebooted);
    handle.join().await;
    assert!(!handle.is_alive());
    Ok(())
}

#[tokio::test]
async fn double_reservation_fails_device_busy() -> anyhow::Result<()> {
    let (handle, _signal_rx) = spawn(StubAdapter::healthy(DeviceType::NoOp), fast_settings());
    assert!(wait_until(|| handle.allocatable()).await, "device never became idle");

    let (test, _run) = build_run(&handle, None);
    let _reservation = handle.reserve(allocation(&test))?;

    let (other, _run2) = build_run(&handle, None);
    let Err(err) = handle.reserve(allocation(&other)) else {
        anyhow::bail!("expected second reservation to fail");
    };
    assert_eq!(error_code(&err), Some(ErrorCode::DeviceBusy));
    handle.cancel();
    handle.join().await;
    Ok(())
}

#[tokio::test]
async fn dropping_reservation_releases_device() -> anyhow::Result<()> {
    let (handle, _signal_rx) = spawn(StubAdapter::healthy(DeviceType::NoOp), fast_settings());
    assert!(wait_until(|| handle.allocatable()).await);

    let (test, _run) = build_run(&handle, None);
    let reservation = handle.reserve(allocation(&test))?;
    assert!(!handle.allocatable());
    drop(reservation);
    assert!(handle.allocatable());
    handle.cancel();
    handle.join().await;
    Ok(())
}

#[tokio::test]
async fn runs_test_and_returns_to_idle() -> anyhow::Result<()> {
    let (handle, _signal_rx) = spawn(StubAdapter::healthy(DeviceType::NoOp), fast_settings());
    assert!(wait_until(|| handle.allocatable()).await);

    let (test, run) = build_run(&handle, None);
    let reservation = handle.reserve(allocation(&test))?;
    let outcome = handle.run_test(&reservation, run).await?;

    assert_eq!(outcome.result, TestResult::Pass);
    drop(reservation);
    assert!(wait_until(|| handle.allocatable()).await, "device should be idle again");
    handle.cancel();
    handle.join().await;
    Ok(())
}

#[tokio::test]
async fn error_result_on_rebootable_class_tears_down_with_reboot() -> anyhow::Result<()> {
    let adapter = StubAdapter::healthy(DeviceType::AndroidReal);
    let reboots = Arc::clone(&adapter.reboots);
    let (handle, mut signal_rx) = spawn(adapter, fast_settings());
    assert!(wait_until(|| handle.allocatable()).await);

    let (test, run) = build_run(&handle, Some("ERROR"));
    let reservation = handle.reserve(allocation(&test))?;
    let outcome = handle.run_test(&reservation, run).await?;
    assert_eq!(outcome.result, TestResult::Error);
    drop(reservation);

    let exited = loop {
        match signal_rx.recv().await {
            Some(DeviceSignal::WorkerExited { rebooted, .. }) => break rebooted,
            Some(_) => continue,
            None => anyhow::bail!("signal channel closed early"),
        }
    };
    assert!(exited, "worker should reboot after ERROR on a rebootable class");
    handle.join().await;
    assert_eq!(reboots.load(Ordering::SeqCst), 1);
    assert!(!handle.is_alive());
    Ok(())
}

#[tokio::test]
async fn draining_arbiter_exits_worker() -> anyhow::Result<()> {
    let device = Device::new("dev-1", DeviceType::NoOp);
    let (signal_tx, mut signal_rx) = mpsc::channel(16);
    let handle = spawn_runner(
        device,
        StubAdapter::healthy(DeviceType::NoOp),
        Arc::new(DrainingArbiter),
        fast_settings(),
        signal_tx,
    );

    let exited = loop {
        match signal_rx.recv().await {
            Some(DeviceSignal::WorkerExited { .. }) => break true,
            Some(_) => continue,
            None => break false,
        }
    };
    assert!(exited);
    handle.join().await;
    assert!(!handle.is_alive());
    Ok(())
}

#[tokio::test]
async fn check_error_posts_signal_and_defers_reboot() -> anyhow::Result<()> {
    let adapter = Arc::new(StubAdapter {
        device_type: DeviceType::AndroidReal,
        fail_prepare: false,
        fail_check: true,
        reboots: Arc::new(AtomicUsize::new(0)),
    });
    let reboots = Arc::clone(&adapter.reboots);
    let (handle, mut signal_rx) = spawn(adapter, fast_settings());

    let Some(DeviceSignal::CheckError { message, .. }) = signal_rx.recv().await else {
        anyhow::bail!("expected CheckError");
    };
    assert!(message.contains("check exploded"));

    handle.cancel();
    let rebooted = loop {
        match signal_rx.recv().await {
            Some(DeviceSignal::WorkerExited { rebooted, .. }) => break rebooted,
            Some(_) => continue,
            None => anyhow::bail!("signal channel closed early"),
        }
    };
    assert!(rebooted, "check error should reboot on tear-down");
    handle.join().await;
    assert_eq!(reboots.load(Ordering::SeqCst), 1);
    Ok(())
}

#[yare::parameterized(
    error_on_rebootable = { TestResult::Error, PostTestOp::None, false, false, true, false, true },
    error_on_fixed = { TestResult::Error, PostTestOp::None, false, false, false, false, false },
    pass_quiet = { TestResult::Pass, PostTestOp::None, false, false, true, false, false },
    pass_forced = { TestResult::Pass, PostTestOp::None, true, false, false, false, true },
    device_requested = { TestResult::Pass, PostTestOp::Reboot, false, false, false, false, true },
    veto_wins = { TestResult::Error, PostTestOp::Reboot, true, true, true, false, false },
    externally_managed = { TestResult::Timeout, PostTestOp::Reboot, true, false, true, true, false },
)]
fn reboot_policy(
    result: TestResult,
    post_op: PostTestOp,
    force: bool,
    disable: bool,
    supports: bool,
    managed: bool,
    expected: bool,
) {
    let mut settings = fast_settings();
    settings.force_reboot_after_test = force;
    settings.disable_reboot = disable;
    assert_eq!(decide_reboot(result, post_op, &settings, supports, managed), expected);
}
