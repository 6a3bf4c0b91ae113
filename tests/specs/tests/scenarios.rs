// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios: capacity fill, plugin veto, abort while queued,
//! device reboot on error, duplicate labels, and labelled notifications.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use devlab::config::ExecMode;
use devlab::device::manager::{
    DeviceManagerBuilder, DeviceObservation, Detector, Dispatcher,
};
use devlab::device::{Device, DeviceAdapter, DeviceQuery, DeviceType, PostTestOp};
use devlab::dispatch::{DeviceJobClient, JobClient};
use devlab::driver::DriverRegistry;
use devlab::error::{error_code, ErrorCode};
use devlab::event::{SessionNotification, SkipResult};
use devlab::job::{Job, TestResult};
use devlab::plugin::PluginSpec;
use devlab::session::{SessionCell, SessionConfigSpec, SessionStatus};
use devlab::test_support::{
    fast_runner_settings, noop_job, noop_session, recording_factory, sleep_job, veto_factory,
    TestLabBuilder,
};
use devlab_specs::{count_of, journal, wait_for};

fn notification(label: Option<&str>) -> SessionNotification {
    SessionNotification {
        plugin_label: label.map(str::to_owned),
        type_name: None,
        payload: serde_json::json!({"ping": true}),
    }
}

// -- Scenario 1: capacity fill ------------------------------------------------

#[tokio::test]
async fn capacity_fill_admits_fifo_and_finishes_all() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new()
        .running_capacity(2)
        .max_started_running(2)
        .noop_devices(4)
        .start()
        .await?;

    let mut holders = Vec::new();
    for name in ["s1", "s2"] {
        let mut config = noop_session(name, 0);
        config.jobs.push(sleep_job(&format!("{name}-job"), 400));
        holders.push(lab.sessions.add(config)?);
    }
    let s3 = lab.sessions.add(noop_session("s3", 1))?;
    let s4 = lab.sessions.add(noop_session("s4", 1))?;

    // s1 and s2 occupy both running slots; s3 and s4 stay submitted.
    let sessions = Arc::clone(&lab.sessions);
    assert!(
        wait_for(|| {
            let (_, running, _) = sessions.counts();
            running == 2
        })
        .await
    );
    assert_eq!(lab.sessions.get(&s3.detail.id)?.status, SessionStatus::Submitted);
    assert_eq!(lab.sessions.get(&s4.detail.id)?.status, SessionStatus::Submitted);

    // The running set never exceeds its capacity while everything drains.
    let all_done = async {
        for holder in holders {
            let done = holder.done.await?;
            assert_eq!(done.status, SessionStatus::Finished);
        }
        for tail in [s3, s4] {
            let done = tail.done.await?;
            assert_eq!(done.status, SessionStatus::Finished);
        }
        anyhow::Ok(())
    };
    let watchdog = async {
        loop {
            let (_, running, _) = lab.sessions.counts();
            assert!(running <= 2, "running capacity exceeded: {running}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::select! {
        result = all_done => result?,
        _ = watchdog => {}
    }
    Ok(())
}

// -- Scenario 2: plugin veto --------------------------------------------------

#[tokio::test]
async fn plugin_veto_passes_test_without_driver() -> anyhow::Result<()> {
    let events = journal();
    let lab = TestLabBuilder::new()
        .plugin(
            "veto_plugin",
            veto_factory(Arc::clone(&events), "test_starting", SkipResult::Pass, "no-op"),
        )
        .start()
        .await?;

    let mut config = noop_session("vetoed", 0);
    config.jobs.push(sleep_job("never-runs", 30_000));
    config.plugins.push(PluginSpec::named("veto_plugin"));

    let result = lab.api.create_session_tracked(config)?;
    let done = result.done.await?;

    assert_eq!(done.status, SessionStatus::Finished);
    assert!(done.runner_error.is_none());
    assert_eq!(done.job_results.values().next(), Some(&TestResult::Pass));

    let seen = events.lock().clone();
    assert!(
        !seen.iter().any(|e| e.ends_with(":local_driver_starting")),
        "driver ran despite veto: {seen:?}"
    );
    assert!(seen.iter().any(|e| e.ends_with(":session_ended")), "ended missing: {seen:?}");
    Ok(())
}

// -- Scenario 3: abort during queue wait --------------------------------------

#[tokio::test]
async fn abort_while_gated_finishes_with_queueing_error() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new()
        .running_capacity(2)
        .max_started_running(1)
        .start()
        .await?;

    let mut blocker = noop_session("s1", 0);
    blocker.jobs.push(sleep_job("s1-job", 1_500));
    let s1 = lab.sessions.add(blocker)?;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let s2 = lab.sessions.add(noop_session("s2", 1))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    lab.api.abort_session(&s2.detail.id)?;

    let s2_done = s2.done.await?;
    assert_eq!(s2_done.status, SessionStatus::Finished);
    let error = s2_done
        .runner_error
        .ok_or_else(|| anyhow::anyhow!("expected a queueing error"))?;
    assert!(error.contains("SESSION_ABORTED_WHEN_QUEUEING"), "got: {error}");

    let s1_done = s1.done.await?;
    assert!(s1_done.runner_error.is_none(), "s1 must be unaffected");
    Ok(())
}

// -- Scenario 4: device reboot on ERROR ---------------------------------------

struct PhoneAdapter {
    reboots: Arc<AtomicUsize>,
}

impl DeviceAdapter for PhoneAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::AndroidReal
    }
    fn prepare(&self, device: &Device) -> anyhow::Result<()> {
        device.set_supported_dimension("pool", "shared");
        Ok(())
    }
    fn check(&self, _device: &Device) -> anyhow::Result<()> {
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

struct PhoneDetector;

impl Detector for PhoneDetector {
    fn name(&self) -> &'static str {
        "phone_detector"
    }
    fn precondition(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
    fn detect(
        &self,
    ) -> std::pin::Pin<
        Box<
            dyn std::future::Future<Output = anyhow::Result<Vec<DeviceObservation>>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async {
            Ok(vec![DeviceObservation {
                id: "phone-1".to_owned(),
                detector: "phone_detector".to_owned(),
                attributes: Default::default(),
            }])
        })
    }
}

struct PhoneDispatcher;

impl Dispatcher for PhoneDispatcher {
    fn name(&self) -> &'static str {
        "phone_dispatcher"
    }
    fn dispatch(
        &self,
        _observation: &DeviceObservation,
        _upstream: &std::collections::BTreeMap<String, DeviceType>,
    ) -> Option<DeviceType> {
        Some(DeviceType::AndroidReal)
    }
}

#[tokio::test]
async fn error_result_reboots_device_and_manager_recreates_runner() -> anyhow::Result<()> {
    let reboots = Arc::new(AtomicUsize::new(0));
    let manager = DeviceManagerBuilder::new(fast_runner_settings())
        .detector(Arc::new(PhoneDetector))
        .dispatcher(Arc::new(PhoneDispatcher))
        .adapter(DeviceType::AndroidReal, Arc::new(PhoneAdapter { reboots: Arc::clone(&reboots) }))
        .detect_interval(Duration::from_millis(10))
        .start()
        .await?;

    let client = DeviceJobClient::with_poll_interval(
        Arc::clone(&manager),
        Arc::new(DriverRegistry::with_builtins()),
        ExecMode::Lab,
        CancellationToken::new(),
        Duration::from_millis(10),
    );

    let cell = SessionCell::new(
        SessionConfigSpec { name: "reboot".to_owned(), ..Default::default() },
        0,
    )
    .0;

    let mut spec = noop_job("explodes");
    spec.driver = "fixed_result_driver".to_owned();
    spec.params.insert("result".to_owned(), "ERROR".to_owned());
    spec.device.device_type = DeviceType::AndroidReal;
    let job = Job::new(cell.id().clone(), spec);

    client.start_job(&cell, Arc::clone(&job), Arc::new(devlab::bus::EventBus::new()))?;
    assert!(wait_for(|| job.is_done()).await, "job never finished");
    assert_eq!(job.result(), TestResult::Error);

    // The worker tears down with a reboot, and the next detector tick
    // recreates a fresh runner for the same device.
    assert!(wait_for(|| reboots.load(Ordering::SeqCst) >= 1).await, "no reboot issued");
    assert!(
        wait_for(|| {
            manager
                .list_devices()
                .iter()
                .any(|d| d.control_id == "phone-1" && d.status.as_str() == "idle")
        })
        .await,
        "runner never recreated after reboot"
    );

    manager.drain().await;
    Ok(())
}

// -- Scenario 5: duplicate plugin label ---------------------------------------

#[tokio::test]
async fn duplicate_plugin_label_rejected_at_submission() -> anyhow::Result<()> {
    let events = journal();
    let lab = TestLabBuilder::new()
        .plugin("recorder", recording_factory(Arc::clone(&events)))
        .start()
        .await?;

    let before = lab.sessions.counts();

    let mut config = noop_session("dup", 0);
    config.plugins.push(PluginSpec::named("recorder").with_label("same"));
    config.plugins.push(PluginSpec::named("recorder").with_label("same"));

    let Err(err) = lab.api.create_session(config) else {
        anyhow::bail!("expected duplicate-label failure");
    };
    assert_eq!(error_code(&err), Some(ErrorCode::DuplicatedPluginLabel));

    // Queue size unchanged.
    assert_eq!(lab.sessions.counts(), before);
    Ok(())
}

// -- Scenario 6: notification routing -----------------------------------------

#[tokio::test]
async fn labelled_notification_reaches_only_matching_plugin() -> anyhow::Result<()> {
    let events = journal();
    let lab = TestLabBuilder::new()
        .plugin("recorder", recording_factory(Arc::clone(&events)))
        .start()
        .await?;

    let mut config = noop_session("routed", 0);
    config.jobs.push(sleep_job("hold-open", 600));
    config.plugins.push(PluginSpec::named("recorder").with_label("a"));
    config.plugins.push(PluginSpec::named("recorder").with_label("b"));

    let result = lab.api.create_session_tracked(config)?;
    let id = result.detail.id.clone();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(lab.api.notify_session(&id, notification(Some("b")))?);
    let _ = result.done.await?;

    assert_eq!(count_of(&events, "b:session_notification"), 1);
    assert_eq!(count_of(&events, "a:session_notification"), 0);
    Ok(())
}

#[tokio::test]
async fn unlabelled_notification_broadcasts_to_all_plugins() -> anyhow::Result<()> {
    let events = journal();
    let lab = TestLabBuilder::new()
        .plugin("recorder", recording_factory(Arc::clone(&events)))
        .start()
        .await?;

    let mut config = noop_session("broadcast", 0);
    config.jobs.push(sleep_job("hold-open", 600));
    config.plugins.push(PluginSpec::named("recorder").with_label("a"));
    config.plugins.push(PluginSpec::named("recorder").with_label("b"));

    let result = lab.api.create_session_tracked(config)?;
    let id = result.detail.id.clone();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(lab.api.notify_session(&id, notification(None))?);
    let _ = result.done.await?;

    assert_eq!(count_of(&events, "a:session_notification"), 1);
    assert_eq!(count_of(&events, "b:session_notification"), 1);
    Ok(())
}

// -- Log record streaming -----------------------------------------------------

#[tokio::test]
async fn session_lifecycle_is_visible_on_the_log_stream() -> anyhow::Result<()> {
    let lab = TestLabBuilder::new().start().await?;
    let mut stream = lab.api.subscribe_log_records();

    let result = lab.api.create_session_tracked(noop_session("logged", 1))?;
    let id = result.detail.id.clone();
    let _ = result.done.await?;

    let mut saw_submitted = false;
    let mut saw_finished = false;
    while let Ok(Some(record)) =
        tokio::time::timeout(Duration::from_secs(2), stream.next()).await
    {
        let record = record?;
        if record.session_id.as_deref() == Some(id.as_str()) {
            saw_submitted |= record.message.contains("submitted");
            saw_finished |= record.message.contains("finished");
        }
        if saw_submitted && saw_finished {
            break;
        }
    }
    assert!(saw_submitted, "submission record missing");
    assert!(saw_finished, "completion record missing");
    Ok(())
}
