// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::TestRun;
use crate::bus::{EventBus, Scope, Subscriber};
use crate::config::ExecMode;
use crate::device::{Device, DeviceAdapter, DeviceType, NoOpAdapter, PostTestOp};
use crate::driver::{Driver, DriverContext, NoOpDriver, SleepDriver};
use crate::event::{Event, SkipResult, SkipSignal};
use crate::job::{Job, JobSpec, Test, TestResult, TestStatus};

/// Records event names; optionally vetoes one event kind.
struct Probe {
    journal: Arc<Mutex<Vec<String>>>,
    veto_on: Option<(&'static str, SkipResult)>,
}

impl Subscriber for Probe {
    fn handle(&self, event: &Event) -> anyhow::Result<Option<SkipSignal>> {
        self.journal.lock().push(event.name().to_owned());
        if let Some((veto_event, result)) = self.veto_on {
            if event.name() == veto_event {
                return Ok(Some(SkipSignal::new(result, "probe veto")));
            }
        }
        Ok(None)
    }
}

/// Driver that flags when it actually ran.
struct TracingDriver {
    ran: Arc<AtomicBool>,
}

impl Driver for TracingDriver {
    fn name(&self) -> &'static str {
        "tracing_driver"
    }

    fn run(
        &self,
        _cx: DriverContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TestResult>> + Send + '_>> {
        self.ran.store(true, Ordering::Release);
        Box::pin(async { Ok(TestResult::Pass) })
    }
}

struct Harness {
    run: TestRun,
    test: Arc<Test>,
    journal: Arc<Mutex<Vec<String>>>,
}

fn harness(driver: Arc<dyn Driver>, veto_on: Option<(&'static str, SkipResult)>) -> Harness {
    harness_with(driver, veto_on, 60_000)
}

fn harness_with(
    driver: Arc<dyn Driver>,
    veto_on: Option<(&'static str, SkipResult)>,
    timeout_ms: u64,
) -> Harness {
    let spec = JobSpec {
        name: "phase-test".to_owned(),
        driver: driver.name().to_owned(),
        decorators: vec![],
        params: {
            let mut p = BTreeMap::new();
            p.insert("sleep_ms".to_owned(), "60000".to_owned());
            p
        },
        files: vec![],
        timeout_ms,
        device: Default::default(),
    };
    let job = Job::new("s-1".to_owned(), spec);
    let test = Test::new(&job, vec!["noop-0".to_owned()]);
    let device = Device::new("noop-0", DeviceType::NoOp);
    let adapter: Arc<dyn DeviceAdapter> = Arc::new(NoOpAdapter);
    let _ = adapter.prepare(&device);

    let bus = Arc::new(EventBus::new());
    let journal = Arc::new(Mutex::new(Vec::new()));
    bus.register(
        Scope::ApiPlugin,
        "probe",
        Arc::new(Probe { journal: Arc::clone(&journal), veto_on }),
    );

    let run = TestRun {
        test: Arc::clone(&test),
        job,
        device,
        adapter,
        bus,
        driver,
        decorators: vec![],
        mode: ExecMode::Lab,
        kill: CancellationToken::new(),
        process_shutdown: CancellationToken::new(),
    };
    Harness { run, test, journal }
}

#[tokio::test]
async fn happy_path_emits_lifecycle_in_order() -> anyhow::Result<()> {
    let h = harness(Arc::new(NoOpDriver), None);
    let outcome = h.run.execute().await;

    assert_eq!(outcome.result, TestResult::Pass);
    assert_eq!(outcome.post_op, PostTestOp::None);
    assert!(outcome.plugin_errors.is_empty());
    assert_eq!(h.test.status(), TestStatus::Done);

    let seen = h.journal.lock().clone();
    assert_eq!(
        seen,
        vec![
            "test_starting",
            "test_started",
            "local_driver_starting",
            "local_driver_ended",
            "test_ending",
            "test_ended",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn veto_during_starting_short_circuits_driver() -> anyhow::Result<()> {
    let ran = Arc::new(AtomicBool::new(false));
    let h = harness(
        Arc::new(TracingDriver { ran: Arc::clone(&ran) }),
        Some(("test_starting", SkipResult::Pass)),
    );
    let outcome = h.run.execute().await;

    assert_eq!(outcome.result, TestResult::Pass);
    assert!(!ran.load(Ordering::Acquire), "driver must not run after a veto");
    assert_eq!(h.test.result_reason().as_deref(), Some("probe veto"));

    let seen = h.journal.lock().clone();
    assert!(!seen.iter().any(|e| e == "local_driver_starting"));
    assert!(seen.iter().any(|e| e == "test_ended"), "ended still fires: {seen:?}");
    Ok(())
}

#[tokio::test]
async fn error_veto_sets_error_result() -> anyhow::Result<()> {
    let h = harness(Arc::new(NoOpDriver), Some(("test_started", SkipResult::Error)));
    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Error);
    Ok(())
}

#[tokio::test]
async fn veto_during_ending_is_ignored() -> anyhow::Result<()> {
    let h = harness(Arc::new(NoOpDriver), Some(("test_ending", SkipResult::Error)));
    let outcome = h.run.execute().await;
    // The late veto cannot change the result once the driver finished.
    assert_eq!(outcome.result, TestResult::Pass);
    Ok(())
}

#[tokio::test]
async fn job_timer_expiry_classifies_timeout() -> anyhow::Result<()> {
    let h = harness_with(Arc::new(SleepDriver), None, 50);
    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Timeout);
    assert_eq!(h.test.status(), TestStatus::Done);
    Ok(())
}

#[tokio::test]
async fn kill_in_lab_mode_reads_as_device_disconnect() -> anyhow::Result<()> {
    let h = harness(Arc::new(SleepDriver), None);
    let kill = h.run.kill.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        kill.cancel();
    });
    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Error);
    assert_eq!(h.test.result_reason().as_deref(), Some("device_disconnected"));
    Ok(())
}

#[tokio::test]
async fn process_shutdown_classification() -> anyhow::Result<()> {
    let h = harness(Arc::new(SleepDriver), None);
    h.run.process_shutdown.cancel();
    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Error);
    assert_eq!(h.test.result_reason().as_deref(), Some("process_shutdown"));
    Ok(())
}

#[tokio::test]
async fn failing_subscriber_is_recorded_but_test_completes() -> anyhow::Result<()> {
    struct Exploder;
    impl Subscriber for Exploder {
        fn handle(&self, event: &Event) -> anyhow::Result<Option<SkipSignal>> {
            if event.name() == "test_ending" {
                anyhow::bail!("ending handler broke");
            }
            Ok(None)
        }
    }

    let h = harness(Arc::new(NoOpDriver), None);
    h.run.bus.register(Scope::ArchivePlugin, "exploder", Arc::new(Exploder));

    let test = Arc::clone(&h.test);
    let outcome = h.run.execute().await;

    assert_eq!(outcome.result, TestResult::Pass);
    assert!(outcome.plugin_errors.iter().any(|e| e.plugin_label == "exploder"));
    assert!(test
        .warnings()
        .iter()
        .any(|w| w.contains("post-event")));
    Ok(())
}

#[tokio::test]
async fn driver_without_result_finalizes_as_error() -> anyhow::Result<()> {
    struct Silent;
    impl Driver for Silent {
        fn name(&self) -> &'static str {
            "silent_driver"
        }
        fn run(
            &self,
            _cx: DriverContext,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<TestResult>> + Send + '_>> {
            Box::pin(async { Ok(TestResult::Unknown) })
        }
    }

    let h = harness(Arc::new(Silent), None);
    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Error);
    assert_eq!(
        h.test.result_reason().as_deref(),
        Some("test finished without a result")
    );
    Ok(())
}

struct MarkingDecorator {
    name: &'static str,
    journal: Arc<Mutex<Vec<String>>>,
}

impl crate::driver::Decorator for MarkingDecorator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn before(&self, _cx: &crate::driver::DriverContext) -> anyhow::Result<()> {
        self.journal.lock().push(format!("{}:before", self.name));
        Ok(())
    }

    fn after(
        &self,
        _cx: &crate::driver::DriverContext,
        _error: Option<&anyhow::Error>,
    ) -> anyhow::Result<()> {
        self.journal.lock().push(format!("{}:after", self.name));
        Ok(())
    }
}

#[tokio::test]
async fn decorators_bracket_the_driver_in_wrap_order() -> anyhow::Result<()> {
    let marks = Arc::new(Mutex::new(Vec::new()));
    let mut h = harness(Arc::new(NoOpDriver), None);
    h.run.decorators = vec![
        Arc::new(MarkingDecorator { name: "outer", journal: Arc::clone(&marks) }),
        Arc::new(MarkingDecorator { name: "inner", journal: Arc::clone(&marks) }),
    ];

    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Pass);

    let seen = marks.lock().clone();
    assert_eq!(seen, vec!["outer:before", "inner:before", "inner:after", "outer:after"]);

    let events = h.journal.lock().clone();
    let pre_count = events.iter().filter(|e| *e == "decorator_pre_forward").count();
    let post_count = events.iter().filter(|e| *e == "decorator_post_forward").count();
    assert_eq!(pre_count, 2);
    assert_eq!(post_count, 2);
    Ok(())
}

#[tokio::test]
async fn veto_during_decorator_pre_forward_skips_driver() -> anyhow::Result<()> {
    let ran = Arc::new(AtomicBool::new(false));
    let marks = Arc::new(Mutex::new(Vec::new()));
    let mut h = harness(
        Arc::new(TracingDriver { ran: Arc::clone(&ran) }),
        Some(("decorator_pre_forward", SkipResult::Pass)),
    );
    h.run.decorators =
        vec![Arc::new(MarkingDecorator { name: "outer", journal: Arc::clone(&marks) })];

    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Pass);
    assert!(!ran.load(Ordering::Acquire));
    // The veto lands before the decorator forwards.
    assert!(marks.lock().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_messages_reach_the_message_scope() -> anyhow::Result<()> {
    struct Listener {
        messages: Arc<Mutex<Vec<serde_json::Value>>>,
    }
    impl Subscriber for Listener {
        fn handle(&self, event: &Event) -> anyhow::Result<Option<SkipSignal>> {
            if let Event::TestMessage { message, .. } = event {
                self.messages.lock().push(message.clone());
            }
            Ok(None)
        }
    }

    struct Chatty;
    impl Driver for Chatty {
        fn name(&self) -> &'static str {
            "chatty_driver"
        }
        fn run(
            &self,
            cx: DriverContext,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<TestResult>> + Send + '_>> {
            Box::pin(async move {
                cx.message_tx
                    .send(serde_json::json!({"progress": 50}))
                    .await
                    .map_err(|_| anyhow::anyhow!("message channel closed"))?;
                Ok(TestResult::Pass)
            })
        }
    }

    let messages = Arc::new(Mutex::new(Vec::new()));
    let h = harness(Arc::new(Chatty), None);
    h.run.bus.register(
        Scope::TestMessage,
        "listener",
        Arc::new(Listener { messages: Arc::clone(&messages) }),
    );

    let outcome = h.run.execute().await;
    assert_eq!(outcome.result, TestResult::Pass);
    assert_eq!(messages.lock().len(), 1);
    Ok(())
}
