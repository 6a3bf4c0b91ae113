// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test runner: drives one test through pre-run, driver execution, and
//! post-run, fanning lifecycle events across subscriber scopes.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{Direction, EventBus, PluginErrorRecord, PostOutcome};
use crate::config::ExecMode;
use crate::device::{Device, DeviceAdapter, PostTestOp};
use crate::driver::{Decorator, Driver, DriverContext};
use crate::event::{Event, SkipDecision};
use crate::job::{Job, Test, TestResult, TestStatus};

/// Result of one test execution, as seen by the device runner.
#[derive(Debug)]
pub struct TestOutcome {
    pub result: TestResult,
    pub post_op: PostTestOp,
    pub plugin_errors: Vec<PluginErrorRecord>,
}

/// How the driver phase was cut short.
enum ChainEnd {
    Completed(anyhow::Result<TestResult>),
    Skipped(SkipDecision),
}

/// One test execution on one reserved device.
pub struct TestRun {
    pub test: Arc<Test>,
    pub job: Arc<Job>,
    pub device: Arc<Device>,
    pub adapter: Arc<dyn DeviceAdapter>,
    pub bus: Arc<EventBus>,
    pub driver: Arc<dyn Driver>,
    pub decorators: Vec<Arc<dyn Decorator>>,
    pub mode: ExecMode,
    /// Cancelled when the job is killed or the session aborts.
    pub kill: CancellationToken,
    /// Cancelled when the whole process is shutting down.
    pub process_shutdown: CancellationToken,
}

impl TestRun {
    /// Execute all phases. Never escapes: interruption and driver failures
    /// are classified into the test result.
    pub async fn execute(self) -> TestOutcome {
        let errors: Arc<Mutex<Vec<PluginErrorRecord>>> = Arc::new(Mutex::new(Vec::new()));
        self.test.set_status(TestStatus::Running);

        let skip = self.pre_run(&errors);

        let mut poster = None;
        if skip.is_none() {
            poster = Some(MessagePoster::open(Arc::clone(&self.bus), &self.test));
        }

        match skip {
            Some(decision) => {
                debug!(
                    test_id = %self.test.info.id,
                    result = decision.result.to_test_result().as_str(),
                    "skip signal raised before driver; short-circuiting"
                );
                self.test
                    .set_result(decision.result.to_test_result(), Some(decision.reason()));
            }
            None => self.driver_phase(poster.as_ref(), &errors).await,
        }

        let post_op = self.post_run(poster, &errors).await;

        self.test.set_status(TestStatus::Done);
        TestOutcome {
            result: self.test.result(),
            post_op,
            plugin_errors: Arc::try_unwrap(errors)
                .map(Mutex::into_inner)
                .unwrap_or_default(),
        }
    }

    /// Pre-run: device check, dimension capture, starting/started fan-out.
    /// Returns the aggregated veto, if any subscriber raised one.
    fn pre_run(&self, errors: &Arc<Mutex<Vec<PluginErrorRecord>>>) -> Option<SkipDecision> {
        if let Err(err) = self.adapter.check(&self.device) {
            warn!(device_id = %self.device.control_id, error = %format!("{err:#}"), "device check failed before test");
            self.collect(
                errors,
                self.bus.post(
                    &Event::DeviceError {
                        device_id: self.device.control_id.clone(),
                        message: format!("{err:#}"),
                    },
                    Direction::Forward,
                ),
            );
        }

        // Copy observed dimensions onto the allocation so the test records
        // what the device actually offered.
        self.test
            .record_observed_dimensions(self.device.dimensions().supported);

        let starting = self.bus.post(
            &Event::TestStarting { test: self.test.info.clone() },
            Direction::Forward,
        );
        let mut skip = starting.skip_decision();
        self.collect(errors, starting);

        if skip.is_none() {
            if let Err(err) = self.adapter.pre_run_test(&self.device) {
                self.test.set_result(
                    TestResult::Error,
                    Some(format!("device pre-run failed: {err:#}")),
                );
            }
        }

        let started = self.bus.post(
            &Event::TestStarted { test: self.test.info.clone() },
            Direction::Forward,
        );
        if skip.is_none() {
            skip = started.skip_decision();
        }
        self.collect(errors, started);

        if self.test.result() == TestResult::Error {
            // Device pre-run already failed; treat as a veto with ERROR so
            // the driver never runs.
            return Some(SkipDecision {
                result: crate::event::SkipResult::Error,
                reasons: self.test.result_reason().into_iter().collect(),
            });
        }
        skip
    }

    /// Driver execution with decorator bracketing and interruption
    /// classification.
    async fn driver_phase(
        &self,
        poster: Option<&MessagePoster>,
        errors: &Arc<Mutex<Vec<PluginErrorRecord>>>,
    ) {
        let driver_cancel = CancellationToken::new();
        let message_tx = match poster {
            Some(poster) => poster.sender(),
            None => mpsc::channel(1).0,
        };
        let cx = DriverContext {
            test: Arc::clone(&self.test),
            device: self.device.snapshot(),
            params: self.job.spec.params.clone(),
            cancel: driver_cancel.clone(),
            message_tx,
        };

        let timeout = self.job.spec.timeout();
        tokio::select! {
            end = self.run_chain(cx, errors) => match end {
                ChainEnd::Skipped(decision) => {
                    self.test.set_result(
                        decision.result.to_test_result(),
                        Some(decision.reason()),
                    );
                }
                ChainEnd::Completed(Ok(result)) => {
                    self.test.set_result(result, None);
                }
                ChainEnd::Completed(Err(err)) => {
                    self.test.set_result(TestResult::Error, Some(format!("{err:#}")));
                }
            },
            _ = tokio::time::sleep(timeout) => {
                driver_cancel.cancel();
                self.test.post_kill();
            }
            _ = self.process_shutdown.cancelled() => {
                driver_cancel.cancel();
                self.test.set_result(TestResult::Error, Some("process_shutdown".to_owned()));
            }
            _ = self.kill.cancelled() => {
                driver_cancel.cancel();
                match self.mode {
                    // On a lab host a kill mid-test most often means the
                    // device dropped off the bus.
                    ExecMode::Lab => self.test.set_result(
                        TestResult::Error,
                        Some("device_disconnected".to_owned()),
                    ),
                    ExecMode::Local => self.test.set_result(
                        TestResult::Error,
                        Some("killed_by_user".to_owned()),
                    ),
                }
            }
        }
    }

    /// Decorator pre-forwards, driver invocation, decorator post-forwards.
    async fn run_chain(
        &self,
        cx: DriverContext,
        errors: &Arc<Mutex<Vec<PluginErrorRecord>>>,
    ) -> ChainEnd {
        for decorator in &self.decorators {
            let out = self.bus.post(
                &Event::DecoratorPreForward {
                    test: self.test.info.clone(),
                    decorator: decorator.name().to_owned(),
                },
                Direction::Forward,
            );
            let skip = out.skip_decision();
            self.collect(errors, out);
            if let Some(decision) = skip {
                return ChainEnd::Skipped(decision);
            }
            if let Err(err) = decorator.before(&cx) {
                return ChainEnd::Completed(Err(
                    err.context(format!("decorator {} failed", decorator.name()))
                ));
            }
        }

        let starting = self.bus.post(
            &Event::LocalDriverStarting {
                test: self.test.info.clone(),
                driver: self.driver.name().to_owned(),
            },
            Direction::Forward,
        );
        let skip = starting.skip_decision();
        self.collect(errors, starting);
        if let Some(decision) = skip {
            return ChainEnd::Skipped(decision);
        }

        let result = self.driver.run(cx).await;

        let ended = self.bus.post(
            &Event::LocalDriverEnded {
                test: self.test.info.clone(),
                driver: self.driver.name().to_owned(),
                error: result.as_ref().err().map(|e| format!("{e:#}")),
            },
            Direction::Forward,
        );
        self.warn_late_skips(&ended, "local_driver_ended");
        self.collect(errors, ended);

        // Decorator contexts were consumed by the driver; post-forwards run
        // with a fresh snapshot-only view.
        let after_cx = DriverContext {
            test: Arc::clone(&self.test),
            device: self.device.snapshot(),
            params: self.job.spec.params.clone(),
            cancel: CancellationToken::new(),
            message_tx: mpsc::channel(1).0,
        };
        for decorator in self.decorators.iter().rev() {
            if let Err(err) = decorator.after(&after_cx, result.as_ref().err()) {
                warn!(decorator = decorator.name(), error = %format!("{err:#}"), "decorator post-forward failed");
            }
            let out = self.bus.post(
                &Event::DecoratorPostForward {
                    test: self.test.info.clone(),
                    decorator: decorator.name().to_owned(),
                    error: result.as_ref().err().map(|e| format!("{e:#}")),
                },
                Direction::Forward,
            );
            self.warn_late_skips(&out, "decorator_post_forward");
            self.collect(errors, out);
        }

        ChainEnd::Completed(result)
    }

    /// Post-run: finalize the result, reverse fan-out, device cleanup.
    async fn post_run(
        &self,
        poster: Option<MessagePoster>,
        errors: &Arc<Mutex<Vec<PluginErrorRecord>>>,
    ) -> PostTestOp {
        if self.test.result() == TestResult::Unknown {
            self.test.set_result(
                TestResult::Error,
                Some("test finished without a result".to_owned()),
            );
        }

        let ending = self.bus.post(
            &Event::TestEnding { test: self.test.info.clone() },
            Direction::Reverse,
        );
        self.warn_late_skips(&ending, "test_ending");
        let had_post_errors = !ending.errors.is_empty();
        self.collect(errors, ending);

        let post_op = match self.adapter.post_run_test(&self.device) {
            Ok(op) => op,
            Err(err) => {
                warn!(device_id = %self.device.control_id, error = %format!("{err:#}"), "device post-run failed");
                self.test.add_warning(format!("device post-run failed: {err:#}"));
                PostTestOp::Reboot
            }
        };

        if let Some(poster) = poster {
            let poster_errors = poster.close().await;
            errors.lock().extend(poster_errors);
        }

        let ended = self.bus.post(
            &Event::TestEnded {
                test: self.test.info.clone(),
                result: self.test.result(),
            },
            Direction::Reverse,
        );
        self.warn_late_skips(&ended, "test_ended");
        let had_post_errors = had_post_errors || !ended.errors.is_empty();
        self.collect(errors, ended);

        if had_post_errors {
            self.test
                .add_warning("post-event: subscriber failed during test end dispatch".to_owned());
        }

        post_op
    }

    fn collect(&self, errors: &Arc<Mutex<Vec<PluginErrorRecord>>>, outcome: PostOutcome) {
        if !outcome.errors.is_empty() {
            errors.lock().extend(outcome.errors);
        }
    }

    /// The result cannot change once the driver finished; late vetoes only
    /// warn.
    fn warn_late_skips(&self, outcome: &PostOutcome, stage: &str) {
        for skip in &outcome.skips {
            warn!(
                test_id = %self.test.info.id,
                plugin_label = %skip.plugin_label,
                stage,
                "skip signal raised after driver execution; ignored"
            );
        }
    }
}

/// Drains asynchronous test messages to the `TEST_MESSAGE` scope.
///
/// Opened after pre-run succeeds, closed during post-run; messages sent
/// after close are dropped by the closed channel.
pub struct MessagePoster {
    tx: mpsc::Sender<serde_json::Value>,
    join: JoinHandle<Vec<PluginErrorRecord>>,
}

impl MessagePoster {
    pub fn open(bus: Arc<EventBus>, test: &Arc<Test>) -> Self {
        let (tx, mut rx) = mpsc::channel::<serde_json::Value>(64);
        let info = test.info.clone();
        let join = tokio::spawn(async move {
            let mut errors = Vec::new();
            while let Some(message) = rx.recv().await {
                let outcome = bus
                    .post_test_message(&Event::TestMessage { test: info.clone(), message });
                errors.extend(outcome.errors);
            }
            errors
        });
        Self { tx, join }
    }

    pub fn sender(&self) -> mpsc::Sender<serde_json::Value> {
        self.tx.clone()
    }

    /// Close the channel and wait for queued messages to be delivered.
    pub async fn close(self) -> Vec<PluginErrorRecord> {
        drop(self.tx);
        self.join.await.unwrap_or_default()
    }
}

#[cfg(test)]
#[path = "test_runner_tests.rs"]
mod tests;
