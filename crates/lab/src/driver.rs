// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Driver seam: the object that actually exercises an allocated device,
//! plus the decorator chain wrapped around it.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::device::DeviceSnapshot;
use crate::job::{Test, TestResult};

/// Everything a driver may touch while running one test.
pub struct DriverContext {
    pub test: Arc<Test>,
    pub device: DeviceSnapshot,
    pub params: BTreeMap<String, String>,
    /// Cancelled when the test is killed (timer, abort, shutdown).
    pub cancel: CancellationToken,
    /// Sink for asynchronous test-to-plugin messages.
    pub message_tx: tokio::sync::mpsc::Sender<serde_json::Value>,
}

/// A test driver. Test content is out of scope for the core; these objects
/// only honor the invocation contract.
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(
        &self,
        cx: DriverContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TestResult>> + Send + '_>>;
}

/// Wraps the driver invocation; each decorator's forward is bracketed by
/// pre/post events so plugins can veto or observe.
pub trait Decorator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs before the wrapped driver (outermost decorator first).
    fn before(&self, cx: &DriverContext) -> anyhow::Result<()> {
        let _ = cx;
        Ok(())
    }

    /// Runs after the wrapped driver (outermost decorator last).
    fn after(&self, cx: &DriverContext, error: Option<&anyhow::Error>) -> anyhow::Result<()> {
        let _ = (cx, error);
        Ok(())
    }
}

/// Driver that reports PASS without touching the device.
#[derive(Debug, Default)]
pub struct NoOpDriver;

impl Driver for NoOpDriver {
    fn name(&self) -> &'static str {
        "no_op_driver"
    }

    fn run(
        &self,
        _cx: DriverContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TestResult>> + Send + '_>> {
        Box::pin(async { Ok(TestResult::Pass) })
    }
}

/// Driver that sleeps for `sleep_ms` then passes; cancellable. Used to
/// exercise timers and kill paths without hardware.
#[derive(Debug, Default)]
pub struct SleepDriver;

impl Driver for SleepDriver {
    fn name(&self) -> &'static str {
        "sleep_driver"
    }

    fn run(
        &self,
        cx: DriverContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TestResult>> + Send + '_>> {
        Box::pin(async move {
            let ms = cx
                .params
                .get("sleep_ms")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1000);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(TestResult::Pass),
                _ = cx.cancel.cancelled() => anyhow::bail!("driver cancelled mid-sleep"),
            }
        })
    }
}

/// Driver that fails with the result named by the `result` param.
#[derive(Debug, Default)]
pub struct FixedResultDriver;

impl Driver for FixedResultDriver {
    fn name(&self) -> &'static str {
        "fixed_result_driver"
    }

    fn run(
        &self,
        cx: DriverContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<TestResult>> + Send + '_>> {
        Box::pin(async move {
            match cx.params.get("result").map(String::as_str) {
                Some("FAIL") => Ok(TestResult::Fail),
                Some("ERROR") => anyhow::bail!("driver reported an error"),
                _ => Ok(TestResult::Pass),
            }
        })
    }
}

/// Registry resolving job-spec driver/decorator names.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
    decorators: HashMap<String, Arc<dyn Decorator>>,
}

impl DriverRegistry {
    /// Registry pre-loaded with the built-in hardwareless drivers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register_driver(Arc::new(NoOpDriver));
        registry.register_driver(Arc::new(SleepDriver));
        registry.register_driver(Arc::new(FixedResultDriver));
        registry
    }

    pub fn register_driver(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.insert(driver.name().to_owned(), driver);
    }

    pub fn register_decorator(&mut self, decorator: Arc<dyn Decorator>) {
        self.decorators.insert(decorator.name().to_owned(), decorator);
    }

    pub fn driver(&self, name: &str) -> anyhow::Result<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown driver: {name}"))
    }

    pub fn decorators(&self, names: &[String]) -> anyhow::Result<Vec<Arc<dyn Decorator>>> {
        names
            .iter()
            .map(|name| {
                self.decorators
                    .get(name)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("unknown decorator: {name}"))
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;
