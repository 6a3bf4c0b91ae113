// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Jobs and tests: a job is the client-submitted unit of work; a test is
//! the runtime instance of executing that job on an allocated device set.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::DeviceId;
use crate::session::SessionId;

pub type JobId = String;
pub type TestId = String;

/// Terminal result of a job or test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestResult {
    Pass,
    Fail,
    Error,
    Timeout,
    Unknown,
}

impl TestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Test execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    New,
    Running,
    Done,
}

/// Device class + dimension constraints a job pins itself to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRequirement {
    pub device_type: crate::device::DeviceType,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
}

/// Declarative job description carried in the session config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    /// Registered driver name that exercises the device.
    pub driver: String,
    /// Registered decorator names, outermost first.
    #[serde(default)]
    pub decorators: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Job timer; expiry classifies the test result as TIMEOUT.
    #[serde(default = "JobSpec::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub device: DeviceRequirement,
}

impl JobSpec {
    fn default_timeout_ms() -> u64 {
        Duration::from_secs(3600).as_millis() as u64
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A unit of work pinned to a device requirement.
pub struct Job {
    pub id: JobId,
    pub session_id: SessionId,
    pub spec: JobSpec,
    properties: Mutex<BTreeMap<String, String>>,
    result: Mutex<TestResult>,
    done: AtomicBool,
}

impl Job {
    pub fn new(session_id: SessionId, spec: JobSpec) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            spec,
            properties: Mutex::new(BTreeMap::new()),
            result: Mutex::new(TestResult::Unknown),
            done: AtomicBool::new(false),
        })
    }

    pub fn result(&self) -> TestResult {
        *self.result.lock()
    }

    pub fn set_result(&self, result: TestResult) {
        *self.result.lock() = result;
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.lock().insert(name.into(), value.into());
    }

    pub fn properties(&self) -> BTreeMap<String, String> {
        self.properties.lock().clone()
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Identity of a test, embedded in lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestInfo {
    pub id: TestId,
    pub name: String,
    pub job_id: JobId,
    pub session_id: SessionId,
    pub device_ids: Vec<DeviceId>,
}

/// Runtime instance of a job executing on an allocated device set.
pub struct Test {
    pub info: TestInfo,
    status: Mutex<TestStatus>,
    result: Mutex<(TestResult, Option<String>)>,
    warnings: Mutex<Vec<String>>,
    /// Device dimensions observed during pre-run, copied onto the test so
    /// post-hoc analysis sees what the device actually offered.
    observed_dimensions: Mutex<BTreeMap<String, String>>,
    kill_count: Mutex<u32>,
}

impl Test {
    pub fn new(job: &Job, device_ids: Vec<DeviceId>) -> Arc<Self> {
        Self::with_id(Uuid::new_v4().to_string(), job, device_ids)
    }

    /// Build the test for an already-issued allocation, reusing its test id
    /// so the reservation stays valid.
    pub fn from_allocation(job: &Job, allocation: &Allocation) -> Arc<Self> {
        Self::with_id(allocation.test_id.clone(), job, allocation.device_ids.clone())
    }

    fn with_id(id: TestId, job: &Job, device_ids: Vec<DeviceId>) -> Arc<Self> {
        Arc::new(Self {
            info: TestInfo {
                id,
                name: job.spec.name.clone(),
                job_id: job.id.clone(),
                session_id: job.session_id.clone(),
                device_ids,
            },
            status: Mutex::new(TestStatus::New),
            result: Mutex::new((TestResult::Unknown, None)),
            warnings: Mutex::new(Vec::new()),
            observed_dimensions: Mutex::new(BTreeMap::new()),
            kill_count: Mutex::new(0),
        })
    }

    pub fn status(&self) -> TestStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: TestStatus) {
        *self.status.lock() = status;
    }

    pub fn result(&self) -> TestResult {
        self.result.lock().0
    }

    pub fn result_reason(&self) -> Option<String> {
        self.result.lock().1.clone()
    }

    pub fn set_result(&self, result: TestResult, reason: Option<String>) {
        *self.result.lock() = (result, reason);
    }

    pub fn add_warning(&self, warning: impl Into<String>) {
        self.warnings.lock().push(warning.into());
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn record_observed_dimensions(&self, dims: BTreeMap<String, String>) {
        self.observed_dimensions.lock().extend(dims);
    }

    pub fn observed_dimensions(&self) -> BTreeMap<String, String> {
        self.observed_dimensions.lock().clone()
    }

    /// Kill notification from the job timer. The first call sets TIMEOUT;
    /// later calls only log, never clobbering an earlier result.
    pub fn post_kill(&self) -> bool {
        let mut count = self.kill_count.lock();
        *count += 1;
        if *count == 1 {
            self.set_result(TestResult::Timeout, Some("killed by job timer".to_owned()));
            true
        } else {
            tracing::warn!(
                test_id = %self.info.id,
                kill_count = *count,
                "repeated post_kill ignored; result already set"
            );
            false
        }
    }
}

/// Binding of one test to its devices for the test's lifetime.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub test_id: TestId,
    pub job_id: JobId,
    pub session_id: SessionId,
    pub device_ids: Vec<DeviceId>,
}

/// Collaborator that materializes jobs for a session.
pub trait JobCreator: Send + Sync {
    fn create_jobs(&self, session_id: &SessionId, specs: &[JobSpec]) -> Vec<Arc<Job>>;
}

/// Default creator: one job per declared spec.
#[derive(Debug, Default)]
pub struct SpecJobCreator;

impl JobCreator for SpecJobCreator {
    fn create_jobs(&self, session_id: &SessionId, specs: &[JobSpec]) -> Vec<Arc<Job>> {
        specs.iter().map(|spec| Job::new(session_id.clone(), spec.clone())).collect()
    }
}

/// A job the client API has started executing.
pub struct StartedJob {
    pub job: Arc<Job>,
    pub kill: CancellationToken,
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
