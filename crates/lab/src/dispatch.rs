// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Job dispatch: hands started jobs to the device layer, one task per job,
//! polling for an allocatable device and driving the test runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::config::ExecMode;
use crate::device::manager::DeviceManager;
use crate::driver::DriverRegistry;
use crate::job::{Job, JobId, StartedJob, Test, TestResult, TestStatus};
use crate::session::SessionCell;
use crate::test_runner::TestRun;

/// Client API the session runner starts and kills jobs through.
pub trait JobClient: Send + Sync {
    /// Begin executing a job; returns a handle carrying the kill token.
    fn start_job(
        &self,
        cell: &Arc<SessionCell>,
        job: Arc<Job>,
        bus: Arc<EventBus>,
    ) -> anyhow::Result<StartedJob>;

    fn kill_job(&self, job_id: &str);
}

/// Default client: allocates a device from the manager and runs the test
/// on the device worker.
pub struct DeviceJobClient {
    devices: Arc<DeviceManager>,
    drivers: Arc<DriverRegistry>,
    mode: ExecMode,
    process_shutdown: CancellationToken,
    allocation_poll: Duration,
    kills: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
    tracker: TaskTracker,
}

impl DeviceJobClient {
    pub fn new(
        devices: Arc<DeviceManager>,
        drivers: Arc<DriverRegistry>,
        mode: ExecMode,
        process_shutdown: CancellationToken,
    ) -> Arc<Self> {
        Self::with_poll_interval(
            devices,
            drivers,
            mode,
            process_shutdown,
            Duration::from_millis(500),
        )
    }

    /// Like [`Self::new`] with an explicit allocation poll interval.
    pub fn with_poll_interval(
        devices: Arc<DeviceManager>,
        drivers: Arc<DriverRegistry>,
        mode: ExecMode,
        process_shutdown: CancellationToken,
        allocation_poll: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            drivers,
            mode,
            process_shutdown,
            allocation_poll,
            kills: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        })
    }

    /// Wait for all in-flight job tasks to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl JobClient for DeviceJobClient {
    fn start_job(
        &self,
        cell: &Arc<SessionCell>,
        job: Arc<Job>,
        bus: Arc<EventBus>,
    ) -> anyhow::Result<StartedJob> {
        let driver = self.drivers.driver(&job.spec.driver)?;
        let decorators = self.drivers.decorators(&job.spec.decorators)?;

        let kill = CancellationToken::new();
        self.kills.lock().insert(job.id.clone(), kill.clone());

        let task = JobTask {
            devices: Arc::clone(&self.devices),
            cell: Arc::clone(cell),
            job: Arc::clone(&job),
            bus,
            driver,
            decorators,
            mode: self.mode,
            kill: kill.clone(),
            process_shutdown: self.process_shutdown.clone(),
            allocation_poll: self.allocation_poll,
            kills: Arc::clone(&self.kills),
        };
        self.tracker.spawn(task.run());

        Ok(StartedJob { job, kill })
    }

    fn kill_job(&self, job_id: &str) {
        if let Some(kill) = self.kills.lock().get(job_id) {
            kill.cancel();
        }
    }
}

struct JobTask {
    devices: Arc<DeviceManager>,
    cell: Arc<SessionCell>,
    job: Arc<Job>,
    bus: Arc<EventBus>,
    driver: Arc<dyn crate::driver::Driver>,
    decorators: Vec<Arc<dyn crate::driver::Decorator>>,
    mode: ExecMode,
    kill: CancellationToken,
    process_shutdown: CancellationToken,
    allocation_poll: Duration,
    kills: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

enum AllocationEnd {
    Allocated,
    Killed,
    TimedOut,
}

impl JobTask {
    async fn run(self) {
        let job_id = self.job.id.clone();
        self.execute().await;
        self.cell.record_job_result(job_id.clone(), self.job.result());
        self.job.mark_done();
        self.kills.lock().remove(&job_id);
    }

    async fn execute(&self) {
        // The allocation window shares the job timer.
        let deadline = Instant::now() + self.job.spec.timeout();

        let allocated = loop {
            if let Some(allocated) =
                self.devices.try_allocate(&self.job.spec.device, &self.job)
            {
                break (AllocationEnd::Allocated, Some(allocated));
            }
            if Instant::now() >= deadline {
                break (AllocationEnd::TimedOut, None);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.allocation_poll) => {}
                _ = self.kill.cancelled() => break (AllocationEnd::Killed, None),
                _ = self.process_shutdown.cancelled() => break (AllocationEnd::Killed, None),
            }
        };

        let (handle, reservation, allocation) = match allocated {
            (AllocationEnd::Allocated, Some(triple)) => triple,
            (AllocationEnd::Killed, _) | (AllocationEnd::Allocated, None) => {
                debug!(job_id = %self.job.id, "job killed before allocation");
                self.job.set_result(TestResult::Error);
                return;
            }
            (AllocationEnd::TimedOut, _) => {
                warn!(job_id = %self.job.id, "no device available within the job timer");
                self.job.set_result(TestResult::Timeout);
                return;
            }
        };

        let test = Test::from_allocation(&self.job, &allocation);
        let run = TestRun {
            test: Arc::clone(&test),
            job: Arc::clone(&self.job),
            device: handle.device(),
            adapter: handle.adapter(),
            bus: Arc::clone(&self.bus),
            driver: Arc::clone(&self.driver),
            decorators: self.decorators.clone(),
            mode: self.mode,
            kill: self.kill.child_token(),
            process_shutdown: self.process_shutdown.clone(),
        };

        match handle.run_test(&reservation, run).await {
            Ok(outcome) => {
                self.job.set_result(outcome.result);
                self.cell.add_plugin_errors(outcome.plugin_errors);
            }
            Err(err) => {
                // The runner never picked the test up; it must still be
                // finalized.
                warn!(job_id = %self.job.id, error = %format!("{err:#}"), "device runner dropped the test");
                if test.result() == TestResult::Unknown {
                    test.set_result(
                        TestResult::Error,
                        Some(format!("device never ran the test: {err:#}")),
                    );
                }
                test.set_status(TestStatus::Done);
                self.job.set_result(TestResult::Error);
            }
        }
        drop(reservation);
    }
}

#[cfg(test)]
#[path = "dispatch_tests.rs"]
mod tests;
