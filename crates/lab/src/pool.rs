// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named bounded task pool handed to plugins and notification workers.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// A bounded tokio task pool.
///
/// Concurrency is capped by a semaphore; `close` stops admission and waits
/// for in-flight tasks. Subsystems own their pool and shut it down with
/// their session.
pub struct TaskPool {
    name: String,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TaskPool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token cancelled when the pool closes; long tasks should select on it.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn a task onto the pool. Fails once the pool has been closed.
    pub fn spawn<F>(&self, fut: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            anyhow::bail!("task pool {} is closed", self.name);
        }
        let permits = Arc::clone(&self.permits);
        self.tracker.spawn(async move {
            // The permit bounds concurrency; queued work still runs after
            // close, it only stops being admitted.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            fut.await;
        });
        Ok(())
    }

    /// Stop admission, signal cancellation, and wait for queued and
    /// in-flight tasks to finish.
    pub async fn close(&self) {
        self.tracker.close();
        self.cancel.cancel();
        self.tracker.wait().await;
        debug!(pool = %self.name, "task pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
