// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wall-clock abstraction so tests can pin time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Source of wall-clock time handed to plugins and snapshots.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// System clock backed by [`epoch_ms`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        epoch_ms()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn at(now_ms: u64) -> Arc<Self> {
        Arc::new(Self { now: AtomicU64::new(now_ms) })
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}
