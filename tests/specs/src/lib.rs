// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Harness helpers for end-to-end scenario tests against the devlab core.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Shared event journal filled by recording plugins.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// Poll `cond` until it holds or the budget (2s) runs out.
pub async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Count journal entries equal to `entry`.
pub fn count_of(journal: &Journal, entry: &str) -> usize {
    journal.lock().iter().filter(|e| e.as_str() == entry).count()
}
