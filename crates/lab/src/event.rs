// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};

use crate::device::DeviceId;
use crate::job::{TestInfo, TestResult};
use crate::session::SessionInfo;

/// A client-sent notification routed to session plugins.
///
/// A notification with a label is delivered only to the plugin carrying
/// that label; without one it broadcasts to every plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_label: Option<String>,
    /// Declared payload type name, resolvable through the session's type
    /// registry for decoding diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub payload: serde_json::Value,
}

/// Desired result carried by a skip-test veto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipResult {
    Pass,
    Skip,
    Error,
}

impl SkipResult {
    /// Severity used when aggregating multiple vetoes from one post.
    fn severity(&self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Skip => 1,
            Self::Error => 2,
        }
    }

    /// Map the veto onto a terminal test result.
    pub fn to_test_result(self) -> TestResult {
        match self {
            // A skipped test reports PASS with the skip recorded as reason.
            Self::Pass | Self::Skip => TestResult::Pass,
            Self::Error => TestResult::Error,
        }
    }
}

/// Structured veto a subscriber may return from an event handler to
/// short-circuit driver execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipSignal {
    pub result: SkipResult,
    pub reason: String,
}

impl SkipSignal {
    pub fn new(result: SkipResult, reason: impl Into<String>) -> Self {
        Self { result, reason: reason.into() }
    }
}

/// Aggregate of all skip signals raised within a single event post: the
/// most severe result wins, every cause is retained.
#[derive(Debug, Clone)]
pub struct SkipDecision {
    pub result: SkipResult,
    pub reasons: Vec<String>,
}

impl SkipDecision {
    pub fn aggregate(signals: impl IntoIterator<Item = SkipSignal>) -> Option<Self> {
        let mut decision: Option<SkipDecision> = None;
        for signal in signals {
            match decision.as_mut() {
                None => {
                    decision =
                        Some(SkipDecision { result: signal.result, reasons: vec![signal.reason] })
                }
                Some(d) => {
                    if signal.result.severity() > d.result.severity() {
                        d.result = signal.result;
                    }
                    d.reasons.push(signal.reason);
                }
            }
        }
        decision
    }

    pub fn reason(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Lifecycle events delivered to subscribers through the event bus.
#[derive(Debug, Clone)]
pub enum Event {
    SessionStarting { session: SessionInfo },
    SessionStarted { session: SessionInfo },
    SessionNotification { session: SessionInfo, notification: SessionNotification },
    SessionEnded { session: SessionInfo, error: Option<String> },
    TestStarting { test: TestInfo },
    TestStarted { test: TestInfo },
    TestEnding { test: TestInfo },
    TestEnded { test: TestInfo, result: TestResult },
    LocalDriverStarting { test: TestInfo, driver: String },
    LocalDriverEnded { test: TestInfo, driver: String, error: Option<String> },
    DecoratorPreForward { test: TestInfo, decorator: String },
    DecoratorPostForward { test: TestInfo, decorator: String, error: Option<String> },
    TestMessage { test: TestInfo, message: serde_json::Value },
    DeviceError { device_id: DeviceId, message: String },
}

impl Event {
    /// Stable event name used in plugin error records and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionStarting { .. } => "session_starting",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionNotification { .. } => "session_notification",
            Self::SessionEnded { .. } => "session_ended",
            Self::TestStarting { .. } => "test_starting",
            Self::TestStarted { .. } => "test_started",
            Self::TestEnding { .. } => "test_ending",
            Self::TestEnded { .. } => "test_ended",
            Self::LocalDriverStarting { .. } => "local_driver_starting",
            Self::LocalDriverEnded { .. } => "local_driver_ended",
            Self::DecoratorPreForward { .. } => "decorator_pre_forward",
            Self::DecoratorPostForward { .. } => "decorator_post_forward",
            Self::TestMessage { .. } => "test_message",
            Self::DeviceError { .. } => "device_error",
        }
    }
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
