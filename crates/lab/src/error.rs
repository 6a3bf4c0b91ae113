// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error codes surfaced through the session API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    QueueFull,
    DuplicatedPluginLabel,
    PluginClassNotFound,
    PluginCreationFailed,
    SessionAbortedWhenQueueing,
    SessionNotFound,
    DeviceBusy,
    DeviceDraining,
    Unimplemented,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "QUEUE_FULL",
            Self::DuplicatedPluginLabel => "DUPLICATED_PLUGIN_LABEL",
            Self::PluginClassNotFound => "PLUGIN_CLASS_NOT_FOUND",
            Self::PluginCreationFailed => "PLUGIN_CREATION_FAILED",
            Self::SessionAbortedWhenQueueing => "SESSION_ABORTED_WHEN_QUEUEING",
            Self::SessionNotFound => "NOT_FOUND",
            Self::DeviceBusy => "DEVICE_BUSY",
            Self::DeviceDraining => "DEVICE_DRAINING",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error carried inside `anyhow::Error` so API callers can recover
/// the code with [`error_code`].
#[derive(Debug, Clone)]
pub struct LabError {
    pub code: ErrorCode,
    pub message: String,
}

impl LabError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for LabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for LabError {}

/// Extract the [`ErrorCode`] from an error chain, if one is present.
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain().find_map(|e| e.downcast_ref::<LabError>().map(|l| l.code))
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
