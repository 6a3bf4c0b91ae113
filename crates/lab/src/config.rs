// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Device-test orchestration server for mobile device labs.
#[derive(Debug, Clone, Parser)]
#[command(name = "devlab", version, about)]
pub struct Config {
    /// Execution mode: "local" (client-embedded runtime) or "lab" (standalone host).
    #[arg(long, env = "DEVLAB_MODE", default_value = "lab")]
    pub mode: String,

    /// Maximum sessions concurrently in the started-running window.
    #[arg(long, env = "DEVLAB_MAX_STARTED_RUNNING_SESSIONS", default_value = "30")]
    pub max_started_running_sessions: usize,

    /// Maximum sessions admitted into the running pool.
    #[arg(long, env = "DEVLAB_RUNNING_SESSION_CAPACITY", default_value = "30")]
    pub running_session_capacity: usize,

    /// Maximum sessions waiting in the submission queue.
    #[arg(long, env = "DEVLAB_SESSION_QUEUE_CAPACITY", default_value = "5000")]
    pub session_queue_capacity: usize,

    /// Maximum finished sessions kept in the archive (oldest evicted).
    #[arg(long, env = "DEVLAB_ARCHIVED_SESSIONS_CAPACITY", default_value = "500")]
    pub archived_sessions_capacity: usize,

    /// Seconds between periodic device checks while a device is idle.
    #[arg(long, env = "DEVLAB_CHECK_DEVICE_INTERVAL", default_value = "60")]
    pub check_device_interval: u64,

    /// Seconds between detector polling rounds.
    #[arg(long, env = "DEVLAB_DETECT_DEVICE_INTERVAL", default_value = "5")]
    pub detect_device_interval: u64,

    /// Veto all device reboots regardless of other policy.
    #[arg(long, env = "DEVLAB_DISABLE_DEVICE_REBOOT")]
    pub disable_device_reboot: bool,

    /// Reboot every device after every test.
    #[arg(long, env = "DEVLAB_FORCE_DEVICE_REBOOT_AFTER_TEST")]
    pub force_device_reboot_after_test: bool,

    /// Re-run device preparation after each test instead of trusting state.
    #[arg(long, env = "DEVLAB_PREPARE_DEVICE_AFTER_TEST")]
    pub prepare_device_after_test: bool,

    /// Enable the ADB detector (requires adb on PATH).
    #[arg(long, env = "DEVLAB_DETECT_ADB_DEVICE")]
    pub detect_adb_device: bool,

    /// Enable emulator classification on top of ADB observations.
    #[arg(long, env = "DEVLAB_ENABLE_EMULATOR_DETECTION")]
    pub enable_emulator_detection: bool,

    /// Number of synthetic no-op devices to host.
    #[arg(long, env = "DEVLAB_NO_OP_DEVICE_NUM", default_value = "0")]
    pub no_op_device_num: usize,

    /// Base directory for per-session gen/tmp dirs and persisted state.
    #[arg(long, env = "DEVLAB_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Log format (json or text).
    #[arg(long, env = "DEVLAB_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "DEVLAB_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Execution profile selecting detector/dispatcher sets and interruption
/// classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Local,
    Lab,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Lab => "lab",
        }
    }
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.mode_enum()?;

        if self.running_session_capacity == 0 {
            anyhow::bail!("--running-session-capacity must be at least 1");
        }
        if self.max_started_running_sessions == 0 {
            anyhow::bail!("--max-started-running-sessions must be at least 1");
        }
        if self.session_queue_capacity == 0 {
            anyhow::bail!("--session-queue-capacity must be at least 1");
        }

        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }

        Ok(())
    }

    /// Parse the mode string into an enum.
    pub fn mode_enum(&self) -> anyhow::Result<ExecMode> {
        match self.mode.to_lowercase().as_str() {
            "local" => Ok(ExecMode::Local),
            "lab" => Ok(ExecMode::Lab),
            other => anyhow::bail!("invalid mode: {other}"),
        }
    }

    pub fn check_device_interval(&self) -> Duration {
        Duration::from_secs(self.check_device_interval)
    }

    pub fn detect_device_interval(&self) -> Duration {
        Duration::from_secs(self.detect_device_interval)
    }

    /// Resolve the base directory, defaulting under the system temp dir.
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(|| std::env::temp_dir().join("devlab"))
    }
}

impl Default for Config {
    fn default() -> Self {
        // Parsing just the binary name yields the declared clap defaults.
        Self::parse_from(["devlab"])
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
