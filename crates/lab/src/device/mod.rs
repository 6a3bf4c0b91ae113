// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device model: control ids, typed classes, dimensions, and the adapter
//! seam the lifecycle runner drives.

pub mod manager;
pub mod runner;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Stable control id for one physical or virtual device (e.g. a serial).
pub type DeviceId = String;

/// Known device classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    NoOp,
    AndroidReal,
    AndroidEmulator,
    Failed,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoOp => "no_op_device",
            Self::AndroidReal => "android_real_device",
            Self::AndroidEmulator => "android_emulator",
            Self::Failed => "failed_device",
        }
    }

    /// Whether this class supports being rebooted by the lab.
    pub fn supports_reboot(&self) -> bool {
        matches!(self, Self::AndroidReal | Self::AndroidEmulator)
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a device runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Init,
    Idle,
    Prepping,
    Busy,
    Dying,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Idle => "idle",
            Self::Prepping => "prepping",
            Self::Busy => "busy",
            Self::Dying => "dying",
        }
    }
}

/// Supported vs required dimension maps.
///
/// Supported dimensions describe what the device can offer; required
/// dimensions restrict which jobs may allocate it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionSet {
    pub supported: BTreeMap<String, String>,
    pub required: BTreeMap<String, String>,
}

/// Dimension names that mark a device as transiently not ready.
///
/// While any of these is present the runner reports `Prepping` instead of
/// `Idle` and the device is not allocatable.
pub const NOT_READY_DIMENSIONS: [&str; 3] = ["low_disk", "network_down", "external_not_ready"];

/// A device owned by exactly one lifecycle runner.
pub struct Device {
    pub control_id: DeviceId,
    pub device_type: DeviceType,
    dimensions: Mutex<DimensionSet>,
    properties: Mutex<BTreeMap<String, String>>,
    status: Mutex<DeviceStatus>,
}

impl Device {
    pub fn new(control_id: impl Into<DeviceId>, device_type: DeviceType) -> Arc<Self> {
        Arc::new(Self {
            control_id: control_id.into(),
            device_type,
            dimensions: Mutex::new(DimensionSet::default()),
            properties: Mutex::new(BTreeMap::new()),
            status: Mutex::new(DeviceStatus::Init),
        })
    }

    pub fn status(&self) -> DeviceStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: DeviceStatus) {
        *self.status.lock() = status;
    }

    pub fn dimensions(&self) -> DimensionSet {
        self.dimensions.lock().clone()
    }

    pub fn set_supported_dimension(&self, name: impl Into<String>, value: impl Into<String>) {
        self.dimensions.lock().supported.insert(name.into(), value.into());
    }

    pub fn clear_supported_dimension(&self, name: &str) {
        self.dimensions.lock().supported.remove(name);
    }

    pub fn set_required_dimension(&self, name: impl Into<String>, value: impl Into<String>) {
        self.dimensions.lock().required.insert(name.into(), value.into());
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.lock().insert(name.into(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<String> {
        self.properties.lock().get(name).cloned()
    }

    /// True when a transient not-ready dimension is set.
    pub fn has_not_ready_dimension(&self) -> bool {
        let dims = self.dimensions.lock();
        NOT_READY_DIMENSIONS.iter().any(|d| dims.supported.contains_key(*d))
    }

    /// True when the supported dimensions satisfy every requested dimension
    /// and every required dimension is requested.
    pub fn matches_dimensions(&self, requested: &BTreeMap<String, String>) -> bool {
        let dims = self.dimensions.lock();
        let supported_ok = requested
            .iter()
            .all(|(k, v)| dims.supported.get(k).is_some_and(|have| have == v));
        let required_ok = dims
            .required
            .iter()
            .all(|(k, v)| requested.get(k).is_some_and(|want| want == v));
        supported_ok && required_ok
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            control_id: self.control_id.clone(),
            device_type: self.device_type,
            status: self.status(),
            dimensions: self.dimensions(),
            properties: self.properties.lock().clone(),
        }
    }
}

/// Immutable view of a device, returned by queries and device checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub control_id: DeviceId,
    pub device_type: DeviceType,
    pub status: DeviceStatus,
    pub dimensions: DimensionSet,
    pub properties: BTreeMap<String, String>,
}

/// Device listing capability handed to plugins and the API layer.
pub trait DeviceQuery: Send + Sync {
    fn list_devices(&self) -> Vec<DeviceSnapshot>;
}

/// Operation a device requests after a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostTestOp {
    None,
    Reboot,
}

/// Per-class device behavior the lifecycle runner drives.
///
/// Adapters are the collaborator seam for real hardware; the orchestration
/// core only ships classes that need no hardware.
pub trait DeviceAdapter: Send + Sync {
    fn device_type(&self) -> DeviceType;

    /// One-time initialization. Failure turns the runner into a
    /// failed-device placeholder.
    fn prepare(&self, device: &Device) -> anyhow::Result<()>;

    /// Periodic readiness check; updates supported dimensions in place.
    fn check(&self, device: &Device) -> anyhow::Result<()>;

    /// Called before the driver phase of each test.
    fn pre_run_test(&self, device: &Device) -> anyhow::Result<()>;

    /// Called after each test; returns the operation the device requests.
    fn post_run_test(&self, device: &Device) -> anyhow::Result<PostTestOp>;

    fn reboot(&self, device: &Device) -> anyhow::Result<()>;
}

/// Synthetic device with no hardware behind it.
#[derive(Debug, Default)]
pub struct NoOpAdapter;

impl DeviceAdapter for NoOpAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::NoOp
    }

    fn prepare(&self, device: &Device) -> anyhow::Result<()> {
        device.set_supported_dimension("pool", "shared");
        device.set_supported_dimension("device_class", self.device_type().as_str());
        Ok(())
    }

    fn check(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_run_test(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_run_test(&self, _device: &Device) -> anyhow::Result<PostTestOp> {
        Ok(PostTestOp::None)
    }

    fn reboot(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Placeholder adapter standing in for a device whose initialization failed.
///
/// It advertises nothing and refuses tests, so the device stays visible in
/// queries without ever being allocated.
#[derive(Debug)]
pub struct FailedAdapter {
    pub reason: String,
}

impl DeviceAdapter for FailedAdapter {
    fn device_type(&self) -> DeviceType {
        DeviceType::Failed
    }

    fn prepare(&self, device: &Device) -> anyhow::Result<()> {
        device.set_supported_dimension("init_failure", self.reason.clone());
        device.set_required_dimension("unallocatable", "true");
        Ok(())
    }

    fn check(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_run_test(&self, _device: &Device) -> anyhow::Result<()> {
        anyhow::bail!("failed device cannot run tests: {}", self.reason)
    }

    fn post_run_test(&self, _device: &Device) -> anyhow::Result<PostTestOp> {
        Ok(PostTestOp::None)
    }

    fn reboot(&self, _device: &Device) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lease refusal from the external device arbiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    /// The arbiter is draining the device; the runner must exit.
    Draining,
    /// Transient refusal; the runner logs and retries.
    Denied(String),
}

impl fmt::Display for LeaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draining => f.write_str("device is draining"),
            Self::Denied(reason) => write!(f, "lease denied: {reason}"),
        }
    }
}

/// External device manager that can veto local use of a device.
pub trait DeviceArbiter: Send + Sync {
    /// Request a short-duration reservation for the runner's next iteration.
    fn try_lease(&self, device_id: &str, ttl: Duration) -> Result<(), LeaseError>;

    /// Mark the current lease as running a test.
    fn mark_running_test(&self, device_id: &str);

    /// Whether the arbiter owns the device lifecycle (reboots are skipped).
    fn manages_lifecycle(&self, device_id: &str) -> bool;
}

/// Arbiter for labs with no external device manager: always grants.
#[derive(Debug, Default)]
pub struct LocalArbiter;

impl DeviceArbiter for LocalArbiter {
    fn try_lease(&self, _device_id: &str, _ttl: Duration) -> Result<(), LeaseError> {
        Ok(())
    }

    fn mark_running_test(&self, _device_id: &str) {}

    fn manages_lifecycle(&self, _device_id: &str) -> bool {
        false
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
