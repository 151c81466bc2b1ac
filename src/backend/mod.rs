//! Device backend: telemetry and fan actuation for a set of GPUs
//!
//! The control loops only talk to hardware through [`DeviceBackend`]. The
//! [`nvml`] implementation drives real NVIDIA cards, [`sim`] runs a thermal
//! model for dry runs and tests.

pub mod nvml;
pub mod sim;

use crate::errors::{FanControlError, Result};
use log::debug;
use std::fmt;

/// Index of a GPU, stable for the lifetime of the process
pub type DeviceId = u32;

/// Fan speed limits and thermal ceiling of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThermalBounds {
    /// Lowest fan speed the device accepts, in percent
    pub min_fan_speed: i32,
    /// Highest fan speed the device accepts, in percent
    pub max_fan_speed: i32,
    /// GPU max temperature threshold, in °C
    pub max_temp_threshold: i32,
}

/// Identity strings used by the listing command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub serial: String,
    pub uuid: String,
}

/// Who decides a fan's speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanControlMode {
    /// The driver's temperature-based policy
    Auto,
    /// A speed set through the backend
    Manual,
}

impl fmt::Display for FanControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Per-device telemetry and fan actuation.
///
/// Calls for different devices may run concurrently from different tasks.
/// Every call can fail; callers decide whether a failure is fatal.
pub trait DeviceBackend: Send + Sync {
    /// Number of devices visible to the backend
    fn device_count(&self) -> Result<u32>;

    /// Name, serial number and UUID of a device
    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo>;

    /// Current GPU core temperature in °C
    fn temperature(&self, device: DeviceId) -> Result<i32>;

    /// Allowed fan speed range as `(min, max)` percent
    fn fan_bounds(&self, device: DeviceId) -> Result<(i32, i32)>;

    /// GPU max temperature threshold in °C
    fn max_temp_threshold(&self, device: DeviceId) -> Result<i32>;

    /// Number of fan units on the device
    fn num_fans(&self, device: DeviceId) -> Result<u32>;

    /// Speed the fan currently reports, in percent
    fn fan_speed(&self, device: DeviceId, fan: u32) -> Result<i32>;

    /// Control policy currently applied to a fan
    fn fan_control_mode(&self, device: DeviceId, fan: u32) -> Result<FanControlMode>;

    /// Speed the fan is currently commanded to, in percent
    fn current_target_speed(&self, device: DeviceId, fan: u32) -> Result<i32>;

    /// Command a fan to a speed in percent
    fn set_fan_speed(&self, device: DeviceId, fan: u32, speed: i32) -> Result<()>;

    /// Hand a fan back to the vendor's automatic policy
    fn restore_default_fan_speed(&self, device: DeviceId, fan: u32) -> Result<()>;

    /// Read fan range and max temperature in one go
    fn thermal_bounds(&self, device: DeviceId) -> Result<ThermalBounds> {
        let (min_fan_speed, max_fan_speed) = self.fan_bounds(device)?;
        debug!("GPU {}: fan speed range {}-{}%", device, min_fan_speed, max_fan_speed);
        if min_fan_speed > max_fan_speed {
            return Err(FanControlError::backend(
                device,
                "read fan speed range",
                format!("minimum {} above maximum {}", min_fan_speed, max_fan_speed),
            ));
        }

        let max_temp_threshold = self.max_temp_threshold(device)?;
        debug!("GPU {}: max temperature {}°C", device, max_temp_threshold);

        Ok(ThermalBounds {
            min_fan_speed,
            max_fan_speed,
            max_temp_threshold,
        })
    }
}
