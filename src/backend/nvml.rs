//! NVML backend for NVIDIA GPUs
//!
//! Each call looks the device up by index, so the backend holds no per-device
//! handles and can be shared across the control tasks.

use super::{DeviceBackend, DeviceId, DeviceInfo, FanControlMode};
use crate::errors::{FanControlError, Result};
use log::{debug, info};
use nvml_wrapper::enum_wrappers::device::{TemperatureSensor, TemperatureThreshold};
use nvml_wrapper::enums::device::FanControlPolicy;
use nvml_wrapper::error::nvml_try;
use nvml_wrapper::{Device, Nvml};
use nvml_wrapper_sys::bindings::NvmlLib;

/// Library loaded by `Nvml::init` on Linux
const NVML_LIB: &str = "libnvidia-ml.so.1";

/// Fan control through the NVIDIA Management Library
pub struct NvmlBackend {
    nvml: Nvml,
    /// Raw bindings for the calls the wrapper does not expose
    raw: NvmlLib,
}

impl NvmlBackend {
    /// Load and initialize NVML. Requires the NVIDIA driver.
    pub fn init() -> Result<Self> {
        let nvml = Nvml::init()
            .map_err(|e| FanControlError::BackendUnavailable(format!("NVML init failed: {}", e)))?;
        // Same shared object as above, so device handles stay valid across both
        let raw = unsafe { NvmlLib::new(NVML_LIB) }
            .map_err(|e| FanControlError::BackendUnavailable(format!("can't load {}: {}", NVML_LIB, e)))?;

        match nvml.sys_driver_version() {
            Ok(version) => info!("NVML initialized, driver {}", version),
            Err(e) => debug!("NVML initialized, driver version unknown: {}", e),
        }
        Ok(Self { nvml, raw })
    }

    fn device(&self, device: DeviceId) -> Result<Device<'_>> {
        self.nvml
            .device_by_index(device)
            .map_err(|e| FanControlError::backend(device, "get device handle", e))
    }
}

fn signed(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

impl DeviceBackend for NvmlBackend {
    fn device_count(&self) -> Result<u32> {
        self.nvml
            .device_count()
            .map_err(|e| FanControlError::BackendUnavailable(format!("can't get device count: {}", e)))
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        let handle = self.device(device)?;
        Ok(DeviceInfo {
            name: handle
                .name()
                .map_err(|e| FanControlError::backend(device, "get name", e))?,
            serial: handle
                .serial()
                .map_err(|e| FanControlError::backend(device, "get serial number", e))?,
            uuid: handle
                .uuid()
                .map_err(|e| FanControlError::backend(device, "get UUID", e))?,
        })
    }

    fn temperature(&self, device: DeviceId) -> Result<i32> {
        self.device(device)?
            .temperature(TemperatureSensor::Gpu)
            .map(signed)
            .map_err(|e| FanControlError::backend(device, "get temperature", e))
    }

    fn fan_bounds(&self, device: DeviceId) -> Result<(i32, i32)> {
        self.device(device)?
            .min_max_fan_speed()
            .map(|(min, max)| (signed(min), signed(max)))
            .map_err(|e| FanControlError::backend(device, "get min/max fan speed", e))
    }

    fn max_temp_threshold(&self, device: DeviceId) -> Result<i32> {
        self.device(device)?
            .temperature_threshold(TemperatureThreshold::GpuMax)
            .map(signed)
            .map_err(|e| FanControlError::backend(device, "get max temperature threshold", e))
    }

    fn num_fans(&self, device: DeviceId) -> Result<u32> {
        self.device(device)?
            .num_fans()
            .map_err(|e| FanControlError::backend(device, "get fan count", e))
    }

    fn fan_speed(&self, device: DeviceId, fan: u32) -> Result<i32> {
        self.device(device)?
            .fan_speed(fan)
            .map(signed)
            .map_err(|e| FanControlError::backend(device, "get fan speed", e))
    }

    fn fan_control_mode(&self, device: DeviceId, fan: u32) -> Result<FanControlMode> {
        let policy = self
            .device(device)?
            .fan_control_policy(fan)
            .map_err(|e| FanControlError::backend(device, "get fan control policy", e))?;
        Ok(match policy {
            FanControlPolicy::TemperatureContinousSw => FanControlMode::Auto,
            FanControlPolicy::Manual => FanControlMode::Manual,
        })
    }

    fn current_target_speed(&self, device: DeviceId, fan: u32) -> Result<i32> {
        const OPERATION: &str = "get target fan speed";
        let sym = *self
            .raw
            .nvmlDeviceGetTargetFanSpeed
            .as_ref()
            .map_err(|e| FanControlError::backend(device, OPERATION, e))?;
        let handle = self.device(device)?;

        let mut speed: u32 = 0;
        // The handle outlives the call and `speed` is a valid out pointer
        let code = unsafe { sym(handle.handle(), fan, &mut speed) };
        nvml_try(code).map_err(|e| FanControlError::backend(device, OPERATION, e))?;
        Ok(signed(speed))
    }

    fn set_fan_speed(&self, device: DeviceId, fan: u32, speed: i32) -> Result<()> {
        let write_error = |reason: String| FanControlError::FanWrite {
            device,
            fan,
            speed,
            reason,
        };
        let value = u32::try_from(speed).map_err(|_| write_error("negative speed".to_string()))?;

        let mut handle = self.device(device)?;
        handle
            .set_fan_speed(fan, value)
            .map_err(|e| write_error(e.to_string()))
    }

    fn restore_default_fan_speed(&self, device: DeviceId, fan: u32) -> Result<()> {
        let mut handle = self.device(device)?;
        handle
            .set_default_fan_speed(fan)
            .map_err(|e| FanControlError::backend(device, "restore default fan speed", e))
    }
}
