//! Simulated GPUs for dry runs and tests
//!
//! Each device follows a first-order thermal model: temperature relaxes
//! toward an equilibrium that drops as the fans spin faster. Fans reach a
//! commanded speed over a few steps, so the measured speed lags the target.
//! Every actuation is recorded so callers can inspect what the daemon did.

use super::{DeviceBackend, DeviceId, DeviceInfo, FanControlMode};
use crate::errors::{FanControlError, Result};
use log::trace;
use rand::Rng;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Share of the heat load removed when all fans run at 100%
const FAN_COOLING_FACTOR: f64 = 0.7;

/// Fraction of the gap to equilibrium closed per temperature read
const THERMAL_RESPONSE: f64 = 0.25;

/// Static description of one simulated device
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub name: String,
    pub fans: u32,
    pub min_fan_speed: i32,
    pub max_fan_speed: i32,
    pub max_temp: i32,
    /// Temperature with the GPU idle, °C
    pub ambient: f64,
    /// Temperature rise above ambient with the fans stopped, °C
    pub heat: f64,
}

impl Default for SimDeviceSpec {
    fn default() -> Self {
        Self {
            name: "Simulated GPU".to_string(),
            fans: 2,
            min_fan_speed: 30,
            max_fan_speed: 100,
            max_temp: 83,
            ambient: 30.0,
            heat: 55.0,
        }
    }
}

/// An actuation issued against the simulated hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendCall {
    SetFanSpeed { device: DeviceId, fan: u32, speed: i32 },
    RestoreDefault { device: DeviceId, fan: u32 },
}

#[derive(Debug)]
struct SimFan {
    target: i32,
    speed: i32,
    manual: bool,
}

impl SimFan {
    /// Close half the gap to the target, at least one percent
    fn spin(&mut self) {
        let gap = self.target - self.speed;
        self.speed += gap.signum() * ((gap.abs() + 1) / 2);
    }
}

#[derive(Debug)]
struct SimDevice {
    spec: SimDeviceSpec,
    temperature: f64,
    pinned_temperature: Option<i32>,
    fans: Vec<SimFan>,
    fail_reads: bool,
    fail_writes: bool,
    panic_on_read: bool,
    read_delay: Option<Duration>,
}

impl SimDevice {
    fn new(spec: SimDeviceSpec) -> Self {
        let fans = (0..spec.fans)
            .map(|_| SimFan {
                target: spec.min_fan_speed,
                speed: spec.min_fan_speed,
                manual: false,
            })
            .collect();
        Self {
            temperature: spec.ambient,
            pinned_temperature: None,
            fans,
            fail_reads: false,
            fail_writes: false,
            panic_on_read: false,
            read_delay: None,
            spec,
        }
    }

    fn fan(&mut self, device: DeviceId, fan: u32) -> Result<&mut SimFan> {
        self.fans
            .get_mut(fan as usize)
            .ok_or_else(|| FanControlError::backend(device, "look up fan", format!("no fan {}", fan)))
    }

    /// Advance the thermal model by one step
    fn step(&mut self, noise: f64) -> f64 {
        self.fans.iter_mut().for_each(SimFan::spin);
        let average_speed = if self.fans.is_empty() {
            0.0
        } else {
            self.fans.iter().map(|f| f64::from(f.speed)).sum::<f64>() / self.fans.len() as f64
        };
        let equilibrium =
            self.spec.ambient + self.spec.heat * (1.0 - FAN_COOLING_FACTOR * average_speed / 100.0);
        self.temperature += (equilibrium - self.temperature) * THERMAL_RESPONSE + noise;
        self.temperature
    }
}

/// In-memory GPUs implementing [`DeviceBackend`]
pub struct SimulatedBackend {
    devices: Vec<Mutex<SimDevice>>,
    calls: Mutex<Vec<BackendCall>>,
    noise: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimulatedBackend {
    /// `count` identical devices with sensor noise enabled
    pub fn new(count: u32) -> Self {
        let specs = (0..count)
            .map(|i| SimDeviceSpec {
                name: format!("Simulated GPU {}", i),
                ..SimDeviceSpec::default()
            })
            .collect();
        Self::from_specs(specs).with_noise(true)
    }

    /// Devices built from explicit specs, noise disabled
    pub fn from_specs(specs: Vec<SimDeviceSpec>) -> Self {
        Self {
            devices: specs.into_iter().map(|s| Mutex::new(SimDevice::new(s))).collect(),
            calls: Mutex::new(Vec::new()),
            noise: false,
        }
    }

    /// Toggle random jitter on temperature readings
    pub fn with_noise(mut self, noise: bool) -> Self {
        self.noise = noise;
        self
    }

    fn with_device<T>(
        &self,
        device: DeviceId,
        operation: &'static str,
        f: impl FnOnce(&mut SimDevice) -> Result<T>,
    ) -> Result<T> {
        let slot = self
            .devices
            .get(device as usize)
            .ok_or_else(|| FanControlError::backend(device, operation, "no such device"))?;
        f(&mut lock(slot))
    }

    /// Hold the temperature of a device at a fixed value
    pub fn pin_temperature(&self, device: DeviceId, temperature: i32) {
        let _ = self.with_device(device, "pin temperature", |d| {
            d.pinned_temperature = Some(temperature);
            Ok(())
        });
    }

    /// Make temperature reads on a device fail
    pub fn fail_reads(&self, device: DeviceId, fail: bool) {
        let _ = self.with_device(device, "inject read failure", |d| {
            d.fail_reads = fail;
            Ok(())
        });
    }

    /// Make the next temperature reads on a device panic, like a driver bug
    pub fn panic_on_read(&self, device: DeviceId, panic: bool) {
        let _ = self.with_device(device, "inject panic", |d| {
            d.panic_on_read = panic;
            Ok(())
        });
    }

    /// Block temperature reads on a device for `delay`, like a hung driver.
    /// Other calls on the device are not held up.
    pub fn delay_reads(&self, device: DeviceId, delay: Option<Duration>) {
        let _ = self.with_device(device, "inject read delay", |d| {
            d.read_delay = delay;
            Ok(())
        });
    }

    /// Make fan speed writes and restores on a device fail
    pub fn fail_writes(&self, device: DeviceId, fail: bool) {
        let _ = self.with_device(device, "inject write failure", |d| {
            d.fail_writes = fail;
            Ok(())
        });
    }

    /// All actuations issued so far, in order
    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Fan speed writes issued so far
    pub fn set_calls(&self) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::SetFanSpeed { .. }))
            .collect()
    }

    /// Restorations issued so far
    pub fn restore_calls(&self) -> Vec<BackendCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::RestoreDefault { .. }))
            .collect()
    }

    /// Whether a fan is currently under manual control
    pub fn is_manual(&self, device: DeviceId, fan: u32) -> bool {
        self.with_device(device, "query fan policy", |d| Ok(d.fan(device, fan)?.manual))
            .unwrap_or(false)
    }

    fn record(&self, call: BackendCall) {
        lock(&self.calls).push(call);
    }
}

impl DeviceBackend for SimulatedBackend {
    fn device_count(&self) -> Result<u32> {
        Ok(self.devices.len() as u32)
    }

    fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        self.with_device(device, "get device info", |d| {
            Ok(DeviceInfo {
                name: d.spec.name.clone(),
                serial: format!("SIM{:08}", device),
                uuid: format!("GPU-00000000-0000-0000-0000-{:012}", device),
            })
        })
    }

    fn temperature(&self, device: DeviceId) -> Result<i32> {
        let noise = if self.noise {
            rand::thread_rng().gen_range(-0.5..0.5)
        } else {
            0.0
        };
        if let Some(delay) = self.with_device(device, "get temperature", |d| Ok(d.read_delay))? {
            std::thread::sleep(delay);
        }
        self.with_device(device, "get temperature", |d| {
            if d.panic_on_read {
                panic!("simulated driver fault on GPU {}", device);
            }
            if d.fail_reads {
                return Err(FanControlError::backend(device, "get temperature", "sensor read failed"));
            }
            if let Some(pinned) = d.pinned_temperature {
                return Ok(pinned);
            }
            let temperature = d.step(noise);
            trace!("GPU {}: simulated temperature {:.2}°C", device, temperature);
            Ok(temperature.round() as i32)
        })
    }

    fn fan_bounds(&self, device: DeviceId) -> Result<(i32, i32)> {
        self.with_device(device, "get min/max fan speed", |d| {
            Ok((d.spec.min_fan_speed, d.spec.max_fan_speed))
        })
    }

    fn max_temp_threshold(&self, device: DeviceId) -> Result<i32> {
        self.with_device(device, "get max temperature threshold", |d| Ok(d.spec.max_temp))
    }

    fn num_fans(&self, device: DeviceId) -> Result<u32> {
        self.with_device(device, "get fan count", |d| Ok(d.fans.len() as u32))
    }

    fn fan_speed(&self, device: DeviceId, fan: u32) -> Result<i32> {
        self.with_device(device, "get fan speed", |d| Ok(d.fan(device, fan)?.speed))
    }

    fn fan_control_mode(&self, device: DeviceId, fan: u32) -> Result<FanControlMode> {
        self.with_device(device, "get fan control policy", |d| {
            if d.fail_reads {
                return Err(FanControlError::backend(device, "get fan control policy", "query failed"));
            }
            Ok(if d.fan(device, fan)?.manual {
                FanControlMode::Manual
            } else {
                FanControlMode::Auto
            })
        })
    }

    fn current_target_speed(&self, device: DeviceId, fan: u32) -> Result<i32> {
        self.with_device(device, "get target fan speed", |d| Ok(d.fan(device, fan)?.target))
    }

    fn set_fan_speed(&self, device: DeviceId, fan: u32, speed: i32) -> Result<()> {
        self.with_device(device, "set fan speed", |d| {
            if d.fail_writes {
                return Err(FanControlError::FanWrite {
                    device,
                    fan,
                    speed,
                    reason: "write rejected".to_string(),
                });
            }
            let unit = d.fan(device, fan)?;
            unit.target = speed;
            unit.manual = true;
            Ok(())
        })?;
        self.record(BackendCall::SetFanSpeed { device, fan, speed });
        Ok(())
    }

    fn restore_default_fan_speed(&self, device: DeviceId, fan: u32) -> Result<()> {
        self.with_device(device, "restore default fan speed", |d| {
            if d.fail_writes {
                return Err(FanControlError::backend(device, "restore default fan speed", "write rejected"));
            }
            let min = d.spec.min_fan_speed;
            let unit = d.fan(device, fan)?;
            unit.target = min;
            unit.manual = false;
            Ok(())
        })?;
        self.record(BackendCall::RestoreDefault { device, fan });
        Ok(())
    }
}
