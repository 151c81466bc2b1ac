//! Per-device control loop
//!
//! Each configured GPU gets one [`DeviceController`] running on its own task:
//! read temperature, compute a duty with the card's curve or PID loop, apply
//! it to every fan, sleep, repeat. Backend calls are blocking, so each tick
//! runs on tokio's blocking pool. Any backend failure ends the loop with an
//! error; the supervisor treats that as fatal.

use super::ShutdownGuard;
use crate::backend::{DeviceBackend, DeviceId, ThermalBounds};
use crate::config::ControlPolicy;
use crate::curve::FanCurve;
use crate::errors::{FanControlError, Result};
use crate::pid::PidController;
use log::{debug, info};
use std::panic;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::spawn_blocking;
use tokio::time::sleep;

/// Duty computation owned by one loop
#[derive(Debug, Clone)]
pub enum FanPolicy {
    Curve(FanCurve),
    Pid(PidController),
}

/// Everything one device's loop owns between ticks
#[derive(Debug)]
pub struct DeviceController {
    device: DeviceId,
    bounds: ThermalBounds,
    policy: FanPolicy,
}

/// Command every fan on a device to `speed`.
///
/// Fans already targeting that speed are skipped. Returns the number of
/// writes issued; the first failed write aborts with its error.
pub fn apply_fan_speed(backend: &dyn DeviceBackend, device: DeviceId, speed: i32) -> Result<usize> {
    let mut writes = 0;
    for fan in 0..backend.num_fans(device)? {
        if backend.current_target_speed(device, fan)? == speed {
            debug!("GPU {}: fan {} already at {}%, skipping", device, fan, speed);
            continue;
        }
        backend.set_fan_speed(device, fan, speed)?;
        writes += 1;
    }
    Ok(writes)
}

impl DeviceController {
    /// Read the device limits and build the loop state for `policy`
    pub fn initialize(backend: &dyn DeviceBackend, device: DeviceId, policy: &ControlPolicy) -> Result<Self> {
        let bounds = backend.thermal_bounds(device)?;
        let policy = match policy {
            ControlPolicy::Curve(curve) => {
                info!("GPU {}: curve control", device);
                FanPolicy::Curve(curve.clamped(device, &bounds))
            }
            ControlPolicy::Target { target, gains } => {
                info!(
                    "GPU {}: target control at {}°C (kp={}, ki={}, kd={})",
                    device, target, gains.kp, gains.ki, gains.kd
                );
                FanPolicy::Pid(PidController::new(
                    *target,
                    *gains,
                    bounds.min_fan_speed,
                    bounds.max_fan_speed,
                ))
            }
        };
        Ok(Self {
            device,
            bounds,
            policy,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn policy(&self) -> &FanPolicy {
        &self.policy
    }

    /// Duty for a temperature sample; advances PID state
    pub fn compute(&mut self, temp: i32) -> i32 {
        match &mut self.policy {
            FanPolicy::Curve(curve) => {
                curve.duty_for_temperature(temp, self.bounds.min_fan_speed, self.bounds.max_fan_speed)
            }
            FanPolicy::Pid(pid) => {
                let step = pid.step(temp);
                debug!(
                    "GPU {}: PID error={} p={} i_acc={} d={} input={} output={}",
                    self.device, step.error, step.p_term, step.integral, step.d_term, temp, step.output
                );
                step.output
            }
        }
    }

    /// One tick: sample, compute, apply. Returns the commanded duty.
    ///
    /// Nothing is written once `guard` has handed the fans back.
    pub fn tick(&mut self, backend: &dyn DeviceBackend, guard: &ShutdownGuard) -> Result<i32> {
        let temp = backend.temperature(self.device)?;
        let speed = self.compute(temp);
        debug!("GPU {}: {}°C -> {}%", self.device, temp, speed);
        match guard.while_open(|| apply_fan_speed(backend, self.device, speed)) {
            Some(applied) => {
                applied?;
            }
            None => debug!("GPU {}: fans already restored, dropping {}%", self.device, speed),
        }
        Ok(speed)
    }

    /// Run one tick on the blocking pool and take the controller back
    async fn tick_blocking(self, backend: &Arc<dyn DeviceBackend>, guard: &Arc<ShutdownGuard>) -> Result<Self> {
        let device = self.device;
        let backend = backend.clone();
        let guard = guard.clone();
        let mut controller = self;
        let handle = spawn_blocking(move || {
            let result = controller.tick(backend.as_ref(), &guard);
            (controller, result)
        });

        match handle.await {
            Ok((controller, result)) => result.map(|_| controller),
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(e) => Err(FanControlError::backend(device, "run control tick", e)),
        }
    }

    /// Tick every `period` until `stop` flips or a tick fails.
    pub async fn run(
        mut self,
        backend: Arc<dyn DeviceBackend>,
        guard: Arc<ShutdownGuard>,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        debug!("GPU {}: starting control loop every {:?}", self.device, period);
        loop {
            if *stop.borrow() {
                break;
            }
            self = self.tick_blocking(&backend, &guard).await?;
            tokio::select! {
                _ = sleep(period) => {}
                _ = stop.changed() => break,
            }
        }
        debug!("GPU {}: control loop stopped", self.device);
        Ok(())
    }
}
