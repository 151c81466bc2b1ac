//! PID controller holding a GPU at a target temperature
//!
//! The error is `measured - target`, positive when the GPU runs hot, so a
//! positive output means more fan. The integral accumulator stops growing
//! toward a saturated limit (conditional integration anti-windup). Nothing is
//! reset between ticks; state lives as long as the controller.

use crate::errors::{FanControlError, Result};
use log::debug;

/// Proportional, integral and derivative gains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

impl TryFrom<&[f64]> for PidGains {
    type Error = FanControlError;

    /// Gains from a `[kp, ki, kd]` list
    fn try_from(values: &[f64]) -> Result<Self> {
        match values {
            [kp, ki, kd] if values.iter().all(|v| v.is_finite()) => Ok(Self::new(*kp, *ki, *kd)),
            [_, _, _] => Err(FanControlError::Config(format!(
                "PID gains must be finite numbers, got {:?}",
                values
            ))),
            _ => Err(FanControlError::Config(format!(
                "PID needs exactly three gains [kp, ki, kd], got {}",
                values.len()
            ))),
        }
    }
}

/// Terms computed by one controller step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidStep {
    pub error: f64,
    pub p_term: f64,
    pub i_term: f64,
    pub d_term: f64,
    pub integral: f64,
    /// Whether the integral contribution was dropped this step
    pub anti_windup: bool,
    /// Fan duty in percent, within the device range
    pub output: i32,
}

/// Stateful PID loop for one device. Not shared between tasks.
#[derive(Debug, Clone)]
pub struct PidController {
    target: i32,
    gains: PidGains,
    min_speed: i32,
    max_speed: i32,
    prev_error: f64,
    integral: f64,
}

impl PidController {
    pub fn new(target: i32, gains: PidGains, min_speed: i32, max_speed: i32) -> Self {
        Self {
            target,
            gains,
            min_speed,
            max_speed,
            prev_error: 0.0,
            integral: 0.0,
        }
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn prev_error(&self) -> f64 {
        self.prev_error
    }

    /// Feed one temperature sample and get the next fan duty
    pub fn step(&mut self, measured: i32) -> PidStep {
        let min = f64::from(self.min_speed);
        let max = f64::from(self.max_speed);

        let error = f64::from(measured) - f64::from(self.target);
        let p_term = error * self.gains.kp;
        let d_term = self.gains.kd * (error - self.prev_error);
        let mut i_term = self.gains.ki * error;
        self.prev_error = error;

        // Integrating further would only push an already saturated output
        let anti_windup = (p_term + self.integral > max && i_term > 0.0)
            || (p_term + self.integral < min && i_term < 0.0);
        if anti_windup {
            debug!("PID anti-windup triggered, dropping i_term {}", i_term);
            i_term = 0.0;
        }
        self.integral += i_term;

        // `as` truncates toward zero and saturates on overflow
        let raw = (p_term + self.integral + d_term) as i32;
        let output = if raw < self.min_speed {
            debug!("PID clamping output {} to min {}", raw, self.min_speed);
            self.min_speed
        } else if raw > self.max_speed {
            debug!("PID clamping output {} to max {}", raw, self.max_speed);
            self.max_speed
        } else {
            raw
        };

        PidStep {
            error,
            p_term,
            i_term,
            d_term,
            integral: self.integral,
            anti_windup,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_tick_saturates_at_device_maximum() {
        let mut pid = PidController::new(65, PidGains::new(20.0, 0.1, 0.0), 0, 100);
        let step = pid.step(70);

        assert_eq!(step.error, 5.0);
        assert_eq!(step.p_term, 100.0);
        assert!(!step.anti_windup);
        assert!((step.integral - 0.5).abs() < 1e-9);
        assert_eq!(step.output, 100);
    }

    #[test]
    fn test_first_tick_with_lower_ceiling_suppresses_integral() {
        let mut pid = PidController::new(65, PidGains::new(20.0, 0.1, 0.0), 30, 80);
        let step = pid.step(70);

        assert!(step.anti_windup);
        assert_eq!(step.i_term, 0.0);
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(step.output, 80);
    }

    #[test]
    fn test_integral_stops_growing_when_saturated() {
        let mut pid = PidController::new(60, PidGains::new(10.0, 1.0, 0.0), 0, 100);

        // p_term 50 leaves room for the integral to build up past the ceiling once
        let mut last_integral = 0.0;
        for _ in 0..200 {
            let step = pid.step(65);
            assert!(step.integral >= last_integral);
            last_integral = step.integral;
        }
        let saturated = pid.integral();
        assert_eq!(saturated, 55.0);

        for _ in 0..50 {
            let step = pid.step(65);
            assert!(step.anti_windup);
            assert_eq!(step.output, 100);
        }
        assert_eq!(pid.integral(), saturated);
    }

    #[test]
    fn test_integral_recovers_below_minimum() {
        let mut pid = PidController::new(70, PidGains::new(5.0, 0.5, 0.0), 20, 100);
        let step = pid.step(40);
        // p_term -150 is already below the floor, negative i_term is dropped
        assert!(step.anti_windup);
        assert_eq!(pid.integral(), 0.0);
        assert_eq!(step.output, 20);
    }

    #[test]
    fn test_zero_error_leaves_integral_unchanged() {
        let mut pid = PidController::new(60, PidGains::new(2.0, 0.5, 1.0), 0, 100);
        pid.step(70);
        pid.step(70);
        let integral = pid.integral();

        let mut outputs = Vec::new();
        for _ in 0..10 {
            outputs.push(pid.step(60).output);
            assert_eq!(pid.integral(), integral);
        }
        // After the derivative kick fades only the residual integral remains
        assert!(outputs[1..].iter().all(|o| *o == integral as i32));
    }

    #[test]
    fn test_derivative_uses_previous_error() {
        let mut pid = PidController::new(50, PidGains::new(0.0, 0.0, 3.0), -100, 100);
        assert_eq!(pid.step(52).d_term, 6.0);
        assert_eq!(pid.step(55).d_term, 9.0);
        assert_eq!(pid.prev_error(), 5.0);
    }

    #[test]
    fn test_previous_error_updates_during_anti_windup() {
        let mut pid = PidController::new(60, PidGains::new(50.0, 1.0, 0.0), 0, 100);
        let step = pid.step(80);
        assert!(step.anti_windup);
        assert_eq!(pid.prev_error(), 20.0);
    }

    #[test]
    fn test_output_stays_within_bounds() {
        let gains = PidGains::new(7.5, 0.8, 4.0);
        let mut pid = PidController::new(65, gains, 25, 95);
        let samples = [20, 120, 65, 64, 90, -40, 300, 65, 66, 0, i32::MAX / 2, i32::MIN / 2];
        for temp in samples.iter().cycle().take(500) {
            let out = pid.step(*temp).output;
            assert!((25..=95).contains(&out), "output {} for {}°C", out, temp);
        }
    }

    #[test]
    fn test_gains_from_list() {
        let gains = PidGains::try_from(&[20.0, 0.1, 0.0][..]).unwrap();
        assert_eq!(gains, PidGains::new(20.0, 0.1, 0.0));

        assert!(PidGains::try_from(&[1.0, 2.0][..]).is_err());
        assert!(PidGains::try_from(&[1.0, f64::NAN, 0.0][..]).is_err());
    }
}
