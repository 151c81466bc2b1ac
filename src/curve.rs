//! Piecewise-linear fan curves
//!
//! A curve is a list of `(temperature, duty)` anchors. Between anchors the duty
//! is interpolated with integer arithmetic and truncating division, so results
//! can sit up to one percent below the exact line. Outside the anchors the
//! device limits apply: below the first anchor the fan runs at the device
//! minimum, above the last one at the device maximum.

use crate::backend::{DeviceId, ThermalBounds};
use crate::errors::{FanControlError, Result};
use log::{debug, error};
use serde::{Deserialize, Serialize};

/// One anchor of a fan curve, written as `[temp, duty]` in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(i32, i32)", into = "(i32, i32)")]
pub struct FanPoint {
    /// Temperature in °C
    pub temp: i32,
    /// Fan duty in percent
    pub duty: i32,
}

impl FanPoint {
    pub fn new(temp: i32, duty: i32) -> Self {
        Self { temp, duty }
    }
}

impl From<(i32, i32)> for FanPoint {
    fn from((temp, duty): (i32, i32)) -> Self {
        Self::new(temp, duty)
    }
}

impl From<FanPoint> for (i32, i32) {
    fn from(point: FanPoint) -> Self {
        (point.temp, point.duty)
    }
}

/// Axis on which two consecutive anchors fail to increase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveAnomaly {
    /// `points[index + 1].temp <= points[index].temp`
    TemperatureNotIncreasing { index: usize },
    /// `points[index + 1].duty <= points[index].duty`
    DutyNotIncreasing { index: usize },
}

/// Ordered, non-empty list of anchors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanCurve {
    points: Vec<FanPoint>,
}

impl FanCurve {
    /// Build a curve from anchors in configuration order. Fails only when empty.
    pub fn new(points: Vec<FanPoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(FanControlError::InvalidCurve("curve has no points".to_string()));
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[FanPoint] {
        &self.points
    }

    /// Pairs of consecutive anchors that are not strictly increasing
    pub fn anomalies(&self) -> Vec<CurveAnomaly> {
        let mut anomalies = Vec::new();
        for (index, pair) in self.points.windows(2).enumerate() {
            if pair[1].temp <= pair[0].temp {
                anomalies.push(CurveAnomaly::TemperatureNotIncreasing { index });
            }
            if pair[1].duty <= pair[0].duty {
                anomalies.push(CurveAnomaly::DutyNotIncreasing { index });
            }
        }
        anomalies
    }

    /// Copy of the curve fitted to a device.
    ///
    /// Temperatures are capped at the max temperature threshold and duties
    /// clamped into the fan speed range. Non-increasing anchors are logged but
    /// kept.
    pub fn clamped(&self, device: DeviceId, bounds: &ThermalBounds) -> Self {
        debug!("GPU {}: clamping curve {:?}", device, self.points);
        let points = self
            .points
            .iter()
            .enumerate()
            .map(|(i, point)| {
                let mut clamped = *point;
                if clamped.temp > bounds.max_temp_threshold {
                    debug!(
                        "GPU {}: point {} temperature {}°C above GPU maximum {}°C",
                        device, i, clamped.temp, bounds.max_temp_threshold
                    );
                    clamped.temp = bounds.max_temp_threshold;
                }
                if clamped.duty < bounds.min_fan_speed {
                    debug!(
                        "GPU {}: point {} duty {}% below allowed minimum {}%",
                        device, i, clamped.duty, bounds.min_fan_speed
                    );
                    clamped.duty = bounds.min_fan_speed;
                } else if clamped.duty > bounds.max_fan_speed {
                    debug!(
                        "GPU {}: point {} duty {}% above allowed maximum {}%",
                        device, i, clamped.duty, bounds.max_fan_speed
                    );
                    clamped.duty = bounds.max_fan_speed;
                }
                clamped
            })
            .collect();

        let curve = Self { points };
        for anomaly in curve.anomalies() {
            match anomaly {
                CurveAnomaly::TemperatureNotIncreasing { index } => error!(
                    "GPU {}: temperature curve is not increasing between points {} and {}",
                    device,
                    index,
                    index + 1
                ),
                CurveAnomaly::DutyNotIncreasing { index } => error!(
                    "GPU {}: fan speed curve is not increasing between points {} and {}",
                    device,
                    index,
                    index + 1
                ),
            }
        }
        debug!("GPU {}: clamped curve {:?}", device, curve.points);
        curve
    }

    /// Fan duty for a temperature, given the device fan speed range.
    ///
    /// On a non-increasing curve the first bracketing pair from the left wins.
    pub fn duty_for_temperature(&self, temp: i32, min_speed: i32, max_speed: i32) -> i32 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];

        if temp < first.temp {
            return min_speed;
        }
        if temp > last.temp {
            return max_speed;
        }

        for pair in self.points.windows(2) {
            let (p1, p2) = (pair[0], pair[1]);
            if temp >= p1.temp && temp <= p2.temp {
                if p2.temp == p1.temp {
                    return p1.duty;
                }
                return interpolate(p1, p2, temp);
            }
        }

        // Single anchor, or a curve whose temperatures go backwards
        if temp == first.temp {
            first.duty
        } else {
            max_speed
        }
    }
}

/// Truncating linear interpolation between two anchors with
/// `p1.temp <= temp <= p2.temp` and `p1.temp < p2.temp`.
///
/// Widened to `i64` since any `i32` anchor temperature is accepted.
fn interpolate(p1: FanPoint, p2: FanPoint, temp: i32) -> i32 {
    let (t1, d1) = (i64::from(p1.temp), i64::from(p1.duty));
    let (t2, d2) = (i64::from(p2.temp), i64::from(p2.duty));
    let duty = d1 + (d2 - d1) * (i64::from(temp) - t1) / (t2 - t1);
    // Lies between the two duties
    i32::try_from(duty).unwrap_or(p2.duty)
}
