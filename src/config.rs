//! Daemon configuration file
//!
//! ```json
//! {
//!   "period": 2,
//!   "logging": { "type": "stdout", "level": "info" },
//!   "cards": {
//!     "0": { "mode": "curve", "curve": [[60, 30], [65, 50], [75, 100]] },
//!     "1": { "mode": "target", "target": 65, "pid": [20.0, 0.1, 0.0] }
//!   }
//! }
//! ```

use crate::backend::DeviceId;
use crate::curve::{FanCurve, FanPoint};
use crate::errors::{FanControlError, Result};
use crate::pid::PidGains;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Control period used when the file leaves it unset or zero
pub const DEFAULT_PERIOD_SECS: u64 = 1;

/// Configuration path used when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gpu-fan-daemon/config.json";

/// Log file used by the `file` logging type when no path is set
pub const DEFAULT_LOG_PATH: &str = "/var/log/gpu-fan-daemon.log";

/// How a card's fan speed is decided
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ControlMode {
    /// Interpolate a temperature/duty curve
    Curve,
    /// Hold a target temperature with a PID loop
    Target,
    /// Anything else; the card is left under vendor control
    Unknown(String),
}

impl From<String> for ControlMode {
    fn from(mode: String) -> Self {
        match mode.as_str() {
            "curve" => Self::Curve,
            "target" => Self::Target,
            _ => Self::Unknown(mode),
        }
    }
}

/// Per-card settings as written in the file
#[derive(Debug, Clone, Deserialize)]
pub struct CardConfig {
    pub mode: ControlMode,
    /// Target temperature in °C for `target` mode
    #[serde(default)]
    pub target: Option<i32>,
    /// `[kp, ki, kd]` for `target` mode
    #[serde(default)]
    pub pid: Option<Vec<f64>>,
    /// `[[temp, duty], ...]` for `curve` mode
    #[serde(default)]
    pub curve: Option<Vec<FanPoint>>,
}

/// Validated control policy of one card
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPolicy {
    Curve(FanCurve),
    Target { target: i32, gains: PidGains },
}

impl CardConfig {
    /// Check the settings required by the card's mode
    pub fn policy(&self) -> Result<ControlPolicy> {
        match &self.mode {
            ControlMode::Curve => {
                let points = self
                    .curve
                    .clone()
                    .ok_or_else(|| FanControlError::Config("curve mode requires a curve".to_string()))?;
                Ok(ControlPolicy::Curve(FanCurve::new(points)?))
            }
            ControlMode::Target => {
                let target = self
                    .target
                    .ok_or_else(|| FanControlError::Config("target mode requires a target".to_string()))?;
                let gains = self
                    .pid
                    .as_deref()
                    .ok_or_else(|| FanControlError::Config("target mode requires pid gains".to_string()))?;
                Ok(ControlPolicy::Target {
                    target,
                    gains: PidGains::try_from(gains)?,
                })
            }
            ControlMode::Unknown(mode) => Err(FanControlError::Config(format!("unknown mode '{}'", mode))),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// `stdout`, `json` or `file`
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// `debug`, `info`, `warn` or `error`
    #[serde(default)]
    pub level: Option<String>,
    /// Log file for the `file` type
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Whole daemon configuration, immutable once loaded
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Stay attached to the terminal instead of detaching
    #[serde(default)]
    pub foreground: bool,
    /// Seconds between control ticks
    #[serde(default)]
    pub period: u64,
    #[serde(default)]
    pub cards: BTreeMap<DeviceId, CardConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl DaemonConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| FanControlError::Config(format!("can't read {}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: DaemonConfig = serde_json::from_str(json)?;
        if config.period == 0 {
            config.period = DEFAULT_PERIOD_SECS;
        }
        Ok(config)
    }

    /// Interval between two ticks of a control loop
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period.max(DEFAULT_PERIOD_SECS))
    }

    pub fn card(&self, device: DeviceId) -> Option<&CardConfig> {
        self.cards.get(&device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "foreground": true,
        "period": 3,
        "logging": { "type": "json", "level": "debug" },
        "cards": {
            "0": { "mode": "curve", "curve": [[60, 30], [65, 50], [75, 100]] },
            "1": { "mode": "target", "target": 65, "pid": [20.0, 0.1, 0.0] },
            "2": { "mode": "turbo" }
        }
    }"#;

    #[test]
    fn test_parse_full_config() {
        let config = DaemonConfig::from_json(SAMPLE).unwrap();
        assert!(config.foreground);
        assert_eq!(config.period(), Duration::from_secs(3));

        let logging = config.logging.as_ref().unwrap();
        assert_eq!(logging.kind.as_deref(), Some("json"));
        assert_eq!(logging.level.as_deref(), Some("debug"));

        match config.card(0).unwrap().policy().unwrap() {
            ControlPolicy::Curve(curve) => assert_eq!(curve.points().len(), 3),
            other => panic!("unexpected policy {:?}", other),
        }
        assert_eq!(
            config.card(1).unwrap().policy().unwrap(),
            ControlPolicy::Target {
                target: 65,
                gains: PidGains::new(20.0, 0.1, 0.0),
            }
        );
        assert_eq!(config.card(2).unwrap().mode, ControlMode::Unknown("turbo".to_string()));
        assert!(matches!(
            config.card(2).unwrap().policy(),
            Err(FanControlError::Config(_))
        ));
        assert!(config.card(3).is_none());
    }

    #[test]
    fn test_period_defaults_to_one_second() {
        let config = DaemonConfig::from_json(r#"{ "cards": {} }"#).unwrap();
        assert_eq!(config.period(), Duration::from_secs(1));
        assert!(config.logging.is_none());

        let config = DaemonConfig::from_json(r#"{ "period": 0 }"#).unwrap();
        assert_eq!(config.period, DEFAULT_PERIOD_SECS);
    }

    #[test]
    fn test_incomplete_cards_are_config_errors() {
        let config = DaemonConfig::from_json(
            r#"{ "cards": {
                "0": { "mode": "curve" },
                "1": { "mode": "curve", "curve": [] },
                "2": { "mode": "target", "pid": [1.0, 0.0, 0.0] },
                "3": { "mode": "target", "target": 60, "pid": [1.0, 0.0] }
            } }"#,
        )
        .unwrap();

        for device in 0..4 {
            let err = config.card(device).unwrap().policy().unwrap_err();
            assert!(
                matches!(err, FanControlError::Config(_) | FanControlError::InvalidCurve(_)),
                "GPU {}: {}",
                device,
                err
            );
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = DaemonConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.cards.len(), 3);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::load_from_file(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, FanControlError::Config(_)));
    }
}
