//! GPU Fan Control Daemon
//!
//! Regulates GPU fan speed from temperature, either along a fan curve or with
//! a PID loop holding a target temperature, and restores the driver's default
//! fan policy when it stops.

pub mod args;
pub mod backend;
pub mod config;
pub mod curve;
pub mod daemon;
pub mod errors;
pub mod inspect;
pub mod logging;
pub mod pid;

// Re-export commonly used types
pub use backend::{DeviceBackend, DeviceId, FanControlMode, ThermalBounds};
pub use config::DaemonConfig;
pub use curve::{FanCurve, FanPoint};
pub use daemon::{DaemonExit, FanDaemon, ShutdownGuard};
pub use errors::{FanControlError, Result};
pub use pid::{PidController, PidGains};
