//! Error types for the GPU fan daemon

use crate::backend::DeviceId;
use thiserror::Error;

/// Result type alias for the GPU fan daemon
pub type Result<T> = std::result::Result<T, FanControlError>;

/// Main error type for the GPU fan daemon
#[derive(Error, Debug)]
pub enum FanControlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Logging setup error: {0}")]
    Logging(#[from] fern::InitError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid fan curve: {0}")]
    InvalidCurve(String),

    #[error("Device backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("GPU {device}: {operation} failed: {reason}")]
    Backend {
        device: DeviceId,
        operation: &'static str,
        reason: String,
    },

    #[error("GPU {device}: unable to set fan {fan} speed {speed}%: {reason}")]
    FanWrite {
        device: DeviceId,
        fan: u32,
        speed: i32,
        reason: String,
    },
}

impl FanControlError {
    /// Wrap a backend failure with the device and operation it happened on
    pub fn backend(device: DeviceId, operation: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::Backend {
            device,
            operation,
            reason: reason.to_string(),
        }
    }
}
