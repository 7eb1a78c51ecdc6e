//! Custom error types for the orchestration core.
//!
//! `DeviceError` consolidates the failure modes this layer can see: config
//! loading, storage I/O, driver-reported errors, and closed actor channels.
//! Reconstruction failures are deliberately *not* an error variant: a
//! persisted manager family that is no longer compiled in degrades to "no
//! active device" (the registry returns `None` and logs).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DeviceError>;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Pump driver error: {0}")]
    Pump(String),

    #[error("CGM driver error: {0}")]
    Cgm(String),

    #[error("Device session is no longer running")]
    SessionClosed,
}

impl From<anyhow::Error> for DeviceError {
    fn from(value: anyhow::Error) -> Self {
        DeviceError::Storage(value.to_string())
    }
}
