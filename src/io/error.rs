// src/io/error.rs
//
// Error taxonomy for the bridge. Validation failures are kept apart from
// device and transport failures so callers can tell "fix your input" from
// "the hardware or network said no".

use thiserror::Error;

/// Rejected configuration input. Raised before any device or socket is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("serial port cannot be empty")]
    EmptyDevicePath,
    #[error("invalid baud rate '{0}': must be a positive integer")]
    InvalidBaudRate(String),
    #[error("invalid poll interval '{0}': must be a positive number of milliseconds")]
    InvalidPollInterval(String),
    #[error("invalid request frame '{0}': expected a non-empty hex string")]
    InvalidRequestFrame(String),
    #[error("invalid HTTP port '{0}': must be a positive integer")]
    InvalidHttpPort(String),
    #[error("invalid WebSocket port '{0}': must be a positive integer")]
    InvalidWsPort(String),
    #[error("invalid data bits '{0}': expected 5, 6, 7 or 8")]
    InvalidDataBits(String),
    #[error("invalid stop bits '{0}': expected 1 or 2")]
    InvalidStopBits(String),
    #[error("invalid open timeout '{0}': must be a positive number of milliseconds")]
    InvalidOpenTimeout(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("configuration rejected: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to open {path}: {reason}")]
    DeviceOpen { path: String, reason: String },

    #[error("device error on {path}: {reason}")]
    DeviceRuntime { path: String, reason: String },

    #[error("failed to start {transport} server on port {port}: {reason}")]
    PublishTransport {
        transport: &'static str,
        port: u16,
        reason: String,
    },

    #[error("open cancelled by a newer open or close request")]
    Cancelled,

    #[error("settings error: {0}")]
    Settings(String),
}

impl BridgeError {
    pub fn device_open(path: &str, reason: impl Into<String>) -> Self {
        BridgeError::DeviceOpen {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn device_runtime(path: &str, reason: impl Into<String>) -> Self {
        BridgeError::DeviceRuntime {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, BridgeError::Validation(_))
    }
}
