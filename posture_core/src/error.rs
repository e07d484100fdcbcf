//! Error types for the posture_core library.

use crate::{CalibrationStep, DeviceRole};
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for posture_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No matching peripheral connected within the scan/connection window
    #[error("Connection timeout: no {} peripheral connected within {waited_ms} ms", role_label(.role))]
    ConnectionTimeout {
        role: Option<DeviceRole>,
        waited_ms: u64,
    },

    /// A calibration phase finished without any samples for a role
    #[error("Incomplete calibration data: no samples collected for {role}")]
    IncompleteCalibrationData { role: DeviceRole },

    /// Classification requested without a completed calibration profile
    #[error("Missing calibration: complete calibration before analysing sessions")]
    MissingCalibration,

    /// A telemetry record could not be parsed or paired
    #[error("Malformed telemetry record: {0}")]
    MalformedTelemetryRecord(String),

    /// A store read or write failed
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// The radio rejected a request
    #[error("Radio error: {0}")]
    Radio(String),

    /// A cycle was requested while another one is still running
    #[error("A device cycle is already running")]
    CycleBusy,

    /// The controller task is gone
    #[error("Device cycle controller is no longer running")]
    ControllerClosed,

    /// Calibration was cancelled while a phase was collecting
    #[error("Calibration cancelled")]
    CalibrationCancelled,

    /// Calibration step change not allowed from the current step
    #[error("Invalid calibration transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: CalibrationStep,
        to: CalibrationStep,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn role_label(role: &Option<DeviceRole>) -> String {
    match role {
        Some(role) => role.to_string(),
        None => "sensor".into(),
    }
}

impl Error {
    /// Whether the user can simply retry the operation that failed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout { .. }
                | Error::IncompleteCalibrationData { .. }
                | Error::Persistence(_)
                | Error::CycleBusy
        )
    }
}
