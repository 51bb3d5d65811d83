//! Custom error types for the recorder.
//!
//! This module defines the primary error type, `RecorderError`, shared by the
//! controller, the recording pipeline, the protocol layer and the device
//! collaborators. Using the `thiserror` crate, it provides one consistent way to
//! describe failures from configuration parsing up to mid-stream device loss.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: parse errors from `figment` and semantic
//!   validation errors (zero capacities, unknown log levels).
//! - **`Io`**, **`Csv`**, **`Json`**: wrapped lower level failures, converted with `?`.
//! - **`Probe`**: capability discovery failed (`ProbeError`).
//! - **`DeviceOpen`** / **`DeviceLost`**: the device could not be opened, or failed
//!   while streaming.
//! - **`Protocol`**: a line could not be decoded into a command or status.
//! - **`Pipeline`**: the recording pipeline could not be started or stopped.
//! - **`DrainTimeout`**: the writer did not drain its queue in time; carries the
//!   number of items that were force-cancelled.
//!
//! - **`ShutdownFailed`**: one or more module tasks did not stop cleanly.
//!
//! Queue overflow has no variant: it is counted, never raised.

use thiserror::Error;

/// Convenience alias for results using the recorder error type.
pub type AppResult<T> = std::result::Result<T, RecorderError>;

/// Errors raised by the recorder library.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum RecorderError {
    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is not usable
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Capability discovery failed
    #[error("Capability probe failed: {0}")]
    Probe(String),

    #[error("Failed to open device: {0}")]
    DeviceOpen(String),

    /// The device failed while streaming
    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("No device is open")]
    DeviceNotOpen,

    /// A line was not a valid command or status
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Recording pipeline error: {0}")]
    Pipeline(String),

    /// The writer missed the drain deadline
    #[error("Writer did not drain within timeout, {residual} item(s) cancelled")]
    DrainTimeout { residual: usize },

    #[error("Task '{task}' did not stop cleanly: {reason}")]
    TaskFailed { task: String, reason: String },

    #[error("Controller is no longer running")]
    ControllerClosed,

    /// Aggregate of task failures during shutdown
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<RecorderError>),
}

impl From<figment::Error> for RecorderError {
    fn from(err: figment::Error) -> Self {
        RecorderError::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RecorderError::Probe("camera not found".to_string());
        assert_eq!(err.to_string(), "Capability probe failed: camera not found");
    }

    #[test]
    fn test_drain_timeout_reports_residual() {
        let err = RecorderError::DrainTimeout { residual: 7 };
        assert!(err.to_string().contains("7 item(s) cancelled"));
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = RecorderError::ShutdownFailed(vec![
            RecorderError::DeviceLost("camera timeout".into()),
            RecorderError::Pipeline("buffer drain".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
