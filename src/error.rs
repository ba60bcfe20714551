//! Custom error types for the control unit.
//!
//! This module defines the primary error type, `DaqError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized way to report the few
//! conditions that are allowed to reach a caller: configuration problems, file
//! I/O while persisting batches, thread lifecycle failures and unknown devices.
//!
//! ## What is *not* an error
//!
//! Conditions listed as recoverable never surface as `DaqError`:
//!
//! - A bad sensor reading is recorded as a sentinel value plus a warning message.
//! - An invalid gain or gauge-mode request is coerced to a safe default with a warning.
//! - A control setter called while no acquisition is running is a no-op.
//!
//! Those paths travel as [`DeviceEvent::Message`](crate::device::DeviceEvent) so the
//! coordinator and the other workers keep running.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Unknown device '{0}'")]
    DeviceNotFound(String),

    #[error("Acquisition is already running")]
    AcquisitionRunning,

    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// Flatten nested shutdown failures into one human readable line.
    pub fn summary(&self) -> String {
        match self {
            DaqError::ShutdownFailed(errors) => {
                let combined = errors
                    .iter()
                    .map(DaqError::summary)
                    .collect::<Vec<_>>()
                    .join("; ");
                format!("Shutdown failed: {combined}")
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarises_shutdown_failure() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::ThreadSpawn("adc".into()),
            DaqError::Hardware("dac timeout".into()),
        ]);
        let text = err.summary();
        assert!(text.contains("adc"));
        assert!(text.contains("dac timeout"));
    }

    #[test]
    fn figment_errors_are_boxed() {
        let err: DaqError = figment::Error::from("missing field".to_string()).into();
        assert!(matches!(err, DaqError::Config(_)));
    }
}
