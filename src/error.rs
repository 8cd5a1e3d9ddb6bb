//! Custom error types for the application.
//!
//! This module defines the primary error type, `PipetteError`, for the entire
//! engine. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the engine can hit,
//! from configuration problems to exhausted consumables to faults reported by
//! the motion controller.
//!
//! ## Error classes
//!
//! - **Validation** (`UnknownLocation`, `DuplicateName`, `InvalidGeometry`,
//!   `PlateExhausted`, `VolumeOutOfRange`, `TipAlreadyOn`, `NoTipbox`,
//!   `NoWasteContainer`): pure pre-flight failures. They are always surfaced
//!   to the caller before any physical motion is issued and are never retried
//!   internally.
//! - **Controller** (`ControllerTimeout`, `ControllerFault`): raised by the
//!   dispatcher when the motion controller misses its acknowledgment window
//!   or reports a hardware fault. After a timeout the physical position is
//!   unknown until the next successful home.
//! - **Run state** (`AlreadyRunning`, `NotRunning`): illegal protocol-runner
//!   transitions.
//! - **Infrastructure** (`Config`, `Io`, `Persist`): wrapped errors from
//!   figment, `std::io`, and `serde_json`.
//!
//! Partially-completed physical operations are never repeated automatically:
//! a half-finished aspirate cannot be replayed without risking a double dose
//! or tip contamination, so controller failures halt the run and leave the
//! operator to inspect.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PipetteError>;

#[derive(Error, Debug)]
pub enum PipetteError {
    #[error("'{0}' is not a named location")]
    UnknownLocation(String),

    #[error("location '{0}' is already registered")]
    DuplicateName(String),

    #[error("invalid plate geometry: {0}")]
    InvalidGeometry(String),

    #[error("plate '{0}' has no free slots left")]
    PlateExhausted(String),

    #[error("volume {requested} uL is outside the calibrated range (max {max} uL)")]
    VolumeOutOfRange { requested: f64, max: f64 },

    #[error("controller did not acknowledge '{op}' in time; position unknown until next home")]
    ControllerTimeout { op: String },

    #[error("controller reported fault: {0}")]
    ControllerFault(String),

    #[error("a protocol run is already in progress")]
    AlreadyRunning,

    #[error("no protocol run is in progress")]
    NotRunning,

    #[error("a tip is already on the pipette; eject it before picking up another")]
    TipAlreadyOn,

    #[error("no plate registered as a tip box")]
    NoTipbox,

    #[error("no plate registered as a waste container")]
    NoWasteContainer,

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence error: {0}")]
    Persist(#[from] serde_json::Error),

    #[error("runner control channel closed")]
    RunnerGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PipetteError::UnknownLocation("plate9".to_string());
        assert_eq!(err.to_string(), "'plate9' is not a named location");
    }

    #[test]
    fn test_volume_error_carries_bounds() {
        let err = PipetteError::VolumeOutOfRange {
            requested: 150.0,
            max: 103.0,
        };
        assert!(err.to_string().contains("150"));
        assert!(err.to_string().contains("103"));
    }
}
