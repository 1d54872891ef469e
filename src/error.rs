//! Custom error types for the guider core.
//!
//! This module defines `GuiderError`, the single error type returned by every core
//! operation. Using the `thiserror` crate it gives each failure class its own variant so
//! callers can match on what went wrong instead of decoding sentinel integers.
//!
//! ## Error Hierarchy
//!
//! - **`Protocol`**: the controller replied with a leading byte that is neither `:` nor `?`.
//! - **`Controller`**: the controller rejected a command (`?`); carries the `TC1` text.
//! - **`Timeout`**: a bounded poll (motion completion, actuator settling, limit creep) ran
//!   out of attempts.
//! - **`Range`**: an absolute target falls outside the calibrated travel envelope.
//! - **`InvalidAxis`**: an operation was invoked on an axis that does not support it,
//!   e.g. a brake command on Z.
//! - **`SensorInconsistency`**: a dual-sensor status read is self-contradictory.
//! - **`ConnectionFailure`**: the link could not be established. Fatal at startup.
//!
//! Numeric parse failures on query replies are *not* errors: they degrade to zero in
//! [`crate::hardware::codec`].

use crate::hardware::axis::Axis;
use thiserror::Error;

/// Convenience alias for results using the guider error type.
pub type GuiderResult<T> = std::result::Result<T, GuiderError>;

/// Failure of a guider operation.
#[derive(Error, Debug)]
pub enum GuiderError {
    /// Reply was neither an acknowledgement nor an error marker.
    #[error("Unexpected response from controller (first byte = {byte:#04X})")]
    Protocol {
        /// First byte of the reply
        byte: u8,
    },

    /// Controller answered `?`; carries the `TC1` text.
    #[error("Controller rejected command: {0}")]
    Controller(String),

    /// A bounded poll ran out of attempts.
    #[error("Timed out waiting for {operation} after {attempts} attempts")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Absolute target outside the calibrated envelope.
    #[error("{axis} target encoder value {target} outside calibrated range [{min}, {max}]")]
    Range {
        /// Offending axis
        axis: Axis,
        /// Requested encoder value
        target: i64,
        /// Far-limit encoder value
        min: i64,
        /// Home encoder value
        max: i64,
    },

    /// Operation is not available on this axis.
    #[error("Axis {axis} does not support {operation}")]
    InvalidAxis {
        /// Axis the operation was invoked on
        axis: Axis,
        /// Name of the unsupported operation
        operation: &'static str,
    },

    /// A cylinder reports both or neither end sensor.
    #[error("Cylinder sensors are inconsistent (status word {status_word:#04X})")]
    SensorInconsistency {
        /// Inverted input word as read
        status_word: u8,
    },

    /// The link could not be established.
    #[error("Connection to controller failed: {0}")]
    ConnectionFailure(String),

    /// No homing reference, or the controller token no longer matches.
    #[error("Stage is not homed")]
    NotHomed,

    /// Travel envelope has not been measured.
    #[error("Stage is not calibrated")]
    NotCalibrated,

    /// Far-limit run covered zero steps.
    #[error("Calibration of {axis} measured zero steps of travel")]
    DegenerateCalibration {
        /// Axis that did not travel
        axis: Axis,
    },

    /// Stream read or write failed.
    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file or environment could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Config values out of bounds.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl GuiderError {
    pub(crate) fn timeout(operation: impl Into<String>, attempts: u32) -> Self {
        GuiderError::Timeout {
            operation: operation.into(),
            attempts,
        }
    }

    /// Whether this error means the link itself is unusable.
    ///
    /// Only connection and I/O faults qualify; everything else leaves the link in a state
    /// where the next command can be issued.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, GuiderError::ConnectionFailure(_) | GuiderError::Io(_))
    }
}

impl From<figment::Error> for GuiderError {
    fn from(value: figment::Error) -> Self {
        GuiderError::Config(Box::new(value))
    }
}
