//! Stage reference and coordinate handling.
//!
//! - [`homing`]: homing and calibration sequences
//! - [`mapper`]: inch/mil conversions and travel-envelope checks

pub mod homing;
pub mod mapper;

pub use homing::{FarLimit, HomeReference, HomingEngine, HomingPhase};
pub use mapper::{AxisCalibration, AxisMove, MovePlan};
