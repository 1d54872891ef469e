//! Coordinate Mapper
//!
//! Pure conversions between physical units (inches, mils) and controller counts.
//!
//! Encoder values fall as the stage moves away from home: the home reference is the maximum
//! encoder value (`encoder_offset`) and the far limit found during calibration is the
//! minimum (`encoder_min`). A valid absolute target always lands in
//! `[encoder_min, encoder_offset]`.
//!
//! Two formulas relate inches and encoder pulses and they are deliberately kept apart:
//! [`target_encoder`] truncates when planning a move, [`position_inches`] reports the
//! read-back position without truncation. Both use the nominal screw constants.

use crate::config::AxisGeometry;
use crate::error::{GuiderError, GuiderResult};
use crate::hardware::axis::Axis;
use serde::{Deserialize, Serialize};

/// Calibrated travel envelope of one translation axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisCalibration {
    /// Encoder value at the home reference
    pub encoder_offset: i64,
    /// Encoder value at the far limit
    pub encoder_min: i64,
    /// Measured encoder pulses per motor step
    pub encoder_per_step: f64,
}

/// One axis of a planned absolute move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AxisMove {
    /// Encoder reading before the move
    pub current: i64,
    /// Encoder value the move aims for
    pub target: i64,
    /// Relative motor steps to command
    pub steps: i64,
}

/// A validated X-Y absolute move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MovePlan {
    /// X component
    pub x: AxisMove,
    /// Y component
    pub y: AxisMove,
}

/// Encoder value equivalent to `inches` from home.
pub fn target_encoder(encoder_offset: i64, inches: f64, geometry: &AxisGeometry) -> i64 {
    encoder_offset - (inches * geometry.pulses_per_inch()).trunc() as i64
}

/// Reject a target outside the calibrated envelope.
pub fn check_range(axis: Axis, target: i64, calibration: &AxisCalibration) -> GuiderResult<()> {
    if target > calibration.encoder_offset || target < calibration.encoder_min {
        return Err(GuiderError::Range {
            axis,
            target,
            min: calibration.encoder_min,
            max: calibration.encoder_offset,
        });
    }
    Ok(())
}

/// Motor steps for an encoder delta at the nominal pulses-per-step ratio.
///
/// Rounds half away from zero.
pub fn encoder_delta_to_steps(delta: i64, geometry: &AxisGeometry) -> i64 {
    (delta as f64 / geometry.pulses_per_step()).round() as i64
}

/// Plan one axis of an absolute move from its current encoder reading.
pub fn plan_axis(
    axis: Axis,
    inches: f64,
    current: i64,
    calibration: &AxisCalibration,
    geometry: &AxisGeometry,
) -> GuiderResult<AxisMove> {
    let target = target_encoder(calibration.encoder_offset, inches, geometry);
    check_range(axis, target, calibration)?;
    Ok(AxisMove {
        current,
        target,
        steps: encoder_delta_to_steps(target - current, geometry),
    })
}

/// Read-back position in inches from home.
pub fn position_inches(encoder_offset: i64, encoder: i64, geometry: &AxisGeometry) -> f64 {
    (encoder_offset - encoder) as f64 * geometry.screw_pitch
        / geometry.encoder_pulses_per_turn as f64
}

/// Measured encoder pulses per step over a calibration run.
///
/// # Errors
/// [`GuiderError::DegenerateCalibration`] when the run covered zero steps.
pub fn calibration_scale(
    axis: Axis,
    encoder_offset: i64,
    final_encoder: i64,
    steps: i64,
) -> GuiderResult<f64> {
    if steps == 0 {
        return Err(GuiderError::DegenerateCalibration { axis });
    }
    Ok((final_encoder - encoder_offset) as f64 / steps as f64)
}

/// Focus motor steps per mil of travel, truncated.
pub fn focus_steps_per_mil(steps_per_turn: i64, screw_pitch: f64) -> i64 {
    (steps_per_turn as f64 / (1000.0 * screw_pitch)).trunc() as i64
}

/// Relative focus steps that bring the step counter to `-target_mils` worth of steps.
pub fn focus_move_steps(target_mils: f64, current_steps: i64, steps_per_mil: i64) -> i64 {
    let target = (target_mils * steps_per_mil as f64).trunc() as i64;
    -target - current_steps
}
