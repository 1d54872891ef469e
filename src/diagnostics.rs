//! Diagnostics
//!
//! Self-check of the pneumatic and motion hardware, and a status snapshot of everything the
//! core can read back. Both reports serialize with serde for `--json` output and implement
//! `Display` for the terminal.

use crate::error::{GuiderError, GuiderResult};
use crate::guider::Guider;
use crate::hardware::actuator::{Actuator, ActuatorReading, CylinderCommand, LedState};
use crate::hardware::axis::{Axis, BrakeState, Limits, PowerState};
use serde::Serialize;
use std::fmt;
use tracing::{info, instrument, warn};

/// Steps moved per axis by the scale check.
pub const SCALE_CHECK_STEPS: i64 = 500;

/// Allowed deviation of the measured pulses-per-step from nominal.
pub const SCALE_TOLERANCE: f64 = 0.01;

/// Number of extend/retract cycles per cylinder.
const ACTUATOR_CYCLES: usize = 2;

/// An actuator command that did not settle.
#[derive(Debug, Clone, Serialize)]
pub struct ActuatorFailure {
    /// Cylinder
    pub actuator: Actuator,
    /// Command that failed
    pub command: CylinderCommand,
    /// Error text
    pub error: String,
}

/// Measured encoder scale on one axis.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleCheck {
    /// Axis moved
    pub axis: Axis,
    /// Encoder change over the move
    pub encoder_delta: i64,
    /// `encoder_delta / SCALE_CHECK_STEPS`
    pub measured: f64,
    /// Nominal pulses per step
    pub nominal: f64,
    /// Within tolerance
    pub passed: bool,
}

/// Outcome of the motion part of the self-check.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MotionCheck {
    /// A limit switch was engaged, so nothing was moved
    Skipped {
        /// Axis and limit bitmask that caused the skip
        engaged: Vec<(Axis, u8)>,
    },
    /// Both axes were moved and measured
    Measured {
        /// X then Y
        axes: Vec<ScaleCheck>,
    },
}

/// Self-check results.
#[derive(Debug, Clone, Serialize)]
pub struct SelfCheckReport {
    /// Cylinder commands that failed
    pub actuator_failures: Vec<ActuatorFailure>,
    /// Encoder scale check
    pub motion: MotionCheck,
}

impl SelfCheckReport {
    /// No actuator failures and every measured axis within tolerance.
    pub fn passed(&self) -> bool {
        let motion_ok = match &self.motion {
            MotionCheck::Skipped { .. } => true,
            MotionCheck::Measured { axes } => axes.iter().all(|check| check.passed),
        };
        self.actuator_failures.is_empty() && motion_ok
    }
}

impl fmt::Display for SelfCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.actuator_failures.is_empty() {
            writeln!(f, "actuators: ok")?;
        }
        for failure in &self.actuator_failures {
            writeln!(
                f,
                "actuator {} {:?}: FAILED ({})",
                failure.actuator, failure.command, failure.error
            )?;
        }
        match &self.motion {
            MotionCheck::Skipped { engaged } => {
                for (axis, bits) in engaged {
                    writeln!(f, "motion: skipped, {axis} limit mask {bits:#04b}")?;
                }
            }
            MotionCheck::Measured { axes } => {
                for check in axes {
                    writeln!(
                        f,
                        "motion {}: {:.4} pulses/step (nominal {:.4}) {}",
                        check.axis,
                        check.measured,
                        check.nominal,
                        if check.passed { "ok" } else { "FAILED" }
                    )?;
                }
            }
        }
        write!(f, "{}", if self.passed() { "PASS" } else { "FAIL" })
    }
}

/// Cycle the beam selectors and check the encoder scale on X and Y.
///
/// Actuator failures are recorded and the check carries on; only link faults abort it. The
/// motion test is skipped when any X/Y limit switch is engaged. Each axis is returned to its
/// starting point after it is measured.
#[instrument(skip(guider), err)]
pub async fn self_check(guider: &Guider) -> GuiderResult<SelfCheckReport> {
    let mut actuator_failures = Vec::new();
    for _ in 0..ACTUATOR_CYCLES {
        for actuator in Actuator::SENSED {
            for command in [CylinderCommand::Extend, CylinderCommand::Retract] {
                match guider.command_actuator(actuator, command).await {
                    Ok(_) => {}
                    Err(err) if err.is_link_fault() => return Err(err),
                    Err(err) => {
                        warn!(%actuator, ?command, error = %err, "actuator check failed");
                        actuator_failures.push(ActuatorFailure {
                            actuator,
                            command,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    let axes = guider.axes();
    let mut engaged = Vec::new();
    for axis in [Axis::X, Axis::Y] {
        let limits = axes.limit_switch(axis).await?;
        if limits.any() {
            engaged.push((axis, limits.bits()));
        }
    }

    let motion = if engaged.is_empty() {
        let mut checks = Vec::with_capacity(2);
        for (axis, x, y) in [
            (Axis::X, SCALE_CHECK_STEPS, 0),
            (Axis::Y, 0, SCALE_CHECK_STEPS),
        ] {
            let before = axes.encoder_position(axis).await?;
            guider.move_relative(x, y).await?;
            let after = axes.encoder_position(axis).await?;
            guider.move_relative(-x, -y).await?;

            let nominal = if axis == Axis::X {
                guider.config().stage.x.pulses_per_step()
            } else {
                guider.config().stage.y.pulses_per_step()
            };
            let encoder_delta = after - before;
            let measured = encoder_delta as f64 / SCALE_CHECK_STEPS as f64;
            checks.push(ScaleCheck {
                axis,
                encoder_delta,
                measured,
                nominal,
                passed: (measured - nominal).abs() <= SCALE_TOLERANCE,
            });
        }
        MotionCheck::Measured { axes: checks }
    } else {
        info!(?engaged, "limit engaged, skipping motion check");
        MotionCheck::Skipped { engaged }
    };

    let report = SelfCheckReport {
        actuator_failures,
        motion,
    };
    info!(passed = report.passed(), "self-check finished");
    Ok(report)
}

/// Read-back state of one axis.
#[derive(Debug, Clone, Serialize)]
pub struct AxisReport {
    /// Axis
    pub axis: Axis,
    /// Step counter
    pub steps: i64,
    /// Encoder reading (X/Y)
    pub encoder: Option<i64>,
    /// Limit switches
    pub limits: Limits,
    /// Motor power
    pub power: PowerState,
    /// Brake
    pub brake: BrakeState,
    /// In motion
    pub moving: bool,
    /// Home encoder offset
    pub encoder_offset: Option<i64>,
    /// Far-limit encoder value
    pub encoder_min: Option<i64>,
    /// Read-back position in inches, when calibrated
    pub position_inches: Option<f64>,
}

/// Actuator position, or why it could not be read.
#[derive(Debug, Clone, Serialize)]
pub struct ActuatorReport {
    /// Actuator
    pub actuator: Actuator,
    /// Decoded reading
    pub reading: Option<ActuatorReading>,
    /// Error text when the read failed
    pub error: Option<String>,
}

/// Snapshot of the whole core.
#[derive(Debug, Clone, Serialize)]
pub struct GuiderStatus {
    /// Token cached at the last homing run
    pub local_token: Option<i64>,
    /// Token held by the controller
    pub remote_token: i64,
    /// Tokens match
    pub homed: bool,
    /// Both X and Y envelopes measured
    pub calibrated: bool,
    /// Per-axis state
    pub axes: Vec<AxisReport>,
    /// Per-actuator state
    pub actuators: Vec<ActuatorReport>,
    /// Illumination LED
    pub led: LedState,
}

/// Read back everything the core knows about.
///
/// Sensor inconsistencies are reported per actuator instead of failing the snapshot.
#[instrument(skip(guider), err)]
pub async fn status(guider: &Guider) -> GuiderResult<GuiderStatus> {
    let calibration = guider.calibration();
    let local_token = calibration.home_token();
    let remote_token = guider.remote_home_token().await?;

    let axes = guider.axes();
    let mut reports = Vec::with_capacity(Axis::ALL.len());
    for axis in Axis::ALL {
        let word = axes.status(axis).await?;
        let encoder = if axis.has_encoder() {
            Some(axes.encoder_position(axis).await?)
        } else {
            None
        };
        let envelope = calibration.axis(axis);
        let position_inches = match envelope {
            Some(_) => Some(guider.position_inches(axis).await?),
            None => None,
        };
        reports.push(AxisReport {
            axis,
            steps: axes.step_position(axis).await?,
            encoder,
            limits: word.limits(),
            power: if word.motor_off() {
                PowerState::Off
            } else {
                PowerState::On
            },
            brake: axes.brake_status(axis).await?,
            moving: word.is_moving(),
            encoder_offset: calibration.encoder_offset(axis),
            encoder_min: envelope.map(|e| e.encoder_min),
            position_inches,
        });
    }

    let mut actuators = Vec::with_capacity(3);
    for actuator in [
        Actuator::CameraSelector,
        Actuator::ApertureSelector,
        Actuator::ReflectorArm,
    ] {
        let report = match guider.actuator_status(actuator).await {
            Ok(reading) => ActuatorReport {
                actuator,
                reading: Some(reading),
                error: None,
            },
            Err(err @ GuiderError::SensorInconsistency { .. }) => ActuatorReport {
                actuator,
                reading: None,
                error: Some(err.to_string()),
            },
            Err(err) => return Err(err),
        };
        actuators.push(report);
    }

    Ok(GuiderStatus {
        local_token,
        remote_token,
        homed: local_token == Some(remote_token),
        calibrated: calibration.is_calibrated(),
        axes: reports,
        actuators,
        led: guider.actuators().led_status().await?,
    })
}

impl fmt::Display for GuiderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let local = self
            .local_token
            .map_or_else(|| "none".to_string(), |t| t.to_string());
        writeln!(
            f,
            "home token: local {local}, remote {} ({})",
            self.remote_token,
            if self.homed { "homed" } else { "not homed" }
        )?;
        writeln!(f, "calibrated: {}", self.calibrated)?;
        for axis in &self.axes {
            write!(
                f,
                "{}: steps {} power {:?} brake {:?} limits {:#04b}",
                axis.axis,
                axis.steps,
                axis.power,
                axis.brake,
                axis.limits.bits()
            )?;
            if let Some(encoder) = axis.encoder {
                write!(f, " encoder {encoder}")?;
            }
            if let (Some(offset), Some(min)) = (axis.encoder_offset, axis.encoder_min) {
                write!(f, " envelope [{min}, {offset}]")?;
            }
            if let Some(inches) = axis.position_inches {
                write!(f, " at {inches:.4} in")?;
            }
            if axis.moving {
                write!(f, " (moving)")?;
            }
            writeln!(f)?;
        }
        for actuator in &self.actuators {
            match (&actuator.reading, &actuator.error) {
                (Some(reading), _) => writeln!(f, "{}: {reading:?}", actuator.actuator)?,
                (None, Some(error)) => writeln!(f, "{}: {error}", actuator.actuator)?,
                (None, None) => writeln!(f, "{}: unavailable", actuator.actuator)?,
            }
        }
        write!(f, "led: {:?}", self.led)
    }
}
