//! Stepper Axis Control
//!
//! Per-axis primitives for the three stepper motors on the guider stage:
//!
//! | axis | controller letter | encoder | brake output |
//! |------|-------------------|---------|--------------|
//! | X    | `A`               | yes     | 1            |
//! | Y    | `B`               | yes     | 2            |
//! | Z    | `C` (focus)       | no      | none         |
//!
//! Motion is split in two phases. [`AxisController::begin_move`] powers the motor, releases
//! the brake and starts a relative move, then hands back a [`PendingMove`]. The move is only
//! finished once the caller consumes that value with [`PendingMove::settle_and_power_off`],
//! which waits for the axis to stop, re-engages the brake and de-energizes the motor. Chained
//! moves (creeping toward a limit) keep the axis powered between steps with
//! [`PendingMove::then`].
//!
//! Step counters are open loop and can drift if the motor loses steps. Only the homing
//! procedure zeroes them.

use crate::config::{GuiderConfig, MotionProfile};
use crate::error::{GuiderError, GuiderResult};
use crate::hardware::codec::Codec;
use crate::hardware::poll::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// One stepper-driven degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Stage X translation
    X,
    /// Stage Y translation
    Y,
    /// Focus stage
    Z,
}

impl Axis {
    /// All axes, in homing order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Axis letter in the controller's command dialect.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'A',
            Axis::Y => 'B',
            Axis::Z => 'C',
        }
    }

    /// Digital output that drives this axis' brake, if it has one.
    pub fn brake_output(self) -> Option<u8> {
        match self {
            Axis::X => Some(1),
            Axis::Y => Some(2),
            Axis::Z => None,
        }
    }

    /// Whether the axis carries a quadrature encoder.
    pub fn has_encoder(self) -> bool {
        !matches!(self, Axis::Z)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        };
        f.write_str(name)
    }
}

/// Motor power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    /// Motor energized
    On,
    /// Motor off
    Off,
}

/// Brake state. `On` means the brake is engaged and holds the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrakeState {
    /// Brake engaged
    On,
    /// Brake released
    Off,
    /// Output readback disagrees with the command, or the axis has no brake
    Unknown,
}

/// Limit switch state of one axis.
///
/// As a bitmask: bit0 = reverse limit active, bit1 = forward limit active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Reverse limit engaged (motion in the negative direction disabled)
    pub reverse: bool,
    /// Forward limit engaged (motion in the positive direction disabled)
    pub forward: bool,
}

impl Limits {
    /// Bitmask form: bit0 reverse, bit1 forward.
    pub fn bits(self) -> u8 {
        u8::from(self.reverse) | (u8::from(self.forward) << 1)
    }

    /// Whether either switch is engaged.
    pub fn any(self) -> bool {
        self.reverse || self.forward
    }
}

/// Decoded `TS<axis>` status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisStatus(pub i32);

impl AxisStatus {
    /// Bit 7: axis in motion.
    pub fn is_moving(self) -> bool {
        (self.0 >> 7) & 0x01 == 1
    }

    /// Bit 5: motor off.
    pub fn motor_off(self) -> bool {
        (self.0 >> 5) & 0x01 == 1
    }

    /// Bits 2 and 3 carry the reverse and forward switches, active low.
    pub fn limits(self) -> Limits {
        Limits {
            reverse: (self.0 >> 2) & 0x01 == 0,
            forward: (self.0 >> 3) & 0x01 == 0,
        }
    }
}

/// Per-axis primitives over the command codec.
pub struct AxisController {
    codec: Codec,
    xy_profile: MotionProfile,
    z_profile: MotionProfile,
    brake_settle: Duration,
    motion: RetryPolicy,
}

impl AxisController {
    /// Create an axis controller with explicit profiles and timing.
    pub fn new(
        codec: Codec,
        xy_profile: MotionProfile,
        z_profile: MotionProfile,
        brake_settle: Duration,
        motion: RetryPolicy,
    ) -> Self {
        Self {
            codec,
            xy_profile,
            z_profile,
            brake_settle,
            motion,
        }
    }

    /// Create an axis controller from the guider configuration.
    pub fn from_config(codec: Codec, config: &GuiderConfig) -> Self {
        Self::new(
            codec,
            config.stage.xy_profile,
            config.stage.z_profile,
            config.timing.brake_settle(),
            RetryPolicy::new(config.timing.motion_poll(), config.timing.motion_max_polls),
        )
    }

    /// The codec this controller talks through.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Motion profile used for `axis`.
    pub fn profile(&self, axis: Axis) -> MotionProfile {
        match axis {
            Axis::X | Axis::Y => self.xy_profile,
            Axis::Z => self.z_profile,
        }
    }

    /// Read and decode the axis status word.
    pub async fn status(&self, axis: Axis) -> GuiderResult<AxisStatus> {
        let word = self.codec.ask_int(&format!("TS{}", axis.letter())).await?;
        Ok(AxisStatus(word))
    }

    /// Whether the axis is currently in motion.
    pub async fn is_moving(&self, axis: Axis) -> GuiderResult<bool> {
        Ok(self.status(axis).await?.is_moving())
    }

    /// Current limit switch state.
    pub async fn limit_switch(&self, axis: Axis) -> GuiderResult<Limits> {
        Ok(self.status(axis).await?.limits())
    }

    /// Motor power as reported by the status word.
    pub async fn power_status(&self, axis: Axis) -> GuiderResult<PowerState> {
        Ok(if self.status(axis).await?.motor_off() {
            PowerState::Off
        } else {
            PowerState::On
        })
    }

    /// Energize the motor and, for X/Y, release the brake.
    #[instrument(skip(self), err)]
    pub async fn power_on(&self, axis: Axis) -> GuiderResult<PowerState> {
        self.codec.tell(&format!("SH{}", axis.letter())).await?;
        if axis.brake_output().is_some() {
            sleep(self.brake_settle).await;
            if self.release_brake(axis).await? != BrakeState::Off {
                warn!(%axis, "brake did not report released");
            }
            sleep(self.brake_settle).await;
        }
        Ok(PowerState::On)
    }

    /// Wait for motion to stop, engage the brake (X/Y) and de-energize the motor.
    ///
    /// Does not return `Ok` while the axis still reports motion; a move that outlasts the
    /// poll budget is a [`GuiderError::Timeout`].
    #[instrument(skip(self), err)]
    pub async fn power_off(&self, axis: Axis) -> GuiderResult<PowerState> {
        self.wait_stopped(axis).await?;
        if axis.brake_output().is_some() {
            sleep(self.brake_settle).await;
            if self.engage_brake(axis).await? != BrakeState::On {
                warn!(%axis, "brake did not report engaged");
            }
            sleep(self.brake_settle).await;
        }
        self.codec.tell(&format!("MO{}", axis.letter())).await?;
        Ok(PowerState::Off)
    }

    /// Poll until the axis stops moving.
    pub async fn wait_stopped(&self, axis: Axis) -> GuiderResult<()> {
        self.motion
            .poll_until(&format!("{axis} motion to stop"), || async move {
                Ok((!self.is_moving(axis).await?).then_some(()))
            })
            .await
    }

    /// Engage the brake (clear its output).
    pub async fn engage_brake(&self, axis: Axis) -> GuiderResult<BrakeState> {
        let output = Self::brake_bit(axis)?;
        self.codec.tell(&format!("CB{output}")).await?;
        Ok(if self.read_output(output).await? == 0 {
            BrakeState::On
        } else {
            BrakeState::Unknown
        })
    }

    /// Release the brake (set its output).
    pub async fn release_brake(&self, axis: Axis) -> GuiderResult<BrakeState> {
        let output = Self::brake_bit(axis)?;
        self.codec.tell(&format!("SB{output}")).await?;
        Ok(if self.read_output(output).await? != 0 {
            BrakeState::Off
        } else {
            BrakeState::Unknown
        })
    }

    /// Brake state from the output readback. Z has no brake and reports `Unknown`.
    pub async fn brake_status(&self, axis: Axis) -> GuiderResult<BrakeState> {
        match axis.brake_output() {
            Some(output) => Ok(if self.read_output(output).await? != 0 {
                BrakeState::Off
            } else {
                BrakeState::On
            }),
            None => Ok(BrakeState::Unknown),
        }
    }

    fn brake_bit(axis: Axis) -> GuiderResult<u8> {
        axis.brake_output().ok_or(GuiderError::InvalidAxis {
            axis,
            operation: "brake control",
        })
    }

    /// Read back a digital output bit.
    pub async fn read_output(&self, output: u8) -> GuiderResult<i32> {
        self.codec.ask_int(&format!("MG@OUT[{output}]")).await
    }

    /// Accumulated step count (open loop).
    pub async fn step_position(&self, axis: Axis) -> GuiderResult<i64> {
        self.codec.ask_long(&format!("RP{}", axis.letter())).await
    }

    /// Encoder reading. Only X and Y carry encoders.
    pub async fn encoder_position(&self, axis: Axis) -> GuiderResult<i64> {
        if !axis.has_encoder() {
            return Err(GuiderError::InvalidAxis {
                axis,
                operation: "encoder readout",
            });
        }
        self.codec.ask_long(&format!("TP{}", axis.letter())).await
    }

    /// Zero all three step counters.
    pub async fn zero_steps(&self) -> GuiderResult<()> {
        self.codec.tell("DP 0,0,0").await
    }

    /// Power the axis and start a relative move of `steps` at `speed`.
    ///
    /// Returns without waiting for completion and leaves the motor energized and the brake
    /// released. The returned [`PendingMove`] carries the obligation to power down.
    #[instrument(skip(self), err)]
    pub async fn begin_move(
        &self,
        axis: Axis,
        steps: i64,
        speed: i64,
    ) -> GuiderResult<PendingMove<'_>> {
        let profile = self.profile(axis);
        let letter = axis.letter();

        self.power_on(axis).await?;
        self.codec.tell(&format!("SP{letter}={speed}")).await?;
        self.codec
            .tell(&format!("AC{letter}={}", profile.acceleration))
            .await?;
        self.codec
            .tell(&format!("DC{letter}={}", profile.deceleration))
            .await?;
        self.codec.tell(&format!("PR{letter}={steps}")).await?;
        self.codec.tell(&format!("BG{letter}")).await?;
        debug!(%axis, steps, speed, "move started");

        Ok(PendingMove {
            controller: self,
            axis,
        })
    }

    /// Relative X-Y move in motor steps at the default X/Y speed.
    ///
    /// Both axes are powered down afterwards, even when one of them did not move. If either
    /// move fails to start or settle, every started axis is still powered down and the first
    /// error is returned.
    #[instrument(skip(self), err)]
    pub async fn move_relative(&self, x_steps: i64, y_steps: i64) -> GuiderResult<()> {
        let speed = self.xy_profile.speed;
        let mut started = Vec::with_capacity(2);
        for (axis, steps) in [(Axis::X, x_steps), (Axis::Y, y_steps)] {
            if steps == 0 {
                continue;
            }
            match self.begin_move(axis, steps, speed).await {
                Ok(pending) => started.push(pending),
                Err(err) => {
                    self.power_down_after(axis, &err).await;
                    for pending in started {
                        self.power_down_after(pending.axis(), &err).await;
                    }
                    return Err(err);
                }
            }
        }

        let mut first_err = None;
        for axis in [Axis::X, Axis::Y] {
            let outcome = match started.iter().position(|p| p.axis() == axis) {
                Some(index) => started.swap_remove(index).settle_and_power_off().await,
                None => self.power_off(axis).await.map(|_| ()),
            };
            if let Err(err) = outcome {
                if let Some(cause) = &first_err {
                    warn!(%axis, %cause, error = %err, "could not power down after failure");
                } else {
                    first_err = Some(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Relative focus move in motor steps.
    #[instrument(skip(self), err)]
    pub async fn focus_relative(&self, steps: i64) -> GuiderResult<()> {
        match self.begin_move(Axis::Z, steps, self.z_profile.speed).await {
            Ok(pending) => pending.settle_and_power_off().await,
            Err(err) => {
                self.power_down_after(Axis::Z, &err).await;
                Err(err)
            }
        }
    }

    /// Best-effort power-down once `cause` has aborted a move on `axis`.
    ///
    /// An axis that still reports motion times out in [`Self::power_off`] and stays
    /// energized; that failure is logged and `cause` remains the reported error.
    pub async fn power_down_after(&self, axis: Axis, cause: &GuiderError) {
        if let Err(power_err) = self.power_off(axis).await {
            warn!(%axis, %cause, error = %power_err, "could not power down after failure");
        }
    }
}

/// A move that has been started but whose power/brake cycle is still open.
#[must_use = "a started move must be finished with settle_and_power_off"]
pub struct PendingMove<'a> {
    controller: &'a AxisController,
    axis: Axis,
}

impl<'a> PendingMove<'a> {
    /// The moving axis.
    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Wait for the move to finish, keeping the motor energized.
    pub async fn wait_stopped(&self) -> GuiderResult<()> {
        self.controller.wait_stopped(self.axis).await
    }

    /// Wait for this move, then start another on the same axis without powering down.
    pub async fn then(self, steps: i64, speed: i64) -> GuiderResult<PendingMove<'a>> {
        self.wait_stopped().await?;
        self.controller.begin_move(self.axis, steps, speed).await
    }

    /// Wait for the move, re-engage the brake and de-energize the motor.
    pub async fn settle_and_power_off(self) -> GuiderResult<()> {
        self.controller.power_off(self.axis).await.map(|_| ())
    }
}
