//! Homing & Calibration Engine
//!
//! Establishes the stage reference at the forward limit switches and measures the travel
//! envelope out to the reverse limits.
//!
//! Each axis is homed through a fixed sequence of [`HomingPhase`]s. Every phase that moves
//! powers the axis down before the next one starts, including when it fails.
//!
//! Limit detection is edge based: a creep keeps stepping until the limit bitmask differs
//! from what it read before the first step. Both the approach onto a switch and the final
//! creep off it use the same loop, so the reference lands on the switch's release point
//! regardless of where the axis started.

use crate::config::{HomingConfig, StageConfig};
use crate::error::{GuiderError, GuiderResult};
use crate::hardware::axis::{Axis, AxisController, Limits, PendingMove};
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, instrument, warn};

/// Step of the per-axis homing sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingPhase {
    /// Clear a limit that was already engaged
    BackOff,
    /// Step toward the home switch until it trips
    CreepToLimit,
    /// Step back inside the switch hysteresis
    OvershootClear,
    /// Creep off the switch in small steps until it releases
    FinalApproach,
    /// Back off one motor turn and power down
    Reference,
}

impl fmt::Display for HomingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HomingPhase::BackOff => "back-off",
            HomingPhase::CreepToLimit => "creep-to-limit",
            HomingPhase::OvershootClear => "overshoot-clear",
            HomingPhase::FinalApproach => "final-approach",
            HomingPhase::Reference => "reference",
        };
        f.write_str(name)
    }
}

/// Reference captured at the end of a successful homing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HomeReference {
    /// Controller timestamp recorded as `homeTime`
    pub token: i64,
    /// X encoder at the reference
    pub x_offset: i64,
    /// Y encoder at the reference
    pub y_offset: i64,
}

/// Result of driving one axis to its far limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarLimit {
    /// Encoder reading at the far reference
    pub encoder: i64,
    /// Step counter at the far reference
    pub steps: i64,
}

/// Homing and calibration sequences over an [`AxisController`].
pub struct HomingEngine<'a> {
    axes: &'a AxisController,
    homing: &'a HomingConfig,
    stage: &'a StageConfig,
}

impl<'a> HomingEngine<'a> {
    /// Create an engine borrowing the axis controller and its configuration.
    pub fn new(axes: &'a AxisController, homing: &'a HomingConfig, stage: &'a StageConfig) -> Self {
        Self {
            axes,
            homing,
            stage,
        }
    }

    fn turn_steps(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => self.stage.x.steps_per_turn,
            Axis::Y => self.stage.y.steps_per_turn,
            Axis::Z => self.stage.z_steps_per_turn,
        }
    }

    fn overshoot_steps(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X | Axis::Y => self.homing.xy_overshoot_steps,
            Axis::Z => self.homing.z_overshoot_steps,
        }
    }

    fn approach_steps(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X | Axis::Y => self.homing.xy_approach_steps,
            Axis::Z => self.homing.z_approach_steps,
        }
    }

    fn backoff_steps(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X | Axis::Y => self.homing.xy_backoff_steps,
            Axis::Z => self.homing.z_backoff_steps,
        }
    }

    /// Step `axis` repeatedly until its limit bitmask changes, then power it down.
    ///
    /// # Errors
    /// [`GuiderError::Timeout`] once the iteration budget is spent without a change.
    pub async fn creep(&self, axis: Axis, steps: i64, speed: i64) -> GuiderResult<Limits> {
        match self.creep_powered(axis, steps, speed).await {
            Ok((pending, changed)) => {
                pending.settle_and_power_off().await?;
                changed.ok_or_else(|| {
                    GuiderError::timeout(
                        format!("{axis} limit change"),
                        self.homing.max_creep_iterations,
                    )
                })
            }
            Err(err) => {
                self.axes.power_down_after(axis, &err).await;
                Err(err)
            }
        }
    }

    async fn creep_powered(
        &self,
        axis: Axis,
        steps: i64,
        speed: i64,
    ) -> GuiderResult<(PendingMove<'a>, Option<Limits>)> {
        let initial = self.axes.limit_switch(axis).await?;
        let max = self.homing.max_creep_iterations;

        let mut pending = self.axes.begin_move(axis, steps, speed).await?;
        for iteration in 1..=max {
            pending.wait_stopped().await?;
            let limits = self.axes.limit_switch(axis).await?;
            if limits != initial {
                debug!(%axis, iteration, from = initial.bits(), to = limits.bits(), "limit changed");
                return Ok((pending, Some(limits)));
            }
            if iteration < max {
                pending = pending.then(steps, speed).await?;
            }
        }
        warn!(%axis, steps, max, "limit never changed");
        Ok((pending, None))
    }

    /// Single move that is always powered down, even when it fails to start.
    async fn step(&self, axis: Axis, steps: i64, speed: i64) -> GuiderResult<()> {
        match self.axes.begin_move(axis, steps, speed).await {
            Ok(pending) => pending.settle_and_power_off().await,
            Err(err) => {
                self.axes.power_down_after(axis, &err).await;
                Err(err)
            }
        }
    }

    /// Creep `axis` off any limit that is already engaged.
    ///
    /// A reverse limit is cleared in the positive direction, a forward limit in the
    /// negative direction, at quarter speed.
    #[instrument(skip(self), err)]
    pub async fn back_off_axis(&self, axis: Axis) -> GuiderResult<()> {
        let limits = self.axes.limit_switch(axis).await?;
        if !limits.any() {
            return Ok(());
        }

        let direction = if limits.reverse { 1 } else { -1 };
        let speed = self.axes.profile(axis).speed / 4;
        info!(%axis, phase = %HomingPhase::BackOff, limits = limits.bits(), "clearing limit");
        self.creep(axis, direction * self.backoff_steps(axis), speed)
            .await?;
        Ok(())
    }

    /// Clear engaged limits on every axis.
    pub async fn back_off(&self) -> GuiderResult<()> {
        for axis in Axis::ALL {
            self.back_off_axis(axis).await?;
        }
        Ok(())
    }

    /// Run the homing sequence on one axis.
    #[instrument(skip(self), err)]
    pub async fn home_axis(&self, axis: Axis) -> GuiderResult<()> {
        let speed = self.axes.profile(axis).speed;

        self.back_off_axis(axis).await?;

        info!(%axis, phase = %HomingPhase::CreepToLimit, "homing phase");
        self.creep(axis, self.homing.seek_steps, speed).await?;

        info!(%axis, phase = %HomingPhase::OvershootClear, "homing phase");
        self.step(axis, -self.overshoot_steps(axis), speed / 2).await?;

        info!(%axis, phase = %HomingPhase::FinalApproach, "homing phase");
        self.creep(axis, -self.approach_steps(axis), speed / 2)
            .await?;

        info!(%axis, phase = %HomingPhase::Reference, "homing phase");
        self.step(axis, -self.turn_steps(axis), speed / 2).await
    }

    /// Home X, Y and Z, then record the reference.
    ///
    /// Zeroes the step counters, captures the X/Y encoders as offsets and stamps the
    /// controller's `homeTime` variable, whose value becomes the homing token.
    #[instrument(skip(self), err)]
    pub async fn home_all(&self) -> GuiderResult<HomeReference> {
        for axis in Axis::ALL {
            self.home_axis(axis).await?;
        }

        self.axes.zero_steps().await?;
        let x_offset = self.axes.encoder_position(Axis::X).await?;
        let y_offset = self.axes.encoder_position(Axis::Y).await?;

        let codec = self.axes.codec();
        codec.tell("homeTime=TIME").await?;
        let token = codec.ask_long("MG homeTime").await?;

        let reference = HomeReference {
            token,
            x_offset,
            y_offset,
        };
        info!(?reference, "stage homed");
        Ok(reference)
    }

    /// Drive a homed X or Y axis to its far limit and read the counters there.
    ///
    /// The far reference is taken the same way as home, mirrored: creep onto the reverse
    /// switch, clear it, creep off it in small steps, then one turn further.
    #[instrument(skip(self), err)]
    pub async fn run_to_far_limit(&self, axis: Axis) -> GuiderResult<FarLimit> {
        if !axis.has_encoder() {
            return Err(GuiderError::InvalidAxis {
                axis,
                operation: "calibration",
            });
        }
        let speed = self.axes.profile(axis).speed;

        self.creep(axis, -self.homing.seek_steps, speed).await?;
        self.step(axis, self.homing.calibration_overshoot_steps, speed / 2)
            .await?;
        self.creep(axis, self.approach_steps(axis), speed / 2)
            .await?;
        self.step(axis, self.turn_steps(axis), speed / 2).await?;

        let far = FarLimit {
            encoder: self.axes.encoder_position(axis).await?,
            steps: self.axes.step_position(axis).await?,
        };
        debug!(%axis, encoder = far.encoder, steps = far.steps, "far limit reached");
        Ok(far)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuiderConfig;
    use crate::hardware::codec::Codec;
    use crate::hardware::mock::SimulatedController;
    use std::sync::Arc;

    fn controller(sim: Arc<SimulatedController>, config: &GuiderConfig) -> AxisController {
        let codec = Codec::from_config(sim, &config.controller);
        AxisController::from_config(codec, config)
    }

    #[tokio::test]
    async fn home_reference_sits_one_turn_inside_release_point() -> anyhow::Result<()> {
        let sim = Arc::new(SimulatedController::new());
        let config = GuiderConfig::without_delays();
        let axes = controller(sim.clone(), &config);
        let engine = HomingEngine::new(&axes, &config.homing, &config.stage);

        engine.home_axis(Axis::X).await?;
        // switch trips at 0, releases below -150
        assert_eq!(sim.position(Axis::X).await, -655);
        Ok(())
    }

    #[tokio::test]
    async fn engaged_reverse_limit_backs_off_positive() -> anyhow::Result<()> {
        let sim = Arc::new(SimulatedController::new());
        sim.set_position(Axis::Y, -70_000).await;
        let config = GuiderConfig::without_delays();
        let axes = controller(sim.clone(), &config);
        let engine = HomingEngine::new(&axes, &config.homing, &config.stage);

        assert!(axes.limit_switch(Axis::Y).await?.reverse);
        engine.back_off_axis(Axis::Y).await?;
        assert!(!axes.limit_switch(Axis::Y).await?.any());
        // 20-step creep out of the 150-step band: 8 iterations
        assert_eq!(sim.position(Axis::Y).await, -65_300 + 160);
        Ok(())
    }

    #[tokio::test]
    async fn z_homes_within_the_creep_budget() -> anyhow::Result<()> {
        let sim = Arc::new(SimulatedController::new());
        let config = GuiderConfig::without_delays();
        let axes = controller(sim.clone(), &config);
        let engine = HomingEngine::new(&axes, &config.homing, &config.stage);

        engine.home_axis(Axis::Z).await?;
        assert_eq!(sim.position(Axis::Z).await, -2_710 - 4_000);
        Ok(())
    }

    #[tokio::test]
    async fn creep_that_never_reaches_the_switch_times_out_powered_down() {
        let sim = Arc::new(SimulatedController::new());
        let mut config = GuiderConfig::without_delays();
        config.homing.max_creep_iterations = 5;
        let axes = controller(sim.clone(), &config);
        let engine = HomingEngine::new(&axes, &config.homing, &config.stage);

        let err = engine.creep(Axis::X, 10, 3800).await.unwrap_err();
        assert!(matches!(err, GuiderError::Timeout { attempts: 5, .. }));
        assert_eq!(sim.position(Axis::X).await, -8_000 + 50);
        assert_eq!(sim.commands().await.last().map(String::as_str), Some("MOA"));
    }

    #[tokio::test]
    async fn far_limit_rejects_focus() {
        let sim = Arc::new(SimulatedController::new());
        let config = GuiderConfig::without_delays();
        let axes = controller(sim, &config);
        let engine = HomingEngine::new(&axes, &config.homing, &config.stage);

        assert!(matches!(
            engine.run_to_far_limit(Axis::Z).await,
            Err(GuiderError::InvalidAxis { axis: Axis::Z, .. })
        ));
    }
}
