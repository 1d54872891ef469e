//! Guider Context
//!
//! [`Guider`] is the one object that owns the controller connection, the axis and actuator
//! controllers and the calibration state. Every operation a caller can perform on the
//! stage is a method on it; there is no global state.
//!
//! Methods that change calibration take `&mut self`, so homing, calibration and the moves
//! that depend on them can never overlap.
//!
//! # Homed vs calibrated
//!
//! Homing stamps the controller variable `homeTime` and keeps its value as a token. The stage
//! counts as homed only while the controller still reports that same token: a controller
//! reset, or another client re-homing, invalidates it even when a calibration is cached.
//! [`Guider::is_homed`] always asks the controller.
//!
//! # Example
//!
//! ```no_run
//! use ao_guider::config::GuiderConfig;
//! use ao_guider::guider::Guider;
//!
//! # async fn run() -> ao_guider::error::GuiderResult<()> {
//! let mut guider = Guider::connect(GuiderConfig::load()?).await?;
//! guider.initialize().await?;
//! guider.calibrate().await?;
//! guider.move_absolute(0.5, 0.25).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::GuiderConfig;
use crate::error::{GuiderError, GuiderResult};
use crate::hardware::actuator::{
    Actuator, ActuatorController, ActuatorReading, CylinderCommand, LedState, OpticalElement,
};
use crate::hardware::axis::{Axis, AxisController};
use crate::hardware::codec::{Codec, PassthroughReply};
use crate::hardware::link::{Link, StreamLink};
use crate::stage::homing::{HomeReference, HomingEngine};
use crate::stage::mapper::{self, AxisCalibration, MovePlan};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Motion defaults loaded by [`Guider::initialize`] after the actuators are parked.
const MOTION_DEFAULTS: [&str; 9] = [
    "SP 200,200,1000",
    "AC 256000,256000,256000",
    "DC 256000,256000,256000",
    "SD 256000,256000,256000",
    "VS 200",
    "VA 256000",
    "VD 256000",
    "KS 3,3,3",
    "CAS",
];

/// What is known about the stage reference. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CalibrationState {
    /// Reference from the last homing run
    pub reference: Option<HomeReference>,
    /// X envelope, once calibrated
    pub x: Option<AxisCalibration>,
    /// Y envelope, once calibrated
    pub y: Option<AxisCalibration>,
}

impl CalibrationState {
    /// Cached homing token.
    pub fn home_token(&self) -> Option<i64> {
        self.reference.map(|r| r.token)
    }

    /// Whether both translation axes have a measured envelope.
    pub fn is_calibrated(&self) -> bool {
        self.x.is_some() && self.y.is_some()
    }

    /// Envelope of `axis`, if calibrated.
    pub fn axis(&self, axis: Axis) -> Option<&AxisCalibration> {
        match axis {
            Axis::X => self.x.as_ref(),
            Axis::Y => self.y.as_ref(),
            Axis::Z => None,
        }
    }

    /// Home encoder offset of `axis`, if homed.
    pub fn encoder_offset(&self, axis: Axis) -> Option<i64> {
        let reference = self.reference?;
        match axis {
            Axis::X => Some(reference.x_offset),
            Axis::Y => Some(reference.y_offset),
            Axis::Z => None,
        }
    }
}

/// The guider motion core.
pub struct Guider {
    config: GuiderConfig,
    axes: AxisController,
    actuators: ActuatorController,
    calibration: CalibrationState,
}

impl Guider {
    /// Validate `config`, connect to the controller and build the context.
    ///
    /// # Errors
    /// [`GuiderError::ConnectionFailure`] if the controller cannot be reached.
    pub async fn connect(config: GuiderConfig) -> GuiderResult<Self> {
        config.validate()?;
        let link = StreamLink::connect(
            config.controller.host_addr()?,
            config.controller.port,
            config.controller.read_timeout(),
        )
        .await?;
        Ok(Self::with_link(Arc::new(link), config))
    }

    /// Build the context over an existing link.
    pub fn with_link(link: Arc<dyn Link>, config: GuiderConfig) -> Self {
        let codec = Codec::from_config(link, &config.controller);
        let axes = AxisController::from_config(codec.clone(), &config);
        let actuators = ActuatorController::from_config(codec, &config.actuators);
        Self {
            config,
            axes,
            actuators,
            calibration: CalibrationState::default(),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &GuiderConfig {
        &self.config
    }

    /// Per-axis primitives.
    pub fn axes(&self) -> &AxisController {
        &self.axes
    }

    /// Pneumatic actuators and LED.
    pub fn actuators(&self) -> &ActuatorController {
        &self.actuators
    }

    /// Cached calibration state.
    pub fn calibration(&self) -> &CalibrationState {
        &self.calibration
    }

    fn engine(&self) -> HomingEngine<'_> {
        HomingEngine::new(&self.axes, &self.config.homing, &self.config.stage)
    }

    /// Bring the controller to a known state.
    ///
    /// Selects stepper mode on all axes, powers them down, parks the reflector arm and both
    /// beam selectors retracted, then loads the motion defaults.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> GuiderResult<()> {
        let codec = self.axes.codec();
        codec.tell("MT -2,-2,-2").await?;
        for axis in Axis::ALL {
            self.axes.power_off(axis).await?;
        }
        self.actuators
            .command(Actuator::ReflectorArm, CylinderCommand::Retract)
            .await?;
        codec.tell("CN1").await?;
        for actuator in Actuator::SENSED {
            self.actuators
                .command(actuator, CylinderCommand::Retract)
                .await?;
        }
        for command in MOTION_DEFAULTS {
            codec.tell(command).await?;
        }
        info!("controller initialized");
        Ok(())
    }

    /// Reset the controller and forget the calibration.
    ///
    /// The controller answers `RS` with a banner instead of `:`; that protocol error is the
    /// expected reply and is not reported.
    #[instrument(skip(self), err)]
    pub async fn reset(&mut self) -> GuiderResult<()> {
        match self.axes.codec().tell("RS").await {
            Ok(()) | Err(GuiderError::Protocol { .. }) => {}
            Err(err) => return Err(err),
        }
        self.calibration = CalibrationState::default();
        self.actuators.forget_commanded().await;
        info!("controller reset");
        Ok(())
    }

    /// Creep every axis off any limit switch that is engaged.
    pub async fn back_off(&self) -> GuiderResult<()> {
        self.engine().back_off().await
    }

    /// Home all axes. Any previous calibration is discarded first.
    #[instrument(skip(self), err)]
    pub async fn home(&mut self) -> GuiderResult<HomeReference> {
        self.calibration = CalibrationState::default();
        let reference = self.engine().home_all().await?;
        self.calibration.reference = Some(reference);
        Ok(reference)
    }

    /// Home, then measure the X and Y envelopes out to the far limits.
    ///
    /// # Errors
    /// [`GuiderError::DegenerateCalibration`] if an axis reports zero steps of travel.
    #[instrument(skip(self), err)]
    pub async fn calibrate(&mut self) -> GuiderResult<CalibrationState> {
        let reference = self.home().await?;

        let mut envelopes = Vec::with_capacity(2);
        for (axis, offset) in [(Axis::X, reference.x_offset), (Axis::Y, reference.y_offset)] {
            let far = self.engine().run_to_far_limit(axis).await?;
            let encoder_per_step = mapper::calibration_scale(axis, offset, far.encoder, far.steps)?;
            let nominal = if axis == Axis::X {
                self.config.stage.x.pulses_per_step()
            } else {
                self.config.stage.y.pulses_per_step()
            };
            if (encoder_per_step - nominal).abs() > 0.01 * nominal {
                warn!(%axis, encoder_per_step, nominal, "measured scale differs from nominal");
            }
            info!(%axis, encoder_per_step, encoder_min = far.encoder, "axis calibrated");
            envelopes.push(AxisCalibration {
                encoder_offset: offset,
                encoder_min: far.encoder,
                encoder_per_step,
            });
        }

        self.calibration.x = envelopes.first().copied();
        self.calibration.y = envelopes.get(1).copied();
        Ok(self.calibration.clone())
    }

    /// Homing token currently held by the controller.
    pub async fn remote_home_token(&self) -> GuiderResult<i64> {
        self.axes.codec().ask_long("MG homeTime").await
    }

    /// Whether the cached homing token still matches the controller's.
    pub async fn is_homed(&self) -> GuiderResult<bool> {
        match self.calibration.home_token() {
            Some(token) => Ok(self.remote_home_token().await? == token),
            None => Ok(false),
        }
    }

    /// Move X and Y to absolute positions in inches from home.
    ///
    /// Both targets are checked against the calibrated envelope before anything moves.
    ///
    /// # Errors
    /// - [`GuiderError::NotCalibrated`] without a calibration
    /// - [`GuiderError::NotHomed`] if the homing token is stale
    /// - [`GuiderError::Range`] if either target leaves the envelope; no motion is commanded
    #[instrument(skip(self), err)]
    pub async fn move_absolute(&self, x_inches: f64, y_inches: f64) -> GuiderResult<MovePlan> {
        let (Some(x_cal), Some(y_cal)) = (self.calibration.x, self.calibration.y) else {
            return Err(GuiderError::NotCalibrated);
        };
        if !self.is_homed().await? {
            return Err(GuiderError::NotHomed);
        }

        let stage = &self.config.stage;
        let x_now = self.axes.encoder_position(Axis::X).await?;
        let y_now = self.axes.encoder_position(Axis::Y).await?;
        let plan = MovePlan {
            x: mapper::plan_axis(Axis::X, x_inches, x_now, &x_cal, &stage.x)?,
            y: mapper::plan_axis(Axis::Y, y_inches, y_now, &y_cal, &stage.y)?,
        };

        self.axes.move_relative(plan.x.steps, plan.y.steps).await?;
        Ok(plan)
    }

    /// Relative X-Y move in motor steps. Not gated on homing.
    pub async fn move_relative(&self, x_steps: i64, y_steps: i64) -> GuiderResult<()> {
        self.axes.move_relative(x_steps, y_steps).await
    }

    /// Read-back position of X or Y in inches from home.
    pub async fn position_inches(&self, axis: Axis) -> GuiderResult<f64> {
        let geometry = match axis {
            Axis::X => &self.config.stage.x,
            Axis::Y => &self.config.stage.y,
            Axis::Z => {
                return Err(GuiderError::InvalidAxis {
                    axis,
                    operation: "position readout",
                })
            }
        };
        let offset = self
            .calibration
            .encoder_offset(axis)
            .ok_or(GuiderError::NotHomed)?;
        let encoder = self.axes.encoder_position(axis).await?;
        Ok(mapper::position_inches(offset, encoder, geometry))
    }

    /// Relative focus move in motor steps.
    pub async fn focus_relative(&self, steps: i64) -> GuiderResult<()> {
        self.axes.focus_relative(steps).await
    }

    /// Move focus to `mils` from its home reference.
    ///
    /// # Errors
    /// [`GuiderError::NotHomed`] if the homing token is missing or stale.
    #[instrument(skip(self), err)]
    pub async fn focus_absolute(&self, mils: f64) -> GuiderResult<()> {
        if !self.is_homed().await? {
            return Err(GuiderError::NotHomed);
        }
        let stage = &self.config.stage;
        let per_mil = mapper::focus_steps_per_mil(stage.z_steps_per_turn, stage.z_screw_pitch);
        let current = self.axes.step_position(Axis::Z).await?;
        let steps = mapper::focus_move_steps(mils, current, per_mil);
        if steps == 0 {
            return Ok(());
        }
        self.axes.focus_relative(steps).await
    }

    /// Drive an actuator and wait for it to settle.
    pub async fn command_actuator(
        &self,
        actuator: Actuator,
        command: CylinderCommand,
    ) -> GuiderResult<ActuatorReading> {
        self.actuators.command(actuator, command).await
    }

    /// Current actuator position.
    pub async fn actuator_status(&self, actuator: Actuator) -> GuiderResult<ActuatorReading> {
        self.actuators.status(actuator).await
    }

    /// Put an optical element in the beam.
    pub async fn insert(&self, element: OpticalElement) -> GuiderResult<ActuatorReading> {
        self.actuators.insert(element).await
    }

    /// Switch the illumination LED.
    pub async fn set_led(&self, on: bool) -> GuiderResult<LedState> {
        if on {
            self.actuators.led_on().await
        } else {
            self.actuators.led_off().await
        }
    }

    /// Send raw command text, returning the reply and any error explanation.
    pub async fn passthrough(&self, command: &str) -> GuiderResult<PassthroughReply> {
        self.axes.codec().passthrough(command).await
    }
}
