//! Pneumatic Actuators
//!
//! Three binary pneumatic devices sit in the guider beam:
//!
//! - **Y1** (camera selector): extended puts the Shack-Hartmann lenslets in the beam,
//!   retracted puts the wide-field camera in.
//! - **Y2** (aperture selector): extended inserts the small aperture, retracted the field lens.
//! - **S** (reflector arm): swings the illumination LED reflector in or out.
//!
//! Y1 and Y2 each carry two magnetic position sensors (extend, retract) wired to the input
//! port read by `TI0`. The inputs are active low, so the word is inverted before decoding:
//!
//! | bit | sensor       |
//! |-----|--------------|
//! | 2   | Y2 extend    |
//! | 3   | Y2 retract   |
//! | 4   | Y1 extend    |
//! | 5   | Y1 retract   |
//!
//! A well-defined cylinder shows exactly one of its two sensors. Because both cylinders share
//! the one word, a status read in which *either* cylinder shows both or neither sensor is
//! rejected for every actuator queried from it.
//!
//! The reflector arm has no sensor. Its state is whatever was last commanded and is reported
//! as [`ActuatorReading::Advisory`].

use crate::config::ActuatorConfig;
use crate::error::{GuiderError, GuiderResult};
use crate::hardware::codec::Codec;
use crate::hardware::poll::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, instrument, warn};

/// Query that returns the sensor input port.
pub const SENSOR_QUERY: &str = "TI0";

/// Digital output driving the illumination LED.
const LED_OUTPUT: u8 = 4;

/// One of the three pneumatic devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actuator {
    /// Y1: Shack-Hartmann lenslets (extended) or wide-field camera (retracted)
    CameraSelector,
    /// Y2: small aperture (extended) or field lens (retracted)
    ApertureSelector,
    /// S: LED reflector arm, no position sensor
    ReflectorArm,
}

impl Actuator {
    /// Sensor-backed cylinders.
    pub const SENSED: [Actuator; 2] = [Actuator::CameraSelector, Actuator::ApertureSelector];

    fn valve_commands(self, command: CylinderCommand) -> &'static str {
        match (self, command) {
            (Actuator::CameraSelector, CylinderCommand::Extend) => "SB7;CB8",
            (Actuator::CameraSelector, CylinderCommand::Retract) => "CB7;SB8",
            (Actuator::ApertureSelector, CylinderCommand::Extend) => "CB5;SB6",
            (Actuator::ApertureSelector, CylinderCommand::Retract) => "SB5;CB6",
            (Actuator::ReflectorArm, CylinderCommand::Extend) => "SB3",
            (Actuator::ReflectorArm, CylinderCommand::Retract) => "CB3",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Actuator::CameraSelector => "Y1",
            Actuator::ApertureSelector => "Y2",
            Actuator::ReflectorArm => "S",
        };
        f.write_str(name)
    }
}

/// Requested cylinder motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CylinderCommand {
    /// Extend the rod
    Extend,
    /// Retract the rod
    Retract,
}

impl CylinderCommand {
    /// The state this command drives toward.
    pub fn target(self) -> CylinderState {
        match self {
            CylinderCommand::Extend => CylinderState::Extended,
            CylinderCommand::Retract => CylinderState::Retracted,
        }
    }
}

/// Settled cylinder position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CylinderState {
    /// Rod extended
    Extended,
    /// Rod retracted
    Retracted,
}

/// Reported actuator position and how much it can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorReading {
    /// Confirmed by the position sensors
    Sensed(CylinderState),
    /// Last commanded state of an unsensed actuator
    Advisory(CylinderState),
    /// Never commanded since startup
    Unknown,
}

impl ActuatorReading {
    /// State regardless of how it was obtained.
    pub fn state(self) -> Option<CylinderState> {
        match self {
            ActuatorReading::Sensed(state) | ActuatorReading::Advisory(state) => Some(state),
            ActuatorReading::Unknown => None,
        }
    }
}

/// Illumination LED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedState {
    /// LED lit
    On,
    /// LED dark
    Off,
    /// Output readback disagrees with the command
    Unknown,
}

/// Optical elements selectable by the two beam-selector cylinders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpticalElement {
    /// Shack-Hartmann lenslet array (Y1 extended)
    ShackHartmann,
    /// Wide-field camera (Y1 retracted)
    WideFieldCamera,
    /// Small aperture (Y2 extended)
    SmallAperture,
    /// Field lens (Y2 retracted)
    FieldLens,
}

impl OpticalElement {
    /// Cylinder and motion that put this element in the beam.
    pub fn actuation(self) -> (Actuator, CylinderCommand) {
        match self {
            OpticalElement::ShackHartmann => (Actuator::CameraSelector, CylinderCommand::Extend),
            OpticalElement::WideFieldCamera => {
                (Actuator::CameraSelector, CylinderCommand::Retract)
            }
            OpticalElement::SmallAperture => (Actuator::ApertureSelector, CylinderCommand::Extend),
            OpticalElement::FieldLens => (Actuator::ApertureSelector, CylinderCommand::Retract),
        }
    }
}

/// Sensor input word after active-low inversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorWord(u8);

impl SensorWord {
    /// Decode the raw `TI0` reply.
    pub fn from_raw(raw: i32) -> Self {
        Self((!raw & 0xFF) as u8)
    }

    /// The inverted word.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// `(extend, retract)` sensor bits of a sensed cylinder.
    fn pair(self, actuator: Actuator) -> Option<(bool, bool)> {
        let (extend_bit, retract_bit) = match actuator {
            Actuator::CameraSelector => (4, 5),
            Actuator::ApertureSelector => (2, 3),
            Actuator::ReflectorArm => return None,
        };
        Some((
            (self.0 >> extend_bit) & 0x01 == 1,
            (self.0 >> retract_bit) & 0x01 == 1,
        ))
    }

    /// Whether both sensed cylinders show exactly one sensor each.
    pub fn is_consistent(self) -> bool {
        Actuator::SENSED.iter().all(|&actuator| {
            self.pair(actuator)
                .is_some_and(|(extend, retract)| extend != retract)
        })
    }

    /// Sensed state of `actuator`, subject to the shared-word consistency check.
    ///
    /// # Errors
    /// [`GuiderError::SensorInconsistency`] if either cylinder's two sensors agree, even
    /// when the other cylinder is the one being asked about.
    pub fn state(self, actuator: Actuator) -> GuiderResult<Option<CylinderState>> {
        if !self.is_consistent() {
            return Err(GuiderError::SensorInconsistency {
                status_word: self.0,
            });
        }
        Ok(self.pair(actuator).map(|(extend, _)| {
            if extend {
                CylinderState::Extended
            } else {
                CylinderState::Retracted
            }
        }))
    }

    /// Whether `actuator` alone has settled at `target`. The other cylinder is ignored.
    fn settled_at(self, actuator: Actuator, target: CylinderState) -> bool {
        match (self.pair(actuator), target) {
            (Some((extend, retract)), CylinderState::Extended) => extend && !retract,
            (Some((extend, retract)), CylinderState::Retracted) => retract && !extend,
            (None, _) => false,
        }
    }
}

/// Drives the pneumatic valves and reads the position sensors.
pub struct ActuatorController {
    codec: Codec,
    settle: RetryPolicy,
    reflector_settle: Duration,
    reflector: RwLock<Option<CylinderState>>,
}

impl ActuatorController {
    /// Create an actuator controller.
    pub fn new(codec: Codec, settle: RetryPolicy, reflector_settle: Duration) -> Self {
        Self {
            codec,
            settle,
            reflector_settle,
            reflector: RwLock::new(None),
        }
    }

    /// Create an actuator controller from configuration.
    pub fn from_config(codec: Codec, config: &ActuatorConfig) -> Self {
        Self::new(
            codec,
            RetryPolicy::new(config.poll_interval(), config.max_attempts).with_delay_first(),
            config.reflector_settle(),
        )
    }

    /// One read of the shared sensor word.
    pub async fn read_sensors(&self) -> GuiderResult<SensorWord> {
        Ok(SensorWord::from_raw(self.codec.ask_int(SENSOR_QUERY).await?))
    }

    /// Current position of `actuator`.
    ///
    /// Every query, including the reflector's, reads the sensor word and fails with
    /// [`GuiderError::SensorInconsistency`] when the shared word is contradictory.
    pub async fn status(&self, actuator: Actuator) -> GuiderResult<ActuatorReading> {
        let word = self.read_sensors().await?;
        match word.state(actuator)? {
            Some(state) => Ok(ActuatorReading::Sensed(state)),
            None => Ok(match *self.reflector.read().await {
                Some(state) => ActuatorReading::Advisory(state),
                None => ActuatorReading::Unknown,
            }),
        }
    }

    /// Drive `actuator` and wait for it to settle.
    ///
    /// Sensed cylinders are polled until their own sensor pair shows the target state; the
    /// reflector arm only waits its settle delay and reports the commanded state.
    ///
    /// # Errors
    /// [`GuiderError::Timeout`] if a sensed cylinder does not settle within the poll budget.
    #[instrument(skip(self), err)]
    pub async fn command(
        &self,
        actuator: Actuator,
        command: CylinderCommand,
    ) -> GuiderResult<ActuatorReading> {
        if actuator == Actuator::ReflectorArm {
            return self.command_reflector(command).await;
        }

        let target = command.target();
        self.codec.tell(actuator.valve_commands(command)).await?;
        self.settle
            .poll_until(&format!("{actuator} to reach {target:?}"), || async move {
                let word = self.read_sensors().await?;
                Ok(word.settled_at(actuator, target).then_some(()))
            })
            .await?;
        debug!(%actuator, ?target, "cylinder settled");
        Ok(ActuatorReading::Sensed(target))
    }

    /// Swing the reflector arm and switch the illumination with it.
    ///
    /// The LED is lit after the arm is in and darkened before the arm comes out.
    async fn command_reflector(&self, command: CylinderCommand) -> GuiderResult<ActuatorReading> {
        let target = command.target();
        match command {
            CylinderCommand::Extend => {
                self.codec
                    .tell(Actuator::ReflectorArm.valve_commands(command))
                    .await?;
                *self.reflector.write().await = Some(target);
                sleep(self.reflector_settle).await;
                if self.led_on().await? != LedState::On {
                    warn!("LED did not report on");
                }
            }
            CylinderCommand::Retract => {
                if self.led_off().await? != LedState::Off {
                    warn!("LED did not report off");
                }
                self.codec
                    .tell(Actuator::ReflectorArm.valve_commands(command))
                    .await?;
                *self.reflector.write().await = Some(target);
                sleep(self.reflector_settle).await;
            }
        }
        Ok(ActuatorReading::Advisory(target))
    }

    /// Drop the reflector arm's commanded state, as after a controller reset.
    pub async fn forget_commanded(&self) {
        *self.reflector.write().await = None;
    }

    /// Put an optical element in the beam.
    pub async fn insert(&self, element: OpticalElement) -> GuiderResult<ActuatorReading> {
        let (actuator, command) = element.actuation();
        self.command(actuator, command).await
    }

    /// Light the LED.
    pub async fn led_on(&self) -> GuiderResult<LedState> {
        self.codec.tell(&format!("SB{LED_OUTPUT}")).await?;
        Ok(if self.read_led().await? != 0 {
            LedState::On
        } else {
            LedState::Unknown
        })
    }

    /// Darken the LED.
    pub async fn led_off(&self) -> GuiderResult<LedState> {
        self.codec.tell(&format!("CB{LED_OUTPUT}")).await?;
        Ok(if self.read_led().await? == 0 {
            LedState::Off
        } else {
            LedState::Unknown
        })
    }

    /// LED state from the output readback.
    pub async fn led_status(&self) -> GuiderResult<LedState> {
        Ok(if self.read_led().await? != 0 {
            LedState::On
        } else {
            LedState::Off
        })
    }

    async fn read_led(&self) -> GuiderResult<i32> {
        self.codec.ask_int(&format!("MG@OUT[{LED_OUTPUT}]")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_inputs_high_is_inconsistent() {
        // 0xFF on the port inverts to 0x00: no sensor sees either cylinder
        let word = SensorWord::from_raw(0xFF);
        assert_eq!(word.bits(), 0x00);
        assert!(!word.is_consistent());
        for actuator in Actuator::SENSED {
            assert!(matches!(
                word.state(actuator),
                Err(GuiderError::SensorInconsistency { status_word: 0x00 })
            ));
        }
    }

    #[test]
    fn one_read_decodes_both_cylinders() {
        // inverted: bit4 (Y1 extend) and bit3 (Y2 retract)
        let word = SensorWord::from_raw(!0b0001_1000);
        assert_eq!(
            word.state(Actuator::CameraSelector).unwrap(),
            Some(CylinderState::Extended)
        );
        assert_eq!(
            word.state(Actuator::ApertureSelector).unwrap(),
            Some(CylinderState::Retracted)
        );
    }

    #[test]
    fn inconsistent_other_cylinder_rejects_the_query() {
        // Y1 is cleanly extended, Y2 shows both sensors at once
        let word = SensorWord::from_raw(!0b0001_1100);
        assert!(word.settled_at(Actuator::CameraSelector, CylinderState::Extended));
        assert!(matches!(
            word.state(Actuator::CameraSelector),
            Err(GuiderError::SensorInconsistency { .. })
        ));
    }

    #[test]
    fn settling_only_looks_at_the_target_cylinder() {
        // Y2 extend only; Y1 shows nothing
        let word = SensorWord::from_raw(!0b0000_0100);
        assert!(word.settled_at(Actuator::ApertureSelector, CylinderState::Extended));
        assert!(!word.settled_at(Actuator::ApertureSelector, CylinderState::Retracted));
        assert!(!word.settled_at(Actuator::CameraSelector, CylinderState::Retracted));
        assert!(!word.settled_at(Actuator::ReflectorArm, CylinderState::Extended));
    }

    #[test]
    fn optical_elements_map_to_cylinders() {
        assert_eq!(
            OpticalElement::WideFieldCamera.actuation(),
            (Actuator::CameraSelector, CylinderCommand::Retract)
        );
        assert_eq!(
            OpticalElement::SmallAperture.actuation(),
            (Actuator::ApertureSelector, CylinderCommand::Extend)
        );
    }

    #[test]
    fn valve_commands_are_complementary() {
        assert_eq!(
            Actuator::CameraSelector.valve_commands(CylinderCommand::Extend),
            "SB7;CB8"
        );
        assert_eq!(
            Actuator::ApertureSelector.valve_commands(CylinderCommand::Retract),
            "SB5;CB6"
        );
    }
}
