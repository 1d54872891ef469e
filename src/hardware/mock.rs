//! Simulated Controller
//!
//! An in-process stand-in for the motion controller that speaks the same command dialect,
//! used by the integration tests and by the CLI's `--simulate` mode.
//!
//! # Model
//!
//! - Each axis has a true mechanical position in steps, a step counter (`RP`) and an
//!   encoder (`TP`) that reads `origin + round(position × scale)`.
//! - The forward limit sits at step 0 and the reverse limit at a per-axis edge. A switch
//!   engages at its edge and releases only once the axis has moved back past the switch
//!   hysteresis. Motion toward an engaged switch is refused, and motion toward a released
//!   one stops at its edge.
//! - Moves complete instantly, but `TS` keeps reporting motion for a configurable number of
//!   polls after `BG`. A stalled axis reports motion forever.
//! - Cylinder sensors follow the valve outputs after a configurable number of `TI0` reads,
//!   showing neither sensor while in transit.
//! - `TIME` advances by one tick per exchange, so every `homeTime=TIME` yields a new token.
//!
//! Unknown commands reply `?` and leave `1 Unrecognized command` for `TC1`. `RS` answers with
//! the controller's non-standard banner and clears program variables.

use crate::error::GuiderResult;
use crate::hardware::actuator::{Actuator, CylinderState};
use crate::hardware::axis::Axis;
use crate::hardware::link::Link;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::trace;

const ACK: &str = ":";
const UNRECOGNIZED: &str = "1 Unrecognized command";
const BAD_ARGUMENT: &str = "2 Bad numeric argument";
const MOTOR_OFF: &str = "20 Begin not valid with motor off";

/// Mnemonics accepted as configuration commands without further effect.
const CONFIG_MNEMONICS: [&str; 8] = ["MT", "CN", "SD", "VS", "VA", "VD", "KS", "CA"];

#[derive(Debug, Clone)]
struct SimAxis {
    position: i64,
    steps: i64,
    encoder_origin: i64,
    encoder_scale: f64,
    reverse_edge: i64,
    hysteresis: i64,
    reverse: bool,
    forward: bool,
    powered: bool,
    relative: i64,
    busy: u32,
    stalled: bool,
}

impl SimAxis {
    const FORWARD_EDGE: i64 = 0;

    fn new(position: i64, reverse_edge: i64, hysteresis: i64, encoder_origin: i64) -> Self {
        let mut axis = Self {
            position,
            steps: 0,
            encoder_origin,
            encoder_scale: 4.0,
            reverse_edge,
            hysteresis,
            reverse: false,
            forward: false,
            powered: false,
            relative: 0,
            busy: 0,
            stalled: false,
        };
        axis.place(position);
        axis
    }

    fn encoder(&self) -> i64 {
        self.encoder_origin + (self.position as f64 * self.encoder_scale).round() as i64
    }

    /// Put the axis at `position` with switch state derived from the edges alone.
    fn place(&mut self, position: i64) {
        self.position = position.clamp(self.reverse_edge, Self::FORWARD_EDGE);
        self.forward = self.position >= Self::FORWARD_EDGE;
        self.reverse = self.position <= self.reverse_edge;
    }

    fn update_switches(&mut self) {
        if self.position >= Self::FORWARD_EDGE {
            self.forward = true;
        } else if self.position < Self::FORWARD_EDGE - self.hysteresis {
            self.forward = false;
        }
        if self.position <= self.reverse_edge {
            self.reverse = true;
        } else if self.position > self.reverse_edge + self.hysteresis {
            self.reverse = false;
        }
    }

    fn begin(&mut self, busy_polls: u32) {
        let steps = self.relative;
        let target = if steps > 0 && !self.forward {
            (self.position + steps).min(Self::FORWARD_EDGE)
        } else if steps < 0 && !self.reverse {
            (self.position + steps).max(self.reverse_edge)
        } else {
            self.position
        };
        self.steps += target - self.position;
        self.position = target;
        self.update_switches();
        self.busy = busy_polls;
    }

    fn status_word(&mut self) -> i64 {
        let moving = self.stalled || self.busy > 0;
        self.busy = self.busy.saturating_sub(1);
        (i64::from(moving) << 7)
            | (i64::from(!self.powered) << 5)
            | (i64::from(!self.forward) << 3)
            | (i64::from(!self.reverse) << 2)
    }
}

#[derive(Debug, Clone)]
struct SimCylinder {
    target: CylinderState,
    sensed: Option<CylinderState>,
    transit: u32,
}

impl SimCylinder {
    fn settled(state: CylinderState) -> Self {
        Self {
            target: state,
            sensed: Some(state),
            transit: 0,
        }
    }

    fn drive(&mut self, target: CylinderState, lag: u32) {
        if target == self.target && self.sensed.is_some() {
            return;
        }
        self.target = target;
        self.transit = lag;
        self.sensed = (lag == 0).then_some(target);
    }

    fn advance(&mut self) {
        if self.transit > 0 {
            self.transit -= 1;
            if self.transit == 0 {
                self.sensed = Some(self.target);
            }
        }
    }

    /// `(extend, retract)` sensor levels after inversion.
    fn sensors(&self) -> (bool, bool) {
        match self.sensed {
            Some(CylinderState::Extended) => (true, false),
            Some(CylinderState::Retracted) => (false, true),
            None => (false, false),
        }
    }
}

#[derive(Debug)]
struct SimState {
    axes: [SimAxis; 3],
    outputs: u16,
    camera_selector: SimCylinder,
    aperture_selector: SimCylinder,
    clock: i64,
    home_time: Option<i64>,
    last_error: String,
    input_override: Option<i32>,
    busy_polls: u32,
    actuator_lag: u32,
    log: Vec<String>,
}

impl SimState {
    fn new() -> Self {
        Self {
            axes: [
                SimAxis::new(-8_000, -21_500, 150, 120_000),
                SimAxis::new(-30_000, -65_300, 150, 250_000),
                SimAxis {
                    encoder_scale: 0.0,
                    ..SimAxis::new(-30_000, -88_500, 2_700, 0)
                },
            ],
            // Y1 retract (out 8) and Y2 retract (out 5); brakes engaged
            outputs: (1 << 8) | (1 << 5),
            camera_selector: SimCylinder::settled(CylinderState::Retracted),
            aperture_selector: SimCylinder::settled(CylinderState::Retracted),
            clock: 1_000,
            home_time: None,
            last_error: String::new(),
            input_override: None,
            busy_polls: 1,
            actuator_lag: 2,
            log: Vec::new(),
        }
    }

    fn output(&self, n: u8) -> bool {
        (self.outputs >> n) & 0x01 == 1
    }

    fn set_output(&mut self, n: u8, high: bool) {
        if high {
            self.outputs |= 1 << n;
        } else {
            self.outputs &= !(1 << n);
        }

        let lag = self.actuator_lag;
        let y1 = match (self.output(7), self.output(8)) {
            (true, false) => Some(CylinderState::Extended),
            (false, true) => Some(CylinderState::Retracted),
            _ => None,
        };
        if let Some(target) = y1 {
            self.camera_selector.drive(target, lag);
        }
        let y2 = match (self.output(5), self.output(6)) {
            (false, true) => Some(CylinderState::Extended),
            (true, false) => Some(CylinderState::Retracted),
            _ => None,
        };
        if let Some(target) = y2 {
            self.aperture_selector.drive(target, lag);
        }
    }

    fn read_inputs(&mut self) -> i64 {
        self.camera_selector.advance();
        self.aperture_selector.advance();
        if let Some(raw) = self.input_override {
            return i64::from(raw);
        }

        let (y1_extend, y1_retract) = self.camera_selector.sensors();
        let (y2_extend, y2_retract) = self.aperture_selector.sensors();
        let inverted = (u8::from(y2_extend) << 2)
            | (u8::from(y2_retract) << 3)
            | (u8::from(y1_extend) << 4)
            | (u8::from(y1_retract) << 5);
        i64::from(!inverted)
    }

    fn reset(&mut self) {
        self.home_time = None;
        self.last_error.clear();
        for axis in &mut self.axes {
            axis.powered = false;
            axis.busy = 0;
            axis.relative = 0;
            axis.steps = 0;
        }
    }

    /// Execute one command; `Err` carries the text later reported by `TC1`.
    fn execute(&mut self, command: &str) -> Result<String, &'static str> {
        let command = command.trim();
        match command {
            "" => return Ok(ACK.to_string()),
            "RS" => {
                self.reset();
                return Ok("\r\n:".to_string());
            }
            "TC1" => return Ok(format!("{}\r\n:", self.last_error)),
            "TI0" => return Ok(number(self.read_inputs())),
            "MG TIME" => return Ok(number(self.clock)),
            "MG homeTime" => return self.home_time.map(number).ok_or(UNRECOGNIZED),
            "homeTime=TIME" => {
                self.home_time = Some(self.clock);
                return Ok(ACK.to_string());
            }
            _ => {}
        }

        if let Some(rest) = command.strip_prefix("MG@OUT[") {
            let n = rest
                .strip_suffix(']')
                .and_then(|n| n.parse::<u8>().ok())
                .filter(|n| (1..=8).contains(n))
                .ok_or(BAD_ARGUMENT)?;
            return Ok(format!(" {}.0000\r\n:", u8::from(self.output(n))));
        }

        let mnemonic = command.get(..2).ok_or(UNRECOGNIZED)?;
        let rest = &command[2..];
        match mnemonic {
            "TS" => Ok(number(self.axis_mut(rest)?.status_word())),
            "TP" => Ok(number(self.axis_mut(rest)?.encoder())),
            "RP" => Ok(number(self.axis_mut(rest)?.steps)),
            "DP" => {
                let values = parse_list(rest)?;
                for (axis, value) in self.axes.iter_mut().zip(values) {
                    axis.steps = value;
                }
                Ok(ACK.to_string())
            }
            "SH" => {
                self.axis_mut(rest)?.powered = true;
                Ok(ACK.to_string())
            }
            "MO" => {
                self.axis_mut(rest)?.powered = false;
                Ok(ACK.to_string())
            }
            "BG" => {
                let busy_polls = self.busy_polls;
                let axis = self.axis_mut(rest)?;
                if !axis.powered {
                    return Err(MOTOR_OFF);
                }
                axis.begin(busy_polls);
                Ok(ACK.to_string())
            }
            "SB" | "CB" => {
                let n = rest
                    .parse::<u8>()
                    .ok()
                    .filter(|n| (1..=8).contains(n))
                    .ok_or(BAD_ARGUMENT)?;
                self.set_output(n, mnemonic == "SB");
                Ok(ACK.to_string())
            }
            "PR" | "SP" | "AC" | "DC" => {
                if rest.starts_with(' ') {
                    parse_list(rest)?;
                    return Ok(ACK.to_string());
                }
                let (letter, value) = rest.split_once('=').ok_or(UNRECOGNIZED)?;
                let value = value.trim().parse::<i64>().map_err(|_| BAD_ARGUMENT)?;
                let axis = self.axis_mut(letter)?;
                if mnemonic == "PR" {
                    axis.relative = value;
                }
                Ok(ACK.to_string())
            }
            m if CONFIG_MNEMONICS.contains(&m) => Ok(ACK.to_string()),
            _ => Err(UNRECOGNIZED),
        }
    }

    fn axis_mut(&mut self, letter: &str) -> Result<&mut SimAxis, &'static str> {
        let index = match letter.trim() {
            "A" => 0,
            "B" => 1,
            "C" => 2,
            _ => return Err(UNRECOGNIZED),
        };
        Ok(&mut self.axes[index])
    }
}

fn number(value: i64) -> String {
    format!(" {value}\r\n:")
}

fn parse_list(args: &str) -> Result<Vec<i64>, &'static str> {
    args.split(',')
        .map(|v| v.trim().parse::<i64>().map_err(|_| BAD_ARGUMENT))
        .collect()
}

fn axis_index(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
        Axis::Z => 2,
    }
}

/// In-process motion controller implementing [`Link`].
///
/// # Example
///
/// ```rust,ignore
/// let sim = Arc::new(SimulatedController::new());
/// let mut guider = Guider::with_link(sim.clone(), GuiderConfig::without_delays());
/// guider.home().await?;
/// assert!(sim.commands().await.contains(&"DP 0,0,0".to_string()));
/// ```
pub struct SimulatedController {
    state: Mutex<SimState>,
}

impl SimulatedController {
    /// Controller with all axes mid-travel and both cylinders retracted.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::new()),
        }
    }

    /// Every command line received, in order.
    pub async fn commands(&self) -> Vec<String> {
        self.state.lock().await.log.clone()
    }

    /// Forget the recorded command lines.
    pub async fn clear_commands(&self) {
        self.state.lock().await.log.clear();
    }

    /// True mechanical position of `axis` in steps.
    pub async fn position(&self, axis: Axis) -> i64 {
        self.state.lock().await.axes[axis_index(axis)].position
    }

    /// Move `axis` by hand, clamped to its travel. The step counter is left untouched.
    pub async fn set_position(&self, axis: Axis, steps: i64) {
        self.state.lock().await.axes[axis_index(axis)].place(steps);
    }

    /// Encoder pulses per step seen on `axis`.
    pub async fn set_encoder_scale(&self, axis: Axis, scale: f64) {
        self.state.lock().await.axes[axis_index(axis)].encoder_scale = scale;
    }

    /// Make `axis` report motion forever.
    pub async fn set_stalled(&self, axis: Axis, stalled: bool) {
        self.state.lock().await.axes[axis_index(axis)].stalled = stalled;
    }

    /// Number of `TS` polls that report motion after each `BG`.
    pub async fn set_busy_polls(&self, polls: u32) {
        self.state.lock().await.busy_polls = polls;
    }

    /// Replace the `TI0` reply with a fixed raw word, or restore the cylinder model.
    pub async fn set_input_override(&self, raw: Option<i32>) {
        self.state.lock().await.input_override = raw;
    }

    /// Number of `TI0` reads a cylinder spends in transit.
    pub async fn set_actuator_lag(&self, reads: u32) {
        self.state.lock().await.actuator_lag = reads;
    }

    /// Valve output state of a sensed cylinder's model.
    pub async fn cylinder(&self, actuator: Actuator) -> Option<CylinderState> {
        let state = self.state.lock().await;
        match actuator {
            Actuator::CameraSelector => state.camera_selector.sensed,
            Actuator::ApertureSelector => state.aperture_selector.sensed,
            Actuator::ReflectorArm => Some(if state.output(3) {
                CylinderState::Extended
            } else {
                CylinderState::Retracted
            }),
        }
    }
}

impl Default for SimulatedController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Link for SimulatedController {
    async fn send(&self, command: &str, capacity: usize) -> GuiderResult<Vec<u8>> {
        let mut state = self.state.lock().await;
        state.clock += 1;
        state.log.push(command.to_string());

        let mut reply = String::new();
        for part in command.split(';') {
            match state.execute(part) {
                Ok(text) => reply.push_str(&text),
                Err(text) => {
                    state.last_error = text.to_string();
                    reply.push('?');
                    break;
                }
            }
        }
        trace!(command, reply = %reply.escape_debug(), "simulated exchange");

        let mut bytes = reply.into_bytes();
        bytes.truncate(capacity);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(sim: &SimulatedController, command: &str) -> String {
        let reply = sim.send(command, 512).await.unwrap();
        String::from_utf8(reply).unwrap()
    }

    #[tokio::test]
    async fn acknowledges_known_and_rejects_unknown() {
        let sim = SimulatedController::new();
        assert_eq!(exchange(&sim, "SHA").await, ":");
        assert_eq!(exchange(&sim, "XQ #FOO").await, "?");
        assert_eq!(exchange(&sim, "TC1").await, "1 Unrecognized command\r\n:");
        assert_eq!(exchange(&sim, "SB7;CB8").await, "::");
    }

    #[tokio::test]
    async fn begin_requires_power() {
        let sim = SimulatedController::new();
        exchange(&sim, "PRA=100").await;
        assert_eq!(exchange(&sim, "BGA").await, "?");
        assert_eq!(sim.position(Axis::X).await, -8_000);

        exchange(&sim, "SHA").await;
        assert_eq!(exchange(&sim, "BGA").await, ":");
        assert_eq!(sim.position(Axis::X).await, -7_900);
        assert_eq!(exchange(&sim, "RPA").await, " 100\r\n:");
    }

    #[tokio::test]
    async fn forward_switch_has_hysteresis() {
        let sim = SimulatedController::new();
        exchange(&sim, "SHA").await;
        exchange(&sim, "PRA=25000").await;
        exchange(&sim, "BGA").await;
        assert_eq!(sim.position(Axis::X).await, 0);

        let mut axis = sim.state.lock().await.axes[0].clone();
        assert!(axis.forward);
        axis.relative = -150;
        axis.begin(0);
        assert!(axis.forward, "still inside hysteresis band");
        axis.relative = -5;
        axis.begin(0);
        assert!(!axis.forward);
    }

    #[tokio::test]
    async fn status_word_reports_motion_then_stops() {
        let sim = SimulatedController::new();
        exchange(&sim, "SHB").await;
        exchange(&sim, "PRB=10").await;
        exchange(&sim, "BGB").await;
        // moving, powered, both switches released
        assert_eq!(exchange(&sim, "TSB").await, " 140\r\n:");
        assert_eq!(exchange(&sim, "TSB").await, " 12\r\n:");
    }

    #[tokio::test]
    async fn cylinders_travel_before_sensing() {
        let sim = SimulatedController::new();
        // both retracted: inverted 0b0010_1000
        assert_eq!(exchange(&sim, "TI0").await, format!(" {}\r\n:", !0b0010_1000u8));

        exchange(&sim, "SB7;CB8").await;
        assert_eq!(exchange(&sim, "TI0").await, format!(" {}\r\n:", !0b0000_1000u8));
        assert_eq!(exchange(&sim, "TI0").await, format!(" {}\r\n:", !0b0001_1000u8));
        assert_eq!(
            sim.cylinder(Actuator::CameraSelector).await,
            Some(CylinderState::Extended)
        );
    }

    #[tokio::test]
    async fn reset_clears_home_time() {
        let sim = SimulatedController::new();
        exchange(&sim, "homeTime=TIME").await;
        assert!(exchange(&sim, "MG homeTime").await.starts_with(' '));
        assert_eq!(exchange(&sim, "RS").await, "\r\n:");
        assert_eq!(exchange(&sim, "MG homeTime").await, "?");
    }

    #[tokio::test]
    async fn replies_are_truncated_to_capacity() {
        let sim = SimulatedController::new();
        let reply = sim.send("TPA", 3).await.unwrap();
        assert_eq!(reply.len(), 3);
    }
}
