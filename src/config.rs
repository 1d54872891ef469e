//! Guider Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. `config/guider.toml` (base configuration)
//! 2. Environment variables prefixed with `AO_GUIDER_`, nested with `__`
//!
//! Every section has serde defaults matching the instrument's mechanical constants, so an
//! empty file (or no file at all) yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use ao_guider::config::GuiderConfig;
//!
//! let config = GuiderConfig::load()?;
//! config.validate()?;
//! println!("Controller: {}:{}", config.controller.host, config.controller.port);
//! # Ok::<(), ao_guider::error::GuiderError>(())
//! ```
//!
//! Override the controller address from the environment:
//! `AO_GUIDER_CONTROLLER__HOST=192.168.1.2`

use crate::error::{GuiderError, GuiderResult};
use crate::logging::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Top-level guider configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuiderConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Controller link settings
    pub controller: ControllerConfig,
    /// Mechanical constants and motion profiles
    pub stage: StageConfig,
    /// Homing procedure step sizes and bounds
    pub homing: HomingConfig,
    /// Pneumatic actuator timing
    pub actuators: ActuatorConfig,
    /// Settle delays and motion polling
    pub timing: TimingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format
    pub log_format: OutputFormat,
    /// Log the duration of every controller operation
    pub log_spans: bool,
}

/// Connection settings for the motion controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller IPv4 address (dotted quad)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Receive buffer for numeric queries
    pub query_buffer: usize,
    /// Receive buffer for commands, error text and pass-through
    pub command_buffer: usize,
    /// Per-reply read timeout in milliseconds
    pub read_timeout_ms: u64,
}

/// Motion profile for one motor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionProfile {
    /// Slew speed (steps/s)
    pub speed: i64,
    /// Acceleration (steps/s²)
    pub acceleration: i64,
    /// Deceleration (steps/s²)
    pub deceleration: i64,
}

/// Lead screw and encoder geometry of one translation axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisGeometry {
    /// Motor steps per screw revolution
    pub steps_per_turn: i64,
    /// Encoder pulses per screw revolution
    pub encoder_pulses_per_turn: i64,
    /// Screw pitch in inches per revolution
    pub screw_pitch: f64,
}

impl AxisGeometry {
    /// Nominal encoder pulses per motor step.
    pub fn pulses_per_step(&self) -> f64 {
        self.encoder_pulses_per_turn as f64 / self.steps_per_turn as f64
    }

    /// Nominal encoder pulses per inch of travel.
    pub fn pulses_per_inch(&self) -> f64 {
        self.encoder_pulses_per_turn as f64 / self.screw_pitch
    }
}

/// Stage mechanics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// X translation geometry
    pub x: AxisGeometry,
    /// Y translation geometry
    pub y: AxisGeometry,
    /// Focus motor steps per screw revolution
    pub z_steps_per_turn: i64,
    /// Focus screw pitch in inches
    pub z_screw_pitch: f64,
    /// X/Y motion profile
    pub xy_profile: MotionProfile,
    /// Focus motion profile
    pub z_profile: MotionProfile,
}

/// Homing and calibration step sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HomingConfig {
    /// Maximum creep iterations before reporting Timeout
    pub max_creep_iterations: u32,
    /// Creep step toward the limit at full speed
    pub seek_steps: i64,
    /// X/Y overshoot away from the limit
    pub xy_overshoot_steps: i64,
    /// X/Y final approach creep step
    pub xy_approach_steps: i64,
    /// X/Y back-off step when a limit is active before homing
    pub xy_backoff_steps: i64,
    /// Focus overshoot away from the limit
    pub z_overshoot_steps: i64,
    /// Focus final approach creep step
    pub z_approach_steps: i64,
    /// Focus back-off step when a limit is active before homing
    pub z_backoff_steps: i64,
    /// X/Y clearance step off the far limit during calibration
    pub calibration_overshoot_steps: i64,
}

/// Pneumatic actuator timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Interval between sensor polls in milliseconds
    pub poll_interval_ms: u64,
    /// Maximum sensor polls before reporting Timeout
    pub max_attempts: u32,
    /// Settle delay for the unsensed reflector arm in milliseconds
    pub reflector_settle_ms: u64,
}

/// Settle delays and motion-completion polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay around brake engage/release in milliseconds
    pub brake_settle_ms: u64,
    /// Interval between "is moving" polls in milliseconds
    pub motion_poll_ms: u64,
    /// Maximum "is moving" polls before reporting Timeout
    pub motion_max_polls: u32,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "AO Guider".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
            log_spans: false,
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.2".to_string(),
            port: 8079,
            query_buffer: 80,
            command_buffer: 512,
            read_timeout_ms: 5000,
        }
    }
}

impl Default for StageConfig {
    fn default() -> Self {
        let xy = AxisGeometry {
            steps_per_turn: 500,
            encoder_pulses_per_turn: 2000,
            screw_pitch: 0.0625,
        };
        Self {
            x: xy,
            y: xy,
            z_steps_per_turn: 4000,
            z_screw_pitch: 0.050,
            xy_profile: MotionProfile {
                speed: 3800,
                acceleration: 9000,
                deceleration: 20000,
            },
            z_profile: MotionProfile {
                speed: 4000,
                acceleration: 128_000,
                deceleration: 128_000,
            },
        }
    }
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            max_creep_iterations: 200,
            seek_steps: 25000,
            xy_overshoot_steps: 50,
            xy_approach_steps: 5,
            xy_backoff_steps: 20,
            z_overshoot_steps: 1000,
            z_approach_steps: 10,
            z_backoff_steps: 200,
            calibration_overshoot_steps: 150,
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            max_attempts: 50,
            reflector_settle_ms: 1000,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            brake_settle_ms: 250,
            motion_poll_ms: 10,
            motion_max_polls: 6000,
        }
    }
}

impl ControllerConfig {
    /// Parse the configured host as a dotted-quad IPv4 address.
    pub fn host_addr(&self) -> GuiderResult<Ipv4Addr> {
        self.host.parse::<Ipv4Addr>().map_err(|_| {
            GuiderError::Configuration(format!(
                "Invalid controller host '{}'. Must be a dotted-quad IPv4 address",
                self.host
            ))
        })
    }

    /// Read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl ActuatorConfig {
    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reflector settle delay as a `Duration`
    pub fn reflector_settle(&self) -> Duration {
        Duration::from_millis(self.reflector_settle_ms)
    }
}

impl TimingConfig {
    /// Brake settle delay as a `Duration`
    pub fn brake_settle(&self) -> Duration {
        Duration::from_millis(self.brake_settle_ms)
    }

    /// Motion poll interval as a `Duration`
    pub fn motion_poll(&self) -> Duration {
        Duration::from_millis(self.motion_poll_ms)
    }
}

impl GuiderConfig {
    /// Load configuration from `config/guider.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `AO_GUIDER_`.
    /// Example: `AO_GUIDER_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> GuiderResult<Self> {
        Self::load_from("config/guider.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> GuiderResult<Self> {
        Ok(Figment::from(Serialized::defaults(GuiderConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AO_GUIDER_").split("__"))
            .extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> GuiderResult<()> {
        parse_log_level(&self.application.log_level)?;

        self.controller.host_addr()?;

        if self.controller.query_buffer == 0 || self.controller.command_buffer == 0 {
            return Err(GuiderError::Configuration(
                "Receive buffers must be non-empty".to_string(),
            ));
        }

        for (name, geometry) in [("x", &self.stage.x), ("y", &self.stage.y)] {
            if geometry.steps_per_turn <= 0
                || geometry.encoder_pulses_per_turn <= 0
                || geometry.screw_pitch <= 0.0
            {
                return Err(GuiderError::Configuration(format!(
                    "Stage {name} geometry must be positive"
                )));
            }
        }

        if self.stage.z_steps_per_turn <= 0 || self.stage.z_screw_pitch <= 0.0 {
            return Err(GuiderError::Configuration(
                "Focus geometry must be positive".to_string(),
            ));
        }

        if self.homing.max_creep_iterations == 0
            || self.actuators.max_attempts == 0
            || self.timing.motion_max_polls == 0
        {
            return Err(GuiderError::Configuration(
                "Retry budgets must be at least one attempt".to_string(),
            ));
        }

        Ok(())
    }

    /// Default configuration with every delay set to zero.
    pub fn without_delays() -> Self {
        Self::default().with_zero_delays()
    }

    /// Zero every settle and poll delay, keeping the attempt budgets.
    ///
    /// Used when driving the simulated controller, which settles instantly.
    pub fn with_zero_delays(mut self) -> Self {
        self.actuators.poll_interval_ms = 0;
        self.actuators.reflector_settle_ms = 0;
        self.timing.brake_settle_ms = 0;
        self.timing.motion_poll_ms = 0;
        self
    }
}
