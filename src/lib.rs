//! # AO Guider Motion Core
//!
//! This crate is the motion and actuator control core of an adaptive-optics guider. The
//! guider stage (X and Y translation plus a Z focus stage, all stepper driven) and three
//! pneumatic actuators hang off a single Galil-style motion controller that speaks an ASCII
//! command dialect over TCP.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (TOML file plus `AO_GUIDER_` environment
//!   overrides). See `config::GuiderConfig`.
//! - **`error`**: The `GuiderError` enum returned by every operation.
//! - **`logging`**: `tracing-subscriber` initialization with pretty, compact and JSON output.
//! - **`hardware`**: The controller link, reply codec, bounded polling, per-axis primitives,
//!   pneumatic actuators, and a simulated controller for tests and dry runs.
//! - **`stage`**: Homing and calibration sequences and the inch/encoder coordinate mapper.
//! - **`guider`**: The `Guider` context object that owns all of the above.
//! - **`diagnostics`**: Self-check and status snapshot.

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod guider;
pub mod hardware;
pub mod logging;
pub mod stage;

pub use config::GuiderConfig;
pub use error::{GuiderError, GuiderResult};
pub use guider::Guider;
