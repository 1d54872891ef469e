//! Controller Hardware Layer
//!
//! Everything that speaks the motion controller's command dialect, bottom-up:
//!
//! - [`link`]: one persistent byte-stream connection, one command in flight at a time
//! - [`codec`]: reply classification and numeric parsing
//! - [`poll`]: bounded retry helper used for every wait
//! - [`axis`]: per-axis stepper primitives (power, brakes, limits, two-phase moves)
//! - [`actuator`]: pneumatic cylinders and the illumination LED
//! - [`mock`]: simulated controller for tests and dry runs

pub mod actuator;
pub mod axis;
pub mod codec;
pub mod link;
pub mod mock;
pub mod poll;

pub use actuator::{
    Actuator, ActuatorController, ActuatorReading, CylinderCommand, CylinderState, LedState,
    OpticalElement,
};
pub use axis::{Axis, AxisController, BrakeState, Limits, PendingMove, PowerState};
pub use codec::{Codec, PassthroughReply};
pub use link::{Link, StreamLink};
pub use mock::SimulatedController;
pub use poll::RetryPolicy;
