//! Integration tests for the guider core against the simulated controller
//!
//! These drive complete procedures (homing, calibration, absolute moves, actuators,
//! self-check) through the public API and inspect the commands the controller received.

use ao_guider::config::GuiderConfig;
use ao_guider::diagnostics::{self, MotionCheck};
use ao_guider::hardware::{
    Actuator, ActuatorReading, Axis, BrakeState, CylinderCommand, CylinderState, LedState, Link,
    OpticalElement, PowerState, SimulatedController,
};
use ao_guider::{Guider, GuiderError, GuiderResult};
use async_trait::async_trait;
use std::sync::Arc;

fn simulated() -> (Arc<SimulatedController>, Guider) {
    simulated_with(GuiderConfig::without_delays())
}

fn simulated_with(config: GuiderConfig) -> (Arc<SimulatedController>, Guider) {
    let sim = Arc::new(SimulatedController::new());
    let guider = Guider::with_link(sim.clone(), config);
    (sim, guider)
}

/// Simulated controller that answers `?` to one specific command.
struct RejectingLink {
    sim: Arc<SimulatedController>,
    rejected: &'static str,
}

#[async_trait]
impl Link for RejectingLink {
    async fn send(&self, command: &str, capacity: usize) -> GuiderResult<Vec<u8>> {
        if command == self.rejected {
            return Ok(b"?".to_vec());
        }
        self.sim.send(command, capacity).await
    }
}

fn rejecting(rejected: &'static str) -> (Arc<SimulatedController>, Guider) {
    let sim = Arc::new(SimulatedController::new());
    let link = RejectingLink {
        sim: sim.clone(),
        rejected,
    };
    let guider = Guider::with_link(Arc::new(link), GuiderConfig::without_delays());
    (sim, guider)
}

// =============================================================================
// Homing & Calibration
// =============================================================================

#[tokio::test]
async fn test_homing_is_repeatable() -> anyhow::Result<()> {
    let (_sim, mut guider) = simulated();

    let first = guider.home().await?;
    let second = guider.home().await?;

    assert!((first.x_offset - second.x_offset).abs() <= 1);
    assert!((first.y_offset - second.y_offset).abs() <= 1);
    assert_ne!(first.token, second.token);
    assert!(guider.is_homed().await?);
    Ok(())
}

#[tokio::test]
async fn test_homing_zeroes_steps_and_stamps_token() -> anyhow::Result<()> {
    let (sim, mut guider) = simulated();
    guider.home().await?;

    let commands = sim.commands().await;
    let zero = commands.iter().position(|c| c == "DP 0,0,0");
    let stamp = commands.iter().position(|c| c == "homeTime=TIME");
    assert!(zero.is_some() && stamp.is_some());
    assert!(zero < stamp);

    for axis in Axis::ALL {
        assert_eq!(guider.axes().step_position(axis).await?, 0);
    }
    Ok(())
}

#[tokio::test]
async fn test_calibration_measures_nominal_scale() -> anyhow::Result<()> {
    let (_sim, mut guider) = simulated();

    let calibration = guider.calibrate().await?;
    let reference = calibration.reference.expect("calibration homes first");
    let x = calibration.x.expect("x calibrated");
    let y = calibration.y.expect("y calibrated");

    assert_eq!(x.encoder_per_step, 4.0);
    assert_eq!(y.encoder_per_step, 4.0);
    assert_eq!(x.encoder_offset, reference.x_offset);
    assert!(x.encoder_min < x.encoder_offset);
    assert!(y.encoder_min < y.encoder_offset);
    Ok(())
}

#[tokio::test]
async fn test_rehoming_clears_calibration() -> anyhow::Result<()> {
    let (_sim, mut guider) = simulated();
    guider.calibrate().await?;
    assert!(guider.calibration().is_calibrated());

    guider.home().await?;
    assert!(!guider.calibration().is_calibrated());
    Ok(())
}

#[tokio::test]
async fn test_creep_budget_exhaustion_is_timeout() {
    let mut config = GuiderConfig::without_delays();
    config.homing.seek_steps = 10;
    config.homing.max_creep_iterations = 5;
    let (sim, mut guider) = simulated_with(config);

    let err = guider.home().await.unwrap_err();
    assert!(matches!(err, GuiderError::Timeout { attempts: 5, .. }));
    assert!(guider.calibration().reference.is_none());
    assert_eq!(sim.commands().await.last().map(String::as_str), Some("MOA"));
}

// =============================================================================
// Absolute Moves
// =============================================================================

#[tokio::test]
async fn test_absolute_move_reads_back() -> anyhow::Result<()> {
    let (_sim, mut guider) = simulated();
    guider.calibrate().await?;

    let plan = guider.move_absolute(0.5, 0.25).await?;
    assert_eq!(guider.axes().encoder_position(Axis::X).await?, plan.x.target);
    assert_eq!(guider.axes().encoder_position(Axis::Y).await?, plan.y.target);

    let x = guider.position_inches(Axis::X).await?;
    let y = guider.position_inches(Axis::Y).await?;
    assert!((x - 0.5).abs() < 1e-9, "x = {x}");
    assert!((y - 0.25).abs() < 1e-9, "y = {y}");
    Ok(())
}

#[tokio::test]
async fn test_out_of_range_move_sends_no_motion() -> anyhow::Result<()> {
    let (sim, mut guider) = simulated();
    guider.calibrate().await?;
    sim.clear_commands().await;

    let beyond_far_limit = guider.move_absolute(3.0, 0.0).await;
    assert!(matches!(
        beyond_far_limit,
        Err(GuiderError::Range { axis: Axis::X, .. })
    ));

    let behind_home = guider.move_absolute(0.0, -0.1).await;
    assert!(matches!(
        behind_home,
        Err(GuiderError::Range { axis: Axis::Y, .. })
    ));

    let commands = sim.commands().await;
    assert!(
        !commands
            .iter()
            .any(|c| c.starts_with("PR") || c.starts_with("BG") || c.starts_with("SH")),
        "motion commanded: {commands:?}"
    );
    Ok(())
}

#[tokio::test]
async fn test_stale_token_blocks_absolute_moves() -> anyhow::Result<()> {
    let (_sim, mut guider) = simulated();
    guider.calibrate().await?;
    assert!(guider.is_homed().await?);

    // another session re-stamps the controller's homing variable
    guider.passthrough("homeTime=TIME").await?;

    assert!(!guider.is_homed().await?);
    assert!(guider.calibration().is_calibrated());
    assert!(matches!(
        guider.move_absolute(0.1, 0.1).await,
        Err(GuiderError::NotHomed)
    ));
    assert!(matches!(
        guider.focus_absolute(1.0).await,
        Err(GuiderError::NotHomed)
    ));
    Ok(())
}

#[tokio::test]
async fn test_focus_absolute_uses_home_reference() -> anyhow::Result<()> {
    let (sim, mut guider) = simulated();
    guider.home().await?;
    let homed_at = sim.position(Axis::Z).await;

    guider.focus_absolute(10.0).await?;
    assert_eq!(guider.axes().step_position(Axis::Z).await?, -800);

    guider.focus_absolute(5.0).await?;
    assert_eq!(guider.axes().step_position(Axis::Z).await?, -400);
    assert_eq!(sim.position(Axis::Z).await, homed_at - 400);
    Ok(())
}

// =============================================================================
// Axis Power
// =============================================================================

#[tokio::test]
async fn test_power_off_waits_for_motion_to_stop() -> anyhow::Result<()> {
    let (sim, guider) = simulated();
    sim.set_busy_polls(5).await;
    sim.clear_commands().await;

    guider
        .axes()
        .begin_move(Axis::X, 100, 3800)
        .await?
        .settle_and_power_off()
        .await?;

    let commands = sim.commands().await;
    let polls = commands.iter().filter(|c| *c == "TSA").count();
    let last_poll = commands.iter().rposition(|c| c == "TSA");
    let power_off = commands.iter().position(|c| c == "MOA");
    assert_eq!(polls, 6);
    assert!(last_poll < power_off);
    assert!(!guider.axes().is_moving(Axis::X).await?);
    Ok(())
}

#[tokio::test]
async fn test_stalled_axis_is_never_powered_off() -> anyhow::Result<()> {
    let mut config = GuiderConfig::without_delays();
    config.timing.motion_max_polls = 20;
    let (sim, guider) = simulated_with(config);
    sim.set_stalled(Axis::Y, true).await;

    let pending = guider.axes().begin_move(Axis::Y, 100, 3800).await?;
    let err = pending.settle_and_power_off().await.unwrap_err();

    assert!(matches!(err, GuiderError::Timeout { attempts: 20, .. }));
    assert!(!sim.commands().await.iter().any(|c| c == "MOB"));
    Ok(())
}

#[tokio::test]
async fn test_focus_has_no_brake_or_encoder() {
    let (_sim, guider) = simulated();
    assert!(matches!(
        guider.axes().engage_brake(Axis::Z).await,
        Err(GuiderError::InvalidAxis { axis: Axis::Z, .. })
    ));
    assert!(matches!(
        guider.axes().encoder_position(Axis::Z).await,
        Err(GuiderError::InvalidAxis { axis: Axis::Z, .. })
    ));
}

#[tokio::test]
async fn test_rejected_start_powers_down_started_axis() -> anyhow::Result<()> {
    let (sim, guider) = rejecting("BGB");

    let err = guider.move_relative(100, 100).await.unwrap_err();
    assert!(matches!(err, GuiderError::Controller(_)));

    let commands = sim.commands().await;
    assert!(commands.iter().any(|c| c == "CB1"));
    assert!(commands.iter().any(|c| c == "MOA"));
    assert!(commands.iter().any(|c| c == "MOB"));
    assert_eq!(guider.axes().power_status(Axis::X).await?, PowerState::Off);
    assert_eq!(guider.axes().brake_status(Axis::X).await?, BrakeState::On);
    assert_eq!(guider.axes().power_status(Axis::Y).await?, PowerState::Off);
    Ok(())
}

#[tokio::test]
async fn test_stalled_axis_does_not_strand_the_other() -> anyhow::Result<()> {
    let mut config = GuiderConfig::without_delays();
    config.timing.motion_max_polls = 20;
    let (sim, guider) = simulated_with(config);
    sim.set_stalled(Axis::X, true).await;

    let err = guider.move_relative(100, 100).await.unwrap_err();
    assert!(matches!(err, GuiderError::Timeout { attempts: 20, .. }));

    let commands = sim.commands().await;
    assert!(!commands.iter().any(|c| c == "MOA"));
    assert!(commands.iter().any(|c| c == "MOB"));
    assert_eq!(guider.axes().power_status(Axis::Y).await?, PowerState::Off);
    Ok(())
}

#[tokio::test]
async fn test_rejected_focus_start_powers_down_focus() -> anyhow::Result<()> {
    let (sim, guider) = rejecting("BGC");

    assert!(guider.focus_relative(400).await.is_err());
    assert!(sim.commands().await.iter().any(|c| c == "MOC"));
    assert_eq!(guider.axes().power_status(Axis::Z).await?, PowerState::Off);
    Ok(())
}

// =============================================================================
// Actuators
// =============================================================================

#[tokio::test]
async fn test_insert_shack_hartmann_settles_y1() -> anyhow::Result<()> {
    let (sim, guider) = simulated();

    let reading = guider.insert(OpticalElement::ShackHartmann).await?;
    assert_eq!(reading, ActuatorReading::Sensed(CylinderState::Extended));
    assert_eq!(
        guider.actuator_status(Actuator::ApertureSelector).await?,
        ActuatorReading::Sensed(CylinderState::Retracted)
    );
    assert_eq!(
        sim.cylinder(Actuator::CameraSelector).await,
        Some(CylinderState::Extended)
    );
    Ok(())
}

#[tokio::test]
async fn test_inconsistent_word_fails_every_actuator() {
    let (sim, guider) = simulated();
    sim.set_input_override(Some(0xFF)).await;

    for actuator in [
        Actuator::CameraSelector,
        Actuator::ApertureSelector,
        Actuator::ReflectorArm,
    ] {
        assert!(matches!(
            guider.actuator_status(actuator).await,
            Err(GuiderError::SensorInconsistency { status_word: 0x00 })
        ));
    }
}

#[tokio::test]
async fn test_unsettled_cylinder_times_out() {
    let (sim, guider) = simulated();
    sim.set_input_override(Some(0xFF)).await;

    let err = guider
        .command_actuator(Actuator::ApertureSelector, CylinderCommand::Extend)
        .await
        .unwrap_err();
    assert!(matches!(err, GuiderError::Timeout { attempts: 50, .. }));
}

#[tokio::test]
async fn test_reflector_state_is_advisory() -> anyhow::Result<()> {
    let (_sim, guider) = simulated();
    assert_eq!(
        guider.actuator_status(Actuator::ReflectorArm).await?,
        ActuatorReading::Unknown
    );

    let reading = guider
        .command_actuator(Actuator::ReflectorArm, CylinderCommand::Extend)
        .await?;
    assert_eq!(reading, ActuatorReading::Advisory(CylinderState::Extended));
    assert_eq!(guider.actuators().led_status().await?, LedState::On);

    guider
        .command_actuator(Actuator::ReflectorArm, CylinderCommand::Retract)
        .await?;
    assert_eq!(
        guider.actuator_status(Actuator::ReflectorArm).await?,
        ActuatorReading::Advisory(CylinderState::Retracted)
    );
    assert_eq!(guider.actuators().led_status().await?, LedState::Off);
    Ok(())
}

// =============================================================================
// Diagnostics
// =============================================================================

#[tokio::test]
async fn test_self_check_passes_on_healthy_stage() -> anyhow::Result<()> {
    let (sim, guider) = simulated();
    let start = sim.position(Axis::X).await;

    let report = diagnostics::self_check(&guider).await?;
    assert!(report.passed(), "{report}");
    assert!(matches!(report.motion, MotionCheck::Measured { .. }));
    assert_eq!(sim.position(Axis::X).await, start);
    Ok(())
}

#[tokio::test]
async fn test_self_check_flags_wrong_scale() -> anyhow::Result<()> {
    let (sim, guider) = simulated();
    sim.set_encoder_scale(Axis::Y, 3.9).await;

    let report = diagnostics::self_check(&guider).await?;
    assert!(!report.passed());
    match report.motion {
        MotionCheck::Measured { axes } => {
            assert!(axes[0].passed);
            assert!(!axes[1].passed);
        }
        MotionCheck::Skipped { .. } => panic!("motion check should have run"),
    }
    Ok(())
}

#[tokio::test]
async fn test_self_check_skips_motion_on_limit() -> anyhow::Result<()> {
    let (sim, guider) = simulated();
    sim.set_position(Axis::X, 0).await;
    sim.clear_commands().await;

    let report = diagnostics::self_check(&guider).await?;
    assert!(matches!(report.motion, MotionCheck::Skipped { .. }));
    assert!(!sim.commands().await.iter().any(|c| c.starts_with("BG")));
    Ok(())
}

#[tokio::test]
async fn test_status_snapshot_after_calibration() -> anyhow::Result<()> {
    let (_sim, mut guider) = simulated();
    guider.calibrate().await?;

    let status = diagnostics::status(&guider).await?;
    assert!(status.homed);
    assert!(status.calibrated);
    assert_eq!(status.axes.len(), 3);
    assert!(status.axes[0].position_inches.is_some());
    assert!(status.axes[2].encoder.is_none());

    let json = serde_json::to_value(&status)?;
    assert_eq!(json["axes"][1]["axis"], "Y");
    assert_eq!(json["led"], "Off");
    Ok(())
}
