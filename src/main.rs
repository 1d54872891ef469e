//! CLI Entry Point for ao-guider
//!
//! Operator front end to the guider motion core. Every invocation opens one connection,
//! runs one command and exits; calibration is not persisted between invocations, so
//! absolute moves take `--calibrate` to establish it first.
//!
//! # Usage
//!
//! ```bash
//! ao-guider status --json
//! ao-guider calibrate
//! ao-guider move-abs 0.5 0.25 --calibrate
//! ao-guider insert shack-hartmann
//! ao-guider --simulate self-check
//! ```

use anyhow::{bail, Context, Result};
use ao_guider::config::GuiderConfig;
use ao_guider::diagnostics;
use ao_guider::hardware::{
    Actuator, CylinderCommand, LedState, OpticalElement, SimulatedController,
};
use ao_guider::logging::{self, LogSettings, OutputFormat};
use ao_guider::Guider;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "ao-guider")]
#[command(about = "Motion and actuator control for the AO guider stage", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/guider.toml")]
    config: PathBuf,

    /// Controller address, overriding the configuration
    #[arg(long, global = true)]
    host: Option<String>,

    /// Run against the in-process simulated controller
    #[arg(long, global = true)]
    simulate: bool,

    /// Log output format, overriding the configuration
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    /// Log the duration of every controller operation
    #[arg(long, global = true)]
    log_spans: bool,

    /// Log level, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a status snapshot
    Status {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Load controller defaults and park the actuators
    Init,
    /// Reset the controller
    Reset,
    /// Creep every axis off engaged limit switches
    BackOff,
    /// Home all axes
    Home,
    /// Home and measure the X/Y travel envelope
    Calibrate,
    /// Absolute X-Y move in inches from home
    MoveAbs {
        /// X target (inches)
        #[arg(allow_negative_numbers = true)]
        x: f64,
        /// Y target (inches)
        #[arg(allow_negative_numbers = true)]
        y: f64,
        /// Calibrate first
        #[arg(long)]
        calibrate: bool,
    },
    /// Relative X-Y move in motor steps
    MoveRel {
        /// X steps
        #[arg(allow_negative_numbers = true)]
        x: i64,
        /// Y steps
        #[arg(allow_negative_numbers = true)]
        y: i64,
    },
    /// Relative focus move in motor steps
    FocusRel {
        /// Focus steps
        #[arg(allow_negative_numbers = true)]
        steps: i64,
    },
    /// Absolute focus move in mils from home
    FocusAbs {
        /// Focus target (mils)
        #[arg(allow_negative_numbers = true)]
        mils: f64,
        /// Home first
        #[arg(long)]
        home: bool,
    },
    /// Put an optical element in the beam
    Insert { element: ElementArg },
    /// Drive or query a pneumatic actuator
    Actuator {
        actuator: ActuatorArg,
        action: ActionArg,
    },
    /// Switch or query the illumination LED
    Led { action: SwitchArg },
    /// Cycle the actuators and check the encoder scale
    SelfCheck {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Send raw command text to the controller
    Raw { command: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ElementArg {
    ShackHartmann,
    WideField,
    SmallAperture,
    FieldLens,
}

impl From<ElementArg> for OpticalElement {
    fn from(value: ElementArg) -> Self {
        match value {
            ElementArg::ShackHartmann => OpticalElement::ShackHartmann,
            ElementArg::WideField => OpticalElement::WideFieldCamera,
            ElementArg::SmallAperture => OpticalElement::SmallAperture,
            ElementArg::FieldLens => OpticalElement::FieldLens,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ActuatorArg {
    Y1,
    Y2,
    S,
}

impl From<ActuatorArg> for Actuator {
    fn from(value: ActuatorArg) -> Self {
        match value {
            ActuatorArg::Y1 => Actuator::CameraSelector,
            ActuatorArg::Y2 => Actuator::ApertureSelector,
            ActuatorArg::S => Actuator::ReflectorArm,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Extend,
    Retract,
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum SwitchArg {
    On,
    Off,
    Status,
}

fn load_config(cli: &Cli) -> Result<GuiderConfig> {
    let mut config = GuiderConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(host) = &cli.host {
        config.controller.host = host.clone();
    }
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    config.validate()?;
    if cli.simulate {
        config = config.with_zero_delays();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut log_settings = LogSettings::from_config(&config.application)?;
    if let Some(format) = cli.log_format {
        log_settings.format = format;
    }
    log_settings.spans |= cli.log_spans;
    logging::init(&log_settings);

    let mut guider = if cli.simulate {
        info!("using simulated controller");
        Guider::with_link(Arc::new(SimulatedController::new()), config)
    } else {
        let target = format!("{}:{}", config.controller.host, config.controller.port);
        Guider::connect(config)
            .await
            .with_context(|| format!("connecting to controller at {target}"))?
    };

    run(&mut guider, cli.command).await
}

async fn run(guider: &mut Guider, command: Commands) -> Result<()> {
    match command {
        Commands::Status { json } => {
            let status = diagnostics::status(guider).await?;
            if json {
                print_json(&status)?;
            } else {
                println!("{status}");
            }
        }
        Commands::Init => guider.initialize().await?,
        Commands::Reset => guider.reset().await?,
        Commands::BackOff => guider.back_off().await?,
        Commands::Home => {
            let reference = guider.home().await?;
            println!(
                "homed: token {} x offset {} y offset {}",
                reference.token, reference.x_offset, reference.y_offset
            );
        }
        Commands::Calibrate => {
            let calibration = guider.calibrate().await?;
            print_json(&calibration)?;
        }
        Commands::MoveAbs { x, y, calibrate } => {
            if calibrate {
                guider.calibrate().await?;
            }
            let plan = guider.move_absolute(x, y).await?;
            println!("moved {} / {} steps", plan.x.steps, plan.y.steps);
        }
        Commands::MoveRel { x, y } => guider.move_relative(x, y).await?,
        Commands::FocusRel { steps } => guider.focus_relative(steps).await?,
        Commands::FocusAbs { mils, home } => {
            if home {
                guider.home().await?;
            }
            guider.focus_absolute(mils).await?;
        }
        Commands::Insert { element } => {
            let reading = guider.insert(element.into()).await?;
            println!("{reading:?}");
        }
        Commands::Actuator { actuator, action } => {
            let actuator = Actuator::from(actuator);
            let reading = match action {
                ActionArg::Extend => {
                    guider
                        .command_actuator(actuator, CylinderCommand::Extend)
                        .await?
                }
                ActionArg::Retract => {
                    guider
                        .command_actuator(actuator, CylinderCommand::Retract)
                        .await?
                }
                ActionArg::Status => guider.actuator_status(actuator).await?,
            };
            println!("{actuator}: {reading:?}");
        }
        Commands::Led { action } => {
            let state: LedState = match action {
                SwitchArg::On => guider.set_led(true).await?,
                SwitchArg::Off => guider.set_led(false).await?,
                SwitchArg::Status => guider.actuators().led_status().await?,
            };
            println!("led: {state:?}");
        }
        Commands::SelfCheck { json } => {
            let report = diagnostics::self_check(guider).await?;
            if json {
                print_json(&report)?;
            } else {
                println!("{report}");
            }
            if !report.passed() {
                bail!("self-check failed");
            }
        }
        Commands::Raw { command } => {
            let reply = guider.passthrough(&command).await?;
            println!("{}", reply.reply.trim_end());
            if let Some(text) = reply.error_text {
                println!("error: {text}");
            }
        }
    }
    Ok(())
}
