//! Logging setup
//!
//! Installs a `tracing-subscriber` registry writing to stderr. The level comes from
//! `[application] log_level` unless `RUST_LOG` is set. Controller traffic is logged at
//! `trace` and procedure milestones at `debug`, so `log_level = "debug"` is the
//! diagnostic-print switch. With `log_spans` enabled, every instrumented controller
//! operation also logs its duration when it closes.

use crate::config::ApplicationConfig;
use crate::error::{GuiderError, GuiderResult};
use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, for development
    Pretty,
    /// One line per event, for the observatory console
    #[default]
    Compact,
    /// One JSON object per event, for log collection
    Json,
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    /// Maximum level when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Log span close events with their duration
    pub spans: bool,
    /// Colorize text formats
    pub ansi: bool,
}

impl LogSettings {
    /// Settings from the `[application]` section. Colors follow whether stderr is a terminal.
    pub fn from_config(config: &ApplicationConfig) -> GuiderResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.log_level)?,
            format: config.log_format,
            spans: config.log_spans,
            ansi: std::io::stderr().is_terminal(),
        })
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string().to_lowercase()))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_span_events(span_events)
            .with_writer(std::io::stderr);
        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(self.ansi).boxed(),
            OutputFormat::Json => base.json().with_ansi(false).boxed(),
        }
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed in this process (tests,
/// embedding); the existing one is left in place.
pub fn init(settings: &LogSettings) -> bool {
    let layer = settings.fmt_layer().with_filter(settings.env_filter());
    tracing_subscriber::registry().with(layer).try_init().is_ok()
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> GuiderResult<Level> {
    Level::from_str(level).map_err(|_| {
        GuiderError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}
