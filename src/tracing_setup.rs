//! Tracing subscriber setup.
//!
//! Workers log through `tracing` with structured fields (`device = ...`). The
//! subscriber installed here decides the output format. Operator-facing messages
//! travel separately as [`DeviceEvent::Message`](crate::device::DeviceEvent) and are
//! kept in the [`MessageLog`](crate::log_capture::MessageLog).
//!
//! # Example
//! ```no_run
//! use plasma_daq::{config::Settings, tracing_setup};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load_from("config/controlunit.toml")?;
//! tracing_setup::init_from_settings(&settings)?;
//! tracing::info!(device = "adc", "ready");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Multi-line with colors
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Emit span NEW/CLOSE events
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    /// Worker threads are named after their device
    pub with_thread_names: bool,
    /// Only honored by the pretty format
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let level = parse_log_level(&settings.application.log_level)?;
        Ok(Self {
            level,
            ..Default::default()
        })
    }

    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing with the log level from `settings`.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Idempotent: a second call returns `Ok(())`, so tests and embedding
/// applications can call it freely. `RUST_LOG` overrides the configured level.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let result = match config.format {
        OutputFormat::Pretty => tracing_subscriber::registry()
            .with(layer.pretty().with_ansi(config.with_ansi).with_filter(env_filter))
            .try_init(),
        OutputFormat::Compact => tracing_subscriber::registry()
            .with(layer.compact().with_ansi(false).with_filter(env_filter))
            .try_init(),
        OutputFormat::Json => tracing_subscriber::registry()
            .with(layer.json().with_filter(env_filter))
            .try_init(),
    };

    result.or_else(|e| {
        // Already installed by a test harness or an embedding application.
        if e.to_string()
            .contains("a global default trace dispatcher has already been set")
        {
            Ok(())
        } else {
            Err(format!("Failed to initialize tracing: {e}"))
        }
    })
}

/// Parse log level string into tracing Level
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace".to_string(),
        Level::DEBUG => "debug".to_string(),
        Level::INFO => "info".to_string(),
        Level::WARN => "warn".to_string(),
        Level::ERROR => "error".to_string(),
    }
}
