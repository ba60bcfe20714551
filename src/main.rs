//! CLI entry point for plasma-daq.
//!
//! - `run`: start an acquisition session against the simulated hardware and keep it
//!   running until Ctrl+C or `--duration` elapses.
//! - `check-config`: load and validate a configuration file.
//!
//! # Usage
//!
//! ```bash
//! plasma-daq run --config config/controlunit.toml --duration 30 --setpoint 0.5
//! plasma-daq check-config --config config/controlunit.toml --json
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use plasma_daq::channel::Conversion;
use plasma_daq::config::{DeviceConfig, Settings};
use plasma_daq::coordinator::{Coordinator, PlotUpdate};
use plasma_daq::device::SystemClock;
use plasma_daq::hal::MockHal;
use plasma_daq::log_capture::MessageLog;
use plasma_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Simulated current sensor volts per DAC volt.
const LOOPBACK_GAIN: f64 = 0.2;
/// MAX6675 frame for 25 °C.
const ROOM_TEMPERATURE_FRAME: [u8; 2] = [0x03, 0x20];

#[derive(Parser)]
#[command(name = "plasma-daq")]
#[command(about = "Plasma experiment control unit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormat> for OutputFormat {
    fn from(value: LogFormat) -> Self {
        match value {
            LogFormat::Pretty => OutputFormat::Pretty,
            LogFormat::Compact => OutputFormat::Compact,
            LogFormat::Json => OutputFormat::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run an acquisition session on simulated hardware
    Run {
        /// Configuration file
        #[arg(long)]
        config: PathBuf,

        /// Stop after this many seconds (default: until Ctrl+C)
        #[arg(long)]
        duration: Option<f64>,

        /// Plasma current setpoint in A
        #[arg(long)]
        setpoint: Option<f64>,

        /// Membrane temperature setpoint in °C
        #[arg(long)]
        temperature: Option<f64>,

        #[arg(long, value_enum, default_value = "compact")]
        log_format: LogFormat,
    },

    /// Load and validate a configuration file
    CheckConfig {
        #[arg(long)]
        config: PathBuf,

        /// Print the resolved configuration as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration,
            setpoint,
            temperature,
            log_format,
        } => run_session(config, duration, setpoint, temperature, log_format).await,
        Commands::CheckConfig { config, json } => check_config(config, json),
    }
}

async fn run_session(
    config: PathBuf,
    duration: Option<f64>,
    setpoint: Option<f64>,
    temperature: Option<f64>,
    log_format: LogFormat,
) -> Result<()> {
    let settings = Settings::load_from(&config)?;
    let tracing = TracingConfig::from_settings(&settings)
        .map_err(anyhow::Error::msg)?
        .with_format(log_format.into());
    tracing_setup::init(tracing).map_err(anyhow::Error::msg)?;
    info!(config = %config.display(), devices = settings.devices.len(), "configuration loaded");

    let hal = Arc::new(simulated_hal(&settings));
    let stop = CancellationToken::new();
    let (plot_tx, mut plot_rx) = mpsc::unbounded_channel::<PlotUpdate>();

    let plots = tokio::spawn(async move {
        let mut updates = 0usize;
        while let Some(update) = plot_rx.recv().await {
            debug!(device = %update.device, points = update.elapsed.len(), "plot update");
            updates += 1;
        }
        updates
    });

    let session_stop = stop.clone();
    let mut session = tokio::task::spawn_blocking(move || -> Result<MessageLog> {
        let mut coordinator =
            Coordinator::new(settings, hal, Arc::new(SystemClock)).with_plot_sink(plot_tx);
        coordinator.start_acquisition()?;
        if let Some(amps) = setpoint {
            coordinator.set_current_setpoint(amps);
        }
        if let Some(celsius) = temperature {
            coordinator.set_temperature(celsius);
        }
        while coordinator.is_running() && !session_stop.is_cancelled() {
            coordinator.run_for(Duration::from_millis(100))?;
        }
        coordinator.abort_acquisition()?;
        Ok(coordinator.messages().clone())
    });

    let joined = tokio::select! {
        joined = &mut session => joined,
        _ = shutdown_signal(duration) => {
            stop.cancel();
            session.await
        }
    };
    let messages = joined??;
    let updates = plots.await?;

    println!();
    for entry in messages.entries() {
        println!("{}", entry.render());
    }
    info!(plot_updates = updates, "session finished");
    Ok(())
}

async fn shutdown_signal(duration: Option<f64>) {
    match duration {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
                _ = tokio::time::sleep(Duration::from_secs_f64(seconds.max(0.0))) => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupted");
        }
    }
}

fn check_config(config: PathBuf, json: bool) -> Result<()> {
    let settings = Settings::load_from(&config)?;
    settings.validate()?;
    tracing_setup::init_from_settings(&settings).map_err(anyhow::Error::msg)?;
    for device in &settings.devices {
        info!(kind = %device.kind(), name = device.name(), "device");
    }
    let resolved = if json {
        serde_json::to_string_pretty(&settings)?
    } else {
        toml::to_string_pretty(&settings)?
    };
    eprintln!("{}: ok", config.display());
    println!("{resolved}");
    Ok(())
}

/// Mock hardware with plausible resting values on every configured input. The
/// current loop output is fed back into its measured channel.
fn simulated_hal(settings: &Settings) -> MockHal {
    // No call history: a CLI session may run for hours.
    let hal = MockHal::new().with_call_log_capacity(0);
    for device in &settings.devices {
        match device {
            DeviceConfig::Adc(adc) => {
                for channel in &adc.channels {
                    let volts = match Conversion::resolve(channel.conversion, channel.full_scale) {
                        Some(Conversion::HallCurrentSensor) => 2.52,
                        Some(Conversion::IonizationGauge) => 2.0,
                        Some(Conversion::PfeifferSingleGauge) => 3.0,
                        Some(Conversion::Baratron { .. }) => 1.0,
                        Some(Conversion::Identity) | None => 0.0,
                    };
                    hal.set_input(channel.channel, volts);
                }
                if let Some(pid) = &adc.pid {
                    let measured = adc.channels.iter().find(|c| c.name == pid.measured_channel);
                    let output = settings
                        .actuator(&pid.actuator)
                        .and_then(|a| a.channels.get(pid.actuator_channel.saturating_sub(1)));
                    if let (Some(measured), Some(output)) = (measured, output) {
                        hal.loopback(output.channel, measured.channel, LOOPBACK_GAIN, 2.52);
                    }
                }
            }
            DeviceConfig::Thermocouple(tc) => {
                hal.set_spi_response(tc.chip_select, ROOM_TEMPERATURE_FRAME.to_vec());
            }
            DeviceConfig::Actuator(_) => {}
        }
    }
    hal
}
