//! Control unit configuration using Figment
//!
//! Configuration is loaded once before an acquisition starts, from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `PLASMA_DAQ_`, nested keys separated by
//!    `__` (e.g. `PLASMA_DAQ_ACQUISITION__SAMPLING_INTERVAL_S=0.05`)
//!
//! The loaded [`Settings`] value is immutable for the lifetime of a session; the
//! coordinator hands each worker the part it needs.
//!
//! # Example
//! ```no_run
//! use plasma_daq::config::Settings;
//!
//! # fn main() -> plasma_daq::error::AppResult<()> {
//! let settings = Settings::load_from("config/controlunit.toml")?;
//! settings.validate()?;
//! println!("{} devices", settings.devices.len());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::channel::{ChannelSpec, Conversion, ConversionId, Gain};
use crate::device::DeviceKind;
use crate::error::{AppResult, DaqError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Plasma control unit".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Session-wide acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_s: f64,
    /// Directory receiving one CSV file per device and session
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Title written into the CSV header
    #[serde(default = "default_title")]
    pub title: String,
    /// Plot history in seconds (0 = whole buffer)
    #[serde(default = "default_plot_window")]
    pub plot_window_s: f64,
    #[serde(default = "default_plot_max_points")]
    pub plot_max_points: usize,
    /// Rows kept in memory per device; the oldest are dropped first
    #[serde(default = "default_buffer_max_rows")]
    pub buffer_max_rows: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sampling_interval_s: default_sampling_interval(),
            data_dir: default_data_dir(),
            title: default_title(),
            plot_window_s: default_plot_window(),
            plot_max_points: default_plot_max_points(),
            buffer_max_rows: default_buffer_max_rows(),
        }
    }
}

/// Synchronisation output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// GPIO pin; no trigger thread is started when absent
    pub gpio: Option<u8>,
}

/// One instrument, tagged by `kind`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceConfig {
    Adc(AdcConfig),
    Actuator(ActuatorConfig),
    Thermocouple(ThermocoupleConfig),
}

impl DeviceConfig {
    pub fn name(&self) -> &str {
        match self {
            DeviceConfig::Adc(c) => &c.name,
            DeviceConfig::Actuator(c) => &c.name,
            DeviceConfig::Thermocouple(c) => &c.name,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceConfig::Adc(_) => DeviceKind::Adc,
            DeviceConfig::Actuator(_) => DeviceKind::Actuator,
            DeviceConfig::Thermocouple(_) => DeviceKind::Thermocouple,
        }
    }
}

/// Analog input channel as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub channel: u8,
    /// Full-scale voltage: 1, 2, 5 or 10
    #[serde(default = "default_gain")]
    pub gain: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_conversion")]
    pub conversion: ConversionId,
    /// Required for baratrons
    #[serde(default)]
    pub full_scale: Option<f64>,
}

/// Plasma current loop attached to an ADC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentPidConfig {
    #[serde(default)]
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    #[serde(default)]
    pub out_min_mv: f64,
    #[serde(default = "default_max_millivolts")]
    pub out_max_mv: f64,
    /// ADC signal used as measured value
    pub measured_channel: String,
    /// Actuator device applying the output
    pub actuator: String,
    /// 1-based logical channel of that actuator
    #[serde(default = "default_actuator_channel")]
    pub actuator_channel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdcConfig {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    /// 0 linear, 1 log
    #[serde(default)]
    pub gauge_mode: i32,
    #[serde(default = "default_gauge_range")]
    pub gauge_range: i32,
    /// Actuator channel names mirrored into every sample
    #[serde(default)]
    pub preset_columns: Vec<String>,
    #[serde(default)]
    pub pid: Option<CurrentPidConfig>,
}

impl AdcConfig {
    /// Resolve channel descriptors. Unsupported gains are coerced to 10 V; each
    /// coercion is returned as a warning text.
    pub fn channel_specs(&self) -> AppResult<(Vec<ChannelSpec>, Vec<String>)> {
        let mut warnings = Vec::new();
        let specs = self
            .channels
            .iter()
            .map(|c| {
                let conversion = Conversion::resolve(c.conversion, c.full_scale).ok_or_else(|| {
                    DaqError::Configuration(format!(
                        "channel '{}' of '{}' needs a full_scale",
                        c.name, self.name
                    ))
                })?;
                let (gain, coerced) = Gain::coerce(c.gain);
                if coerced {
                    warnings.push(format!(
                        "Gain {} V of channel '{}' not supported, using {gain}",
                        c.gain, c.name
                    ));
                }
                Ok(ChannelSpec::new(c.name.clone(), c.channel, conversion)
                    .with_gain(gain)
                    .with_description(c.description.clone()))
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok((specs, warnings))
    }
}

/// Logical actuator channel; numbering is 1-based in list order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorChannelConfig {
    pub name: String,
    /// DAC channel id
    pub channel: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub name: String,
    #[serde(default = "default_max_millivolts")]
    pub max_millivolts: f64,
    #[serde(default)]
    pub channels: Vec<ActuatorChannelConfig>,
}

/// Membrane heater loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterPidConfig {
    #[serde(default = "default_heater_kp")]
    pub kp: f64,
    #[serde(default = "default_heater_ki")]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,
    /// PID output to seconds of on-time per PWM period
    #[serde(default = "default_heater_output_scale")]
    pub output_scale: f64,
    #[serde(default = "default_integral_floor")]
    pub integral_floor: f64,
}

impl Default for HeaterPidConfig {
    fn default() -> Self {
        Self {
            kp: default_heater_kp(),
            ki: default_heater_ki(),
            kd: 0.0,
            output_scale: default_heater_output_scale(),
            integral_floor: default_integral_floor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermocoupleConfig {
    pub name: String,
    pub chip_select: u8,
    pub heater_gpio: u8,
    #[serde(default = "default_min_thermocouple_interval")]
    pub min_sampling_interval_s: f64,
    #[serde(default)]
    pub pid: HeaterPidConfig,
}

// Default value functions
fn default_sampling_interval() -> f64 {
    0.1
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_title() -> String {
    "Plasma experiment".to_string()
}

fn default_plot_window() -> f64 {
    60.0
}

fn default_plot_max_points() -> usize {
    3000
}

fn default_buffer_max_rows() -> usize {
    200_000
}

fn default_gain() -> u32 {
    10
}

fn default_conversion() -> ConversionId {
    ConversionId::Identity
}

fn default_gauge_range() -> i32 {
    -5
}

fn default_max_millivolts() -> f64 {
    5000.0
}

fn default_actuator_channel() -> usize {
    1
}

fn default_heater_kp() -> f64 {
    3.5
}

fn default_heater_ki() -> f64 {
    0.06
}

fn default_heater_output_scale() -> f64 {
    0.0002
}

fn default_integral_floor() -> f64 {
    -0.5
}

fn default_min_thermocouple_interval() -> f64 {
    0.25
}

/// Highest voltage the DAC boards accept.
pub const HARDWARE_MAX_MILLIVOLTS: f64 = 5000.0;

impl Settings {
    /// Load configuration from a TOML file and environment variables
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PLASMA_DAQ_").split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string, without environment overrides
    pub fn from_toml_str(text: &str) -> AppResult<Self> {
        let settings = Figment::from(Toml::string(text)).extract()?;
        Ok(settings)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn actuator(&self, name: &str) -> Option<&ActuatorConfig> {
        match self.device(name) {
            Some(DeviceConfig::Actuator(actuator)) => Some(actuator),
            _ => None,
        }
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let acq = &self.acquisition;
        if !(acq.sampling_interval_s.is_finite() && acq.sampling_interval_s > 0.0) {
            return invalid(format!(
                "sampling_interval_s must be positive, got {}",
                acq.sampling_interval_s
            ));
        }
        if acq.plot_max_points == 0 || acq.buffer_max_rows == 0 {
            return invalid("plot_max_points and buffer_max_rows must be positive".into());
        }
        if acq.plot_window_s < 0.0 {
            return invalid(format!("plot_window_s must not be negative, got {}", acq.plot_window_s));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name().is_empty() {
                return invalid("Device name must not be empty".into());
            }
            if !names.insert(device.name()) {
                return invalid(format!("Duplicate device name: {}", device.name()));
            }
        }

        // Every physical channel, pin and chip select has exactly one owner.
        let mut owned: HashSet<(&str, u8)> = HashSet::new();
        let mut claim = |resource: &'static str, id: u8, owner: &str| {
            if owned.insert((resource, id)) {
                Ok(())
            } else {
                Err(DaqError::Configuration(format!(
                    "{resource} {id} claimed twice (again by '{owner}')"
                )))
            }
        };
        if let Some(pin) = self.trigger.gpio {
            claim("GPIO", pin, "trigger")?;
        }

        for device in &self.devices {
            match device {
                DeviceConfig::Adc(adc) => {
                    let mut signals = HashSet::new();
                    for channel in &adc.channels {
                        if !signals.insert(channel.name.as_str()) {
                            return invalid(format!(
                                "Duplicate channel name '{}' in '{}'",
                                channel.name, adc.name
                            ));
                        }
                        claim("ADC input", channel.channel, &adc.name)?;
                    }
                    adc.channel_specs()?;
                    for preset in &adc.preset_columns {
                        let known = self.devices.iter().any(|d| match d {
                            DeviceConfig::Actuator(a) => a.channels.iter().any(|c| &c.name == preset),
                            _ => false,
                        });
                        if !known {
                            return invalid(format!(
                                "Preset column '{preset}' of '{}' is not an actuator channel",
                                adc.name
                            ));
                        }
                    }
                    if let Some(pid) = &adc.pid {
                        self.validate_current_pid(adc, pid)?;
                    }
                }
                DeviceConfig::Actuator(actuator) => {
                    if !(actuator.max_millivolts > 0.0
                        && actuator.max_millivolts <= HARDWARE_MAX_MILLIVOLTS)
                    {
                        return invalid(format!(
                            "max_millivolts of '{}' must be in (0, {HARDWARE_MAX_MILLIVOLTS}]",
                            actuator.name
                        ));
                    }
                    for channel in &actuator.channels {
                        claim("DAC output", channel.channel, &actuator.name)?;
                    }
                }
                DeviceConfig::Thermocouple(tc) => {
                    if !(tc.min_sampling_interval_s.is_finite() && tc.min_sampling_interval_s > 0.0) {
                        return invalid(format!(
                            "min_sampling_interval_s of '{}' must be positive",
                            tc.name
                        ));
                    }
                    claim("SPI chip select", tc.chip_select, &tc.name)?;
                    claim("GPIO", tc.heater_gpio, &tc.name)?;
                }
            }
        }

        Ok(())
    }

    fn validate_current_pid(&self, adc: &AdcConfig, pid: &CurrentPidConfig) -> AppResult<()> {
        if !adc.channels.iter().any(|c| c.name == pid.measured_channel) {
            return Err(DaqError::Configuration(format!(
                "PID of '{}' measures unknown channel '{}'",
                adc.name, pid.measured_channel
            )));
        }
        let Some(actuator) = self.actuator(&pid.actuator) else {
            return Err(DaqError::Configuration(format!(
                "PID of '{}' drives '{}', which is not an actuator",
                adc.name, pid.actuator
            )));
        };
        if pid.actuator_channel == 0 || pid.actuator_channel > actuator.channels.len() {
            return Err(DaqError::Configuration(format!(
                "PID of '{}' drives channel {} of '{}', which has {} channels",
                adc.name,
                pid.actuator_channel,
                actuator.name,
                actuator.channels.len()
            )));
        }
        let numbers = [pid.kp, pid.ki, pid.kd, pid.out_min_mv, pid.out_max_mv];
        if numbers.iter().any(|n| !n.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "PID of '{}' has a non-finite gain or output bound",
                adc.name
            )));
        }
        if pid.out_min_mv > pid.out_max_mv {
            return Err(DaqError::Configuration(format!(
                "PID of '{}' has out_min_mv > out_max_mv",
                adc.name
            )));
        }
        Ok(())
    }
}
