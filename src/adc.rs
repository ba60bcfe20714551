//! Multi-channel ADC worker.
//!
//! Reads every configured channel once per tick, converts the raw voltages and
//! annotates each sample with the ionization gauge flags, the trigger value and the
//! mirrored actuator presets. Optionally closes the plasma current loop: once per
//! flush the batch mean of the measured channel (minus the zero offset) is fed to a
//! [`PidController`] and the result is emitted as a control voltage for the actuator.

use std::sync::Arc;
use tracing::{debug, info};

use crate::channel::{ChannelSpec, Conversion, Gain, GaugeMode, GaugeState};
use crate::config::{AdcConfig, CurrentPidConfig};
use crate::device::{
    Batch, BatchSchema, DeviceCommand, DeviceEvent, DeviceKind, DeviceStrategy, Reading,
    WorkerContext,
};
use crate::error::AppResult;
use crate::hal::Hal;
use crate::pid::{PidConfig, PidController, PidTunings};

/// Column names of the per-sample flags.
pub const FLAG_COLUMNS: [&str; 3] = ["IGmode", "IGrange", "trigger"];

/// Plasma current loop state.
#[derive(Debug)]
struct CurrentLoop {
    pid: PidController,
    measured: usize,
    actuator: String,
    channel: usize,
}

/// ADC strategy for [`Device`](crate::device::Device).
pub struct AdcStrategy {
    hal: Arc<dyn Hal>,
    channels: Vec<ChannelSpec>,
    gauge: GaugeState,
    trigger: i32,
    preset_columns: Vec<String>,
    /// Presets in volts.
    presets: Vec<f64>,
    current_loop: Option<CurrentLoop>,
    zero_signal: Option<usize>,
    zero_offset: f64,
    last_zero_candidate: Option<f64>,
    failing: Vec<bool>,
    startup_warnings: Vec<String>,
}

impl AdcStrategy {
    pub fn new(hal: Arc<dyn Hal>, channels: Vec<ChannelSpec>) -> Self {
        let zero_signal = channels
            .iter()
            .position(|c| c.conversion == Conversion::HallCurrentSensor);
        let failing = vec![false; channels.len()];
        Self {
            hal,
            channels,
            gauge: GaugeState::default(),
            trigger: 0,
            preset_columns: Vec::new(),
            presets: Vec::new(),
            current_loop: None,
            zero_signal,
            zero_offset: 0.0,
            last_zero_candidate: None,
            failing,
            startup_warnings: Vec::new(),
        }
    }

    /// Build from configuration. Gain coercions are reported when the worker starts.
    pub fn from_config(config: &AdcConfig, hal: Arc<dyn Hal>) -> AppResult<Self> {
        let (channels, warnings) = config.channel_specs()?;
        let (mode, mode_coerced) = GaugeMode::coerce(config.gauge_mode);
        let mut adc = Self::new(hal, channels).with_presets(config.preset_columns.clone());
        adc.gauge = GaugeState {
            mode,
            range: config.gauge_range,
        };
        adc.startup_warnings = warnings;
        if mode_coerced {
            adc.startup_warnings.push(format!(
                "Gauge mode {} not supported, using linear",
                config.gauge_mode
            ));
        }
        if let Some(pid) = &config.pid {
            adc = adc.with_current_loop(pid);
        }
        Ok(adc)
    }

    /// Actuator channel names mirrored into the samples.
    pub fn with_presets(mut self, columns: Vec<String>) -> Self {
        self.presets = vec![0.0; columns.len()];
        self.preset_columns = columns;
        self
    }

    /// Attach the plasma current loop. Ignored if the measured channel is unknown.
    pub fn with_current_loop(mut self, config: &CurrentPidConfig) -> Self {
        let Some(measured) = self
            .channels
            .iter()
            .position(|c| c.name == config.measured_channel)
        else {
            return self;
        };
        let pid = PidController::new(
            PidConfig::new()
                .with_tunings(PidTunings::new(config.kp, config.ki, config.kd))
                .with_output_limits(config.out_min_mv, config.out_max_mv),
        );
        self.zero_signal = Some(measured);
        self.current_loop = Some(CurrentLoop {
            pid,
            measured,
            actuator: config.actuator.clone(),
            channel: config.actuator_channel,
        });
        self
    }

    pub fn gauge(&self) -> GaugeState {
        self.gauge
    }

    pub fn zero_offset(&self) -> f64 {
        self.zero_offset
    }

    fn signal(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    fn set_gain(&mut self, ctx: &WorkerContext, signal: &str, volts: u32) {
        let Some(index) = self.signal(signal) else {
            ctx.warn(format!("Cannot set gain: unknown channel '{signal}'"));
            return;
        };
        let (gain, coerced) = Gain::coerce(volts);
        if coerced {
            ctx.warn(format!(
                "Gain {volts} V not in {:?}, channel '{signal}' set to {gain}",
                Gain::ALLOWED
            ));
        }
        self.channels[index].gain = gain;
        debug!(device = ctx.name(), signal, %gain, "gain changed");
    }

    fn set_setpoint(&mut self, ctx: &WorkerContext, setpoint: f64) {
        let Some(current) = self.current_loop.as_mut() else {
            ctx.warn("No plasma current controller configured");
            return;
        };
        if !setpoint.is_finite() {
            ctx.warn(format!("Ignoring setpoint {setpoint}"));
            return;
        }
        let was_idle = current.pid.setpoint() == 0.0;
        current.pid.set_setpoint(setpoint);
        if setpoint == 0.0 {
            current.pid.rearm();
            ctx.emit(DeviceEvent::ControlVoltage {
                device: ctx.name().to_string(),
                actuator: current.actuator.clone(),
                channel: current.channel,
                millivolts: 0.0,
            });
            info!(device = ctx.name(), "plasma current control stopped");
        } else if was_idle {
            current.pid.rearm();
            info!(device = ctx.name(), setpoint, "plasma current control started");
        }
    }

    fn capture_zero(&mut self, ctx: &WorkerContext, pending: &Batch) {
        let Some(index) = self.zero_signal else {
            ctx.warn("No plasma current channel to zero");
            return;
        };
        let mean = if pending.is_empty() {
            self.last_zero_candidate
        } else {
            pending.converted_mean(index)
        };
        match mean {
            Some(offset) => {
                self.zero_offset = offset;
                ctx.emit(DeviceEvent::ZeroAdjusted {
                    device: ctx.name().to_string(),
                    signal: self.channels[index].name.clone(),
                    offset,
                });
            }
            None => ctx.warn(format!(
                "No valid data to zero, keeping offset {}",
                self.zero_offset
            )),
        }
    }
}

impl DeviceStrategy for AdcStrategy {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Adc
    }

    fn schema(&self) -> Option<BatchSchema> {
        Some(BatchSchema {
            flag_columns: FLAG_COLUMNS.iter().map(|c| c.to_string()).collect(),
            preset_columns: self.preset_columns.clone(),
            raw_columns: self.channels.iter().map(|c| c.name.clone()).collect(),
            channel_numbers: self.channels.iter().map(|c| c.channel).collect(),
        })
    }

    fn start(&mut self, ctx: &WorkerContext) {
        for warning in self.startup_warnings.drain(..) {
            ctx.warn(warning);
        }
        if let Some(current) = self.current_loop.as_mut() {
            current.pid.set_sample_time(ctx.control_period());
        }
        info!(
            device = ctx.name(),
            n_channels = self.channels.len(),
            "ADC ready"
        );
    }

    fn handle_command(&mut self, ctx: &WorkerContext, command: DeviceCommand, pending: &Batch) {
        match command {
            DeviceCommand::SetGaugeMode(mode) => {
                let (mode, coerced) = GaugeMode::coerce(mode);
                if coerced {
                    ctx.warn("Gauge mode must be 0 (linear) or 1 (log), using linear");
                }
                self.gauge.mode = mode;
            }
            DeviceCommand::SetGaugeRange(range) => self.gauge.range = range,
            DeviceCommand::SetGain { signal, volts } => self.set_gain(ctx, &signal, volts),
            DeviceCommand::SetTrigger(value) => self.trigger = value,
            DeviceCommand::SetPreset { channel, millivolts } => {
                if let Some(i) = self.preset_columns.iter().position(|c| *c == channel) {
                    self.presets[i] = millivolts / 1000.0;
                }
            }
            DeviceCommand::SetCurrentSetpoint(setpoint) => self.set_setpoint(ctx, setpoint),
            DeviceCommand::SetPidTunings(tunings) => match self.current_loop.as_mut() {
                Some(current) => current.pid.set_tunings(tunings),
                None => ctx.warn("No plasma current controller configured"),
            },
            DeviceCommand::CaptureZero => self.capture_zero(ctx, pending),
            other => debug!(device = ctx.name(), ?other, "command ignored by ADC"),
        }
    }

    fn tick(&mut self, ctx: &WorkerContext) -> Option<Reading> {
        let mut raw = Vec::with_capacity(self.channels.len());
        let mut converted = Vec::with_capacity(self.channels.len());
        for (i, spec) in self.channels.iter().enumerate() {
            let value = match self.hal.read_channel(spec.channel, spec.gain) {
                Ok(volts) => {
                    if self.failing[i] {
                        self.failing[i] = false;
                        ctx.info(format!("Channel '{}' reads again", spec.name));
                    }
                    volts
                }
                Err(err) => {
                    if !self.failing[i] {
                        self.failing[i] = true;
                        ctx.warn(format!("Reading channel '{}' failed: {err}", spec.name));
                    }
                    f64::NAN
                }
            };
            raw.push(value);
            converted.push(spec.convert(value, self.gauge));
        }
        Some(Reading {
            flags: vec![self.gauge.mode.as_flag(), self.gauge.range, self.trigger],
            presets: self.presets.clone(),
            raw,
            converted,
        })
    }

    fn on_flush(&mut self, ctx: &WorkerContext, batch: &Batch) {
        if let Some(index) = self.zero_signal {
            if let Some(mean) = batch.converted_mean(index) {
                self.last_zero_candidate = Some(mean);
            }
        }

        let Some(current) = self.current_loop.as_mut() else {
            return;
        };
        if current.pid.setpoint() == 0.0 {
            return;
        }
        let Some(mean) = batch.converted_mean(current.measured) else {
            return;
        };
        let millivolts = current.pid.compute(mean - self.zero_offset);
        ctx.emit(DeviceEvent::ControlVoltage {
            device: ctx.name().to_string(),
            actuator: current.actuator.clone(),
            channel: current.channel,
            millivolts,
        });
    }

    fn on_interval_changed(&mut self, ctx: &WorkerContext) {
        if let Some(current) = self.current_loop.as_mut() {
            current.pid.set_sample_time(ctx.control_period());
        }
    }
}
