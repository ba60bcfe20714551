//! DAC actuator worker (mass-flow controllers, cathode voltage).
//!
//! Logical channels are numbered from 1 in configuration order and mapped onto
//! hardware DAC channels. All values on this side are millivolts; the HAL is driven
//! in volts. Every accepted output is published as a preset change, both to the
//! coordinator and directly to the ADC workers that mirror presets into their
//! samples.
//!
//! The calibration sweep runs on its own thread so its dwell times never stall this
//! worker's command handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ActuatorConfig, HARDWARE_MAX_MILLIVOLTS};
use crate::device::{
    Batch, BatchSchema, DeviceCommand, DeviceEvent, DeviceKind, DeviceStrategy, Reading,
    WorkerContext,
};
use crate::hal::Hal;

/// One logical output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChannel {
    /// 1-based logical number
    pub number: usize,
    pub name: String,
    pub hardware: u8,
}

/// Triangle `0 → max → 0` in `steps` increments each way (`2·steps + 1` values).
pub fn calibration_ramp(max_millivolts: f64, steps: u32) -> Vec<f64> {
    if steps == 0 {
        return vec![0.0];
    }
    let level = |i: u32| max_millivolts * f64::from(i) / f64::from(steps);
    (0..=steps).chain((0..steps).rev()).map(level).collect()
}

/// Sends preset changes to the coordinator and the mirroring ADC workers.
#[derive(Clone)]
struct PresetPublisher {
    ctx: WorkerContext,
    observers: Vec<UnboundedSender<DeviceCommand>>,
}

impl PresetPublisher {
    fn publish(&self, channel: &OutputChannel, millivolts: f64) {
        self.ctx.emit(DeviceEvent::PresetChanged {
            device: self.ctx.name().to_string(),
            channel: channel.number,
            name: channel.name.clone(),
            millivolts,
        });
        for observer in &self.observers {
            // An ADC that already stopped no longer needs presets.
            let _ = observer.send(DeviceCommand::SetPreset {
                channel: channel.name.clone(),
                millivolts,
            });
        }
    }
}

/// Drive `channel` through `ramp`, holding each value for `dwell`.
///
/// `calibrating` and `cancel` are checked before every increment; clearing the flag
/// or cancelling the token stops the sweep, and the token also cuts a dwell short.
/// The output always ends at 0. Returns `true` when cancelled.
fn run_sweep(
    hal: &dyn Hal,
    publisher: &PresetPublisher,
    channel: &OutputChannel,
    ramp: &[f64],
    dwell: Duration,
    calibrating: &AtomicBool,
    cancel: &CancellationToken,
) -> bool {
    let ctx = &publisher.ctx;
    let mut cancelled = false;
    let mut last = None;
    for &millivolts in ramp {
        if !calibrating.load(Ordering::SeqCst) || cancel.is_cancelled() {
            cancelled = true;
            break;
        }
        if let Err(err) = hal.write_output(channel.hardware, millivolts / 1000.0) {
            ctx.warn(format!("Calibration write to '{}' failed: {err}", channel.name));
        }
        publisher.publish(channel, millivolts);
        last = Some(millivolts);
        ctx.clock().sleep_until_cancelled(dwell, cancel);
    }
    if last != Some(0.0) {
        if let Err(err) = hal.write_output(channel.hardware, 0.0) {
            ctx.error(format!("Could not return '{}' to 0 V: {err}", channel.name));
        }
        publisher.publish(channel, 0.0);
    }
    calibrating.store(false, Ordering::SeqCst);
    cancelled
}

struct CalibrationRun {
    calibrating: Arc<AtomicBool>,
    /// Child of the halt token.
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CalibrationRun {
    fn cancel(&self) {
        self.calibrating.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// Actuator strategy for [`Device`](crate::device::Device).
pub struct ActuatorStrategy {
    hal: Arc<dyn Hal>,
    channels: Vec<OutputChannel>,
    max_millivolts: f64,
    outputs: Vec<f64>,
    available: bool,
    observers: Vec<UnboundedSender<DeviceCommand>>,
    halt: CancellationToken,
    calibration: Option<CalibrationRun>,
}

impl ActuatorStrategy {
    pub fn new(hal: Arc<dyn Hal>, channels: Vec<OutputChannel>, max_millivolts: f64) -> Self {
        let outputs = vec![0.0; channels.len()];
        Self {
            hal,
            channels,
            max_millivolts: max_millivolts.clamp(0.0, HARDWARE_MAX_MILLIVOLTS),
            outputs,
            available: false,
            observers: Vec::new(),
            halt: CancellationToken::new(),
            calibration: None,
        }
    }

    pub fn from_config(config: &ActuatorConfig, hal: Arc<dyn Hal>) -> Self {
        let channels = config
            .channels
            .iter()
            .enumerate()
            .map(|(i, c)| OutputChannel {
                number: i + 1,
                name: c.name.clone(),
                hardware: c.channel,
            })
            .collect();
        Self::new(hal, channels, config.max_millivolts)
    }

    /// Mirror every preset change into the worker behind `sender`.
    pub fn with_preset_observer(mut self, sender: UnboundedSender<DeviceCommand>) -> Self {
        self.observers.push(sender);
        self
    }

    /// Token that stops a running sweep from outside the worker thread.
    pub fn with_halt_token(mut self, halt: CancellationToken) -> Self {
        self.halt = halt;
        self
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn outputs(&self) -> &[f64] {
        &self.outputs
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration
            .as_ref()
            .is_some_and(|run| run.calibrating.load(Ordering::SeqCst))
    }

    fn publisher(&self, ctx: &WorkerContext) -> PresetPublisher {
        PresetPublisher {
            ctx: ctx.clone(),
            observers: self.observers.clone(),
        }
    }

    /// Set logical `channel` (1-based) to `millivolts`, clamped to the hardware range.
    pub fn output_voltage(&mut self, ctx: &WorkerContext, channel: usize, millivolts: f64) {
        if !self.available {
            ctx.warn(format!("{} not available, output ignored", ctx.name()));
            return;
        }
        let Some(target) = channel.checked_sub(1).and_then(|i| self.channels.get(i)).cloned() else {
            ctx.warn(format!("Wrong channel {channel}"));
            return;
        };
        if !millivolts.is_finite() {
            ctx.warn(format!("Ignoring output {millivolts} mV for '{}'", target.name));
            return;
        }
        let clamped = millivolts.clamp(0.0, self.max_millivolts);
        if clamped != millivolts {
            ctx.warn(format!(
                "Output {millivolts} mV for '{}' clamped to {clamped} mV",
                target.name
            ));
        }
        if let Err(err) = self.hal.write_output(target.hardware, clamped / 1000.0) {
            ctx.warn(format!("Writing '{}' failed: {err}", target.name));
            return;
        }
        self.outputs[target.number - 1] = clamped;
        self.publisher(ctx).publish(&target, clamped);
        debug!(device = ctx.name(), channel, millivolts = clamped, "output set");
    }

    /// Cancel any sweep and zero every channel.
    ///
    /// Does not wait for the sweep thread; it is joined by a later tick or at
    /// shutdown.
    pub fn stop(&mut self, ctx: &WorkerContext) {
        if let Some(run) = &self.calibration {
            run.cancel();
        }
        if !self.available {
            return;
        }
        for channel in self.channels.clone() {
            self.output_voltage(ctx, channel.number, 0.0);
        }
    }

    fn start_calibration(&mut self, ctx: &WorkerContext, max_millivolts: f64, steps: u32, dwell_s: f64) {
        if !self.available {
            ctx.warn(format!("{} not available, calibration ignored", ctx.name()));
            return;
        }
        if self.is_calibrating() {
            ctx.warn("Calibration already running");
            return;
        }
        self.finish_calibration(ctx);
        let Some(channel) = self.channels.first().cloned() else {
            ctx.warn("No channel to calibrate");
            return;
        };
        if steps == 0 {
            ctx.warn("Calibration needs at least one step");
            return;
        }
        let max = if max_millivolts <= 0.0 || !max_millivolts.is_finite() {
            self.max_millivolts
        } else {
            max_millivolts.min(self.max_millivolts)
        };
        let dwell = Duration::from_secs_f64(if dwell_s.is_finite() { dwell_s.max(0.0) } else { 0.0 });

        let ramp = calibration_ramp(max, steps);
        let calibrating = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&calibrating);
        let hal = Arc::clone(&self.hal);
        let publisher = self.publisher(ctx);
        let cancel = self.halt.child_token();
        let token = cancel.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-calibration", ctx.name()))
            .spawn(move || {
                let cancelled = run_sweep(hal.as_ref(), &publisher, &channel, &ramp, dwell, &flag, &token);
                let ctx = &publisher.ctx;
                ctx.emit(DeviceEvent::CalibrationFinished {
                    device: ctx.name().to_string(),
                    cancelled,
                });
            });
        match spawned {
            Ok(handle) => {
                self.calibration = Some(CalibrationRun { calibrating, cancel, handle });
                info!(device = ctx.name(), max_millivolts = max, steps, "calibration started");
            }
            Err(err) => ctx.error(format!("Could not start calibration: {err}")),
        }
    }

    /// Join the sweep thread, waiting for it if it is still running.
    fn finish_calibration(&mut self, ctx: &WorkerContext) {
        let Some(run) = self.calibration.take() else {
            return;
        };
        if run.handle.join().is_err() {
            warn!(device = ctx.name(), "calibration thread panicked");
        }
        if let Some(first) = self.outputs.first_mut() {
            *first = 0.0;
        }
    }
}

impl DeviceStrategy for ActuatorStrategy {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Actuator
    }

    fn schema(&self) -> Option<BatchSchema> {
        None
    }

    fn start(&mut self, ctx: &WorkerContext) {
        let failed: Vec<String> = self
            .channels
            .iter()
            .filter_map(|c| self.hal.write_output(c.hardware, 0.0).err().map(|e| format!("{}: {e}", c.name)))
            .collect();
        if failed.is_empty() {
            self.available = true;
            info!(device = ctx.name(), n_channels = self.channels.len(), "DAC initialised");
        } else {
            self.available = false;
            ctx.error(format!(
                "{} could not be initialised ({}), outputs disabled",
                ctx.name(),
                failed.join(", ")
            ));
        }
    }

    fn handle_command(&mut self, ctx: &WorkerContext, command: DeviceCommand, _pending: &Batch) {
        match command {
            DeviceCommand::OutputVoltage { channel, millivolts } => {
                self.output_voltage(ctx, channel, millivolts);
            }
            DeviceCommand::StopOutputs => self.stop(ctx),
            DeviceCommand::StartCalibration { max_millivolts, steps, dwell_s } => {
                self.start_calibration(ctx, max_millivolts, steps, dwell_s);
            }
            DeviceCommand::CancelCalibration => {
                if let Some(run) = &self.calibration {
                    run.cancel();
                }
            }
            other => debug!(device = ctx.name(), ?other, "command ignored by actuator"),
        }
    }

    fn tick(&mut self, ctx: &WorkerContext) -> Option<Reading> {
        if self
            .calibration
            .as_ref()
            .is_some_and(|run| run.handle.is_finished())
        {
            self.finish_calibration(ctx);
        }
        None
    }

    fn shutdown(&mut self, ctx: &WorkerContext) {
        self.stop(ctx);
        self.finish_calibration(ctx);
        info!(device = ctx.name(), "DAC outputs at 0 V");
    }
}
