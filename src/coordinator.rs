//! Acquisition coordinator.
//!
//! The coordinator is the only component that knows every worker. It owns the
//! session lifecycle and all routing:
//!
//! - `start_acquisition` builds one [`Device`] per configured instrument, wires the
//!   actuator → ADC preset mirroring and the trigger → ADC notifications, and starts
//!   one OS thread per worker.
//! - Events are pumped on the caller's thread with [`Coordinator::process_pending`]
//!   (or [`Coordinator::run_for`]): batches are buffered, written to CSV and
//!   forwarded as plot slices; control voltages are routed to their actuator.
//! - `abort_acquisition` zeroes every actuator output through the HAL first, then
//!   aborts every worker, then joins every thread.
//!
//! Every setter is a no-op while no acquisition is running.

use chrono::{DateTime, Local};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actuator::ActuatorStrategy;
use crate::adc::AdcStrategy;
use crate::config::{DeviceConfig, Settings};
use crate::device::{
    Batch, BatchSchema, Clock, Device, DeviceCommand, DeviceEvent, DeviceHandle, DeviceKind,
    DeviceStrategy, Severity,
};
use crate::error::{AppResult, DaqError};
use crate::hal::Hal;
use crate::log_capture::MessageLog;
use crate::pid::PidTunings;
use crate::storage::CsvSink;
use crate::thermocouple::ThermocoupleStrategy;
use crate::trigger::TriggerSignal;

const EVENT_POLL: Duration = Duration::from_millis(10);

/// Stride that keeps at most `max_points` of `len` points.
pub fn downsample_stride(len: usize, max_points: usize) -> usize {
    if max_points == 0 || len <= max_points {
        1
    } else {
        len / max_points + 1
    }
}

/// One plotted signal.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSeries {
    pub name: String,
    pub values: Vec<f64>,
}

/// Plot-ready slice of one device's buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotUpdate {
    pub device: String,
    pub elapsed: Vec<f64>,
    pub series: Vec<PlotSeries>,
}

/// In-memory history of one device, capped at `max_rows`.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    schema: Arc<BatchSchema>,
    elapsed: VecDeque<f64>,
    converted: VecDeque<Vec<f64>>,
    max_rows: usize,
}

impl DeviceBuffer {
    pub fn new(schema: Arc<BatchSchema>, max_rows: usize) -> Self {
        Self {
            schema,
            elapsed: VecDeque::new(),
            converted: VecDeque::new(),
            max_rows: max_rows.max(1),
        }
    }

    pub fn push_batch(&mut self, batch: &Batch) {
        for (sample, converted) in batch.samples.iter().zip(&batch.converted) {
            self.elapsed.push_back(sample.elapsed);
            self.converted.push_back(converted.clone());
        }
        while self.elapsed.len() > self.max_rows {
            self.elapsed.pop_front();
            self.converted.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.elapsed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elapsed.is_empty()
    }

    /// Last `window_s` seconds (0 = everything), at most `max_points` points.
    /// Signals with an entry in `offsets` are shown minus that offset.
    pub fn plot(
        &self,
        device: &str,
        window_s: f64,
        max_points: usize,
        offsets: &HashMap<String, f64>,
    ) -> PlotUpdate {
        let start = match self.elapsed.back() {
            Some(last) if window_s > 0.0 => {
                let from = last - window_s;
                self.elapsed.iter().position(|t| *t > from).unwrap_or(0)
            }
            _ => 0,
        };
        let stride = downsample_stride(self.len() - start, max_points);
        let rows: Vec<usize> = (start..self.len()).step_by(stride).collect();

        let elapsed = rows.iter().map(|&i| self.elapsed[i]).collect();
        let series = self
            .schema
            .raw_columns
            .iter()
            .enumerate()
            .map(|(col, signal)| {
                let offset = offsets.get(signal).copied().unwrap_or(0.0);
                PlotSeries {
                    name: BatchSchema::converted_column(signal),
                    values: rows
                        .iter()
                        .map(|&i| self.converted[i].get(col).copied().unwrap_or(f64::NAN) - offset)
                        .collect(),
                }
            })
            .collect();
        PlotUpdate {
            device: device.to_string(),
            elapsed,
            series,
        }
    }
}

struct Worker {
    handle: DeviceHandle,
    thread: Option<JoinHandle<()>>,
}

struct Session {
    started: DateTime<Local>,
    events: UnboundedReceiver<DeviceEvent>,
    workers: Vec<Worker>,
    trigger: Option<TriggerSignal>,
    sinks: HashMap<String, CsvSink>,
    buffers: HashMap<String, DeviceBuffer>,
    /// Stops calibration sweeps from outside the actuator threads.
    halt: CancellationToken,
    running: usize,
    aborting: bool,
    fatal: bool,
}

impl Session {
    fn worker(&self, name: &str) -> Option<&DeviceHandle> {
        self.workers
            .iter()
            .map(|w| &w.handle)
            .find(|h| h.name() == name)
    }

    fn of_kind(&self, kind: DeviceKind) -> impl Iterator<Item = &DeviceHandle> {
        self.workers
            .iter()
            .map(|w| &w.handle)
            .filter(move |h| h.kind() == kind)
    }
}

/// Owns the acquisition session and routes every message between workers.
pub struct Coordinator {
    settings: Settings,
    hal: Arc<dyn Hal>,
    clock: Arc<dyn Clock>,
    session: Option<Session>,
    zero_offsets: HashMap<String, f64>,
    presets: HashMap<String, f64>,
    plot_tx: Option<UnboundedSender<PlotUpdate>>,
    messages: MessageLog,
}

impl Coordinator {
    pub fn new(settings: Settings, hal: Arc<dyn Hal>, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            hal,
            clock,
            session: None,
            zero_offsets: HashMap::new(),
            presets: HashMap::new(),
            plot_tx: None,
            messages: MessageLog::new(),
        }
    }

    /// Receive a [`PlotUpdate`] after every non-empty batch.
    pub fn with_plot_sink(mut self, tx: UnboundedSender<PlotUpdate>) -> Self {
        self.plot_tx = Some(tx);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Last zero offset captured for `signal`.
    pub fn zero_offset(&self, signal: &str) -> Option<f64> {
        self.zero_offsets.get(signal).copied()
    }

    /// Last preset (mV) reported for actuator channel `name`.
    pub fn preset(&self, name: &str) -> Option<f64> {
        self.presets.get(name).copied()
    }

    pub fn buffered_rows(&self, device: &str) -> usize {
        self.session
            .as_ref()
            .and_then(|s| s.buffers.get(device))
            .map_or(0, DeviceBuffer::len)
    }

    pub fn csv_path(&self, device: &str) -> Option<PathBuf> {
        self.session
            .as_ref()
            .and_then(|s| s.sinks.get(device))
            .map(|sink| sink.path().to_path_buf())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create and start one worker thread per configured device.
    pub fn start_acquisition(&mut self) -> AppResult<()> {
        if self.session.is_some() {
            return Err(DaqError::AcquisitionRunning);
        }
        self.settings.validate()?;

        let acq = &self.settings.acquisition;
        let interval = acq.sampling_interval_s;
        let started = self.clock.now();
        let halt = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut devices: Vec<Device> = Vec::new();
        let mut handles: Vec<DeviceHandle> = Vec::new();
        let mut schemas: Vec<(String, BatchSchema)> = Vec::new();
        let mut adc_presets: Vec<(Vec<String>, UnboundedSender<DeviceCommand>)> = Vec::new();
        let mut current_loops = 0usize;

        let mut add = |name: &str, strategy: Box<dyn DeviceStrategy>| -> DeviceHandle {
            if let Some(schema) = strategy.schema() {
                schemas.push((name.to_string(), schema));
            }
            let (device, handle) =
                Device::configure(name, Arc::clone(&self.clock), interval, strategy, events_tx.clone());
            devices.push(device);
            handles.push(handle.clone());
            handle
        };

        // ADCs first: actuators and the trigger need their command senders.
        for config in &self.settings.devices {
            if let DeviceConfig::Adc(adc) = config {
                let strategy = AdcStrategy::from_config(adc, Arc::clone(&self.hal))?;
                if adc.pid.is_some() {
                    current_loops += 1;
                }
                let handle = add(&adc.name, Box::new(strategy));
                adc_presets.push((adc.preset_columns.clone(), handle.command_sender()));
            }
        }
        for config in &self.settings.devices {
            match config {
                DeviceConfig::Actuator(actuator) => {
                    let mut strategy = ActuatorStrategy::from_config(actuator, Arc::clone(&self.hal))
                        .with_halt_token(halt.clone());
                    for (columns, sender) in &adc_presets {
                        if actuator.channels.iter().any(|c| columns.contains(&c.name)) {
                            strategy = strategy.with_preset_observer(sender.clone());
                        }
                    }
                    add(&actuator.name, Box::new(strategy));
                }
                DeviceConfig::Thermocouple(tc) => {
                    let strategy = ThermocoupleStrategy::from_config(tc, Arc::clone(&self.hal));
                    add(&tc.name, Box::new(strategy));
                }
                DeviceConfig::Adc(_) => {}
            }
        }
        drop(add);
        drop(events_tx);

        let mut sinks = HashMap::new();
        let mut buffers = HashMap::new();
        for (name, schema) in schemas {
            let sink = CsvSink::create(&acq.data_dir, &name, &acq.title, started, &schema)?;
            self.messages
                .push(Severity::Info, &name, &format!("savepath: {}", sink.path().display()));
            sinks.insert(name.clone(), sink);
            buffers.insert(name, DeviceBuffer::new(Arc::new(schema), acq.buffer_max_rows));
        }

        let mut workers = Vec::with_capacity(devices.len());
        for (device, handle) in devices.into_iter().zip(handles) {
            let spawned = thread::Builder::new()
                .name(handle.name().to_string())
                .spawn(move || device.run());
            match spawned {
                Ok(thread) => workers.push(Worker {
                    handle,
                    thread: Some(thread),
                }),
                Err(err) => {
                    Self::teardown(&mut workers);
                    return Err(DaqError::ThreadSpawn(format!("{}: {err}", handle.name())));
                }
            }
        }

        let trigger = match self.settings.trigger.gpio {
            Some(pin) => {
                let subscribers = adc_presets.iter().map(|(_, tx)| tx.clone()).collect();
                match TriggerSignal::spawn(Arc::clone(&self.hal), pin, Arc::clone(&self.clock), subscribers) {
                    Ok(trigger) => Some(trigger),
                    Err(err) => {
                        Self::teardown(&mut workers);
                        return Err(DaqError::ThreadSpawn(format!("trigger: {err}")));
                    }
                }
            }
            None => None,
        };

        info!(
            n_workers = workers.len(),
            interval,
            current_loops,
            trigger = trigger.is_some(),
            "acquisition started"
        );
        self.session = Some(Session {
            started,
            events: events_rx,
            running: workers.len(),
            workers,
            trigger,
            sinks,
            buffers,
            halt,
            aborting: false,
            fatal: false,
        });
        Ok(())
    }

    /// Zero every actuator, abort every worker, join every thread.
    ///
    /// No-op when nothing is running.
    pub fn abort_acquisition(&mut self) -> AppResult<()> {
        let Some(mut session) = self.session.take() else {
            debug!("abort requested without acquisition");
            return Ok(());
        };
        session.aborting = true;
        let mut errors = Vec::new();

        // 1. actuators to a safe state
        session.halt.cancel();
        for config in &self.settings.devices {
            if let DeviceConfig::Actuator(actuator) = config {
                for channel in &actuator.channels {
                    if let Err(err) = self.hal.write_output(channel.channel, 0.0) {
                        error!(device = %actuator.name, channel = %channel.name, error = %err, "zeroing failed");
                        errors.push(DaqError::Hardware(format!("{}: {err}", channel.name)));
                    }
                }
            }
        }

        // 2. request abort everywhere
        if let Some(trigger) = &session.trigger {
            trigger.abort();
        }
        for worker in &session.workers {
            worker.handle.abort();
        }

        // 3. join
        for worker in &mut session.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    errors.push(DaqError::Hardware(format!(
                        "worker '{}' panicked",
                        worker.handle.name()
                    )));
                }
            }
        }
        if let Some(mut trigger) = session.trigger.take() {
            trigger.stop();
        }

        // Final batches are still queued.
        while let Ok(event) = session.events.try_recv() {
            self.handle_event(&mut session, event);
        }

        let elapsed = (self.clock.now() - session.started).num_milliseconds();
        info!(elapsed_ms = elapsed, "acquisition stopped");
        self.messages.push(Severity::Info, "coordinator", "Acquisition stopped");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    fn teardown(workers: &mut Vec<Worker>) {
        for worker in workers.iter() {
            worker.handle.abort();
        }
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        workers.clear();
    }

    // =========================================================================
    // Event pump
    // =========================================================================

    /// Handle every queued event. Returns how many were handled.
    pub fn process_pending(&mut self) -> AppResult<usize> {
        let Some(mut session) = self.session.take() else {
            return Ok(0);
        };
        let mut handled = 0;
        loop {
            match session.events.try_recv() {
                Ok(event) => {
                    self.handle_event(&mut session, event);
                    handled += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        let fatal = session.fatal;
        self.session = Some(session);
        if fatal {
            error!("device stopped unexpectedly, aborting acquisition");
            self.messages.push(
                Severity::Error,
                "coordinator",
                "A device stopped unexpectedly, aborting acquisition",
            );
            self.abort_acquisition()?;
        }
        Ok(handled)
    }

    /// Pump events for `duration`, or until the session ends.
    pub fn run_for(&mut self, duration: Duration) -> AppResult<()> {
        let deadline = Instant::now() + duration;
        while self.is_running() && Instant::now() < deadline {
            if self.process_pending()? == 0 {
                thread::sleep(EVENT_POLL);
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, session: &mut Session, event: DeviceEvent) {
        match event {
            DeviceEvent::BatchReady { device, batch } => {
                if batch.is_empty() {
                    return;
                }
                if let Some(sink) = session.sinks.get_mut(&device) {
                    if let Err(err) = sink.write_batch(&batch) {
                        error!(device = %device, error = %err, "CSV write failed");
                        self.messages
                            .push(Severity::Error, &device, &format!("CSV write failed: {err}"));
                    }
                }
                if let Some(buffer) = session.buffers.get_mut(&device) {
                    buffer.push_batch(&batch);
                    if let Some(tx) = &self.plot_tx {
                        let acq = &self.settings.acquisition;
                        let update =
                            buffer.plot(&device, acq.plot_window_s, acq.plot_max_points, &self.zero_offsets);
                        if tx.send(update).is_err() {
                            debug!("plot receiver closed");
                            self.plot_tx = None;
                        }
                    }
                }
            }
            DeviceEvent::Done { device } => {
                session.running = session.running.saturating_sub(1);
                info!(device = %device, remaining = session.running, "worker done");
                self.messages.push(Severity::Info, &device, "Sensor thread stopped");
                if !session.aborting {
                    session.fatal = true;
                }
            }
            DeviceEvent::ControlVoltage {
                device,
                actuator,
                channel,
                millivolts,
            } => {
                if session.aborting {
                    return;
                }
                match session.worker(&actuator) {
                    Some(handle) => {
                        handle.send(DeviceCommand::OutputVoltage { channel, millivolts });
                    }
                    None => warn!(device = %device, actuator = %actuator, "control voltage for unknown actuator"),
                }
            }
            DeviceEvent::ZeroAdjusted { device, signal, offset } => {
                self.messages
                    .push(Severity::Info, &device, &format!("Zero of {signal} set to {offset:.4}"));
                self.zero_offsets.insert(signal, offset);
            }
            DeviceEvent::Message {
                device,
                severity,
                text,
            } => {
                match severity {
                    Severity::Info => info!(device = %device, "{text}"),
                    Severity::Warning => warn!(device = %device, "{text}"),
                    Severity::Error => error!(device = %device, "{text}"),
                }
                self.messages.push(severity, &device, &text);
            }
            DeviceEvent::PresetChanged {
                device,
                name,
                millivolts,
                ..
            } => {
                debug!(device = %device, channel = %name, millivolts, "preset changed");
                self.presets.insert(name, millivolts);
            }
            DeviceEvent::CalibrationFinished { device, cancelled } => {
                if let Some(trigger) = &session.trigger {
                    trigger.off();
                }
                let text = if cancelled {
                    "Calibration cancelled"
                } else {
                    "Calibration finished"
                };
                info!(device = %device, cancelled, "calibration ended");
                self.messages.push(Severity::Info, &device, text);
            }
        }
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    fn broadcast(&self, kind: DeviceKind, command: DeviceCommand) {
        let Some(session) = &self.session else {
            debug!(?command, "not running, command dropped");
            return;
        };
        for handle in session.of_kind(kind) {
            handle.send(command.clone());
        }
    }

    fn send_to(&self, device: &str, command: DeviceCommand) -> AppResult<()> {
        let Some(session) = &self.session else {
            debug!(device, ?command, "not running, command dropped");
            return Ok(());
        };
        let handle = session
            .worker(device)
            .ok_or_else(|| DaqError::DeviceNotFound(device.to_string()))?;
        handle.send(command);
        Ok(())
    }

    pub fn set_sampling_interval(&self, seconds: f64) {
        let Some(session) = &self.session else {
            return;
        };
        for worker in &session.workers {
            worker.handle.send(DeviceCommand::SetSamplingInterval(seconds));
        }
    }

    /// 0 linear, 1 log.
    pub fn set_gauge_mode(&self, mode: i32) {
        self.broadcast(DeviceKind::Adc, DeviceCommand::SetGaugeMode(mode));
    }

    pub fn set_gauge_range(&self, range: i32) {
        self.broadcast(DeviceKind::Adc, DeviceCommand::SetGaugeRange(range));
    }

    pub fn set_gain(&self, adc: &str, signal: &str, volts: u32) -> AppResult<()> {
        self.send_to(
            adc,
            DeviceCommand::SetGain {
                signal: signal.to_string(),
                volts,
            },
        )
    }

    /// Output of logical `channel` (1-based) of `actuator`, in millivolts.
    pub fn set_preset(&self, actuator: &str, channel: usize, millivolts: f64) -> AppResult<()> {
        self.send_to(actuator, DeviceCommand::OutputVoltage { channel, millivolts })
    }

    /// Plasma current setpoint for every ADC with a current loop; 0 stops the loop.
    pub fn set_current_setpoint(&self, setpoint: f64) {
        let Some(session) = &self.session else {
            return;
        };
        for config in &self.settings.devices {
            if let DeviceConfig::Adc(adc) = config {
                if adc.pid.is_some() {
                    if let Some(handle) = session.worker(&adc.name) {
                        handle.send(DeviceCommand::SetCurrentSetpoint(setpoint));
                    }
                }
            }
        }
    }

    pub fn set_pid_tunings(&self, device: &str, tunings: PidTunings) -> AppResult<()> {
        self.send_to(device, DeviceCommand::SetPidTunings(tunings))
    }

    pub fn capture_zero(&self) {
        self.broadcast(DeviceKind::Adc, DeviceCommand::CaptureZero);
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.broadcast(DeviceKind::Thermocouple, DeviceCommand::SetTemperature(celsius));
    }

    /// Start a sweep on channel 1 of `actuator`; `max_millivolts` 0 means full scale.
    pub fn start_calibration(
        &self,
        actuator: &str,
        max_millivolts: f64,
        steps: u32,
        dwell_s: f64,
    ) -> AppResult<()> {
        self.send_to(
            actuator,
            DeviceCommand::StartCalibration {
                max_millivolts,
                steps,
                dwell_s,
            },
        )?;
        if let Some(trigger) = self.session.as_ref().and_then(|s| s.trigger.as_ref()) {
            trigger.calibration_indicator();
        }
        Ok(())
    }

    pub fn stop_calibration(&self, actuator: &str) -> AppResult<()> {
        self.send_to(actuator, DeviceCommand::CancelCalibration)
    }

    /// Zero every actuator output and cancel any sweep.
    pub fn stop_outputs(&self) {
        self.broadcast(DeviceKind::Actuator, DeviceCommand::StopOutputs);
    }

    pub fn set_trigger(&self, on: bool) {
        let Some(trigger) = self.session.as_ref().and_then(|s| s.trigger.as_ref()) else {
            return;
        };
        if on {
            trigger.on();
        } else {
            trigger.off();
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.settings.acquisition.data_dir
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(err) = self.abort_acquisition() {
                error!(error = %err.summary(), "abort on drop failed");
            }
        }
    }
}
