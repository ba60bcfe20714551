//! Device worker loop.
//!
//! Every physical instrument gets one [`Device`] running on its own OS thread. The
//! loop is identical for all instruments; what differs (which hardware is touched,
//! how raw values are converted, which control law runs) lives in a
//! [`DeviceStrategy`].
//!
//! ```text
//!   ┌────────────┐  DeviceCommand   ┌──────────────────────────────┐
//!   │ Coordinator├─────────────────►│ Device (one thread)          │
//!   │            │                  │  drain commands              │
//!   │            │  DeviceEvent     │  cancelled? ──► final flush  │
//!   │            │◄─────────────────┤  sleep(interval)             │
//!   └────────────┘                  │  strategy.tick() ─► Batch    │
//!                                   │  batch full? ──► flush       │
//!                                   └──────────────────────────────┘
//! ```
//!
//! Cancellation is cooperative: the token is checked once at the top of each
//! iteration, so a running tick (including its sleep) always completes. After the
//! loop exits the worker emits exactly one final batch, runs the strategy shutdown
//! and then exactly one [`DeviceEvent::Done`].
//!
//! Events are sent on an unbounded channel, so a worker never blocks on a slow
//! coordinator.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pid::PidTunings;

// =============================================================================
// Clock
// =============================================================================

/// Time source of the worker loops.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
    fn sleep(&self, duration: Duration);

    /// Sleep for `duration` unless `cancel` fires first. Returns whether it fired.
    fn sleep_until_cancelled(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        if !cancel.is_cancelled() {
            self.sleep(duration);
        }
        cancel.is_cancelled()
    }
}

/// Granularity of [`SystemClock::sleep_until_cancelled`].
pub const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Wall clock with real sleeps.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn sleep_until_cancelled(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        let deadline = std::time::Instant::now() + duration;
        loop {
            if cancel.is_cancelled() {
                return true;
            }
            let left = deadline.saturating_duration_since(std::time::Instant::now());
            if left.is_zero() {
                return false;
            }
            std::thread::sleep(left.min(CANCEL_POLL));
        }
    }
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Local>,
    sleeps: usize,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// Deterministic clock for tests.
///
/// `sleep` advances the virtual time instantly. Optionally cancels a token once a
/// given number of sleeps has happened, which makes tick counts exact.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: start,
                sleeps: 0,
                cancel_after: None,
            }),
        }
    }

    /// Cancel `token` when the `sleeps`-th sleep returns.
    pub fn cancel_after(&self, sleeps: usize, token: CancellationToken) {
        let mut state = self.state.lock();
        if state.sleeps >= sleeps {
            token.cancel();
        }
        state.cancel_after = Some((sleeps, token));
    }

    pub fn sleeps(&self) -> usize {
        self.state.lock().sleeps
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Local::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        self.state.lock().now
    }

    fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state.lock();
            let step = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
            state.now += step;
            state.sleeps += 1;
            if let Some((limit, token)) = &state.cancel_after {
                if state.sleeps >= *limit {
                    token.cancel();
                }
            }
        }
        std::thread::yield_now();
    }
}

// =============================================================================
// Flush cadence
// =============================================================================

/// Batch flush cadence derived from the sampling interval.
///
/// | interval        | STEP |
/// |-----------------|------|
/// | ≥ 0.9 s         | 1    |
/// | 0.1 s ..< 0.9 s | 3    |
/// | < 0.1 s         | 5    |
///
/// A batch is emitted once it holds `max(STEP − 1, 1)` samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    step: usize,
}

impl FlushPolicy {
    pub fn for_interval(seconds: f64) -> Self {
        let step = if seconds < 0.1 {
            5
        } else if seconds < 0.9 {
            3
        } else {
            1
        };
        Self { step }
    }

    /// Explicit STEP, at least 1.
    pub fn with_step(step: usize) -> Self {
        Self { step: step.max(1) }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Samples per emitted batch.
    pub fn batch_len(&self) -> usize {
        self.step.saturating_sub(1).max(1)
    }
}

// =============================================================================
// Samples and batches
// =============================================================================

/// One poll tick. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    /// Seconds since the worker started.
    pub elapsed: f64,
    /// Mode/range/trigger style flags, see [`BatchSchema::flag_columns`].
    pub flags: Vec<i32>,
    /// Actuator presets in effect when the sample was taken.
    pub presets: Vec<f64>,
    pub raw: Vec<f64>,
}

/// What a strategy produces on a tick; the loop adds the timestamps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub flags: Vec<i32>,
    pub presets: Vec<f64>,
    pub raw: Vec<f64>,
    pub converted: Vec<f64>,
}

/// Column layout of one device's samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSchema {
    pub flag_columns: Vec<String>,
    pub preset_columns: Vec<String>,
    /// Signal names, one per raw value.
    pub raw_columns: Vec<String>,
    /// Hardware channel numbers, parallel to `raw_columns`.
    pub channel_numbers: Vec<u8>,
}

impl BatchSchema {
    /// Name of the converted column for signal `name`.
    pub fn converted_column(name: &str) -> String {
        format!("{name}_c")
    }

    pub fn converted_columns(&self) -> Vec<String> {
        self.raw_columns
            .iter()
            .map(|name| Self::converted_column(name))
            .collect()
    }

    pub fn signal_index(&self, name: &str) -> Option<usize> {
        self.raw_columns.iter().position(|c| c == name)
    }
}

/// Samples accumulated between two flushes, with their converted values.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub schema: Arc<BatchSchema>,
    pub samples: Vec<Sample>,
    /// Converted values, one row per sample.
    pub converted: Vec<Vec<f64>>,
}

impl Batch {
    pub fn new(schema: Arc<BatchSchema>) -> Self {
        Self {
            schema,
            samples: Vec::new(),
            converted: Vec::new(),
        }
    }

    pub fn push(&mut self, sample: Sample, converted: Vec<f64>) {
        self.samples.push(sample);
        self.converted.push(converted);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Move the contents out, leaving an empty batch with the same schema.
    pub fn take(&mut self) -> Batch {
        Batch {
            schema: Arc::clone(&self.schema),
            samples: std::mem::take(&mut self.samples),
            converted: std::mem::take(&mut self.converted),
        }
    }

    /// Converted values of signal `index`, in tick order.
    pub fn converted_column(&self, index: usize) -> impl Iterator<Item = f64> + '_ {
        self.converted
            .iter()
            .filter_map(move |row| row.get(index).copied())
    }

    /// Mean of converted signal `index`; `None` when empty or not a number.
    pub fn converted_mean(&self, index: usize) -> Option<f64> {
        let (sum, n) = self
            .converted_column(index)
            .fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
        if n == 0 {
            return None;
        }
        let mean = sum / n as f64;
        mean.is_finite().then_some(mean)
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Instrument families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Adc,
    Actuator,
    Thermocouple,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Adc => "adc",
            DeviceKind::Actuator => "actuator",
            DeviceKind::Thermocouple => "thermocouple",
        };
        f.write_str(name)
    }
}

/// Requests sent to a worker. Commands a strategy does not understand are ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    SetSamplingInterval(f64),
    SetGaugeMode(i32),
    SetGaugeRange(i32),
    SetGain { signal: String, volts: u32 },
    SetTrigger(i32),
    /// Mirror an actuator preset into the samples (millivolts).
    SetPreset { channel: String, millivolts: f64 },
    /// Plasma current setpoint; 0 stops the loop.
    SetCurrentSetpoint(f64),
    SetPidTunings(PidTunings),
    CaptureZero,
    /// Drive logical actuator channel (1-based).
    OutputVoltage { channel: usize, millivolts: f64 },
    StopOutputs,
    StartCalibration { max_millivolts: f64, steps: u32, dwell_s: f64 },
    CancelCalibration,
    SetTemperature(f64),
}

/// Severity of a user-visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// ANSI-colored tag for terminal display.
    pub fn tag(self) -> &'static str {
        match self {
            Severity::Info => "\x1b[34m[INFO]\x1b[0m",
            Severity::Warning => "\x1b[33m[WARNING]\x1b[0m",
            Severity::Error => "\x1b[31m[ERROR]\x1b[0m",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(name)
    }
}

/// Fire-and-forget notifications from workers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    BatchReady { device: String, batch: Batch },
    Done { device: String },
    /// Output of the plasma current loop, to be applied by `actuator`.
    ControlVoltage { device: String, actuator: String, channel: usize, millivolts: f64 },
    ZeroAdjusted { device: String, signal: String, offset: f64 },
    Message { device: String, severity: Severity, text: String },
    PresetChanged { device: String, channel: usize, name: String, millivolts: f64 },
    CalibrationFinished { device: String, cancelled: bool },
}

impl DeviceEvent {
    pub fn device(&self) -> &str {
        match self {
            DeviceEvent::BatchReady { device, .. }
            | DeviceEvent::Done { device }
            | DeviceEvent::ControlVoltage { device, .. }
            | DeviceEvent::ZeroAdjusted { device, .. }
            | DeviceEvent::Message { device, .. }
            | DeviceEvent::PresetChanged { device, .. }
            | DeviceEvent::CalibrationFinished { device, .. } => device,
        }
    }
}

// =============================================================================
// Worker context and strategy
// =============================================================================

/// Loop state a strategy may read, plus the outgoing event channel.
#[derive(Clone)]
pub struct WorkerContext {
    name: String,
    events: UnboundedSender<DeviceEvent>,
    clock: Arc<dyn Clock>,
    sampling_interval: f64,
    policy: FlushPolicy,
}

impl WorkerContext {
    /// Context for driving a strategy outside of a [`Device`] loop.
    pub fn new(
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        sampling_interval: f64,
        events: UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            events,
            clock,
            sampling_interval,
            policy: FlushPolicy::for_interval(sampling_interval),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &UnboundedSender<DeviceEvent> {
        &self.events
    }

    pub fn sampling_interval(&self) -> f64 {
        self.sampling_interval
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Nominal control period, `sampling_interval × STEP`.
    pub fn control_period(&self) -> f64 {
        self.sampling_interval * self.policy.step() as f64
    }

    /// Send an event; a closed receiver is ignored.
    pub fn emit(&self, event: DeviceEvent) {
        if self.events.send(event).is_err() {
            debug!(device = %self.name, "event receiver closed");
        }
    }

    pub fn message(&self, severity: Severity, text: impl Into<String>) {
        self.emit(DeviceEvent::Message {
            device: self.name.clone(),
            severity,
            text: text.into(),
        });
    }

    pub fn info(&self, text: impl Into<String>) {
        self.message(Severity::Info, text);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.message(Severity::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.message(Severity::Error, text);
    }
}

/// Instrument specific part of a worker. Runs entirely on the worker thread.
pub trait DeviceStrategy: Send {
    fn kind(&self) -> DeviceKind;

    /// Column layout, or `None` for devices that produce no samples.
    fn schema(&self) -> Option<BatchSchema>;

    /// Lower bound for the sampling interval.
    fn min_sampling_interval(&self) -> f64 {
        0.0
    }

    /// Hardware initialisation, before the first tick.
    fn start(&mut self, _ctx: &WorkerContext) {}

    /// Apply a command. `pending` is the not yet flushed batch.
    fn handle_command(&mut self, ctx: &WorkerContext, command: DeviceCommand, pending: &Batch);

    /// One poll tick after the sleep.
    fn tick(&mut self, ctx: &WorkerContext) -> Option<Reading>;

    /// Called with every batch right before it is handed off.
    fn on_flush(&mut self, _ctx: &WorkerContext, _batch: &Batch) {}

    /// The sampling interval (and with it the control period) changed.
    fn on_interval_changed(&mut self, _ctx: &WorkerContext) {}

    /// Bring the hardware to a safe state after the loop ends.
    fn shutdown(&mut self, _ctx: &WorkerContext) {}
}

// =============================================================================
// Device
// =============================================================================

/// Owner side of a running worker.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    name: String,
    kind: DeviceKind,
    commands: UnboundedSender<DeviceCommand>,
    cancel: CancellationToken,
}

impl DeviceHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Queue a command. Returns `false` once the worker has exited.
    pub fn send(&self, command: DeviceCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn command_sender(&self) -> UnboundedSender<DeviceCommand> {
        self.commands.clone()
    }

    /// Request the loop to stop. Idempotent and callable from any thread.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A worker loop bound to one instrument.
pub struct Device {
    ctx: WorkerContext,
    kind: DeviceKind,
    strategy: Box<dyn DeviceStrategy>,
    commands: UnboundedReceiver<DeviceCommand>,
    cancel: CancellationToken,
    batch: Option<Batch>,
}

impl Device {
    /// Build a worker and its handle. The flush cadence follows the interval.
    pub fn configure(
        name: impl Into<String>,
        clock: Arc<dyn Clock>,
        sampling_interval: f64,
        strategy: Box<dyn DeviceStrategy>,
        events: UnboundedSender<DeviceEvent>,
    ) -> (Device, DeviceHandle) {
        let name = name.into();
        let kind = strategy.kind();
        let interval = sanitize_interval(sampling_interval, strategy.min_sampling_interval());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let batch = strategy.schema().map(|schema| Batch::new(Arc::new(schema)));

        let device = Device {
            ctx: WorkerContext::new(name.clone(), clock, interval, events),
            kind,
            strategy,
            commands: rx,
            cancel: cancel.clone(),
            batch,
        };
        let handle = DeviceHandle {
            name,
            kind,
            commands: tx,
            cancel,
        };
        (device, handle)
    }

    /// Override the interval-derived flush cadence.
    pub fn with_flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.ctx.policy = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn flush_policy(&self) -> FlushPolicy {
        self.ctx.policy
    }

    pub fn sampling_interval(&self) -> f64 {
        self.ctx.sampling_interval
    }

    /// Request the loop to stop.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Change the interval; takes effect on the next iteration.
    pub fn set_sampling_interval(&mut self, seconds: f64) {
        if !seconds.is_finite() || seconds <= 0.0 {
            self.ctx
                .warn(format!("Ignoring invalid sampling interval {seconds} s"));
            return;
        }
        let floor = self.strategy.min_sampling_interval();
        let interval = sanitize_interval(seconds, floor);
        if interval > seconds {
            self.ctx.warn(format!(
                "Sampling interval {seconds} s below minimum, using {interval} s"
            ));
        }
        self.ctx.sampling_interval = interval;
        self.ctx.policy = FlushPolicy::for_interval(interval);
        self.strategy.on_interval_changed(&self.ctx);
        debug!(
            device = %self.ctx.name,
            interval,
            step = self.ctx.policy.step(),
            "sampling interval changed"
        );
    }

    /// Run until aborted. Blocks the calling thread.
    pub fn run(mut self) {
        let start = self.ctx.clock.now();
        info!(
            device = %self.ctx.name,
            kind = %self.kind,
            interval = self.ctx.sampling_interval,
            step = self.ctx.policy.step(),
            "device worker started"
        );
        self.strategy.start(&self.ctx);

        loop {
            self.drain_commands();
            if self.cancel.is_cancelled() {
                break;
            }

            self.ctx
                .clock
                .sleep(Duration::from_secs_f64(self.ctx.sampling_interval));

            let Some(reading) = self.strategy.tick(&self.ctx) else {
                continue;
            };
            let Some(batch) = self.batch.as_mut() else {
                continue;
            };
            let timestamp = self.ctx.clock.now();
            let elapsed = (timestamp - start)
                .to_std()
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            batch.push(
                Sample {
                    timestamp,
                    elapsed,
                    flags: reading.flags,
                    presets: reading.presets,
                    raw: reading.raw,
                },
                reading.converted,
            );
            if batch.len() >= self.ctx.policy.batch_len() {
                self.flush();
            }
        }

        // Exactly one final flush, even when empty.
        self.flush();
        self.strategy.shutdown(&self.ctx);
        info!(device = %self.ctx.name, "device worker stopped");
        self.ctx.emit(DeviceEvent::Done {
            device: self.ctx.name.clone(),
        });
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                DeviceCommand::SetSamplingInterval(seconds) => self.set_sampling_interval(seconds),
                other => {
                    let empty;
                    let pending = match &self.batch {
                        Some(batch) => batch,
                        None => {
                            empty = Batch::new(Arc::new(BatchSchema::default()));
                            &empty
                        }
                    };
                    self.strategy.handle_command(&self.ctx, other, pending);
                }
            }
        }
    }

    fn flush(&mut self) {
        let Some(pending) = self.batch.as_mut() else {
            return;
        };
        let batch = pending.take();
        self.strategy.on_flush(&self.ctx, &batch);
        self.ctx.emit(DeviceEvent::BatchReady {
            device: self.ctx.name.clone(),
            batch,
        });
    }
}

fn sanitize_interval(seconds: f64, floor: f64) -> f64 {
    let seconds = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        0.1
    };
    seconds.max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Produces one sample per tick with the tick number as raw value.
    struct Counter {
        ticks: usize,
        shutdowns: Arc<Mutex<usize>>,
    }

    impl DeviceStrategy for Counter {
        fn kind(&self) -> DeviceKind {
            DeviceKind::Adc
        }

        fn schema(&self) -> Option<BatchSchema> {
            Some(BatchSchema {
                raw_columns: vec!["n".into()],
                channel_numbers: vec![0],
                ..Default::default()
            })
        }

        fn handle_command(&mut self, _: &WorkerContext, _: DeviceCommand, _: &Batch) {}

        fn tick(&mut self, _: &WorkerContext) -> Option<Reading> {
            self.ticks += 1;
            let n = self.ticks as f64;
            Some(Reading {
                raw: vec![n],
                converted: vec![n * 2.0],
                ..Default::default()
            })
        }

        fn shutdown(&mut self, _: &WorkerContext) {
            *self.shutdowns.lock() += 1;
        }
    }

    fn run_ticks(interval: f64, ticks: usize) -> (Vec<DeviceEvent>, usize) {
        let clock = Arc::new(ManualClock::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdowns = Arc::new(Mutex::new(0));
        let strategy = Counter {
            ticks: 0,
            shutdowns: Arc::clone(&shutdowns),
        };
        let (device, handle) = Device::configure("counter", clock.clone(), interval, Box::new(strategy), tx);
        clock.cancel_after(ticks, handle.cancel_token());
        device.run();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let n = *shutdowns.lock();
        (events, n)
    }

    fn batches(events: &[DeviceEvent]) -> Vec<&Batch> {
        events
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::BatchReady { batch, .. } => Some(batch),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn flush_policy_tiers() {
        assert_eq!(FlushPolicy::for_interval(1.0).step(), 1);
        assert_eq!(FlushPolicy::for_interval(0.9).step(), 1);
        assert_eq!(FlushPolicy::for_interval(0.5).step(), 3);
        assert_eq!(FlushPolicy::for_interval(0.1).step(), 3);
        assert_eq!(FlushPolicy::for_interval(0.01).step(), 5);
        assert_eq!(FlushPolicy::for_interval(1.0).batch_len(), 1);
        assert_eq!(FlushPolicy::for_interval(0.5).batch_len(), 2);
        assert_eq!(FlushPolicy::for_interval(0.01).batch_len(), 4);
    }

    #[test]
    fn twelve_ticks_at_step_five() {
        let (events, shutdowns) = run_ticks(0.01, 12);
        let batches = batches(&events);
        assert_eq!(batches.len(), 4);
        assert!(batches[..3].iter().all(|b| b.len() == 4));
        assert!(batches[3].is_empty());
        assert_eq!(shutdowns, 1);
        assert!(matches!(events.last(), Some(DeviceEvent::Done { .. })));
    }

    #[test]
    fn abort_flushes_remainder() {
        let (events, _) = run_ticks(0.01, 10);
        let sizes: Vec<usize> = batches(&events).iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn no_sample_is_lost() {
        for interval in [1.0, 0.5, 0.01] {
            let step = FlushPolicy::for_interval(interval).step();
            for n in 0..25 {
                let (events, _) = run_ticks(interval, n);
                let batches = batches(&events);
                let total: usize = batches.iter().map(|b| b.len()).sum();
                assert_eq!(total, n, "interval {interval}, {n} ticks");
                assert!(batches.len() * step + step >= n);

                let values: Vec<f64> = batches
                    .iter()
                    .flat_map(|b| b.samples.iter().map(|s| s.raw[0]))
                    .collect();
                let expected: Vec<f64> = (1..=n).map(|i| i as f64).collect();
                assert_eq!(values, expected);
            }
        }
    }

    #[test]
    fn exactly_one_done() {
        let (events, _) = run_ticks(0.5, 7);
        let done = events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Done { .. }))
            .count();
        assert_eq!(done, 1);
    }

    #[test]
    fn elapsed_follows_clock() {
        let (events, _) = run_ticks(1.0, 3);
        let elapsed: Vec<f64> = batches(&events)
            .iter()
            .flat_map(|b| b.samples.iter().map(|s| s.elapsed))
            .collect();
        assert_eq!(elapsed, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn interval_change_retiers_flush() {
        let clock = Arc::new(ManualClock::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let strategy = Counter {
            ticks: 0,
            shutdowns: Arc::new(Mutex::new(0)),
        };
        let (mut device, _handle) = Device::configure("counter", clock, 1.0, Box::new(strategy), tx);
        assert_eq!(device.flush_policy().step(), 1);
        device.set_sampling_interval(0.05);
        assert_eq!(device.flush_policy().step(), 5);
        device.set_sampling_interval(-1.0);
        assert_eq!(device.sampling_interval(), 0.05);
    }

    #[test]
    fn batch_mean_rejects_non_numbers() {
        let mut batch = Batch::new(Arc::new(BatchSchema::default()));
        assert_eq!(batch.converted_mean(0), None);
        let sample = Sample {
            timestamp: Local::now(),
            elapsed: 0.0,
            flags: vec![],
            presets: vec![],
            raw: vec![0.0],
        };
        batch.push(sample.clone(), vec![1.0]);
        batch.push(sample.clone(), vec![3.0]);
        assert_eq!(batch.converted_mean(0), Some(2.0));
        batch.push(sample, vec![f64::NAN]);
        assert_eq!(batch.converted_mean(0), None);
    }

    #[test]
    fn system_clock_wait_ends_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });
        let started = std::time::Instant::now();
        assert!(SystemClock.sleep_until_cancelled(Duration::from_secs(5), &token));
        assert!(started.elapsed() < Duration::from_secs(1));
        waker.join().unwrap();

        let idle = CancellationToken::new();
        assert!(!SystemClock.sleep_until_cancelled(Duration::from_millis(20), &idle));
    }

    #[test]
    fn severity_tags_are_colored() {
        assert!(Severity::Warning.tag().contains("WARNING"));
        assert!(Severity::Error.tag().starts_with("\x1b[31m"));
    }
}
