//! MAX6675 thermocouple worker with membrane heater control.
//!
//! Each tick reads one temperature over SPI. Once per flush the mean of the valid
//! readings drives the heater PID, whose output is the heater on-time per 10 ms PWM
//! period. The PWM itself runs on a dedicated [`HeaterPwm`] thread; the worker only
//! publishes the duty through an atomic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ThermocoupleConfig;
use crate::device::{
    Batch, BatchSchema, DeviceCommand, DeviceKind, DeviceStrategy, Reading, WorkerContext,
};
use crate::hal::{Hal, Level, PinMode};
use crate::pid::{PidConfig, PidController, PidTunings};

/// Recorded when a reading fails.
pub const INVALID_TEMPERATURE: f64 = -1000.0;

/// Decode a MAX6675 frame into °C.
///
/// Bits 15, 2 and 1 must be clear; bit 2 set means the thermocouple is open.
pub fn decode_max6675(frame: &[u8]) -> Option<f64> {
    let [hi, lo] = frame else {
        return None;
    };
    let word = u16::from_be_bytes([*hi, *lo]);
    (word & 0x8006 == 0).then(|| f64::from(word >> 3) / 4.0)
}

/// Software PWM on the heater GPIO.
pub struct HeaterPwm {
    on_time: Arc<AtomicU64>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeaterPwm {
    pub const PERIOD: Duration = Duration::from_millis(10);

    /// Configure `pin` as output and start toggling it.
    pub fn spawn(hal: Arc<dyn Hal>, pin: u8, name: &str) -> std::io::Result<Self> {
        if let Err(err) = hal.gpio_set_mode(pin, PinMode::Output) {
            warn!(pin, error = %err, "heater pin mode not set");
        }
        let on_time = Arc::new(AtomicU64::new(0f64.to_bits()));
        let cancel = CancellationToken::new();

        let duty = Arc::clone(&on_time);
        let token = cancel.clone();
        let span = tracing::Span::current();
        let handle = thread::Builder::new()
            .name(format!("{name}-heater"))
            .spawn(move || {
                let _span = span.entered();
                let period = HeaterPwm::PERIOD.as_secs_f64();
                // Warn once per failure episode.
                let mut failing = false;
                let mut drive = |level: Level| match hal.gpio_write(pin, level) {
                    Ok(()) => {
                        if failing {
                            info!(pin, "heater writes recovered");
                        }
                        failing = false;
                    }
                    Err(err) => {
                        if !failing {
                            warn!(pin, error = %err, "heater write failed");
                        }
                        failing = true;
                    }
                };
                while !token.is_cancelled() {
                    let on = f64::from_bits(duty.load(Ordering::Relaxed));
                    if on <= 0.0 {
                        thread::sleep(HeaterPwm::PERIOD);
                        continue;
                    }
                    drive(Level::High);
                    thread::sleep(Duration::from_secs_f64(on.min(period)));
                    drive(Level::Low);
                    thread::sleep(Duration::from_secs_f64((period - on).max(0.0)));
                }
                if let Err(err) = hal.gpio_write(pin, Level::Low) {
                    warn!(pin, error = %err, "heater pin not driven low");
                }
            })?;

        Ok(Self {
            on_time,
            cancel,
            handle: Some(handle),
        })
    }

    /// Seconds of on-time per period, clamped to `[0, PERIOD]`.
    pub fn set_on_time(&self, seconds: f64) {
        let seconds = if seconds.is_finite() {
            seconds.clamp(0.0, Self::PERIOD.as_secs_f64())
        } else {
            0.0
        };
        self.on_time.store(seconds.to_bits(), Ordering::Relaxed);
    }

    pub fn on_time(&self) -> f64 {
        f64::from_bits(self.on_time.load(Ordering::Relaxed))
    }

    /// Stop the thread; the pin is left low.
    pub fn stop(&mut self) {
        self.set_on_time(0.0);
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("heater thread panicked");
            }
        }
    }
}

impl Drop for HeaterPwm {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Thermocouple strategy for [`Device`](crate::device::Device).
pub struct ThermocoupleStrategy {
    hal: Arc<dyn Hal>,
    chip_select: u8,
    heater_gpio: u8,
    min_interval: f64,
    output_scale: f64,
    pid: PidController,
    setpoint: f64,
    heater: Option<HeaterPwm>,
}

impl ThermocoupleStrategy {
    pub fn from_config(config: &ThermocoupleConfig, hal: Arc<dyn Hal>) -> Self {
        let tunings = PidTunings::new(config.pid.kp, config.pid.ki, config.pid.kd);
        let pid = PidController::new(
            PidConfig::new()
                .with_tunings(tunings.scaled(config.pid.output_scale))
                .with_output_limits(0.0, HeaterPwm::PERIOD.as_secs_f64())
                .with_integral_floor(config.pid.integral_floor),
        );
        Self {
            hal,
            chip_select: config.chip_select,
            heater_gpio: config.heater_gpio,
            min_interval: config.min_sampling_interval_s,
            output_scale: config.pid.output_scale,
            pid,
            setpoint: 0.0,
            heater: None,
        }
    }

    pub fn heater_on_time(&self) -> f64 {
        self.heater.as_ref().map_or(0.0, HeaterPwm::on_time)
    }

    fn read_temperature(&self, ctx: &WorkerContext) -> f64 {
        match self.hal.spi_read(self.chip_select, 2) {
            Ok(frame) => decode_max6675(&frame).unwrap_or_else(|| {
                ctx.warn(format!("MAX6675: bad reading {frame:02x?}"));
                INVALID_TEMPERATURE
            }),
            Err(err) => {
                ctx.warn(format!("MAX6675: read failed: {err}"));
                INVALID_TEMPERATURE
            }
        }
    }

    /// Heater on-time for the mean temperature of one control period.
    fn control(&mut self, mean: f64) -> f64 {
        let output = self.pid.compute(mean);
        match self.pid.last_error() {
            Some(error) if error >= 0.0 => output,
            _ => 0.0,
        }
    }
}

impl DeviceStrategy for ThermocoupleStrategy {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Thermocouple
    }

    fn schema(&self) -> Option<BatchSchema> {
        Some(BatchSchema {
            flag_columns: Vec::new(),
            preset_columns: vec!["PresetT".to_string()],
            raw_columns: vec!["T".to_string()],
            channel_numbers: vec![self.chip_select],
        })
    }

    fn min_sampling_interval(&self) -> f64 {
        self.min_interval
    }

    fn start(&mut self, ctx: &WorkerContext) {
        self.pid.set_sample_time(ctx.sampling_interval());
        match HeaterPwm::spawn(Arc::clone(&self.hal), self.heater_gpio, ctx.name()) {
            Ok(pwm) => self.heater = Some(pwm),
            Err(err) => ctx.error(format!("Heater control not available: {err}")),
        }
        info!(device = ctx.name(), chip_select = self.chip_select, "thermocouple ready");
    }

    fn handle_command(&mut self, ctx: &WorkerContext, command: DeviceCommand, _pending: &Batch) {
        match command {
            DeviceCommand::SetTemperature(celsius) if celsius.is_finite() => {
                self.setpoint = celsius;
                self.pid.set_setpoint(celsius);
            }
            DeviceCommand::SetPidTunings(tunings) => {
                self.pid.set_tunings(tunings.scaled(self.output_scale));
            }
            other => debug!(device = ctx.name(), ?other, "command ignored by thermocouple"),
        }
    }

    fn tick(&mut self, ctx: &WorkerContext) -> Option<Reading> {
        let temperature = self.read_temperature(ctx);
        Some(Reading {
            flags: Vec::new(),
            presets: vec![self.setpoint],
            raw: vec![temperature],
            converted: vec![temperature],
        })
    }

    fn on_flush(&mut self, ctx: &WorkerContext, batch: &Batch) {
        let valid: Vec<f64> = batch
            .converted_column(0)
            .filter(|t| *t > INVALID_TEMPERATURE)
            .collect();
        if batch.is_empty() {
            return;
        }
        let on_time = if valid.is_empty() {
            ctx.warn("No valid temperature in batch, heater off");
            0.0
        } else {
            let mean = valid.iter().sum::<f64>() / valid.len() as f64;
            self.control(mean)
        };
        if let Some(heater) = &self.heater {
            heater.set_on_time(on_time);
        }
    }

    fn on_interval_changed(&mut self, ctx: &WorkerContext) {
        self.pid.set_sample_time(ctx.sampling_interval());
    }

    fn shutdown(&mut self, ctx: &WorkerContext) {
        if let Some(mut heater) = self.heater.take() {
            heater.stop();
        }
        self.pid.rearm();
        info!(device = ctx.name(), "heater off");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeaterPidConfig;
    use crate::device::{DeviceEvent, ManualClock};
    use crate::hal::MockHal;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    fn frame(celsius: f64) -> Vec<u8> {
        let word = ((celsius * 4.0) as u16) << 3;
        word.to_be_bytes().to_vec()
    }

    fn strategy(hal: Arc<MockHal>) -> ThermocoupleStrategy {
        let config = ThermocoupleConfig {
            name: "membrane".into(),
            chip_select: 0,
            heater_gpio: 18,
            min_sampling_interval_s: 0.25,
            pid: HeaterPidConfig::default(),
        };
        ThermocoupleStrategy::from_config(&config, hal)
    }

    #[test]
    fn decodes_frames() {
        assert_eq!(decode_max6675(&frame(25.0)), Some(25.0));
        assert_eq!(decode_max6675(&frame(100.25)), Some(100.25));
        // open thermocouple bit
        assert_eq!(decode_max6675(&[0x00, 0x04]), None);
        assert_eq!(decode_max6675(&[0x80, 0x00]), None);
        assert_eq!(decode_max6675(&[0x01]), None);
    }

    #[test]
    fn heater_output_scaled_and_one_sided() {
        let hal = Arc::new(MockHal::new());
        let mut tc = strategy(hal);
        tc.pid.set_sample_time(0.25);
        tc.pid.set_setpoint(30.0);
        // e = 5, integral = 1.25
        let on = tc.control(25.0);
        let expected = (3.5 * 5.0 + 0.06 * 1.25) * 0.0002;
        assert!((on - expected).abs() < 1e-12);

        // above setpoint: heater off
        assert_eq!(tc.control(40.0), 0.0);
        // far below: saturates at one full period
        assert_eq!(tc.control(-500.0), 0.01);
    }

    #[test]
    fn bad_reading_records_sentinel_with_warning() {
        let hal = Arc::new(MockHal::new());
        hal.set_spi_response(0, frame(25.0));
        hal.queue_spi_response(0, vec![0x00, 0x04]);
        let tc = strategy(hal.clone());

        let clock = Arc::new(ManualClock::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (device, handle) = crate::device::Device::configure("membrane", clock.clone(), 0.1, Box::new(tc), tx);
        // floored to 0.25 s → STEP 3, batches of 2
        assert_eq!(device.sampling_interval(), 0.25);
        clock.cancel_after(2, handle.cancel_token());
        device.run();

        let mut temperatures = Vec::new();
        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                DeviceEvent::BatchReady { batch, .. } => {
                    temperatures.extend(batch.samples.iter().map(|s| s.raw[0]));
                }
                DeviceEvent::Message { .. } => warnings += 1,
                _ => {}
            }
        }
        assert_eq!(temperatures, vec![INVALID_TEMPERATURE, 25.0]);
        assert_eq!(warnings, 1);
        assert_eq!(hal.pin(18), Some(Level::Low));
    }

    #[test]
    fn pwm_clamps_on_time_and_leaves_pin_low() {
        let hal = Arc::new(MockHal::new());
        let mut pwm = HeaterPwm::spawn(hal.clone(), 5, "test").unwrap();
        pwm.set_on_time(1.0);
        assert_eq!(pwm.on_time(), 0.01);
        pwm.set_on_time(-3.0);
        assert_eq!(pwm.on_time(), 0.0);
        pwm.set_on_time(0.005);
        thread::sleep(Duration::from_millis(50));
        pwm.stop();
        assert_eq!(hal.pin(5), Some(Level::Low));
        assert!(hal.gpio_writes(5).contains(&Level::High));
    }

    #[test]
    #[traced_test]
    fn heater_write_failures_warn_once() {
        let hal = Arc::new(MockHal::new());
        hal.fail_gpio(5, true);
        let mut pwm = HeaterPwm::spawn(hal.clone(), 5, "test").unwrap();
        pwm.set_on_time(0.005);
        thread::sleep(Duration::from_millis(60));
        hal.fail_gpio(5, false);
        thread::sleep(Duration::from_millis(40));
        pwm.stop();

        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("heater write failed")).count() {
                1 => Ok(()),
                n => Err(format!("{n} heater write warnings")),
            }
        });
        assert!(logs_contain("heater writes recovered"));
        assert_eq!(hal.pin(5), Some(Level::Low));
    }
}
