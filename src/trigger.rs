//! Synchronisation output and calibration indicator.
//!
//! One thread owns the trigger GPIO. It marks shot boundaries (on/off) and blinks
//! the calibration pattern, and tells every subscribed ADC the current trigger value
//! so it ends up in each sample. Whenever the thread terminates the line is driven
//! low and the subscribers are told the trigger is 0.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::{Clock, DeviceCommand};
use crate::hal::{Hal, Level, PinMode};

const POLL: Duration = Duration::from_millis(10);
const PULSE_ON: Duration = Duration::from_millis(100);
const PULSE_OFF: Duration = Duration::from_millis(300);
const PULSES: usize = 3;

/// Trigger value recorded while the calibration indicator holds the line high.
pub const CALIBRATION_MARK: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCommand {
    On,
    Off,
    /// Three short pulses, then sustained on.
    CalibrationIndicator,
}

struct TriggerLine {
    hal: Arc<dyn Hal>,
    pin: u8,
    clock: Arc<dyn Clock>,
    subscribers: Vec<UnboundedSender<DeviceCommand>>,
    cancel: CancellationToken,
}

impl TriggerLine {
    fn write(&self, level: Level) {
        if let Err(err) = self.hal.gpio_write(self.pin, level) {
            warn!(pin = self.pin, error = %err, "trigger write failed");
        }
    }

    fn notify(&self, value: i32) {
        for subscriber in &self.subscribers {
            let _ = subscriber.send(DeviceCommand::SetTrigger(value));
        }
    }

    fn set(&self, level: Level, value: i32) {
        self.write(level);
        self.notify(value);
    }

    fn indicator(&self) {
        for _ in 0..PULSES {
            if self.cancel.is_cancelled() {
                return;
            }
            self.set(Level::High, 1);
            self.clock.sleep_until_cancelled(PULSE_ON, &self.cancel);
            self.set(Level::Low, 0);
            self.clock.sleep_until_cancelled(PULSE_OFF, &self.cancel);
        }
        self.write(Level::High);
        self.notify(CALIBRATION_MARK);
        self.notify(0);
    }

    fn run(self, mut commands: UnboundedReceiver<TriggerCommand>) {
        if let Err(err) = self.hal.gpio_set_mode(self.pin, PinMode::Output) {
            warn!(pin = self.pin, error = %err, "trigger pin mode not set");
        }
        while !self.cancel.is_cancelled() {
            match commands.try_recv() {
                Ok(command) => {
                    debug!(pin = self.pin, ?command, "trigger command");
                    match command {
                        TriggerCommand::On => self.set(Level::High, 1),
                        TriggerCommand::Off => self.set(Level::Low, 0),
                        TriggerCommand::CalibrationIndicator => self.indicator(),
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(POLL),
                Err(TryRecvError::Disconnected) => break,
            }
        }
        self.set(Level::Low, 0);
        info!(pin = self.pin, "trigger line released");
    }
}

/// Handle to the trigger thread.
pub struct TriggerSignal {
    commands: UnboundedSender<TriggerCommand>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TriggerSignal {
    pub fn spawn(
        hal: Arc<dyn Hal>,
        pin: u8,
        clock: Arc<dyn Clock>,
        subscribers: Vec<UnboundedSender<DeviceCommand>>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let line = TriggerLine {
            hal,
            pin,
            clock,
            subscribers,
            cancel: cancel.clone(),
        };
        let handle = thread::Builder::new()
            .name("trigger".to_string())
            .spawn(move || line.run(rx))?;
        Ok(Self {
            commands: tx,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn send(&self, command: TriggerCommand) {
        if self.commands.send(command).is_err() {
            debug!(?command, "trigger thread already stopped");
        }
    }

    pub fn on(&self) {
        self.send(TriggerCommand::On);
    }

    pub fn off(&self) {
        self.send(TriggerCommand::Off);
    }

    pub fn calibration_indicator(&self) {
        self.send(TriggerCommand::CalibrationIndicator);
    }

    /// Request termination without waiting.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Terminate and wait; the line is low afterwards.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("trigger thread panicked");
            }
        }
    }
}

impl Drop for TriggerSignal {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ManualClock;
    use crate::hal::MockHal;

    fn triggers(rx: &mut UnboundedReceiver<DeviceCommand>) -> Vec<i32> {
        let mut values = Vec::new();
        while let Ok(command) = rx.try_recv() {
            if let DeviceCommand::SetTrigger(v) = command {
                values.push(v);
            }
        }
        values
    }

    fn wait_for_writes(hal: &MockHal, pin: u8, n: usize) {
        for _ in 0..500 {
            if hal.gpio_writes(pin).len() >= n {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn on_off_and_release() {
        let hal = Arc::new(MockHal::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trigger = TriggerSignal::spawn(hal.clone(), 27, Arc::new(ManualClock::default()), vec![tx]).unwrap();
        trigger.on();
        wait_for_writes(&hal, 27, 1);
        assert_eq!(hal.pin(27), Some(Level::High));
        trigger.stop();

        assert_eq!(hal.gpio_writes(27), vec![Level::High, Level::Low]);
        assert_eq!(triggers(&mut rx), vec![1, 0]);
    }

    #[test]
    fn calibration_pattern() {
        let hal = Arc::new(MockHal::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trigger = TriggerSignal::spawn(hal.clone(), 27, Arc::new(ManualClock::default()), vec![tx]).unwrap();
        trigger.calibration_indicator();
        wait_for_writes(&hal, 27, 7);
        assert_eq!(hal.pin(27), Some(Level::High));
        trigger.stop();

        use Level::{High, Low};
        assert_eq!(
            hal.gpio_writes(27),
            vec![High, Low, High, Low, High, Low, High, Low]
        );
        assert_eq!(triggers(&mut rx), vec![1, 0, 1, 0, 1, 0, 2, 0, 0]);
    }
}
