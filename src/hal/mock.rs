//! Mock hardware implementation
//!
//! `MockHal` implements every HAL capability in memory and records each call in
//! order, so tests can assert on exactly what the workers did to the hardware (and
//! in which order). It is also the backend of the simulated CLI session. The call
//! log keeps the most recent [`MAX_CALLS`] entries unless configured otherwise.
//!
//! Inputs are fixed voltages per channel. A DAC channel can be looped back onto an
//! ADC channel (`input = offset + gain × output`) to close a simulated control loop.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use super::{AnalogInput, AnalogOutput, DigitalIo, Level, PinMode, SpiBus};
use crate::channel::Gain;

/// One recorded hardware operation.
#[derive(Debug, Clone, PartialEq)]
pub enum HalCall {
    Read { channel: u8, gain: Gain },
    Write { channel: u8, volts: f64 },
    GpioMode { pin: u8, mode: PinMode },
    GpioWrite { pin: u8, level: Level },
    SpiRead { chip_select: u8, len: usize },
}

#[derive(Debug, Clone, Copy)]
struct Loopback {
    input: u8,
    gain: f64,
    offset: f64,
}

/// Default number of calls kept by a [`MockHal`].
pub const MAX_CALLS: usize = 10_000;

/// Call history; the oldest entries are dropped beyond `capacity`.
#[derive(Debug)]
struct CallLog {
    entries: VecDeque<HalCall>,
    capacity: usize,
}

impl Default for CallLog {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: MAX_CALLS,
        }
    }
}

impl CallLog {
    fn push(&mut self, call: HalCall) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(call);
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: CallLog,
    inputs: HashMap<u8, f64>,
    outputs: HashMap<u8, f64>,
    pins: HashMap<u8, Level>,
    failing_reads: HashSet<u8>,
    failing_outputs: HashSet<u8>,
    failing_pins: HashSet<u8>,
    spi_queue: HashMap<u8, VecDeque<Vec<u8>>>,
    spi_default: HashMap<u8, Vec<u8>>,
    loopbacks: HashMap<u8, Loopback>,
}

/// In-memory, call-recording HAL.
#[derive(Debug, Default)]
pub struct MockHal {
    state: Mutex<MockState>,
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` calls; 0 disables recording.
    pub fn with_call_log_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.calls.capacity = capacity;
            while state.calls.entries.len() > capacity {
                state.calls.entries.pop_front();
            }
        }
        self
    }

    /// Voltage returned by every subsequent read of `channel`.
    pub fn set_input(&self, channel: u8, volts: f64) {
        self.state.lock().inputs.insert(channel, volts);
    }

    /// Make reads of `channel` fail until cleared.
    pub fn fail_reads(&self, channel: u8, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_reads.insert(channel);
        } else {
            state.failing_reads.remove(&channel);
        }
    }

    /// Make writes to `channel` fail until cleared.
    pub fn fail_outputs(&self, channel: u8, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_outputs.insert(channel);
        } else {
            state.failing_outputs.remove(&channel);
        }
    }

    /// Make writes to GPIO `pin` fail until cleared.
    pub fn fail_gpio(&self, pin: u8, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_pins.insert(pin);
        } else {
            state.failing_pins.remove(&pin);
        }
    }

    /// Queue a one-shot SPI response for `chip_select`.
    pub fn queue_spi_response(&self, chip_select: u8, bytes: Vec<u8>) {
        self.state
            .lock()
            .spi_queue
            .entry(chip_select)
            .or_default()
            .push_back(bytes);
    }

    /// Response used once the queue for `chip_select` is empty.
    pub fn set_spi_response(&self, chip_select: u8, bytes: Vec<u8>) {
        self.state.lock().spi_default.insert(chip_select, bytes);
    }

    /// Feed DAC `output` back into ADC `input` as `offset + gain × volts`.
    pub fn loopback(&self, output: u8, input: u8, gain: f64, offset: f64) {
        let mut state = self.state.lock();
        state.loopbacks.insert(output, Loopback { input, gain, offset });
        let volts = state.outputs.get(&output).copied().unwrap_or(0.0);
        state.inputs.insert(input, offset + gain * volts);
    }

    /// Recorded calls still in the log, oldest first.
    pub fn calls(&self) -> Vec<HalCall> {
        self.state.lock().calls.entries.iter().cloned().collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.entries.clear();
    }

    /// Every voltage written to DAC `channel`, in order.
    pub fn writes_to(&self, channel: u8) -> Vec<f64> {
        self.state
            .lock()
            .calls
            .entries
            .iter()
            .filter_map(|call| match call {
                HalCall::Write { channel: c, volts } if *c == channel => Some(*volts),
                _ => None,
            })
            .collect()
    }

    /// Every level written to `pin`, in order.
    pub fn gpio_writes(&self, pin: u8) -> Vec<Level> {
        self.state
            .lock()
            .calls
            .entries
            .iter()
            .filter_map(|call| match call {
                HalCall::GpioWrite { pin: p, level } if *p == pin => Some(*level),
                _ => None,
            })
            .collect()
    }

    /// Last voltage written to DAC `channel`.
    pub fn output(&self, channel: u8) -> Option<f64> {
        self.state.lock().outputs.get(&channel).copied()
    }

    /// Last level written to `pin`.
    pub fn pin(&self, pin: u8) -> Option<Level> {
        self.state.lock().pins.get(&pin).copied()
    }
}

impl AnalogInput for MockHal {
    fn read_channel(&self, channel: u8, gain: Gain) -> Result<f64> {
        let mut state = self.state.lock();
        state.calls.push(HalCall::Read { channel, gain });
        if state.failing_reads.contains(&channel) {
            return Err(anyhow!("ADC read failed on channel {channel}"));
        }
        let volts = state.inputs.get(&channel).copied().unwrap_or(0.0);
        let limit = f64::from(gain.full_scale_volts());
        Ok(volts.clamp(-limit, limit))
    }
}

impl AnalogOutput for MockHal {
    fn write_output(&self, channel: u8, volts: f64) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(HalCall::Write { channel, volts });
        if state.failing_outputs.contains(&channel) {
            return Err(anyhow!("DAC write failed on channel {channel}"));
        }
        state.outputs.insert(channel, volts);
        if let Some(lb) = state.loopbacks.get(&channel).copied() {
            state.inputs.insert(lb.input, lb.offset + lb.gain * volts);
        }
        Ok(())
    }
}

impl DigitalIo for MockHal {
    fn gpio_set_mode(&self, pin: u8, mode: PinMode) -> Result<()> {
        self.state.lock().calls.push(HalCall::GpioMode { pin, mode });
        Ok(())
    }

    fn gpio_write(&self, pin: u8, level: Level) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(HalCall::GpioWrite { pin, level });
        if state.failing_pins.contains(&pin) {
            return Err(anyhow!("GPIO {pin} write failed"));
        }
        state.pins.insert(pin, level);
        Ok(())
    }
}

impl SpiBus for MockHal {
    fn spi_read(&self, chip_select: u8, len: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.calls.push(HalCall::SpiRead { chip_select, len });
        let queued = state
            .spi_queue
            .get_mut(&chip_select)
            .and_then(VecDeque::pop_front);
        queued
            .or_else(|| state.spi_default.get(&chip_select).cloned())
            .ok_or_else(|| anyhow!("no SPI peripheral on chip select {chip_select}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_in_order() {
        let hal = MockHal::new();
        hal.set_input(2, 1.5);
        assert_eq!(hal.read_channel(2, Gain::V5).unwrap(), 1.5);
        hal.write_output(0, 2.0).unwrap();
        hal.gpio_write(17, Level::High).unwrap();

        assert_eq!(
            hal.calls(),
            vec![
                HalCall::Read { channel: 2, gain: Gain::V5 },
                HalCall::Write { channel: 0, volts: 2.0 },
                HalCall::GpioWrite { pin: 17, level: Level::High },
            ]
        );
        assert_eq!(hal.output(0), Some(2.0));
        assert_eq!(hal.pin(17), Some(Level::High));
    }

    #[test]
    fn call_log_is_bounded() {
        let hal = MockHal::new().with_call_log_capacity(3);
        for volts in [1.0, 2.0, 3.0, 4.0, 5.0] {
            hal.write_output(0, volts).unwrap();
        }
        assert_eq!(hal.writes_to(0), vec![3.0, 4.0, 5.0]);
        assert_eq!(hal.output(0), Some(5.0));

        let silent = MockHal::new().with_call_log_capacity(0);
        silent.write_output(1, 2.0).unwrap();
        silent.gpio_write(17, Level::High).unwrap();
        assert!(silent.calls().is_empty());
        assert_eq!(silent.output(1), Some(2.0));
        assert_eq!(silent.pin(17), Some(Level::High));

        let default = MockHal::new();
        for _ in 0..MAX_CALLS + 10 {
            default.read_channel(0, Gain::V10).unwrap();
        }
        assert_eq!(default.calls().len(), MAX_CALLS);
    }

    #[test]
    fn reads_saturate_at_gain() {
        let hal = MockHal::new();
        hal.set_input(0, 7.0);
        assert_eq!(hal.read_channel(0, Gain::V5).unwrap(), 5.0);
        assert_eq!(hal.read_channel(0, Gain::V10).unwrap(), 7.0);
    }

    #[test]
    fn injected_failures() {
        let hal = MockHal::new();
        hal.fail_reads(1, true);
        hal.fail_outputs(3, true);
        assert!(hal.read_channel(1, Gain::V10).is_err());
        assert!(hal.write_output(3, 1.0).is_err());
        assert_eq!(hal.output(3), None);
        hal.fail_gpio(17, true);
        assert!(hal.gpio_write(17, Level::High).is_err());
        assert_eq!(hal.pin(17), None);
        hal.fail_reads(1, false);
        assert!(hal.read_channel(1, Gain::V10).is_ok());
    }

    #[test]
    fn spi_queue_then_default() {
        let hal = MockHal::new();
        assert!(hal.spi_read(0, 2).is_err());
        hal.set_spi_response(0, vec![0x03, 0x20]);
        hal.queue_spi_response(0, vec![0xFF]);
        assert_eq!(hal.spi_read(0, 2).unwrap(), vec![0xFF]);
        assert_eq!(hal.spi_read(0, 2).unwrap(), vec![0x03, 0x20]);
    }

    #[test]
    fn loopback_follows_output() {
        let hal = MockHal::new();
        hal.loopback(1, 4, 0.5, 2.52);
        assert_eq!(hal.read_channel(4, Gain::V10).unwrap(), 2.52);
        hal.write_output(1, 2.0).unwrap();
        assert!((hal.read_channel(4, Gain::V10).unwrap() - 3.52).abs() < 1e-12);
    }
}
