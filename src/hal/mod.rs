//! Hardware abstraction layer.
//!
//! The device workers talk to the rig only through the small capability traits in
//! this module. Each trait covers one kind of hardware access:
//!
//! - [`AnalogInput`] reads one ADC channel at a given gain
//! - [`AnalogOutput`] drives one DAC channel (volts)
//! - [`DigitalIo`] configures and drives GPIO pins
//! - [`SpiBus`] performs raw reads from an SPI peripheral
//!
//! All methods are synchronous and take `&self`: every worker runs on its own OS
//! thread and owns a disjoint set of channels and pins, so implementations only need
//! interior locking around the physical bus. Errors use `anyhow::Result`; the device
//! layer turns them into sentinel values and warnings.

pub mod mock;

use anyhow::Result;

use crate::channel::Gain;

pub use mock::{HalCall, MockHal};

/// Direction of a GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    Output,
}

/// Logic level of a GPIO pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

/// Single-ended analog input.
pub trait AnalogInput: Send + Sync {
    /// Read the voltage present on `channel` using the given gain.
    fn read_channel(&self, channel: u8, gain: Gain) -> Result<f64>;
}

/// Analog output (DAC).
pub trait AnalogOutput: Send + Sync {
    /// Drive `channel` to `volts`.
    fn write_output(&self, channel: u8, volts: f64) -> Result<()>;
}

/// General purpose digital I/O.
pub trait DigitalIo: Send + Sync {
    fn gpio_set_mode(&self, pin: u8, mode: PinMode) -> Result<()>;
    fn gpio_write(&self, pin: u8, level: Level) -> Result<()>;
}

/// Raw SPI transfers for simple read-only peripherals.
pub trait SpiBus: Send + Sync {
    /// Clock `len` bytes out of the peripheral selected by `chip_select`.
    fn spi_read(&self, chip_select: u8, len: usize) -> Result<Vec<u8>>;
}

/// Everything a control unit needs from the board.
pub trait Hal: AnalogInput + AnalogOutput + DigitalIo + SpiBus {}

impl<T> Hal for T where T: AnalogInput + AnalogOutput + DigitalIo + SpiBus {}
