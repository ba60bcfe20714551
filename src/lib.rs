//! # Plasma DAQ Core Library
//!
//! Device workers and closed-loop control for the control unit of a small plasma
//! experiment: analog inputs (gauges, plasma current), analog outputs (mass-flow
//! and discharge supply setpoints), a thermocouple-regulated membrane heater and a
//! shared trigger line.
//!
//! ## Crate Structure
//!
//! - **`hal`**: hardware capability traits (`AnalogInput`, `AnalogOutput`, `DigitalIo`,
//!   `SpiBus`) and a recording `MockHal`.
//! - **`channel`**: ADC channel descriptors, gains and raw → engineering-unit conversions.
//! - **`pid`**: the discrete PID controller used by both control loops.
//! - **`device`**: the generic worker loop (`Device`), the per-kind `DeviceStrategy`
//!   seam, batches, commands and events.
//! - **`adc`**, **`actuator`**, **`thermocouple`**: the three device kinds.
//! - **`trigger`**: the shared trigger GPIO and its calibration indicator pattern.
//! - **`coordinator`**: session lifecycle, event routing, CSV persistence and plot slices.
//! - **`storage`**: commented-header CSV files, one per sampling device.
//! - **`config`**: `Settings` loaded with figment from TOML plus environment overrides.
//! - **`error`**: the crate-wide `DaqError`.
//! - **`log_capture`**: bounded operator message log.
//! - **`tracing_setup`**: tracing subscriber initialization.

pub mod actuator;
pub mod adc;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod hal;
pub mod log_capture;
pub mod pid;
pub mod storage;
pub mod thermocouple;
pub mod tracing_setup;
pub mod trigger;

pub use coordinator::Coordinator;
pub use error::{AppResult, DaqError};
