//! Analog input channel descriptors and unit conversions.
//!
//! Every ADC channel carries a [`ChannelSpec`]: its hardware id, programmable gain and
//! the [`Conversion`] that turns a raw voltage into engineering units. The conversion
//! is decided when the configuration is loaded, so the acquisition loop never inspects
//! function identities at run time. The ionization gauge is the only conversion that
//! needs live controller state, which is passed in as a [`GaugeState`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Programmable gain of an ADC channel, expressed as its full-scale voltage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Gain {
    V1,
    V2,
    V5,
    #[default]
    V10,
}

impl Gain {
    /// Gains the ADC front end supports, in volts.
    pub const ALLOWED: [u32; 4] = [1, 2, 5, 10];

    /// Map a requested full-scale voltage onto a supported gain.
    ///
    /// Unsupported requests fall back to the widest range (10 V). The second element
    /// is `true` when the request had to be coerced, so the caller can report it.
    pub fn coerce(volts: u32) -> (Gain, bool) {
        match volts {
            1 => (Gain::V1, false),
            2 => (Gain::V2, false),
            5 => (Gain::V5, false),
            10 => (Gain::V10, false),
            _ => (Gain::V10, true),
        }
    }

    pub fn full_scale_volts(self) -> u32 {
        match self {
            Gain::V1 => 1,
            Gain::V2 => 2,
            Gain::V5 => 5,
            Gain::V10 => 10,
        }
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} V", self.full_scale_volts())
    }
}

/// Output mode selected on the ionization gauge controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GaugeMode {
    /// `pressure = voltage × 10^range` (Torr)
    #[default]
    Linear,
    /// `pressure = 10^(−5 + voltage/2)` (Pa)
    Log,
}

impl GaugeMode {
    /// Decode the numeric mode used by the control surface (0 linear, 1 log).
    ///
    /// Anything else is coerced to linear; the flag reports the coercion.
    pub fn coerce(mode: i32) -> (GaugeMode, bool) {
        match mode {
            0 => (GaugeMode::Linear, false),
            1 => (GaugeMode::Log, false),
            _ => (GaugeMode::Linear, true),
        }
    }

    pub fn as_flag(self) -> i32 {
        match self {
            GaugeMode::Linear => 0,
            GaugeMode::Log => 1,
        }
    }
}

/// Live ionization gauge controller settings, owned by the ADC worker.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GaugeState {
    pub mode: GaugeMode,
    /// Decade exponent used in linear mode, typically −8 ..= −3.
    pub range: i32,
}

/// Conversion identifiers as they appear in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionId {
    IonizationGauge,
    PfeifferSingleGauge,
    HallSensor,
    Baratron,
    Identity,
}

/// Raw-voltage to engineering-unit conversion, resolved at configuration load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Conversion {
    IonizationGauge,
    PfeifferSingleGauge,
    HallCurrentSensor,
    /// Capacitance manometer; `full_scale` is the pressure reported at 10 V.
    Baratron { full_scale: f64 },
    Identity,
}

impl Conversion {
    /// Resolve a configured conversion id. Baratrons require their full scale.
    pub fn resolve(id: ConversionId, full_scale: Option<f64>) -> Option<Conversion> {
        Some(match id {
            ConversionId::IonizationGauge => Conversion::IonizationGauge,
            ConversionId::PfeifferSingleGauge => Conversion::PfeifferSingleGauge,
            ConversionId::HallSensor => Conversion::HallCurrentSensor,
            ConversionId::Identity => Conversion::Identity,
            ConversionId::Baratron => Conversion::Baratron {
                full_scale: full_scale?,
            },
        })
    }

    /// Convert a raw voltage into engineering units.
    pub fn apply(&self, voltage: f64, gauge: GaugeState) -> f64 {
        match *self {
            Conversion::IonizationGauge => ionization_gauge(voltage, gauge.mode, gauge.range),
            Conversion::PfeifferSingleGauge => pfeiffer_single_gauge(voltage),
            Conversion::HallCurrentSensor => hall_current_sensor(voltage),
            Conversion::Baratron { full_scale } => baratron(voltage, full_scale),
            Conversion::Identity => voltage,
        }
    }
}

/// Ionization gauge controller output, 0–10 V.
pub fn ionization_gauge(voltage: f64, mode: GaugeMode, range: i32) -> f64 {
    match mode {
        GaugeMode::Linear => voltage * 10f64.powi(range),
        GaugeMode::Log => 10f64.powf(-5.0 + voltage / 2.0),
    }
}

/// Pfeiffer single gauge, V → Torr.
pub fn pfeiffer_single_gauge(voltage: f64) -> f64 {
    10f64.powf(1.680_138_1 * voltage - 11.359_254_47)
}

/// Hall-effect plasma current sensor (5 A type), V → A.
pub fn hall_current_sensor(voltage: f64) -> f64 {
    5.0 * (voltage - 2.52)
}

/// Baratron output, full scale at 10 V.
pub fn baratron(voltage: f64, full_scale: f64) -> f64 {
    voltage / 10.0 * full_scale
}

/// Immutable descriptor of one ADC channel.
///
/// Only `gain` changes during a session, and only through the owning worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub channel: u8,
    pub gain: Gain,
    pub description: String,
    pub conversion: Conversion,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, channel: u8, conversion: Conversion) -> Self {
        Self {
            name: name.into(),
            channel,
            gain: Gain::default(),
            description: String::new(),
            conversion,
        }
    }

    pub fn with_gain(mut self, gain: Gain) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn convert(&self, voltage: f64, gauge: GaugeState) -> f64 {
        self.conversion.apply(voltage, gauge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn linear_gauge_at_zero_volts_is_zero() {
        for range in -8..=-3 {
            assert_eq!(ionization_gauge(0.0, GaugeMode::Linear, range), 0.0);
        }
    }

    #[test]
    fn gauge_modes() {
        assert!(close(ionization_gauge(2.0, GaugeMode::Linear, -5), 2.0e-5));
        assert!(close(ionization_gauge(4.0, GaugeMode::Log, 0), 1.0e-3));
    }

    #[test]
    fn pfeiffer_is_monotonic() {
        let mut previous = pfeiffer_single_gauge(0.0);
        for step in 1..=100 {
            let value = pfeiffer_single_gauge(step as f64 * 0.1);
            assert!(value > previous, "not increasing at {step}");
            previous = value;
        }
    }

    #[test]
    fn hall_sensor_zero_point() {
        assert_eq!(hall_current_sensor(2.52), 0.0);
        assert!(close(hall_current_sensor(3.52), 5.0));
    }

    #[test]
    fn baratron_full_scale_at_ten_volts() {
        assert!(close(baratron(10.0, 0.1), 0.1));
        assert!(close(baratron(5.0, 10.0), 5.0));
    }

    #[test]
    fn gain_coercion() {
        assert_eq!(Gain::coerce(5), (Gain::V5, false));
        assert_eq!(Gain::coerce(3), (Gain::V10, true));
        assert_eq!(Gain::coerce(0), (Gain::V10, true));
    }

    #[test]
    fn gauge_mode_coercion() {
        assert_eq!(GaugeMode::coerce(1), (GaugeMode::Log, false));
        assert_eq!(GaugeMode::coerce(7), (GaugeMode::Linear, true));
    }

    #[test]
    fn baratron_needs_full_scale() {
        assert_eq!(Conversion::resolve(ConversionId::Baratron, None), None);
        assert_eq!(
            Conversion::resolve(ConversionId::Baratron, Some(1.0)),
            Some(Conversion::Baratron { full_scale: 1.0 })
        );
    }

    #[test]
    fn spec_converts_with_live_gauge_state() {
        let spec = ChannelSpec::new("Pu", 0, Conversion::IonizationGauge);
        let linear = GaugeState { mode: GaugeMode::Linear, range: -4 };
        assert!(close(spec.convert(3.0, linear), 3.0e-4));
        let log = GaugeState { mode: GaugeMode::Log, range: -4 };
        assert!(close(spec.convert(0.0, log), 1.0e-5));
    }
}
