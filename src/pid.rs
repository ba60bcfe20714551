//! Discrete PID controller shared by the plasma-current and membrane-heater loops.
//!
//! `output = Kp·e + Ki·∫e·dt + Kd·de/dt`, evaluated once per control period with a
//! fixed `sample_time`. The result is always clamped to the configured output limits
//! before it is returned. Apart from that clamp the only windup protection is the
//! optional integrator floor: when the accumulated integral drops below the floor it
//! is reset to zero. The membrane heater loop relies on this.
//!
//! Tuning changes keep the accumulated history; [`PidController::rearm`] is the only
//! operation that clears it.

use serde::{Deserialize, Serialize};

/// Proportional, integral and derivative gains.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidTunings {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidTunings {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }

    /// Multiply every gain by `factor`.
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            kp: self.kp * factor,
            ki: self.ki * factor,
            kd: self.kd * factor,
        }
    }
}

/// Static configuration of a [`PidController`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidConfig {
    pub tunings: PidTunings,
    pub setpoint: f64,
    /// Seconds between two calls to [`PidController::compute`].
    pub sample_time: f64,
    pub out_min: f64,
    pub out_max: f64,
    /// Reset the integrator to zero whenever it falls below this value.
    pub integral_floor: Option<f64>,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            tunings: PidTunings::default(),
            setpoint: 0.0,
            sample_time: 1.0,
            out_min: f64::NEG_INFINITY,
            out_max: f64::INFINITY,
            integral_floor: None,
        }
    }
}

impl PidConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kp(mut self, kp: f64) -> Self {
        self.tunings.kp = kp;
        self
    }

    pub fn with_ki(mut self, ki: f64) -> Self {
        self.tunings.ki = ki;
        self
    }

    pub fn with_kd(mut self, kd: f64) -> Self {
        self.tunings.kd = kd;
        self
    }

    pub fn with_tunings(mut self, tunings: PidTunings) -> Self {
        self.tunings = tunings;
        self
    }

    pub fn with_setpoint(mut self, setpoint: f64) -> Self {
        self.setpoint = setpoint;
        self
    }

    pub fn with_sample_time(mut self, seconds: f64) -> Self {
        self.sample_time = seconds;
        self
    }

    /// Output limits; reversed bounds are swapped and a NaN bound means unbounded.
    pub fn with_output_limits(mut self, min: f64, max: f64) -> Self {
        let min = if min.is_nan() { f64::NEG_INFINITY } else { min };
        let max = if max.is_nan() { f64::INFINITY } else { max };
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        self.out_min = min;
        self.out_max = max;
        self
    }

    pub fn with_integral_floor(mut self, floor: f64) -> Self {
        self.integral_floor = Some(floor);
        self
    }
}

/// PID state. Owned and mutated by exactly one worker thread.
#[derive(Debug, Clone)]
pub struct PidController {
    config: PidConfig,
    integral: f64,
    last_error: Option<f64>,
    output: f64,
}

impl PidController {
    pub fn new(config: PidConfig) -> Self {
        let mut pid = Self {
            config,
            integral: 0.0,
            last_error: None,
            output: 0.0,
        };
        pid.output = pid.clamp(0.0);
        pid
    }

    /// Run one control step against `measured` and return the clamped output.
    ///
    /// Non-finite measurements leave the state untouched and repeat the previous
    /// output.
    pub fn compute(&mut self, measured: f64) -> f64 {
        if !measured.is_finite() {
            return self.output;
        }
        let dt = self.sample_time();
        let error = self.config.setpoint - measured;

        let mut integral = self.integral + error * dt;
        if let Some(floor) = self.config.integral_floor {
            if integral < floor {
                integral = 0.0;
            }
        }
        let derivative = self
            .last_error
            .map_or(0.0, |previous| (error - previous) / dt);

        let PidTunings { kp, ki, kd } = self.config.tunings;
        let raw = kp * error + ki * integral + kd * derivative;

        self.integral = integral;
        self.last_error = Some(error);
        self.output = self.clamp(raw);
        self.output
    }

    /// Clear integrator and error history. Tunings and setpoint are kept.
    pub fn rearm(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
        self.output = self.clamp(0.0);
    }

    pub fn set_tunings(&mut self, tunings: PidTunings) {
        self.config.tunings = tunings;
    }

    pub fn set_setpoint(&mut self, setpoint: f64) {
        self.config.setpoint = setpoint;
    }

    pub fn set_sample_time(&mut self, seconds: f64) {
        if seconds.is_finite() && seconds > 0.0 {
            self.config.sample_time = seconds;
        }
    }

    pub fn set_output_limits(&mut self, min: f64, max: f64) {
        let limits = PidConfig::default().with_output_limits(min, max);
        self.config.out_min = limits.out_min;
        self.config.out_max = limits.out_max;
        self.output = self.clamp(self.output);
    }

    pub fn tunings(&self) -> PidTunings {
        self.config.tunings
    }

    pub fn setpoint(&self) -> f64 {
        self.config.setpoint
    }

    pub fn sample_time(&self) -> f64 {
        if self.config.sample_time > 0.0 {
            self.config.sample_time
        } else {
            1.0
        }
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_error(&self) -> Option<f64> {
        self.last_error
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    pub fn limits(&self) -> (f64, f64) {
        (self.config.out_min, self.config.out_max)
    }

    // Must not panic on NaN or reversed bounds, unlike `f64::clamp`.
    fn clamp(&self, value: f64) -> f64 {
        let value = if value.is_nan() { 0.0 } else { value };
        value.max(self.config.out_min).min(self.config.out_max)
    }
}
