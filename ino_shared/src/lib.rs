// ino_shared: contracts shared by the host integration and the simulator

pub mod serial_interface;
pub mod time;

pub use serial_interface::Connector;
pub use time::{Clock, ManualClock, MonotonicClock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Scale between the configured PID gains and a 0.0-1.0 power fraction.
pub const PID_PARAM_BASE: f64 = 255.0;

/// Lowest temperature a sensor can physically report.
pub const ABSOLUTE_ZERO: f64 = -273.15;

// --- Shared data types ---

/// One temperature reading as published by a sensor.
///
/// A sample is never mutated once created; newer samples supersede it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureSample {
    /// Host monotonic time (seconds) of the reading.
    pub timestamp: f64,
    /// Temperature in °C.
    pub value: f64,
    pub valid: bool,
}

impl TemperatureSample {
    pub fn reading(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value, valid: true }
    }

    /// A failed reading. Callers keep the timestamp of the last good reading so
    /// the sample ages out naturally.
    pub fn failed(timestamp: f64, value: f64) -> Self {
        Self { timestamp, value, valid: false }
    }

    /// Placeholder published before any reading exists.
    pub fn missing() -> Self {
        Self::failed(f64::NEG_INFINITY, 0.0)
    }

    pub fn age(&self, eventtime: f64) -> f64 {
        eventtime - self.timestamp
    }
}

/// PID gains in host units (see [`PID_PARAM_BASE`]).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

impl fmt::Display for PidGains {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kp={:.3} Ki={:.3} Kd={:.3}", self.kp, self.ki, self.kd)
    }
}

/// Runtime safety faults raised by a heater and reported to the host.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeaterFault {
    #[error("sensor lost: last valid reading is {age:.2}s old")]
    SensorLost { age: f64 },
    #[error("temperature {temp:.1} exceeds max_temp {max_temp:.1}")]
    OverTemperature { temp: f64, max_temp: f64 },
    #[error("link to {port} abandoned after {attempts} failed connection attempts")]
    LinkAbandoned { port: String, attempts: u32 },
}

// --- Host collaborator traits ---

/// Generic heater capability the host scheduler drives once per control tick.
pub trait HeaterCapability: Send {
    /// Compute the power fraction (0.0-1.0) for this tick. `eventtime` is the
    /// scheduler's monotonic time and is used to judge sample staleness.
    fn compute_power(&mut self, sample: &TemperatureSample, target: f64, eventtime: f64) -> f64;

    fn target_temp(&self) -> f64;
}

/// Anything that wants every sample a sensor publishes.
pub trait SensorConsumer: Send + Sync {
    fn on_sample(&self, sample: &TemperatureSample);
}

/// The host's error/status channel for runtime faults.
pub trait FaultReporter: Send + Sync {
    fn report(&self, source: &str, fault: &HeaterFault);
    fn clear(&self, source: &str);
}

/// A printer object answering the host's object-query API.
#[async_trait]
pub trait StatusObject: Send + Sync {
    async fn get_status(&self, eventtime: f64) -> serde_json::Value;
}
