// src/heater/mod.rs - Heater capability: stock heater or INO heater
pub mod ino;
pub mod pid;
pub mod stock;
pub mod watermark;

pub use ino::{ActiveControl, InoHeater, InoHeaterState};
pub use pid::ControlPid;
pub use stock::{StockControl, StockHeater};
pub use watermark::ControlBangBang;

use crate::autotune::AutotuneError;
use ino_shared::{HeaterCapability, TemperatureSample};
use std::sync::Arc;
use thiserror::Error;

/// Heaters are locked only for synchronous control steps and commands.
pub type SharedHeater = Arc<tokio::sync::Mutex<Heater>>;

/// Longest a power command stays valid on the board without a refresh.
pub const MAX_HEAT_TIME: f64 = 5.0;
/// Smallest power change worth a new command.
pub const PWM_DEADBAND: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HeaterError {
    #[error("Requested temperature ({target:.1}) out of range ({min:.1}:{max:.1})")]
    TargetOutOfRange { target: f64, min: f64, max: f64 },
    #[error("Command not defined for this heater")]
    NotInoHeater,
    #[error(transparent)]
    Autotune(#[from] AutotuneError),
}

/// Check a requested target against the configured range. Zero always passes.
pub fn check_target(degrees: f64, min_temp: f64, max_temp: f64) -> Result<(), HeaterError> {
    if degrees != 0.0 && (degrees < min_temp || degrees > max_temp) {
        return Err(HeaterError::TargetOutOfRange {
            target: degrees,
            min: min_temp,
            max: max_temp,
        });
    }
    Ok(())
}

/// Exponentially smoothed temperature, used for status and `can_extrude`.
#[derive(Debug, Clone)]
pub struct Smoothing {
    inv_smooth_time: f64,
    min_extrude_temp: f64,
    last_time: Option<f64>,
    pub smoothed_temp: f64,
    pub last_temp: f64,
    pub can_extrude: bool,
}

impl Smoothing {
    pub fn new(smooth_time: f64, min_extrude_temp: f64) -> Self {
        Self {
            inv_smooth_time: 1.0 / smooth_time,
            min_extrude_temp,
            last_time: None,
            smoothed_temp: 0.0,
            last_temp: 0.0,
            can_extrude: min_extrude_temp <= 0.0,
        }
    }

    pub fn update(&mut self, read_time: f64, temp: f64) {
        match self.last_time {
            Some(last) => {
                let adj_time = ((read_time - last) * self.inv_smooth_time).min(1.0);
                self.smoothed_temp += (temp - self.smoothed_temp) * adj_time;
            }
            None => self.smoothed_temp = temp,
        }
        self.last_time = Some(read_time);
        self.last_temp = temp;
        self.can_extrude = self.smoothed_temp >= self.min_extrude_temp;
    }
}

/// A configured heater. The INO variant exists only when the section paired
/// the INO heater with the INO sensor.
#[derive(Debug)]
pub enum Heater {
    Stock(StockHeater),
    Ino(InoHeater),
}

impl Heater {
    pub fn name(&self) -> &str {
        match self {
            Heater::Stock(h) => h.name(),
            Heater::Ino(h) => h.name(),
        }
    }

    pub fn set_temp(&mut self, degrees: f64) -> Result<(), HeaterError> {
        match self {
            Heater::Stock(h) => h.set_temp(degrees),
            Heater::Ino(h) => h.set_temp(degrees),
        }
    }

    pub fn as_ino(&self) -> Result<&InoHeater, HeaterError> {
        match self {
            Heater::Ino(h) => Ok(h),
            Heater::Stock(_) => Err(HeaterError::NotInoHeater),
        }
    }

    pub fn as_ino_mut(&mut self) -> Result<&mut InoHeater, HeaterError> {
        match self {
            Heater::Ino(h) => Ok(h),
            Heater::Stock(_) => Err(HeaterError::NotInoHeater),
        }
    }

    pub fn is_ino(&self) -> bool {
        matches!(self, Heater::Ino(_))
    }

    pub fn status(&self) -> serde_json::Value {
        match self {
            Heater::Stock(h) => h.status(),
            Heater::Ino(h) => h.status(),
        }
    }
}

impl HeaterCapability for Heater {
    fn compute_power(&mut self, sample: &TemperatureSample, target: f64, eventtime: f64) -> f64 {
        match self {
            Heater::Stock(h) => h.compute_power(sample, target, eventtime),
            Heater::Ino(h) => h.compute_power(sample, target, eventtime),
        }
    }

    fn target_temp(&self) -> f64 {
        match self {
            Heater::Stock(h) => h.target_temp(),
            Heater::Ino(h) => h.target_temp(),
        }
    }
}
