use super::{check_target, ControlBangBang, ControlPid, HeaterError, Smoothing};
use crate::config::{ControlType, HeaterConfig};
use ino_shared::{HeaterCapability, TemperatureSample};
use serde_json::json;

#[derive(Debug, Clone)]
pub enum StockControl {
    Pid(ControlPid),
    Watermark(ControlBangBang),
}

/// The host's own heater, used whenever a section does not select the INO
/// heater. Output goes to the host's PWM pin, which is not modelled here.
#[derive(Debug)]
pub struct StockHeater {
    name: String,
    min_temp: f64,
    max_temp: f64,
    max_power: f64,
    control: StockControl,
    smoothing: Smoothing,
    target: f64,
    last_power: f64,
    last_sample_timestamp: Option<f64>,
}

impl StockHeater {
    pub fn new(name: &str, config: &HeaterConfig) -> Self {
        let control = match config.control {
            ControlType::Pid => StockControl::Pid(ControlPid::new(
                config.pid_gains(),
                config.max_power,
                config.smooth_time,
            )),
            ControlType::Watermark => {
                StockControl::Watermark(ControlBangBang::new(config.max_power, config.max_delta))
            }
        };
        tracing::info!("Heater {} uses the stock {} control", name, config.control);
        Self {
            name: name.to_string(),
            min_temp: config.min_temp,
            max_temp: config.max_temp,
            max_power: config.max_power,
            control,
            smoothing: Smoothing::new(config.smooth_time, config.min_extrude_temp()),
            target: 0.0,
            last_power: 0.0,
            last_sample_timestamp: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> &StockControl {
        &self.control
    }

    pub fn set_temp(&mut self, degrees: f64) -> Result<(), HeaterError> {
        check_target(degrees, self.min_temp, self.max_temp)?;
        self.target = degrees;
        Ok(())
    }

    pub fn check_busy(&self) -> bool {
        let smoothed = self.smoothing.smoothed_temp;
        match &self.control {
            StockControl::Pid(pid) => pid.check_busy(smoothed, self.target),
            StockControl::Watermark(bang) => bang.check_busy(smoothed, self.target),
        }
    }

    pub fn status(&self) -> serde_json::Value {
        json!({
            "temperature": (self.smoothing.smoothed_temp * 100.0).round() / 100.0,
            "target": self.target,
            "power": self.last_power,
            "can_extrude": self.smoothing.can_extrude,
        })
    }
}

impl HeaterCapability for StockHeater {
    fn compute_power(&mut self, sample: &TemperatureSample, target: f64, _eventtime: f64) -> f64 {
        // Sensor supervision belongs to the host's verify_heater for stock heaters.
        if !sample.valid {
            self.last_power = 0.0;
            return 0.0;
        }
        if self.last_sample_timestamp == Some(sample.timestamp) {
            return self.last_power;
        }
        self.last_sample_timestamp = Some(sample.timestamp);
        self.smoothing.update(sample.timestamp, sample.value);
        let power = match &mut self.control {
            StockControl::Pid(pid) => pid.update(sample.timestamp, sample.value, target),
            StockControl::Watermark(bang) => bang.update(sample.value, target),
        };
        self.last_power = if target <= 0.0 { 0.0 } else { power.clamp(0.0, self.max_power) };
        self.last_power
    }

    fn target_temp(&self) -> f64 {
        self.target
    }
}
