//! # Host configuration
//!
//! Heaters are declared one per `[heaters.<name>]` table. A heater is routed to
//! the INO path when `heater_type` names the INO heater; the INO sensor must
//! then be its `sensor_type`.
//!
//! ```toml
//! [printer]
//! name = "pla-printer"
//!
//! [heaters.extruder]
//! sensor_type = "PLA_INO_SENSOR"
//! heater_type = "PLA_INO_HEATER"
//! serial = "/dev/ttyACM1"
//! pid_Kp = 13.41
//! pid_Ki = 30.91
//! pid_Kd = 1.46
//! min_temp = 10
//! max_temp = 450
//!
//! [gcode_tracker]
//! output_dir = "/var/lib/ino-host/gcode"
//! ```

use ino_shared::{PidGains, ABSOLUTE_ZERO};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const INO_SENSOR_TYPE: &str = "PLA_INO_SENSOR";
pub const INO_HEATER_TYPE: &str = "PLA_INO_HEATER";

/// Shortest cadence the INO board can answer telemetry queries at.
pub const MIN_REPORT_TIME: f64 = 0.1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("[heaters.{section}] invalid range: {reason}")]
    InvalidRange { section: String, reason: String },
    #[error("[heaters.{section}] {option} = {value} is out of bounds ({bound})")]
    OutOfBounds {
        section: String,
        option: &'static str,
        value: f64,
        bound: &'static str,
    },
    #[error(
        "[heaters.{section}] heater_type {heater_type} requires sensor_type PLA_INO_SENSOR, found {sensor_type}"
    )]
    IncompatiblePairing {
        section: String,
        heater_type: String,
        sensor_type: String,
    },
    #[error("[heaters.{section}] control '{control}' is not supported by PLA_INO_HEATER")]
    UnsupportedControl { section: String, control: ControlType },
    #[error("[heaters.{section}] sensor_type PLA_INO_SENSOR requires a serial port")]
    MissingSerial { section: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub heaters: BTreeMap<String, HeaterConfig>,
    #[serde(default)]
    pub gcode_tracker: GcodeTrackerConfig,
    #[serde(default)]
    pub web: WebConfig,
}

impl Config {
    /// Check every heater section. Pairing is checked before anything else
    /// touches a serial port.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, heater) in &self.heaters {
            heater.validate(name)?;
            heater.heater_path(name)?;
        }
        if self.gcode_tracker.batch_size == 0 {
            return Err(ConfigError::OutOfBounds {
                section: "gcode_tracker".to_string(),
                option: "batch_size",
                value: 0.0,
                bound: ">= 1",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcodeTrackerConfig {
    /// Directory for CSV captures; capture is off when unset.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for GcodeTrackerConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default)]
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlType {
    #[default]
    Pid,
    Watermark,
}

impl std::fmt::Display for ControlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlType::Pid => f.write_str("pid"),
            ControlType::Watermark => f.write_str("watermark"),
        }
    }
}

/// Which heater implementation a section resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterPath {
    Ino,
    Stock,
}

/// One `[heaters.<name>]` section. Immutable once loaded.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaterConfig {
    pub sensor_type: String,
    #[serde(default)]
    pub heater_type: Option<String>,
    #[serde(default)]
    pub control: ControlType,
    #[serde(rename = "pid_Kp", default = "default_kp")]
    pub pid_kp: f64,
    #[serde(rename = "pid_Ki", default = "default_ki")]
    pub pid_ki: f64,
    #[serde(rename = "pid_Kd", default = "default_kd")]
    pub pid_kd: f64,
    pub min_temp: f64,
    pub max_temp: f64,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_report_time")]
    pub report_time: f64,
    #[serde(default = "default_max_power")]
    pub max_power: f64,
    #[serde(default = "default_smooth_time")]
    pub smooth_time: f64,
    /// Unset means 170, which is not range checked.
    #[serde(default)]
    pub min_extrude_temp: Option<f64>,
    #[serde(default = "default_max_delta")]
    pub max_delta: f64,
    #[serde(default = "default_tune_delta")]
    pub tune_delta: f64,
    #[serde(default = "default_tune_timeout")]
    pub tune_timeout: f64,
}

impl HeaterConfig {
    /// An INO heater section with every optional field at its default.
    pub fn ino(serial: &str, min_temp: f64, max_temp: f64) -> Self {
        Self {
            sensor_type: INO_SENSOR_TYPE.to_string(),
            heater_type: Some(INO_HEATER_TYPE.to_string()),
            control: ControlType::Pid,
            pid_kp: default_kp(),
            pid_ki: default_ki(),
            pid_kd: default_kd(),
            min_temp,
            max_temp,
            serial: Some(serial.to_string()),
            baud: default_baud(),
            report_time: default_report_time(),
            max_power: default_max_power(),
            smooth_time: default_smooth_time(),
            min_extrude_temp: None,
            max_delta: default_max_delta(),
            tune_delta: default_tune_delta(),
            tune_timeout: default_tune_timeout(),
        }
    }

    pub fn pid_gains(&self) -> PidGains {
        PidGains::new(self.pid_kp, self.pid_ki, self.pid_kd)
    }

    pub fn min_extrude_temp(&self) -> f64 {
        self.min_extrude_temp.unwrap_or_else(default_min_extrude_temp)
    }

    pub fn uses_ino_sensor(&self) -> bool {
        self.sensor_type == INO_SENSOR_TYPE
    }

    /// Resolve the heater implementation for this section.
    pub fn heater_path(&self, section: &str) -> Result<HeaterPath, ConfigError> {
        match self.heater_type.as_deref() {
            Some(INO_HEATER_TYPE) => {
                if !self.uses_ino_sensor() {
                    return Err(ConfigError::IncompatiblePairing {
                        section: section.to_string(),
                        heater_type: INO_HEATER_TYPE.to_string(),
                        sensor_type: self.sensor_type.clone(),
                    });
                }
                if self.control != ControlType::Pid {
                    return Err(ConfigError::UnsupportedControl {
                        section: section.to_string(),
                        control: self.control,
                    });
                }
                Ok(HeaterPath::Ino)
            }
            _ => Ok(HeaterPath::Stock),
        }
    }

    /// Every numeric option that must be a finite number.
    fn numeric_options(&self) -> [(&'static str, Option<f64>); 12] {
        [
            ("pid_Kp", Some(self.pid_kp)),
            ("pid_Ki", Some(self.pid_ki)),
            ("pid_Kd", Some(self.pid_kd)),
            ("min_temp", Some(self.min_temp)),
            ("max_temp", Some(self.max_temp)),
            ("report_time", Some(self.report_time)),
            ("max_power", Some(self.max_power)),
            ("smooth_time", Some(self.smooth_time)),
            ("min_extrude_temp", self.min_extrude_temp),
            ("max_delta", Some(self.max_delta)),
            ("tune_delta", Some(self.tune_delta)),
            ("tune_timeout", Some(self.tune_timeout)),
        ]
    }

    /// Check the section. Gain bounds and the report time floor belong to the
    /// INO board and only apply when the section resolves to the INO path.
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        let out_of_bounds = |option: &'static str, value: f64, bound: &'static str| {
            Err(ConfigError::OutOfBounds {
                section: section.to_string(),
                option,
                value,
                bound,
            })
        };
        let invalid_range = |reason: String| {
            Err(ConfigError::InvalidRange {
                section: section.to_string(),
                reason,
            })
        };

        for (option, value) in self.numeric_options() {
            if let Some(value) = value.filter(|v| !v.is_finite()) {
                return out_of_bounds(option, value, "finite");
            }
        }
        if self.min_temp < ABSOLUTE_ZERO {
            return out_of_bounds("min_temp", self.min_temp, ">= -273.15");
        }
        if self.min_temp >= self.max_temp {
            return invalid_range(format!(
                "min_temp {} must be below max_temp {}",
                self.min_temp, self.max_temp
            ));
        }
        if self.heater_path(section)? == HeaterPath::Ino {
            if !(0.0..=40.0).contains(&self.pid_kp) {
                return out_of_bounds("pid_Kp", self.pid_kp, "0..=40");
            }
            if !(0.0..=80.0).contains(&self.pid_ki) {
                return out_of_bounds("pid_Ki", self.pid_ki, "0..=80");
            }
            if !(0.0..=10.0).contains(&self.pid_kd) {
                return out_of_bounds("pid_Kd", self.pid_kd, "0..=10");
            }
            if self.report_time < MIN_REPORT_TIME {
                return out_of_bounds("report_time", self.report_time, ">= 0.1");
            }
        } else {
            for (option, value) in [("pid_Kp", self.pid_kp), ("pid_Ki", self.pid_ki), ("pid_Kd", self.pid_kd)] {
                if value < 0.0 {
                    return out_of_bounds(option, value, ">= 0");
                }
            }
            if self.report_time <= 0.0 {
                return out_of_bounds("report_time", self.report_time, "> 0");
            }
        }
        if !(self.max_power > 0.0 && self.max_power <= 1.0) {
            return out_of_bounds("max_power", self.max_power, "0 < x <= 1");
        }
        if self.smooth_time <= 0.0 {
            return out_of_bounds("smooth_time", self.smooth_time, "> 0");
        }
        if let Some(min_extrude) = self.min_extrude_temp {
            if min_extrude < self.min_temp || min_extrude > self.max_temp {
                return invalid_range(format!(
                    "min_extrude_temp {} must lie within {}..={}",
                    min_extrude, self.min_temp, self.max_temp
                ));
            }
        }
        if self.max_delta <= 0.0 {
            return out_of_bounds("max_delta", self.max_delta, "> 0");
        }
        if self.tune_delta <= 0.0 {
            return out_of_bounds("tune_delta", self.tune_delta, "> 0");
        }
        if self.tune_timeout <= 0.0 {
            return out_of_bounds("tune_timeout", self.tune_timeout, "> 0");
        }
        if self.baud == 0 {
            return out_of_bounds("baud", 0.0, ">= 1");
        }
        if self.uses_ino_sensor() && self.serial.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingSerial {
                section: section.to_string(),
            });
        }
        Ok(())
    }
}

fn default_kp() -> f64 { 13.41 }
fn default_ki() -> f64 { 30.91 }
fn default_kd() -> f64 { 1.46 }
fn default_baud() -> u32 { 115200 }
fn default_report_time() -> f64 { MIN_REPORT_TIME }
fn default_max_power() -> f64 { 1.0 }
fn default_smooth_time() -> f64 { 1.0 }
fn default_min_extrude_temp() -> f64 { 170.0 }
fn default_max_delta() -> f64 { 2.0 }
fn default_tune_delta() -> f64 { 5.0 }
fn default_tune_timeout() -> f64 { 1200.0 }
fn default_batch_size() -> usize { 1000 }

/// Parse a configuration document and validate it.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_config(&contents).inspect_err(|e| {
            tracing::error!("Invalid config '{}': {}", path.display(), e);
        }),
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path.display(), e);
            Err(ConfigError::Io(e))
        }
    }
}
