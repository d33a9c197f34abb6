//! Host commands for INO heaters.
//!
//! Every dispatched line is first noted by the gcode tracker, then parsed as
//! `NAME KEY=VALUE ...`. Heater commands pick their heater with `HEATER=<name>`
//! or `T=<index>` and default to `extruder`.

use crate::gcode_tracker::GcodeTracker;
use crate::heater::{HeaterError, SharedHeater};
use crate::link::DeviceCommand;
use crate::sensor::SensorHandle;
use ino_shared::{Clock, PidGains};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

pub const DEFAULT_HEATER: &str = "extruder";
/// How long a console query waits for the board to answer.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("{command}: missing parameter {param}")]
    MissingParameter { command: String, param: &'static str },
    #[error("{command}: invalid value '{value}' for {param}")]
    InvalidParameter {
        command: String,
        param: &'static str,
        value: String,
    },
    #[error("Unknown heater '{0}'")]
    UnknownHeater(String),
    #[error(transparent)]
    Heater(#[from] HeaterError),
}

/// One parsed command line. Parameter keys are upper-cased, values keep
/// their case with surrounding quotes removed.
#[derive(Debug, Clone, PartialEq)]
pub struct GcodeCommand {
    pub name: String,
    params: BTreeMap<String, String>,
}

impl GcodeCommand {
    /// Returns `None` for blank lines and pure comments.
    pub fn parse(line: &str) -> Option<Self> {
        let code = line.split(';').next().unwrap_or_default().trim();
        let mut words = code.split_whitespace();
        let name = words.next()?.to_ascii_uppercase();
        let params = words
            .filter_map(|word| word.split_once('='))
            .map(|(key, value)| (key.to_ascii_uppercase(), value.trim_matches('"').to_string()))
            .collect();
        Some(Self { name, params })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    fn invalid(&self, param: &'static str, value: &str) -> CommandError {
        CommandError::InvalidParameter {
            command: self.name.clone(),
            param,
            value: value.to_string(),
        }
    }

    pub fn get_float(&self, param: &'static str, default: Option<f64>) -> Result<f64, CommandError> {
        match (self.get(param), default) {
            (Some(raw), _) => raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| self.invalid(param, raw)),
            (None, Some(default)) => Ok(default),
            (None, None) => Err(CommandError::MissingParameter {
                command: self.name.clone(),
                param,
            }),
        }
    }

    /// A required float parameter that must not be negative.
    pub fn get_non_negative(&self, param: &'static str) -> Result<f64, CommandError> {
        let value = self.get_float(param, None)?;
        if value < 0.0 {
            return Err(self.invalid(param, &value.to_string()));
        }
        Ok(value)
    }

    pub fn get_uint(&self, param: &'static str) -> Result<u32, CommandError> {
        let raw = self.get(param).ok_or_else(|| CommandError::MissingParameter {
            command: self.name.clone(),
            param,
        })?;
        raw.parse::<u32>().map_err(|_| self.invalid(param, raw))
    }

    /// Heater named by `HEATER=`, else `T=<n>`, else the default extruder.
    pub fn heater_name(&self) -> Result<String, CommandError> {
        if let Some(name) = self.get("HEATER") {
            return Ok(name.to_string());
        }
        match self.get("T") {
            None => Ok(DEFAULT_HEATER.to_string()),
            Some(raw) => match raw.parse::<u32>() {
                Ok(0) => Ok(DEFAULT_HEATER.to_string()),
                Ok(n) => Ok(format!("{}{}", DEFAULT_HEATER, n)),
                Err(_) => Err(self.invalid("T", raw)),
            },
        }
    }
}

/// Routes command lines to heaters and INO boards.
pub struct GcodeDispatcher {
    heaters: BTreeMap<String, SharedHeater>,
    sensors: BTreeMap<String, SensorHandle>,
    tracker: Arc<GcodeTracker>,
    clock: Arc<dyn Clock>,
    reply_timeout: Duration,
}

impl GcodeDispatcher {
    pub fn new(
        heaters: BTreeMap<String, SharedHeater>,
        sensors: BTreeMap<String, SensorHandle>,
        tracker: Arc<GcodeTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            heaters,
            sensors,
            tracker,
            clock,
            reply_timeout: REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn tracker(&self) -> &Arc<GcodeTracker> {
        &self.tracker
    }

    /// Run one line and return the text shown to the user.
    pub async fn execute(&self, line: &str) -> Result<String, CommandError> {
        let Some(command) = GcodeCommand::parse(line) else {
            return Ok(String::new());
        };
        let now = self.clock.monotonic();
        self.tracker.record(line.trim(), now);
        tracing::debug!("gcode: {}", line.trim());

        match command.name.as_str() {
            "TUNE" | "INO_PID_TUNE" => {
                let target = command.get_float("PID", None)?;
                let heater = self.heater(&command)?;
                let mut guard = heater.lock().await;
                let ino = guard.as_ino_mut()?;
                ino.start_autotune(target, now)?;
                Ok(format!("Autotune of {} started towards {:.1}", ino.name(), target))
            }
            "TUNE_ABORT" => {
                let heater = self.heater(&command)?;
                let mut guard = heater.lock().await;
                let ino = guard.as_ino_mut()?;
                ino.abort_autotune(now)?;
                Ok(format!("Autotune of {} aborted", ino.name()))
            }
            "READ_TUNED_VALUES" => {
                let heater = self.heater(&command)?;
                let guard = heater.lock().await;
                let ino = guard.as_ino()?;
                Ok(match ino.autotune().tuned_gains() {
                    Some(gains) => format!("{}: {}", ino.name(), gains),
                    None => format!("{}: no successful run", ino.name()),
                })
            }
            // Runtime gains are not held to the config range, so tuned values apply as reported.
            "SET_PID_VALUES" | "INO_SET_PID_VALUES" => {
                let gains = PidGains::new(
                    command.get_non_negative("KP")?,
                    command.get_non_negative("KI")?,
                    command.get_non_negative("KD")?,
                );
                let heater = self.heater(&command)?;
                let mut guard = heater.lock().await;
                let ino = guard.as_ino_mut()?;
                ino.set_pid_gains(gains);
                Ok(format!("{}: PID set to {}", ino.name(), gains))
            }
            "SET_HEATER_TEMPERATURE" => {
                let target = command.get_float("TARGET", Some(0.0))?;
                let heater = self.heater(&command)?;
                let mut guard = heater.lock().await;
                guard.set_temp(target)?;
                Ok(format!("{}: target {:.1}", guard.name(), target))
            }
            "INO_FREQUENCY" => {
                let hz = command.get_uint("F")?;
                self.device_command(&command, DeviceCommand::SetFrequency(hz)).await
            }
            "INO_RESET_ERROR_FLAGS" => {
                self.device_command(&command, DeviceCommand::ResetErrorFlags).await
            }
            "INO_FIRMWARE_VERSION" => self.device_query(&command, DeviceCommand::FirmwareVersion).await,
            "INO_READ_PID_VALUES" => self.device_query(&command, DeviceCommand::ReadPidValues).await,
            "INO_DEBUG_OUT" => {
                self.ino_check(&command).await?;
                let sensor = self.sensor(&command)?;
                Ok(sensor
                    .debug_output()
                    .unwrap_or_else(|| "INO debug output:\nno telemetry received yet".to_string()))
            }
            _ => Err(CommandError::Unknown(command.name.clone())),
        }
    }

    fn heater(&self, command: &GcodeCommand) -> Result<&SharedHeater, CommandError> {
        let name = command.heater_name()?;
        self.heaters.get(&name).ok_or(CommandError::UnknownHeater(name))
    }

    fn sensor(&self, command: &GcodeCommand) -> Result<&SensorHandle, CommandError> {
        let name = command.heater_name()?;
        self.sensors.get(&name).ok_or(CommandError::UnknownHeater(name))
    }

    /// Fails unless the addressed heater runs on an INO board.
    async fn ino_check(&self, command: &GcodeCommand) -> Result<(), CommandError> {
        let heater = self.heater(command)?;
        heater.lock().await.as_ino()?;
        Ok(())
    }

    async fn device_command(&self, command: &GcodeCommand, device: DeviceCommand) -> Result<String, CommandError> {
        self.ino_check(command).await?;
        let sensor = self.sensor(command)?;
        sensor.send(device.clone());
        Ok(format!("{}: sent '{}'", sensor.name(), device))
    }

    /// Send a query and wait for the console line that answers it. Device
    /// errors and other output arriving meanwhile are skipped.
    async fn device_query(&self, command: &GcodeCommand, device: DeviceCommand) -> Result<String, CommandError> {
        self.ino_check(command).await?;
        let sensor = self.sensor(command)?;
        let prefix = device.reply_prefix();
        let mut console = sensor.subscribe_console();
        sensor.send(device.clone());
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        loop {
            match tokio::time::timeout_at(deadline, console.recv()).await {
                Ok(Ok(line)) if prefix.is_none_or(|p| line.starts_with(p)) => {
                    return Ok(format!("{}: {}", sensor.name(), line));
                }
                Ok(Ok(line)) => tracing::debug!("INO {}: '{}' does not answer '{}'", sensor.name(), line, device),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!("INO {}: console skipped {} lines", sensor.name(), skipped);
                }
                Ok(Err(RecvError::Closed)) => {
                    tracing::warn!("INO {}: console closed", sensor.name());
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(format!("{}: sent '{}', no reply", sensor.name(), device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params() {
        let command = GcodeCommand::parse("set_pid_values heater=extruder Kp=20 ki=\"1.5\" ; note").unwrap();
        assert_eq!(command.name, "SET_PID_VALUES");
        assert_eq!(command.get("HEATER"), Some("extruder"));
        assert_eq!(command.get_float("KP", None).unwrap(), 20.0);
        assert_eq!(command.get_float("KI", None).unwrap(), 1.5);
        assert!(matches!(
            command.get_float("KD", None),
            Err(CommandError::MissingParameter { param: "KD", .. })
        ));
        assert!(GcodeCommand::parse("   ; only a comment").is_none());
    }

    #[test]
    fn test_heater_selection() {
        let pick = |line: &str| GcodeCommand::parse(line).unwrap().heater_name();
        assert_eq!(pick("TUNE PID=200").unwrap(), "extruder");
        assert_eq!(pick("TUNE PID=200 T=0").unwrap(), "extruder");
        assert_eq!(pick("TUNE PID=200 T=2").unwrap(), "extruder2");
        assert_eq!(pick("TUNE PID=200 HEATER=hotend").unwrap(), "hotend");
        assert!(pick("TUNE T=x").is_err());
    }

    #[test]
    fn test_gain_parameters() {
        let command = GcodeCommand::parse("SET_PID_VALUES KP=-1 KI=1 KD=114").unwrap();
        assert!(matches!(
            command.get_non_negative("KP"),
            Err(CommandError::InvalidParameter { param: "KP", .. })
        ));
        assert_eq!(command.get_non_negative("KI").unwrap(), 1.0);
        assert_eq!(command.get_non_negative("KD").unwrap(), 114.0);
    }
}
