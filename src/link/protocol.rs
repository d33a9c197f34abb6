//! INO board command set and telemetry parsing.

use ino_shared::PidGains;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Commands understood by the INO board.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    QueryTelemetry,
    SetTarget(f64),
    SetPower(f64),
    SetGains(PidGains),
    ResetErrorFlags,
    SetFrequency(u32),
    FirmwareVersion,
    ReadPidValues,
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::QueryTelemetry => f.write_str("d"),
            DeviceCommand::SetTarget(deg) => write!(f, "s {:?}", deg),
            DeviceCommand::SetPower(power) => write!(f, "pwr {:.3}", power),
            DeviceCommand::SetGains(g) => write!(f, "kp {:?};ki {:?};kd {:?}", g.kp, g.ki, g.kd),
            DeviceCommand::ResetErrorFlags => f.write_str("q"),
            DeviceCommand::SetFrequency(hz) => write!(f, "f {}", hz),
            DeviceCommand::FirmwareVersion => f.write_str("v"),
            DeviceCommand::ReadPidValues => f.write_str("a"),
        }
    }
}

impl DeviceCommand {
    /// Start of the console line that answers a query.
    pub fn reply_prefix(&self) -> Option<&'static str> {
        match self {
            DeviceCommand::FirmwareVersion => Some("version:"),
            DeviceCommand::ReadPidValues => Some("kp:"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("telemetry field '{0}' is not a key:value pair")]
    BadField(String),
    #[error("telemetry frame has no T_a field")]
    MissingTemperature,
    #[error("telemetry temperature '{0}' is not an integer")]
    BadTemperature(String),
    #[error("telemetry tick '{0}' is not an integer")]
    BadTick(String),
}

const FLAG_LABELS: [&str; 5] = [
    "open circuit",
    "no heartbeat",
    "heating slow",
    "heating fast",
    "no temp read",
];

/// Device error flags, a zero-filled six digit string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceFlags {
    raw: String,
}

impl DeviceFlags {
    pub fn parse(field: &str) -> Self {
        Self {
            raw: format!("{:0>6}", field.trim()),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn bit(&self, index: usize) -> bool {
        self.raw.as_bytes().get(index) == Some(&b'1')
    }

    pub fn open_circuit(&self) -> bool {
        self.bit(0)
    }

    pub fn no_temp_read(&self) -> bool {
        self.bit(4)
    }

    /// Flags that make the reported temperature meaningless.
    pub fn invalidates_reading(&self) -> bool {
        self.open_circuit() || self.no_temp_read()
    }

    pub fn active(&self) -> Vec<&'static str> {
        FLAG_LABELS
            .iter()
            .enumerate()
            .filter(|(i, _)| self.bit(*i))
            .map(|(_, label)| *label)
            .collect()
    }

    pub fn any(&self) -> bool {
        !self.active().is_empty()
    }
}

impl Default for DeviceFlags {
    fn default() -> Self {
        Self::parse("0")
    }
}

impl fmt::Display for DeviceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)?;
        for label in self.active() {
            write!(f, " | {}", label)?;
        }
        Ok(())
    }
}

/// One decoded telemetry frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Telemetry {
    pub tick: u64,
    /// °C, converted from the board's hundredths.
    pub temperature: f64,
    pub flags: DeviceFlags,
    /// Every field as sent, in order.
    pub fields: Vec<(String, String)>,
}

impl Telemetry {
    /// Field values joined by commas, the board's debug line.
    pub fn debug_line(&self) -> String {
        self.fields
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Telemetry(Telemetry),
    DeviceError(String),
    Console(String),
}

pub fn is_telemetry(frame: &str) -> bool {
    frame.starts_with("tick:")
}

/// Sort a frame into telemetry, a device error or console output.
pub fn classify(frame: &str) -> Result<Inbound, ProtocolError> {
    if is_telemetry(frame) {
        parse_telemetry(frame).map(Inbound::Telemetry)
    } else if frame.starts_with("ERROR") {
        Ok(Inbound::DeviceError(frame.to_string()))
    } else {
        Ok(Inbound::Console(frame.to_string()))
    }
}

pub fn parse_telemetry(frame: &str) -> Result<Telemetry, ProtocolError> {
    let mut fields = Vec::new();
    for pair in frame.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| ProtocolError::BadField(pair.to_string()))?;
        fields.push((key.trim().to_string(), value.trim().to_string()));
    }
    let field = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    let tick_raw = field("tick").unwrap_or_default();
    let tick = tick_raw
        .parse::<u64>()
        .map_err(|_| ProtocolError::BadTick(tick_raw.to_string()))?;
    let centi_raw = field("T_a").ok_or(ProtocolError::MissingTemperature)?;
    let centi = centi_raw
        .parse::<i64>()
        .map_err(|_| ProtocolError::BadTemperature(centi_raw.to_string()))?;
    let flags = field("err").map(DeviceFlags::parse).unwrap_or_default();

    Ok(Telemetry {
        tick,
        temperature: centi as f64 / 100.0,
        flags,
        fields,
    })
}
