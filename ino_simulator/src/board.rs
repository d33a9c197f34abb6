//! Simulated INO controller board: command handling and telemetry replies.

use crate::thermal::ThermalModel;
use ino_shared::PidGains;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::time::Instant;

pub const FIRMWARE_VERSION: &str = "ino-sim 1.0.0";

/// Knobs a test flips to misbehave like real hardware.
#[derive(Debug, Default)]
pub struct SimControls {
    offline: AtomicBool,
    mute: AtomicBool,
    malformed: AtomicBool,
    garbage: AtomicBool,
    chatter: AtomicBool,
    connects: AtomicU32,
    generation: AtomicU64,
}

impl SimControls {
    /// Refuse new connections.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Stop answering telemetry queries.
    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::SeqCst);
    }

    /// Answer telemetry queries without a temperature field.
    pub fn set_malformed(&self, malformed: bool) {
        self.malformed.store(malformed, Ordering::SeqCst);
    }

    /// Prefix every reply with a non-UTF-8 frame.
    pub fn set_garbage(&self, garbage: bool) {
        self.garbage.store(garbage, Ordering::SeqCst);
    }

    /// Emit an unsolicited device error ahead of every query reply.
    pub fn set_chatter(&self, chatter: bool) {
        self.chatter.store(chatter, Ordering::SeqCst);
    }

    /// Drop every open link; the host sees the stream close on its next write.
    pub fn drop_links(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop every open link and refuse reconnects.
    pub fn unplug(&self) {
        self.set_offline(true);
        self.drop_links();
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn mute(&self) -> bool {
        self.mute.load(Ordering::SeqCst)
    }

    pub(crate) fn malformed(&self) -> bool {
        self.malformed.load(Ordering::SeqCst)
    }

    pub(crate) fn garbage(&self) -> bool {
        self.garbage.load(Ordering::SeqCst)
    }

    fn chatter(&self) -> bool {
        self.chatter.load(Ordering::SeqCst)
    }
}

/// Board state behind the serial link.
#[derive(Debug)]
pub struct BoardState {
    pub model: ThermalModel,
    pub target: f64,
    pub power: f64,
    pub gains: PidGains,
    pub frequency: u32,
    /// Six digit error flag string as reported in telemetry.
    pub error_flags: String,
    pub tick: u64,
    last_step: Option<Instant>,
}

impl BoardState {
    pub fn new(model: ThermalModel) -> Self {
        Self {
            model,
            target: 0.0,
            power: 0.0,
            gains: PidGains::new(0.0, 0.0, 0.0),
            frequency: 0,
            error_flags: "000000".to_string(),
            tick: 0,
            last_step: None,
        }
    }

    /// Run the thermal model up to now at the last commanded power.
    fn advance(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_step {
            self.model.step(self.power, (now - last).as_secs_f64());
        }
        self.last_step = Some(now);
    }

    /// Handle one frame of `;` separated commands, returning the reply frames.
    pub fn handle(&mut self, frame: &str, controls: &SimControls) -> Vec<String> {
        let mut replies = Vec::new();
        for command in frame.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            let mut words = command.split_whitespace();
            let name = words.next().unwrap_or_default();
            let arg = words.next();
            match (name, arg) {
                ("d", _) => {
                    self.advance();
                    self.tick += 1;
                    if controls.mute() {
                        continue;
                    }
                    if controls.malformed() {
                        replies.push(format!("tick:{}, err:{}", self.tick, self.error_flags));
                        continue;
                    }
                    let centi = (self.model.measured() * 100.0).round() as i64;
                    replies.push(format!(
                        "tick:{}, T_a:{}, T_set:{}, pwr:{:.3}, err:{}",
                        self.tick, centi, self.target, self.power, self.error_flags
                    ));
                }
                ("s", Some(value)) => match value.parse::<f64>() {
                    Ok(target) => self.target = target,
                    Err(_) => replies.push(format!("ERROR bad target '{}'", value)),
                },
                ("pwr", Some(value)) => match value.parse::<f64>() {
                    Ok(power) => {
                        self.advance();
                        self.power = power.clamp(0.0, 1.0);
                    }
                    Err(_) => replies.push(format!("ERROR bad power '{}'", value)),
                },
                ("kp" | "ki" | "kd", Some(value)) => match value.parse::<f64>() {
                    Ok(gain) => match name {
                        "kp" => self.gains.kp = gain,
                        "ki" => self.gains.ki = gain,
                        _ => self.gains.kd = gain,
                    },
                    Err(_) => replies.push(format!("ERROR bad gain '{}'", value)),
                },
                ("f", Some(value)) => match value.parse::<u32>() {
                    Ok(frequency) => self.frequency = frequency,
                    Err(_) => replies.push(format!("ERROR bad frequency '{}'", value)),
                },
                ("q", _) => self.error_flags = "000000".to_string(),
                ("v" | "a", _) => {
                    if controls.chatter() {
                        replies.push("ERROR heating slow".to_string());
                    }
                    replies.push(match name {
                        "v" => format!("version: {}", FIRMWARE_VERSION),
                        _ => format!("kp:{} ki:{} kd:{}", self.gains.kp, self.gains.ki, self.gains.kd),
                    });
                }
                _ => replies.push(format!("ERROR unknown command '{}'", command)),
            }
        }
        replies
    }
}
