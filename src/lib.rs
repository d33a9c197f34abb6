// src/lib.rs - INO external heater and sensor integration for the printer host
pub mod autotune;
pub mod commands;
pub mod config;
pub mod gcode_tracker;
pub mod heater;
pub mod host;
pub mod link;
pub mod sensor;
pub mod web;

pub use config::{load_config, Config, ConfigError, HeaterConfig};
pub use host::{Host, HostError};
