//! INO heater: host-side PID over INO sensor samples, with fail-safe and
//! cooperative autotune preemption.

use super::{check_target, ControlPid, HeaterError, Smoothing, MAX_HEAT_TIME, PWM_DEADBAND};
use crate::autotune::{AutotuneCoordinator, FailReason, RelayStep, RelayTuner, TuneParams};
use crate::config::{ConfigError, HeaterConfig, HeaterPath};
use crate::link::DeviceCommand;
use crate::sensor::OutboundQueue;
use ino_shared::{FaultReporter, HeaterCapability, HeaterFault, PidGains, TemperatureSample};
use serde::Serialize;
use serde_json::json;
use std::mem;
use std::sync::Arc;

/// Lifecycle of an INO heater. A section that has not passed pairing
/// validation never becomes an `InoHeater`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InoHeaterState {
    Validated,
    Active,
    Faulted,
    Shutdown,
}

/// Whatever currently produces the power output.
#[derive(Debug, Clone)]
pub enum ActiveControl {
    Pid(ControlPid),
    /// `prior_target` is restored when the run ends.
    Autotune {
        tuner: RelayTuner,
        resume: ControlPid,
        prior_target: f64,
    },
}

impl ActiveControl {
    fn label(&self) -> &'static str {
        match self {
            ActiveControl::Pid(_) => "pid",
            ActiveControl::Autotune { .. } => "autotune",
        }
    }

    fn pid(&self) -> &ControlPid {
        match self {
            ActiveControl::Pid(pid) => pid,
            ActiveControl::Autotune { resume, .. } => resume,
        }
    }

    fn pid_mut(&mut self) -> &mut ControlPid {
        match self {
            ActiveControl::Pid(pid) => pid,
            ActiveControl::Autotune { resume, .. } => resume,
        }
    }
}

pub struct InoHeater {
    name: String,
    config: HeaterConfig,
    state: InoHeaterState,
    control: ActiveControl,
    autotune: AutotuneCoordinator,
    outbound: OutboundQueue,
    faults: Arc<dyn FaultReporter>,
    fault: Option<HeaterFault>,
    smoothing: Smoothing,
    target: f64,
    last_power: f64,
    next_pwm_time: f64,
    last_sample_timestamp: Option<f64>,
    active_since: f64,
    seen_valid: bool,
}

impl std::fmt::Debug for InoHeater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InoHeater")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("control", &self.control.label())
            .field("target", &self.target)
            .field("last_power", &self.last_power)
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

impl InoHeater {
    /// Build from a section that must resolve to the INO path.
    pub fn new(
        name: &str,
        config: &HeaterConfig,
        outbound: OutboundQueue,
        faults: Arc<dyn FaultReporter>,
    ) -> Result<Self, ConfigError> {
        config.validate(name)?;
        if config.heater_path(name)? != HeaterPath::Ino {
            return Err(ConfigError::IncompatiblePairing {
                section: name.to_string(),
                heater_type: config.heater_type.clone().unwrap_or_default(),
                sensor_type: config.sensor_type.clone(),
            });
        }
        tracing::info!(
            "Heater {} uses the INO PID path ({})",
            name,
            config.pid_gains()
        );
        Ok(Self {
            name: name.to_string(),
            config: config.clone(),
            state: InoHeaterState::Validated,
            control: ActiveControl::Pid(ControlPid::new(
                config.pid_gains(),
                config.max_power,
                config.smooth_time,
            )),
            autotune: AutotuneCoordinator::new(),
            outbound,
            faults,
            fault: None,
            smoothing: Smoothing::new(config.smooth_time, config.min_extrude_temp()),
            target: 0.0,
            last_power: 0.0,
            next_pwm_time: 0.0,
            last_sample_timestamp: None,
            active_since: 0.0,
            seen_valid: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InoHeaterState {
        self.state
    }

    pub fn fault(&self) -> Option<&HeaterFault> {
        self.fault.as_ref()
    }

    pub fn last_power(&self) -> f64 {
        self.last_power
    }

    pub fn smoothed_temp(&self) -> f64 {
        self.smoothing.smoothed_temp
    }

    pub fn can_extrude(&self) -> bool {
        self.smoothing.can_extrude
    }

    pub fn pid_gains(&self) -> PidGains {
        self.control.pid().gains()
    }

    pub fn autotune(&self) -> &AutotuneCoordinator {
        &self.autotune
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Start the control path. Staleness grace runs from here.
    pub fn activate(&mut self, eventtime: f64) {
        if self.state == InoHeaterState::Validated {
            self.state = InoHeaterState::Active;
            self.active_since = eventtime;
            tracing::info!("Heater {} active", self.name);
        }
    }

    /// Park the heater for good: zero power and target.
    pub fn shutdown(&mut self, eventtime: f64) {
        if self.state == InoHeaterState::Shutdown {
            return;
        }
        if let ActiveControl::Autotune { .. } = self.control {
            self.end_autotune(Err(FailReason::Aborted), eventtime);
        }
        self.state = InoHeaterState::Shutdown;
        self.target = 0.0;
        self.last_power = 0.0;
        self.outbound.push(DeviceCommand::SetTarget(0.0));
        self.outbound.push(DeviceCommand::SetPower(0.0));
        tracing::info!("Heater {} shut down", self.name);
    }

    pub fn set_temp(&mut self, degrees: f64) -> Result<(), HeaterError> {
        check_target(degrees, self.config.min_temp, self.config.max_temp)?;
        self.target = degrees;
        self.outbound.push(DeviceCommand::SetTarget(degrees));
        Ok(())
    }

    /// Replace the PID gains and upload them to the board. During autotune the
    /// new gains take effect when PID control resumes.
    pub fn set_pid_gains(&mut self, gains: PidGains) {
        self.control.pid_mut().set_gains(gains);
        self.outbound.push(DeviceCommand::SetGains(gains));
        tracing::info!("Heater {} PID gains set to {}", self.name, gains);
    }

    /// Preempt PID control with a relay experiment towards `target`.
    pub fn start_autotune(&mut self, target: f64, eventtime: f64) -> Result<(), HeaterError> {
        let params = TuneParams {
            max_power: self.config.max_power,
            max_temp: self.config.max_temp,
            tune_delta: self.config.tune_delta,
            timeout: self.config.tune_timeout,
        };
        let tuner = self.autotune.start(target, self.config.min_temp, params, eventtime)?;
        let resume = self.control.pid().clone();
        self.control = ActiveControl::Autotune {
            tuner,
            resume,
            prior_target: self.target,
        };
        self.target = target;
        self.outbound.push(DeviceCommand::SetTarget(target));
        tracing::info!("Heater {} autotune started towards {:.1}", self.name, target);
        Ok(())
    }

    /// Cancel the running experiment: power to zero, PID back in charge.
    pub fn abort_autotune(&mut self, eventtime: f64) -> Result<(), HeaterError> {
        if !matches!(self.control, ActiveControl::Autotune { .. }) {
            return Err(crate::autotune::AutotuneError::NotRunning.into());
        }
        self.end_autotune(Err(FailReason::Aborted), eventtime);
        Ok(())
    }

    fn end_autotune(&mut self, result: Result<PidGains, FailReason>, eventtime: f64) {
        let placeholder = ActiveControl::Pid(self.control.pid().clone());
        let ActiveControl::Autotune { tuner, mut resume, prior_target } = mem::replace(&mut self.control, placeholder)
        else {
            return;
        };
        match &result {
            Ok(gains) => tracing::info!("Heater {} autotune finished: {}", self.name, gains),
            Err(reason) => tracing::warn!("Heater {} autotune failed: {}", self.name, reason),
        }
        self.autotune.finish(tuner, result, eventtime);
        resume.reset();
        self.control = ActiveControl::Pid(resume);
        self.set_pwm(eventtime, 0.0, true);
        self.target = prior_target;
        self.outbound.push(DeviceCommand::SetTarget(prior_target));
    }

    /// Record a fault. Returns true on a transition into this fault.
    fn raise(&mut self, fault: HeaterFault) -> bool {
        let same_kind = self
            .fault
            .as_ref()
            .is_some_and(|current| mem::discriminant(current) == mem::discriminant(&fault));
        if same_kind {
            return false;
        }
        tracing::warn!("Heater {}: {}", self.name, fault);
        self.faults.report(&self.name, &fault);
        self.fault = Some(fault);
        self.state = InoHeaterState::Faulted;
        true
    }

    fn recover(&mut self) {
        if self.fault.take().is_some() {
            tracing::info!("Heater {} recovered", self.name);
            self.faults.clear(&self.name);
        }
        self.state = InoHeaterState::Active;
    }

    /// Gate power commands: skip changes under the deadband until the refresh
    /// time, send forced values unconditionally.
    fn set_pwm(&mut self, eventtime: f64, value: f64, force: bool) -> f64 {
        let within_deadband = (value - self.last_power).abs() < PWM_DEADBAND;
        if !force && (eventtime < self.next_pwm_time || self.last_power == 0.0) && within_deadband {
            return self.last_power;
        }
        self.next_pwm_time = eventtime + 0.75 * MAX_HEAT_TIME;
        self.last_power = value;
        self.outbound.push(DeviceCommand::SetPower(value));
        value
    }

    pub fn status(&self) -> serde_json::Value {
        json!({
            "temperature": (self.smoothing.smoothed_temp * 100.0).round() / 100.0,
            "target": self.target,
            "power": self.last_power,
            "state": self.state,
            "can_extrude": self.smoothing.can_extrude,
            "fault": self.fault,
            "control": self.control.label(),
            "pid": self.control.pid().gains(),
            "autotune": self.autotune.status(),
        })
    }
}

impl HeaterCapability for InoHeater {
    fn compute_power(&mut self, sample: &TemperatureSample, target: f64, eventtime: f64) -> f64 {
        match self.state {
            InoHeaterState::Shutdown => return 0.0,
            InoHeaterState::Validated => self.activate(eventtime),
            InoHeaterState::Active | InoHeaterState::Faulted => {}
        }

        let expired = match &self.control {
            ActiveControl::Autotune { tuner, .. } => tuner.expired(eventtime),
            ActiveControl::Pid(_) => None,
        };
        if let Some(reason) = expired {
            self.end_autotune(Err(reason), eventtime);
        }

        let stale_after = 2.0 * self.config.report_time;
        let age = sample.age(eventtime);
        if !sample.valid || age > stale_after {
            if !self.seen_valid && eventtime - self.active_since <= stale_after {
                return self.set_pwm(eventtime, 0.0, false);
            }
            let newly = self.raise(HeaterFault::SensorLost { age });
            return self.set_pwm(eventtime, 0.0, newly);
        }

        if sample.value > self.config.max_temp {
            let fault = HeaterFault::OverTemperature {
                temp: sample.value,
                max_temp: self.config.max_temp,
            };
            if let ActiveControl::Autotune { .. } = self.control {
                self.end_autotune(Err(FailReason::OverTemperature { temp: sample.value }), eventtime);
            }
            let newly = self.raise(fault);
            return self.set_pwm(eventtime, 0.0, newly);
        }

        if self.state == InoHeaterState::Faulted {
            self.recover();
        }
        self.seen_valid = true;

        if self.last_sample_timestamp == Some(sample.timestamp) {
            return self.last_power;
        }
        self.last_sample_timestamp = Some(sample.timestamp);
        self.smoothing.update(sample.timestamp, sample.value);

        let step = match &mut self.control {
            ActiveControl::Pid(pid) => {
                let power = pid.update(sample.timestamp, sample.value, target);
                RelayStep::Continue(if target <= 0.0 { 0.0 } else { power })
            }
            ActiveControl::Autotune { tuner, .. } => tuner.feed(sample, eventtime),
        };
        match step {
            RelayStep::Continue(power) => self.set_pwm(eventtime, power.clamp(0.0, self.config.max_power), false),
            RelayStep::Finished(result) => {
                self.end_autotune(result, eventtime);
                self.last_power
            }
        }
    }

    fn target_temp(&self) -> f64 {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct RecordingFaults {
        events: Mutex<Vec<String>>,
    }

    impl FaultReporter for RecordingFaults {
        fn report(&self, source: &str, fault: &HeaterFault) {
            self.events.lock().unwrap().push(format!("{}: {}", source, fault));
        }
        fn clear(&self, source: &str) {
            self.events.lock().unwrap().push(format!("{}: clear", source));
        }
    }

    fn heater() -> (InoHeater, UnboundedReceiver<DeviceCommand>, Arc<RecordingFaults>) {
        let (outbound, rx) = OutboundQueue::channel();
        let faults = Arc::new(RecordingFaults::default());
        let config = HeaterConfig::ino("sim", 10.0, 450.0);
        let heater = InoHeater::new("extruder", &config, outbound, faults.clone()).unwrap();
        (heater, rx, faults)
    }

    fn drain(rx: &mut UnboundedReceiver<DeviceCommand>) -> Vec<DeviceCommand> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            out.push(command);
        }
        out
    }

    #[test]
    fn test_startup_grace_then_sensor_lost() {
        let (mut heater, _rx, faults) = heater();
        let missing = TemperatureSample::missing();
        assert_eq!(heater.compute_power(&missing, 200.0, 100.0), 0.0);
        assert_eq!(heater.compute_power(&missing, 200.0, 100.15), 0.0);
        assert!(faults.events.lock().unwrap().is_empty());
        assert_eq!(heater.compute_power(&missing, 200.0, 100.25), 0.0);
        assert_eq!(heater.state(), InoHeaterState::Faulted);
        assert_eq!(faults.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_repeated_sample_does_not_advance() {
        let (mut heater, mut rx, _faults) = heater();
        heater.set_temp(250.0).unwrap();
        let sample = TemperatureSample::reading(1.0, 50.0);
        let first = heater.compute_power(&sample, 250.0, 1.0);
        let again = heater.compute_power(&sample, 250.0, 1.05);
        assert_eq!(first, again);
        let powers: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|c| matches!(c, DeviceCommand::SetPower(_)))
            .collect();
        assert_eq!(powers, vec![DeviceCommand::SetPower(1.0)]);
    }

    #[test]
    fn test_over_temperature_forces_zero() {
        let (mut heater, mut rx, faults) = heater();
        heater.set_temp(440.0).unwrap();
        heater.compute_power(&TemperatureSample::reading(1.0, 400.0), 440.0, 1.0);
        let power = heater.compute_power(&TemperatureSample::reading(1.1, 455.0), 440.0, 1.1);
        assert_eq!(power, 0.0);
        assert!(matches!(heater.fault(), Some(HeaterFault::OverTemperature { .. })));
        assert!(drain(&mut rx).contains(&DeviceCommand::SetPower(0.0)));
        assert_eq!(faults.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_target_out_of_range() {
        let (mut heater, _rx, _faults) = heater();
        assert!(matches!(heater.set_temp(500.0), Err(HeaterError::TargetOutOfRange { .. })));
        assert!(heater.set_temp(0.0).is_ok());
    }

    #[test]
    fn test_abort_restores_pid() {
        let (mut heater, mut rx, _faults) = heater();
        heater.start_autotune(200.0, 0.0).unwrap();
        heater.compute_power(&TemperatureSample::reading(0.1, 50.0), 200.0, 0.1);
        assert_eq!(heater.last_power(), 1.0);
        heater.abort_autotune(0.2).unwrap();
        assert_eq!(heater.last_power(), 0.0);
        let sent = drain(&mut rx);
        assert!(sent.ends_with(&[DeviceCommand::SetPower(0.0), DeviceCommand::SetTarget(0.0)]));
        assert!(heater.abort_autotune(0.3).is_err());
        assert_eq!(heater.status()["control"], "pid");
    }
}
