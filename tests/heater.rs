use ino_host::config::{ConfigError, HeaterConfig, INO_HEATER_TYPE};
use ino_host::heater::{Heater, HeaterError, InoHeater, InoHeaterState, StockHeater};
use ino_host::host::FaultLog;
use ino_host::link::DeviceCommand;
use ino_host::sensor::OutboundQueue;
use ino_shared::{HeaterCapability, HeaterFault, TemperatureSample};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

fn ino_heater() -> (InoHeater, UnboundedReceiver<DeviceCommand>, Arc<FaultLog>) {
    let config = HeaterConfig::ino("/dev/ttyACM1", 10.0, 450.0);
    let (outbound, rx) = OutboundQueue::channel();
    let faults = Arc::new(FaultLog::new());
    let heater = InoHeater::new("extruder", &config, outbound, faults.clone()).unwrap();
    (heater, rx, faults)
}

fn sent(rx: &mut UnboundedReceiver<DeviceCommand>) -> Vec<DeviceCommand> {
    let mut out = Vec::new();
    while let Ok(command) = rx.try_recv() {
        out.push(command);
    }
    out
}

#[test]
fn test_warming_samples_give_rising_bounded_power() {
    let (mut heater, _rx, _faults) = ino_heater();
    heater.set_temp(250.0).unwrap();
    let mut powers = Vec::new();
    for (i, temp) in [50.0, 52.0, 55.0].into_iter().enumerate() {
        let t = 1.0 + 0.1 * i as f64;
        powers.push(heater.compute_power(&TemperatureSample::reading(t, temp), 250.0, t));
    }
    assert!(powers.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!(powers.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(heater.state(), InoHeaterState::Active);
}

#[test]
fn test_sensor_lost_reported_once_per_transition() {
    let (mut heater, mut rx, faults) = ino_heater();
    heater.set_temp(200.0).unwrap();
    let good = TemperatureSample::reading(1.0, 150.0);
    assert!(heater.compute_power(&good, 200.0, 1.0) > 0.0);

    let lost = TemperatureSample::failed(1.0, 150.0);
    for i in 1..=10 {
        let t = 1.0 + 0.1 * i as f64;
        assert_eq!(heater.compute_power(&lost, 200.0, t), 0.0);
    }
    assert_eq!(heater.state(), InoHeaterState::Faulted);
    let history = faults.history();
    assert_eq!(history.len(), 1);
    assert!(matches!(history[0].fault, Some(HeaterFault::SensorLost { .. })));
    assert!(sent(&mut rx).contains(&DeviceCommand::SetPower(0.0)));

    // A fresh reading clears the fault and resumes control.
    let fresh = TemperatureSample::reading(2.5, 150.0);
    assert!(heater.compute_power(&fresh, 200.0, 2.5) > 0.0);
    assert_eq!(heater.state(), InoHeaterState::Active);
    assert!(faults.active().is_empty());
    assert_eq!(faults.history().len(), 2);
}

#[test]
fn test_shutdown_parks_heater() {
    let (mut heater, mut rx, _faults) = ino_heater();
    heater.set_temp(200.0).unwrap();
    heater.compute_power(&TemperatureSample::reading(1.0, 100.0), 200.0, 1.0);
    heater.shutdown(1.1);
    assert_eq!(heater.state(), InoHeaterState::Shutdown);
    assert_eq!(heater.compute_power(&TemperatureSample::reading(1.2, 100.0), 200.0, 1.2), 0.0);
    let commands = sent(&mut rx);
    assert!(commands.ends_with(&[DeviceCommand::SetTarget(0.0), DeviceCommand::SetPower(0.0)]));
}

#[test]
fn test_ino_heater_requires_ino_sensor() {
    let mut config = HeaterConfig::ino("/dev/ttyACM1", 10.0, 450.0);
    config.sensor_type = "EPCOS 100K B57560G104F".to_string();
    let (outbound, _rx) = OutboundQueue::channel();
    let err = InoHeater::new("extruder", &config, outbound, Arc::new(FaultLog::new())).unwrap_err();
    assert!(matches!(err, ConfigError::IncompatiblePairing { .. }));
    assert!(err.to_string().contains(INO_HEATER_TYPE));
}

#[test]
fn test_stock_heater_rejects_device_commands() {
    let mut config = HeaterConfig::ino("/dev/ttyACM1", 10.0, 450.0);
    config.heater_type = None;
    let mut heater = Heater::Stock(StockHeater::new("extruder", &config));
    assert!(!heater.is_ino());
    assert_eq!(heater.as_ino_mut().unwrap_err(), HeaterError::NotInoHeater);
    assert_eq!(
        HeaterError::NotInoHeater.to_string(),
        "Command not defined for this heater"
    );
    heater.set_temp(200.0).unwrap();
    assert!(heater.compute_power(&TemperatureSample::reading(1.0, 25.0), 200.0, 1.0) > 0.0);
}

#[test]
fn test_gain_update_reaches_board_queue() {
    let (mut heater, mut rx, _faults) = ino_heater();
    let gains = ino_shared::PidGains::new(20.0, 1.0, 5.0);
    heater.set_pid_gains(gains);
    assert_eq!(heater.pid_gains(), gains);
    assert_eq!(sent(&mut rx), vec![DeviceCommand::SetGains(gains)]);
    assert_eq!(
        DeviceCommand::SetGains(gains).to_string(),
        "kp 20.0;ki 1.0;kd 5.0"
    );
}
