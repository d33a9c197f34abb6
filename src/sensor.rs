//! INO temperature sensor: periodic telemetry sampling over the serial link.
//!
//! The sampler task owns the [`LinkManager`]. Everything else talks to it
//! through a [`SensorHandle`]: samples come out of a `watch` channel, device
//! commands go in through an unbounded queue drained once per cadence step.

use crate::config::HeaterConfig;
use crate::link::{DeviceCommand, DeviceFlags, LinkManager, LinkStats, SessionState, Telemetry};
use async_trait::async_trait;
use ino_shared::{
    Clock, Connector, FaultReporter, HeaterFault, PidGains, SensorConsumer, StatusObject,
    TemperatureSample, ABSOLUTE_ZERO,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;

/// Readings above this are treated as sensor garbage.
pub const MAX_SANE_TEMP: f64 = 1000.0;
/// Consecutive failed connection attempts before the link is reported abandoned.
pub const ABANDON_AFTER: u32 = 5;
const DEBUG_HISTORY: usize = 100;

/// Non-blocking view of the most recent sample.
#[derive(Debug, Clone)]
pub struct SampleReader {
    rx: watch::Receiver<TemperatureSample>,
}

impl SampleReader {
    pub fn read_latest(&self) -> TemperatureSample {
        *self.rx.borrow()
    }
}

/// Commands waiting for the next cadence step.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<DeviceCommand>,
}

impl OutboundQueue {
    /// A queue and its receiving end, for wiring a heater without a sampler.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Returns false once the sampler has stopped.
    pub fn push(&self, command: DeviceCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

#[derive(Debug)]
struct SensorShared {
    last: TemperatureSample,
    last_debug_timestamp: Option<f64>,
    last_debug_message: String,
    flags: DeviceFlags,
    link_state: SessionState,
    stats: LinkStats,
    history: VecDeque<Telemetry>,
}

fn lock(shared: &Mutex<SensorShared>) -> MutexGuard<'_, SensorShared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to a running sensor.
#[derive(Debug, Clone)]
pub struct SensorHandle {
    name: String,
    reader: SampleReader,
    outbound: OutboundQueue,
    console: broadcast::Sender<String>,
    shared: Arc<Mutex<SensorShared>>,
}

impl SensorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_latest(&self) -> TemperatureSample {
        self.reader.read_latest()
    }

    pub fn reader(&self) -> SampleReader {
        self.reader.clone()
    }

    pub fn outbound(&self) -> OutboundQueue {
        self.outbound.clone()
    }

    pub fn send(&self, command: DeviceCommand) -> bool {
        self.outbound.push(command)
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<String> {
        self.console.subscribe()
    }

    pub fn link_state(&self) -> SessionState {
        lock(&self.shared).link_state
    }

    pub fn stats(&self) -> LinkStats {
        lock(&self.shared).stats.clone()
    }

    /// The newest telemetry record and its decoded flags.
    pub fn debug_output(&self) -> Option<String> {
        let shared = lock(&self.shared);
        let latest = shared.history.back()?;
        let fields = latest
            .fields
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("INO debug output:\n{{{}}}\n{}", fields, latest.flags))
    }

    pub fn history_len(&self) -> usize {
        lock(&self.shared).history.len()
    }
}

#[async_trait]
impl StatusObject for SensorHandle {
    async fn get_status(&self, _eventtime: f64) -> serde_json::Value {
        let shared = lock(&self.shared);
        json!({
            "temperature": (shared.last.value * 100.0).round() / 100.0,
            "valid": shared.last.valid,
            "last_debug_timestamp": shared.last_debug_timestamp,
            "last_debug_message": shared.last_debug_message,
            "error_flags": shared.flags.raw(),
            "active_flags": shared.flags.active(),
            "link": shared.link_state,
            "link_stats": shared.stats,
        })
    }
}

/// The sampling side of an INO sensor.
pub struct SensorAdapter<C: Connector> {
    name: String,
    link: LinkManager<C>,
    clock: Arc<dyn Clock>,
    report_time: Duration,
    gains: PidGains,
    first_connect: bool,
    failed_connects: u32,
    abandoned: bool,
    last_good: TemperatureSample,
    outbound_rx: mpsc::UnboundedReceiver<DeviceCommand>,
    /// Commands taken off the queue but not yet delivered, oldest first.
    pending: VecDeque<DeviceCommand>,
    sample_tx: watch::Sender<TemperatureSample>,
    consumers: Vec<Arc<dyn SensorConsumer>>,
    faults: Arc<dyn FaultReporter>,
    shared: Arc<Mutex<SensorShared>>,
}

impl<C: Connector> SensorAdapter<C> {
    pub fn new(
        name: &str,
        config: &HeaterConfig,
        connector: C,
        clock: Arc<dyn Clock>,
        faults: Arc<dyn FaultReporter>,
    ) -> (Self, SensorHandle) {
        let report_time = Duration::from_secs_f64(config.report_time);
        let link = LinkManager::new(connector, report_time);
        let (outbound, outbound_rx) = OutboundQueue::channel();
        let (sample_tx, sample_rx) = watch::channel(TemperatureSample::missing());
        let shared = Arc::new(Mutex::new(SensorShared {
            last: TemperatureSample::missing(),
            last_debug_timestamp: None,
            last_debug_message: String::new(),
            flags: DeviceFlags::default(),
            link_state: SessionState::Closed,
            stats: LinkStats::default(),
            history: VecDeque::with_capacity(DEBUG_HISTORY),
        }));
        let handle = SensorHandle {
            name: name.to_string(),
            reader: SampleReader { rx: sample_rx },
            outbound,
            console: link.console(),
            shared: shared.clone(),
        };
        let adapter = Self {
            name: name.to_string(),
            link,
            clock,
            report_time,
            gains: config.pid_gains(),
            first_connect: true,
            failed_connects: 0,
            abandoned: false,
            last_good: TemperatureSample::missing(),
            outbound_rx,
            pending: VecDeque::new(),
            sample_tx,
            consumers: Vec::new(),
            faults,
            shared,
        };
        (adapter, handle)
    }

    /// Name under which link faults are reported, distinct from the heater's.
    pub fn fault_source(&self) -> String {
        format!("ino_sensor {}", self.name)
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn SensorConsumer>) {
        self.consumers.push(consumer);
    }

    /// One cadence step: connect if needed, flush queued commands, then
    /// request telemetry. Always publishes exactly one sample.
    pub async fn step(&mut self) -> TemperatureSample {
        while let Ok(command) = self.outbound_rx.try_recv() {
            self.pending.push_back(command);
        }
        if !self.link.is_open() && !self.connect().await {
            return self.publish_failure();
        }

        // A command stays pending until a write succeeds, so a forced zero
        // survives a dropped link.
        while let Some(command) = self.pending.front() {
            let text = command.to_string();
            if let Err(e) = self.link.send(&text).await {
                tracing::warn!("INO {}: '{}' held for the next connection: {}", self.name, text, e);
                return self.publish_failure();
            }
            self.pending.pop_front();
        }

        match self.link.request_telemetry().await {
            Ok(telemetry) => self.accept(telemetry),
            Err(e) => {
                tracing::warn!("INO {}: telemetry request failed: {}", self.name, e);
                self.publish_failure()
            }
        }
    }

    async fn connect(&mut self) -> bool {
        match self.link.open().await {
            Ok(()) => {
                if self.abandoned {
                    self.faults.clear(&self.fault_source());
                    self.abandoned = false;
                }
                self.failed_connects = 0;
                if self.first_connect {
                    let upload = format!(
                        "{};{}",
                        DeviceCommand::SetGains(self.gains),
                        DeviceCommand::ResetErrorFlags
                    );
                    if let Err(e) = self.link.send(&upload).await {
                        tracing::warn!("INO {}: gain upload failed: {}", self.name, e);
                        return false;
                    }
                    self.first_connect = false;
                }
                true
            }
            Err(_) => {
                self.failed_connects += 1;
                tracing::error!(
                    "Unable to connect to INO {}. This was attempt number {}",
                    self.name,
                    self.failed_connects
                );
                if self.failed_connects >= ABANDON_AFTER && !self.abandoned {
                    self.abandoned = true;
                    self.faults.report(
                        &self.fault_source(),
                        &HeaterFault::LinkAbandoned {
                            port: self.link.port().to_string(),
                            attempts: self.failed_connects,
                        },
                    );
                }
                false
            }
        }
    }

    fn accept(&mut self, telemetry: Telemetry) -> TemperatureSample {
        let now = self.clock.monotonic();
        let value = telemetry.temperature;
        let flags = telemetry.flags.clone();
        {
            let mut shared = lock(&self.shared);
            if shared.flags != flags && flags.any() {
                tracing::warn!("INO {} error flags: {}", self.name, flags);
            }
            shared.last_debug_timestamp = Some(now);
            shared.last_debug_message = telemetry.debug_line();
            shared.flags = flags.clone();
            if shared.history.len() == DEBUG_HISTORY {
                shared.history.pop_front();
            }
            shared.history.push_back(telemetry);
        }

        if flags.invalidates_reading() {
            return self.publish_failure();
        }
        if !(ABSOLUTE_ZERO..=MAX_SANE_TEMP).contains(&value) {
            tracing::warn!("INO {}: rejecting out of range reading {:.2}", self.name, value);
            return self.publish_failure();
        }
        let sample = TemperatureSample::reading(now, value);
        self.last_good = sample;
        self.publish(sample)
    }

    fn publish_failure(&mut self) -> TemperatureSample {
        let sample = TemperatureSample::failed(self.last_good.timestamp, self.last_good.value);
        self.publish(sample)
    }

    fn publish(&mut self, sample: TemperatureSample) -> TemperatureSample {
        self.sample_tx.send_replace(sample);
        for consumer in &self.consumers {
            consumer.on_sample(&sample);
        }
        let mut shared = lock(&self.shared);
        shared.last = sample;
        shared.link_state = self.link.state();
        shared.stats = self.link.stats().clone();
        sample
    }

    /// Sample every `report_time` until `shutdown` flips to true, then park
    /// the board at zero.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("INO sensor {} sampling every {:?}", self.name, self.report_time);
        let mut interval = tokio::time::interval(self.report_time);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.step().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown_device().await;
    }

    async fn shutdown_device(&mut self) {
        tracing::info!("INO sensor {} shutting down", self.name);
        if self.link.is_open() {
            for command in [DeviceCommand::SetTarget(0.0), DeviceCommand::SetPower(0.0)] {
                if let Err(e) = self.link.send(&command.to_string()).await {
                    tracing::warn!("INO {}: '{}' not delivered: {}", self.name, command, e);
                    break;
                }
            }
        }
        self.link.close().await;
        let mut shared = lock(&self.shared);
        shared.link_state = self.link.state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ino_shared::MonotonicClock;
    use ino_simulator::SimConnector;

    #[derive(Default)]
    struct NoFaults;

    impl FaultReporter for NoFaults {
        fn report(&self, _source: &str, _fault: &HeaterFault) {}
        fn clear(&self, _source: &str) {}
    }

    fn adapter(sim: &SimConnector) -> (SensorAdapter<SimConnector>, SensorHandle) {
        let config = HeaterConfig::ino("sim", 10.0, 450.0);
        SensorAdapter::new(
            "extruder",
            &config,
            sim.clone(),
            Arc::new(MonotonicClock::new()),
            Arc::new(NoFaults),
        )
    }

    #[tokio::test]
    async fn test_first_step_uploads_gains() {
        let sim = SimConnector::hotend("t0");
        let (mut sensor, handle) = adapter(&sim);
        let sample = sensor.step().await;
        assert!(sample.valid);
        assert!((sample.value - 25.0).abs() < 0.5);
        assert_eq!(sim.board().gains, PidGains::new(13.41, 30.91, 1.46));
        assert_eq!(handle.read_latest(), sample);
        assert_eq!(handle.history_len(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_flag_invalidates_sample() {
        let sim = SimConnector::hotend("t0");
        let (mut sensor, _handle) = adapter(&sim);
        let good = sensor.step().await;
        sim.board().error_flags = "100000".to_string();
        let bad = sensor.step().await;
        assert!(!bad.valid);
        assert_eq!(bad.timestamp, good.timestamp);
    }

    #[tokio::test]
    async fn test_undelivered_command_is_resent_after_reconnect() {
        let sim = SimConnector::hotend("t0");
        let (mut sensor, handle) = adapter(&sim);
        handle.send(DeviceCommand::SetPower(0.6));
        assert!(sensor.step().await.valid);
        assert_eq!(sim.board().power, 0.6);

        sim.controls().drop_links();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.send(DeviceCommand::SetPower(0.0));
        assert!(!sensor.step().await.valid);
        assert_eq!(sim.board().power, 0.6);

        assert!(sensor.step().await.valid);
        assert_eq!(sim.board().power, 0.0);
        assert_eq!(sim.controls().connects(), 2);
    }

    #[tokio::test]
    async fn test_queued_commands_reach_board() {
        let sim = SimConnector::hotend("t0");
        let (mut sensor, handle) = adapter(&sim);
        handle.send(DeviceCommand::SetTarget(215.5));
        handle.send(DeviceCommand::SetFrequency(40));
        sensor.step().await;
        assert_eq!(sim.board().target, 215.5);
        assert_eq!(sim.board().frequency, 40);
    }
}
