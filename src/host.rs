// src/host.rs - Wires configured heaters, INO sensors and host services together
use crate::commands::GcodeDispatcher;
use crate::config::{Config, ConfigError, HeaterConfig, HeaterPath};
use crate::gcode_tracker::GcodeTracker;
use crate::heater::{Heater, InoHeater, SharedHeater, StockHeater};
use crate::sensor::{SampleReader, SensorAdapter, SensorHandle};
use crate::web::channel::HostRequest;
use async_trait::async_trait;
use ino_shared::{
    Clock, Connector, FaultReporter, HeaterCapability, HeaterFault, SensorConsumer, StatusObject,
    TemperatureSample,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const FAULT_HISTORY: usize = 100;
const STORE_CAPACITY: usize = 1200;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fault raised or cleared by one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultEvent {
    pub source: String,
    /// `None` when the source recovered.
    pub fault: Option<HeaterFault>,
}

#[derive(Debug, Default)]
struct FaultState {
    active: BTreeMap<String, HeaterFault>,
    history: VecDeque<FaultEvent>,
}

/// The host's fault channel: logs every transition and keeps what is active.
#[derive(Debug, Default)]
pub struct FaultLog {
    state: Mutex<FaultState>,
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> BTreeMap<String, HeaterFault> {
        relock(&self.state).active.clone()
    }

    pub fn history(&self) -> Vec<FaultEvent> {
        relock(&self.state).history.iter().cloned().collect()
    }

    fn push(state: &mut FaultState, event: FaultEvent) {
        if state.history.len() == FAULT_HISTORY {
            state.history.pop_front();
        }
        state.history.push_back(event);
    }
}

impl FaultReporter for FaultLog {
    fn report(&self, source: &str, fault: &HeaterFault) {
        tracing::error!("Fault on {}: {}", source, fault);
        let mut state = relock(&self.state);
        state.active.insert(source.to_string(), fault.clone());
        Self::push(
            &mut state,
            FaultEvent {
                source: source.to_string(),
                fault: Some(fault.clone()),
            },
        );
    }

    fn clear(&self, source: &str) {
        let mut state = relock(&self.state);
        if state.active.remove(source).is_some() {
            tracing::info!("Fault on {} cleared", source);
            Self::push(
                &mut state,
                FaultEvent {
                    source: source.to_string(),
                    fault: None,
                },
            );
        }
    }
}

#[async_trait]
impl StatusObject for FaultLog {
    async fn get_status(&self, _eventtime: f64) -> Value {
        let state = relock(&self.state);
        json!({
            "active": state.active,
            "history": state.history,
        })
    }
}

/// Recent valid samples of one sensor, for temperature graphs.
#[derive(Debug)]
pub struct TemperatureStore {
    samples: Mutex<VecDeque<TemperatureSample>>,
    capacity: usize,
}

impl TemperatureStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        relock(&self.samples).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Option<TemperatureSample> {
        relock(&self.samples).back().copied()
    }
}

impl SensorConsumer for TemperatureStore {
    fn on_sample(&self, sample: &TemperatureSample) {
        if !sample.valid {
            return;
        }
        let mut samples = relock(&self.samples);
        // Failed steps republish the last good timestamp.
        if samples.back().is_some_and(|last| last.timestamp == sample.timestamp) {
            return;
        }
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(*sample);
    }
}

#[async_trait]
impl StatusObject for TemperatureStore {
    async fn get_status(&self, _eventtime: f64) -> Value {
        let samples = relock(&self.samples);
        let temperatures: Vec<f64> = samples.iter().map(|s| (s.value * 100.0).round() / 100.0).collect();
        json!({ "temperatures": temperatures })
    }
}

/// Status adapter for a shared heater.
struct HeaterObject(SharedHeater);

#[async_trait]
impl StatusObject for HeaterObject {
    async fn get_status(&self, _eventtime: f64) -> Value {
        self.0.lock().await.status()
    }
}

/// Named objects answering status queries.
#[derive(Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<String, Arc<dyn StatusObject>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, object: Arc<dyn StatusObject>) {
        self.objects.insert(name.into(), object);
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    /// Status of each requested object. Unknown names are left out.
    pub async fn query(&self, names: &[String], eventtime: f64) -> Map<String, Value> {
        let mut out = Map::new();
        for name in names {
            if let Some(object) = self.objects.get(name) {
                out.insert(name.clone(), object.get_status(eventtime).await);
            }
        }
        out
    }
}

/// The running integration.
pub struct Host {
    config: Config,
    clock: Arc<dyn Clock>,
    heaters: BTreeMap<String, SharedHeater>,
    sensors: BTreeMap<String, SensorHandle>,
    registry: ObjectRegistry,
    dispatcher: GcodeDispatcher,
    faults: Arc<FaultLog>,
    tracker: Arc<GcodeTracker>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Validate every heater section, then start a sampler and a control
    /// loop per INO heater. `connect` supplies the connector for a section.
    /// Nothing is opened when any section is invalid.
    pub fn start<C, F>(config: Config, clock: Arc<dyn Clock>, connect: F) -> Result<Self, HostError>
    where
        C: Connector,
        F: Fn(&str, &HeaterConfig) -> C,
    {
        config.validate()?;

        let faults = Arc::new(FaultLog::new());
        let tracker = Arc::new(GcodeTracker::new(&config.gcode_tracker));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut registry = ObjectRegistry::new();
        let mut heaters = BTreeMap::new();
        let mut sensors = BTreeMap::new();
        let mut tasks = Vec::new();

        for (name, section) in &config.heaters {
            let heater = match section.heater_path(name)? {
                HeaterPath::Ino => {
                    let (mut adapter, handle) =
                        SensorAdapter::new(name, section, connect(name, section), clock.clone(), faults.clone());
                    let store = Arc::new(TemperatureStore::new(STORE_CAPACITY));
                    adapter.add_consumer(store.clone());
                    let heater = InoHeater::new(name, section, handle.outbound(), faults.clone())?;
                    let heater: SharedHeater = Arc::new(tokio::sync::Mutex::new(Heater::Ino(heater)));

                    tasks.push(tokio::spawn(adapter.run(shutdown_rx.clone())));
                    tasks.push(tokio::spawn(control_loop(
                        heater.clone(),
                        handle.reader(),
                        clock.clone(),
                        Duration::from_secs_f64(section.report_time),
                        shutdown_rx.clone(),
                    )));
                    registry.register(format!("ino_sensor {}", name), Arc::new(handle.clone()));
                    registry.register(format!("temperature_store {}", name), store);
                    sensors.insert(name.clone(), handle);
                    heater
                }
                HeaterPath::Stock => Arc::new(tokio::sync::Mutex::new(Heater::Stock(StockHeater::new(name, section)))),
            };
            registry.register(name.clone(), Arc::new(HeaterObject(heater.clone())));
            heaters.insert(name.clone(), heater);
        }
        registry.register("gcode_tracker", tracker.clone());
        registry.register("faults", faults.clone());

        let dispatcher = GcodeDispatcher::new(heaters.clone(), sensors.clone(), tracker.clone(), clock.clone());
        tracing::info!(
            "Host {} started with {} heater(s), {} on INO boards",
            config.printer.name.as_deref().unwrap_or("printer"),
            heaters.len(),
            sensors.len()
        );
        Ok(Self {
            config,
            clock,
            heaters,
            sensors,
            registry,
            dispatcher,
            faults,
            tracker,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn heater(&self, name: &str) -> Option<&SharedHeater> {
        self.heaters.get(name)
    }

    pub fn sensor(&self, name: &str) -> Option<&SensorHandle> {
        self.sensors.get(name)
    }

    pub fn faults(&self) -> &Arc<FaultLog> {
        &self.faults
    }

    pub fn tracker(&self) -> &Arc<GcodeTracker> {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &GcodeDispatcher {
        &self.dispatcher
    }

    pub fn object_names(&self) -> Vec<String> {
        self.registry.names()
    }

    pub async fn execute(&self, line: &str) -> Result<String, String> {
        self.dispatcher.execute(line).await.map_err(|e| e.to_string())
    }

    pub async fn query(&self, names: &[String]) -> Map<String, Value> {
        self.registry.query(names, self.clock.monotonic()).await
    }

    /// Stop control loops and samplers, park the boards and flush the tracker.
    pub async fn shutdown(&self) {
        tracing::info!("Host shutting down");
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *relock(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Task ended abnormally: {}", e);
            }
        }
        self.tracker.flush();
    }
}

/// Drive one heater from its sensor's latest sample every `period`.
async fn control_loop(
    heater: SharedHeater,
    reader: SampleReader,
    clock: Arc<dyn Clock>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let sample = reader.read_latest();
                let now = clock.monotonic();
                let mut heater = heater.lock().await;
                let target = heater.target_temp();
                heater.compute_power(&sample, target, now);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    let mut heater = heater.lock().await;
    if let Ok(ino) = heater.as_ino_mut() {
        ino.shutdown(clock.monotonic());
    }
}

/// Answer web requests until every sender is gone.
pub async fn serve_requests(host: Arc<Host>, mut rx: mpsc::Receiver<HostRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            HostRequest::ExecuteGcode { command, respond_to } => {
                let _ = respond_to.send(host.execute(&command).await);
            }
            HostRequest::QueryObjects { objects, respond_to } => {
                let _ = respond_to.send(host.query(&objects).await);
            }
            HostRequest::ListObjects { respond_to } => {
                let _ = respond_to.send(host.object_names());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_log_tracks_transitions() {
        let log = FaultLog::new();
        let fault = HeaterFault::SensorLost { age: 0.3 };
        log.report("extruder", &fault);
        assert_eq!(log.active().get("extruder"), Some(&fault));
        log.clear("extruder");
        log.clear("extruder");
        assert!(log.active().is_empty());
        assert_eq!(log.history().len(), 2);
    }

    #[test]
    fn test_store_skips_repeats_and_failures() {
        let store = TemperatureStore::new(2);
        store.on_sample(&TemperatureSample::reading(1.0, 20.0));
        store.on_sample(&TemperatureSample::reading(1.0, 20.0));
        store.on_sample(&TemperatureSample::failed(1.0, 20.0));
        assert_eq!(store.len(), 1);
        store.on_sample(&TemperatureSample::reading(2.0, 21.0));
        store.on_sample(&TemperatureSample::reading(3.0, 22.0));
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().map(|s| s.value), Some(22.0));
    }
}
