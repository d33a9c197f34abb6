//! Relay autotune for INO heaters.
//!
//! The heater alternates between `max_power` and off around the target with a
//! `tune_delta` hysteresis band. The extreme temperature of each relay phase
//! is recorded when the relay switches; once enough peaks are in, the
//! ultimate gain and period give Ziegler-Nichols PID gains.

use ino_shared::{PidGains, TemperatureSample, PID_PARAM_BASE};
use serde::Serialize;
use std::f64::consts::PI;
use thiserror::Error;

/// Peaks required before gains are computed.
pub const REQUIRED_PEAKS: usize = 12;
/// Leading peaks ignored while the oscillation settles.
pub const WARMUP_PEAKS: usize = 4;
/// Bound on the samples a single run keeps.
pub const MAX_RUN_SAMPLES: usize = 20_000;
/// Oscillation amplitude below which the run is judged flat, °C.
pub const MIN_AMPLITUDE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AutotuneError {
    #[error("autotune already running towards {target:.1}")]
    AlreadyRunning { target: f64 },
    #[error("no autotune running")]
    NotRunning,
    #[error("autotune target {target:.1} out of range ({min:.1}:{max:.1})")]
    TargetOutOfRange { target: f64, min: f64, max: f64 },
}

/// Why a run ended without gains.
#[derive(Debug, Clone, Copy, PartialEq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailReason {
    #[error("timed out after {elapsed:.0}s")]
    Timeout { elapsed: f64 },
    #[error("temperature {temp:.1} exceeded max_temp")]
    OverTemperature { temp: f64 },
    #[error("no usable oscillation")]
    NoOscillation,
    #[error("aborted")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Failed(FailReason),
}

/// Relay experiment limits, taken from the heater section.
#[derive(Debug, Clone, Copy)]
pub struct TuneParams {
    pub max_power: f64,
    pub max_temp: f64,
    pub tune_delta: f64,
    pub timeout: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Peak {
    pub time: f64,
    pub temp: f64,
    pub high: bool,
}

/// What the heater should do after feeding a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayStep {
    Continue(f64),
    Finished(Result<PidGains, FailReason>),
}

/// The running experiment. Owned by the heater while it preempts PID control.
#[derive(Debug, Clone)]
pub struct RelayTuner {
    target: f64,
    params: TuneParams,
    started_at: f64,
    heating: bool,
    /// Extreme seen in the current phase: lowest while heating, highest while off.
    extreme: Option<(f64, f64)>,
    peaks: Vec<Peak>,
    samples: Vec<(f64, f64)>,
}

impl RelayTuner {
    pub fn new(target: f64, params: TuneParams, started_at: f64) -> Self {
        Self {
            target,
            params,
            started_at,
            heating: true,
            extreme: None,
            peaks: Vec::new(),
            samples: Vec::new(),
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn power(&self) -> f64 {
        if self.heating { self.params.max_power } else { 0.0 }
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<(f64, f64)> {
        self.samples
    }

    pub fn expired(&self, eventtime: f64) -> Option<FailReason> {
        let elapsed = eventtime - self.started_at;
        (elapsed > self.params.timeout).then_some(FailReason::Timeout { elapsed })
    }

    /// Feed one fresh, valid sample.
    pub fn feed(&mut self, sample: &TemperatureSample, eventtime: f64) -> RelayStep {
        if let Some(reason) = self.expired(eventtime) {
            return RelayStep::Finished(Err(reason));
        }
        let (time, temp) = (sample.timestamp, sample.value);
        if temp > self.params.max_temp {
            return RelayStep::Finished(Err(FailReason::OverTemperature { temp }));
        }
        if self.samples.len() < MAX_RUN_SAMPLES {
            self.samples.push((time, temp));
        }

        let extreme = self.extreme.get_or_insert((time, temp));
        let beyond = if self.heating { temp < extreme.1 } else { temp > extreme.1 };
        if beyond {
            *extreme = (time, temp);
        }

        let switch = if self.heating {
            temp >= self.target
        } else {
            temp <= self.target - self.params.tune_delta
        };
        if switch {
            if let Some((peak_time, peak_temp)) = self.extreme.take() {
                // Leaving a heating phase records its trough, leaving an off phase its crest.
                self.peaks.push(Peak { time: peak_time, temp: peak_temp, high: !self.heating });
            }
            self.heating = !self.heating;
            tracing::debug!(
                "autotune relay {} at {:.2}, {} peaks",
                if self.heating { "on" } else { "off" },
                temp,
                self.peaks.len()
            );
            if self.peaks.len() >= REQUIRED_PEAKS {
                let relay = self.params.max_power / 2.0;
                return RelayStep::Finished(compute_gains(&self.peaks[WARMUP_PEAKS..], relay));
            }
        }
        RelayStep::Continue(self.power())
    }
}

/// Ziegler-Nichols gains from settled relay peaks. `relay` is half the
/// peak-to-peak relay output.
pub fn compute_gains(peaks: &[Peak], relay: f64) -> Result<PidGains, FailReason> {
    if peaks.len() < 3 {
        return Err(FailReason::NoOscillation);
    }
    let swings: Vec<f64> = peaks.windows(2).map(|w| (w[1].temp - w[0].temp).abs()).collect();
    let amplitude = swings.iter().sum::<f64>() / swings.len() as f64 / 2.0;
    let periods: Vec<f64> = peaks.windows(3).map(|w| w[2].time - w[0].time).collect();
    let period = periods.iter().sum::<f64>() / periods.len() as f64;
    if amplitude < MIN_AMPLITUDE || period <= 0.0 {
        return Err(FailReason::NoOscillation);
    }

    let ku = 4.0 * relay / (PI * amplitude);
    let ti = period / 2.0;
    let td = period / 8.0;
    let kp = 0.6 * ku * PID_PARAM_BASE;
    Ok(PidGains::new(kp, kp / ti, kp * td))
}

/// Record of the latest run.
#[derive(Debug, Clone, Serialize)]
pub struct AutotuneRun {
    pub target: f64,
    pub started_at: f64,
    pub finished_at: Option<f64>,
    pub state: RunState,
    pub gains: Option<PidGains>,
    pub peaks: Vec<Peak>,
    #[serde(skip)]
    pub samples: Vec<(f64, f64)>,
}

/// Per-heater bookkeeping: at most one run at a time, and the gains of the
/// last successful run.
#[derive(Debug, Clone, Default)]
pub struct AutotuneCoordinator {
    run: Option<AutotuneRun>,
    tuned: Option<PidGains>,
}

impl AutotuneCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        self.run.as_ref().map_or(RunState::Idle, |run| run.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn last_run(&self) -> Option<&AutotuneRun> {
        self.run.as_ref()
    }

    /// Gains of the last successful run, kept across failed runs.
    pub fn tuned_gains(&self) -> Option<PidGains> {
        self.tuned
    }

    /// Validate and open a run. The caller installs the returned tuner.
    pub fn start(
        &mut self,
        target: f64,
        min_temp: f64,
        params: TuneParams,
        eventtime: f64,
    ) -> Result<RelayTuner, AutotuneError> {
        if let Some(run) = self.run.as_ref().filter(|run| run.state == RunState::Running) {
            return Err(AutotuneError::AlreadyRunning { target: run.target });
        }
        if target <= min_temp || target >= params.max_temp {
            return Err(AutotuneError::TargetOutOfRange {
                target,
                min: min_temp,
                max: params.max_temp,
            });
        }
        self.run = Some(AutotuneRun {
            target,
            started_at: eventtime,
            finished_at: None,
            state: RunState::Running,
            gains: None,
            peaks: Vec::new(),
            samples: Vec::new(),
        });
        Ok(RelayTuner::new(target, params, eventtime))
    }

    /// Close the running run with its outcome.
    pub fn finish(&mut self, tuner: RelayTuner, result: Result<PidGains, FailReason>, eventtime: f64) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        run.finished_at = Some(eventtime);
        run.peaks = tuner.peaks().to_vec();
        run.samples = tuner.into_samples();
        match result {
            Ok(gains) => {
                run.state = RunState::Completed;
                run.gains = Some(gains);
                self.tuned = Some(gains);
            }
            Err(reason) => run.state = RunState::Failed(reason),
        }
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "state": self.state(),
            "tuned": self.tuned,
            "last_run": self.run,
        })
    }
}
