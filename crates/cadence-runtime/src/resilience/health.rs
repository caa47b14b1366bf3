//! System-wide health monitoring.
//!
//! Circuit breakers report every call outcome here. A background check
//! periodically folds breaker states and recent latencies into a single
//! operating [`Mode`] that the executor reads to scale tier budgets.

use cadence_core::{HealthConfig, Mode};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::circuit_breaker::{BreakerRegistry, BreakerSnapshot, CircuitState};

/// Result of one call attempt, as seen by a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,

    /// The breaker refused the call; carries no latency sample
    Rejected,
}

/// Errors computing health. Never surfaced to callers.
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("clock moved backwards relative to mode entry")]
    ClockSkew,
}

/// Per-dependency health view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,

    /// p95 over the recent window, once enough samples exist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p95_ms: Option<u64>,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub mode: Mode,
    pub time_in_mode_ms: u64,
    pub dependencies: BTreeMap<String, DependencyHealth>,
}

#[derive(Debug, Default)]
struct Signals {
    /// (recorded at, latency), oldest first
    latencies: VecDeque<(Instant, Duration)>,
    calls: u64,
    successes: u64,
    failures: u64,
    rejected: u64,
}

impl Signals {
    fn recent_latencies(&self, max_age: Duration) -> impl Iterator<Item = Duration> + '_ {
        let now = Instant::now();
        self.latencies
            .iter()
            .filter(move |(at, _)| now.saturating_duration_since(*at) <= max_age)
            .map(|(_, latency)| *latency)
    }
}

#[derive(Debug)]
struct ModeState {
    mode: Mode,
    entered_at: Instant,
    last_check_at: Option<Instant>,
}

/// Aggregates breaker and latency signals into an operating mode.
pub struct HealthMonitor {
    config: HealthConfig,
    signals: Mutex<HashMap<String, Signals>>,
    state: RwLock<ModeState>,
    mode_tx: watch::Sender<Mode>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let (mode_tx, _) = watch::channel(Mode::Normal);
        Self {
            config,
            signals: Mutex::new(HashMap::new()),
            state: RwLock::new(ModeState {
                mode: Mode::Normal,
                entered_at: Instant::now(),
                last_check_at: None,
            }),
            mode_tx,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record the outcome of one call attempt.
    pub fn record_outcome(&self, dependency: &str, latency: Duration, outcome: CallOutcome) {
        let mut signals = self.signals.lock();
        let entry = signals.entry(dependency.to_string()).or_default();

        entry.calls += 1;
        match outcome {
            CallOutcome::Success => entry.successes += 1,
            CallOutcome::Failure => entry.failures += 1,
            CallOutcome::Rejected => {
                entry.rejected += 1;
                return;
            }
        }

        let now = Instant::now();
        entry.latencies.push_back((now, latency));
        while entry.latencies.len() > self.config.latency_window {
            entry.latencies.pop_front();
        }
        while let Some((at, _)) = entry.latencies.front() {
            if now.saturating_duration_since(*at) <= self.config.latency_max_age {
                break;
            }
            entry.latencies.pop_front();
        }
    }

    pub fn current_mode(&self) -> Mode {
        self.state.read().mode
    }

    /// Mode change notifications.
    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    pub fn last_check_at(&self) -> Option<Instant> {
        self.state.read().last_check_at
    }

    /// p95 latency of a dependency, if enough recent samples exist.
    pub fn p95_latency(&self, dependency: &str) -> Option<Duration> {
        self.signals
            .lock()
            .get(dependency)
            .and_then(|s| self.recent_p95(s))
    }

    fn recent_p95(&self, signals: &Signals) -> Option<Duration> {
        p95(
            signals.recent_latencies(self.config.latency_max_age),
            self.config.min_latency_samples,
        )
    }

    /// Run one health check against the given breaker states.
    ///
    /// A failure to compute keeps the last known mode.
    pub fn check(&self, breakers: &[BreakerSnapshot]) -> Mode {
        match self.evaluate(breakers) {
            Ok(next) => self.apply(next),
            Err(e) => {
                tracing::warn!(error = %e, "Health check failed, keeping last known mode");
                self.current_mode()
            }
        }
    }

    /// Run one health check against every breaker in a registry.
    pub fn check_registry(&self, breakers: &BreakerRegistry) -> Mode {
        self.check(&breakers.snapshots())
    }

    fn evaluate(&self, breakers: &[BreakerSnapshot]) -> Result<Mode, HealthError> {
        let unhealthy = self.unhealthy(breakers);
        let state = self.state.read();
        let time_in_mode = Instant::now()
            .checked_duration_since(state.entered_at)
            .ok_or(HealthError::ClockSkew)?;

        Ok(next_mode(state.mode, unhealthy.len(), time_in_mode, &self.config))
    }

    /// Dependencies with a non-closed breaker or p95 above the ceiling.
    ///
    /// A breaker that would admit a recovery trial is not counted, since
    /// steps in omitted tiers never call it again.
    fn unhealthy(&self, breakers: &[BreakerSnapshot]) -> BTreeSet<String> {
        let mut unhealthy: BTreeSet<String> = breakers
            .iter()
            .filter(|b| b.state != CircuitState::Closed && !b.trial_eligible)
            .map(|b| b.dependency.clone())
            .collect();

        let signals = self.signals.lock();
        for (dependency, s) in signals.iter() {
            if let Some(p95) = self.recent_p95(s) {
                if p95 > self.config.latency_ceiling {
                    unhealthy.insert(dependency.clone());
                }
            }
        }

        unhealthy
    }

    fn apply(&self, next: Mode) -> Mode {
        let now = Instant::now();
        let mut state = self.state.write();
        state.last_check_at = Some(now);

        if state.mode != next {
            let previous = state.mode;
            state.mode = next;
            state.entered_at = now;
            drop(state);

            match next {
                Mode::Degraded | Mode::Emergency => {
                    tracing::warn!(from = %previous, to = %next, "Health mode changed")
                }
                Mode::Normal | Mode::Recovery => {
                    tracing::info!(from = %previous, to = %next, "Health mode changed")
                }
            }
            self.mode_tx.send_replace(next);
        }

        next
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let (mode, entered_at) = {
            let state = self.state.read();
            (state.mode, state.entered_at)
        };
        let signals = self.signals.lock();
        let dependencies = signals
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    DependencyHealth {
                        calls: s.calls,
                        successes: s.successes,
                        failures: s.failures,
                        rejected: s.rejected,
                        p95_ms: self.recent_p95(s).map(|d| d.as_millis() as u64),
                    },
                )
            })
            .collect();

        HealthSnapshot {
            mode,
            time_in_mode_ms: entered_at.elapsed().as_millis() as u64,
            dependencies,
        }
    }

    /// Spawn the periodic background check.
    ///
    /// Runs every `check_interval` until `shutdown` is cancelled.
    pub fn spawn(
        self: &Arc<Self>,
        breakers: Arc<BreakerRegistry>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let period = monitor.config.check_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Health monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        monitor.check_registry(&breakers);
                    }
                }
            }
        })
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

/// Mode transition for one check.
///
/// RECOVERY needs one full check interval of healthy signals before NORMAL.
fn next_mode(current: Mode, unhealthy: usize, time_in_mode: Duration, config: &HealthConfig) -> Mode {
    match (current, unhealthy) {
        (_, n) if n >= 2 => Mode::Emergency,
        (Mode::Normal, 1) | (Mode::Recovery, 1) => Mode::Degraded,
        (Mode::Degraded, 1) if time_in_mode >= config.degraded_escalation_after => Mode::Emergency,
        (Mode::Degraded, 1) => Mode::Degraded,
        (Mode::Emergency, 1) => Mode::Emergency,
        (Mode::Normal, _) => Mode::Normal,
        (Mode::Degraded, _) | (Mode::Emergency, _) => Mode::Recovery,
        (Mode::Recovery, _) if time_in_mode >= config.check_interval => Mode::Normal,
        (Mode::Recovery, _) => Mode::Recovery,
    }
}

/// Nearest-rank p95, `None` below `min_samples`.
fn p95(samples: impl Iterator<Item = Duration>, min_samples: usize) -> Option<Duration> {
    let mut sorted: Vec<Duration> = samples.collect();
    if sorted.is_empty() || sorted.len() < min_samples {
        return None;
    }
    sorted.sort_unstable();
    let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted.get(rank.saturating_sub(1)).copied()
}
