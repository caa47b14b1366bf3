//! Circuit breaker to prevent cascade failures.
//!
//! When calls to a dependency fail repeatedly, its circuit opens and
//! subsequent calls are rejected immediately instead of waiting on a broken
//! service. After `reset_timeout` a single trial call is let through; its
//! outcome closes or reopens the circuit.

use cadence_core::{BreakerConfig, CircuitOpenError, HalfOpenPolicy};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::health::{CallOutcome, HealthMonitor};

/// State of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,

    /// Circuit is open, all calls are rejected
    Open,

    /// Testing if the dependency recovered
    HalfOpen,
}

/// Error from a call routed through a breaker.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    #[error(transparent)]
    Open(#[from] CircuitOpenError),

    #[error("{0}")]
    Inner(E),
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,

    /// How long the circuit has been open, if it is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_for: Option<Duration>,

    /// The next call would be admitted as a recovery trial
    #[serde(default)]
    pub trial_eligible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Circuit breaker for one named dependency.
///
/// State transitions happen under a short lock that is never held across
/// the guarded call itself.
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    health: Option<Arc<HealthMonitor>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
            health: None,
        }
    }

    /// Report every call outcome to a health monitor.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Route a call through the breaker.
    ///
    /// `operation` is only invoked when the circuit admits the call. Any
    /// `Err` it returns (timeouts included, if the caller wraps one) counts
    /// as a dependency failure.
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(open) => {
                self.report(Duration::ZERO, CallOutcome::Rejected);
                return Err(BreakerError::Open(open));
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let started = Instant::now();
        let result = operation().await;
        let latency = started.elapsed();
        guard.armed = false;

        match &result {
            Ok(_) => {
                self.record_success(admission);
                self.report(latency, CallOutcome::Success);
            }
            Err(_) => {
                self.record_failure(admission);
                self.report(latency, CallOutcome::Failure);
            }
        }

        result.map_err(BreakerError::Inner)
    }

    /// Route a call through the breaker, substituting `fallback` on any error.
    pub async fn call_with_fallback<T, E, F, Fut, G>(&self, operation: F, fallback: G) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(&BreakerError<E>) -> T,
    {
        match self.call(operation).await {
            Ok(value) => value,
            Err(e) => fallback(&e),
        }
    }

    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    inner.consecutive_failures = 0;
                    tracing::info!(
                        dependency = %self.dependency,
                        "Circuit transitioning to half-open for recovery test"
                    );
                    Ok(Admission::Trial)
                } else {
                    Err(self.open_error())
                }
            }
            CircuitState::HalfOpen if inner.trial_in_flight => Err(self.open_error()),
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;

        if admission == Admission::Trial {
            inner.trial_in_flight = false;
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            tracing::info!(dependency = %self.dependency, "Circuit closed after successful recovery");
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let failures = inner.consecutive_failures;

        match (inner.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                let reopen = match self.config.half_open_policy {
                    HalfOpenPolicy::ReopenImmediately => true,
                    HalfOpenPolicy::CountTowardThreshold => failures >= self.config.failure_threshold,
                };
                if reopen {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        dependency = %self.dependency,
                        "Circuit reopened after failed recovery attempt"
                    );
                } else {
                    tracing::debug!(
                        dependency = %self.dependency,
                        failures,
                        "Recovery trial failed, circuit stays half-open"
                    );
                }
            }
            (CircuitState::Closed, _) if failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!(
                    dependency = %self.dependency,
                    failures,
                    "Circuit opened after repeated failures"
                );
            }
            // Late results from calls admitted before the circuit opened
            _ => {}
        }
    }

    /// Release a trial slot whose call was abandoned before completing.
    fn abandon_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.trial_in_flight {
            inner.trial_in_flight = false;
            tracing::debug!(dependency = %self.dependency, "Recovery trial abandoned");
        }
    }

    fn report(&self, latency: Duration, outcome: CallOutcome) {
        if let Some(health) = &self.health {
            health.record_outcome(&self.dependency, latency, outcome);
        }
    }

    fn open_error(&self) -> CircuitOpenError {
        CircuitOpenError {
            dependency: self.dependency.clone(),
        }
    }

    /// Get current state of the circuit.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let open_for = match inner.state {
            CircuitState::Open => inner.opened_at.map(|at| at.elapsed()),
            _ => None,
        };
        let trial_eligible = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => open_for.unwrap_or_default() >= self.config.reset_timeout,
            CircuitState::HalfOpen => !inner.trial_in_flight,
        };
        BreakerSnapshot {
            dependency: self.dependency.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for,
            trial_eligible,
        }
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }
}

struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_trial();
        }
    }
}

/// Process-lifetime breakers keyed by dependency name.
///
/// Breakers are created lazily on first use and never removed.
pub struct BreakerRegistry {
    config: BreakerConfig,
    health: Option<Arc<HealthMonitor>>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            health: None,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Breakers created by this registry report to `health`.
    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Get or create the breaker for a dependency.
    pub fn get(&self, dependency: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(dependency) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(dependency.to_string()).or_insert_with(|| {
            let mut breaker = CircuitBreaker::new(dependency, self.config.clone());
            if let Some(health) = &self.health {
                breaker = breaker.with_health(Arc::clone(health));
            }
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Route a call through the named dependency's breaker.
    pub async fn call<T, E, F, Fut>(&self, dependency: &str, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get(dependency).call(operation).await
    }

    /// Snapshots of every breaker, ordered by dependency name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.read().values().map(|b| b.snapshot()).collect()
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Reset all circuits to closed.
    pub fn reset(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::HealthConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn config(failure_threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            reset_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        let _ = cb.call(|| async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("inference-chat", BreakerConfig::default());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_after_threshold_and_rejects() {
        let cb = CircuitBreaker::new("inference-chat", config(3));

        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open(_))));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_after_reset_timeout() {
        let cb = Arc::new(CircuitBreaker::new("inference-chat", config(3)));
        for _ in 0..3 {
            fail(&cb).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial_cb = Arc::clone(&cb);
        let trial = tokio::spawn(async move {
            trial_cb
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, &str>("recovered")
                })
                .await
        });
        started_rx.await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Concurrent callers during the trial are rejected without running
        let invoked = AtomicUsize::new(0);
        for _ in 0..3 {
            let result = cb
                .call(|| async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, &str>("other")
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Open(_))));
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "recovered");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_immediately() {
        let cb = CircuitBreaker::new("inference-chat", config(3));
        for _ in 0..3 {
            fail(&cb).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        // Fresh opened_at: still rejecting shortly after the failed trial
        tokio::time::advance(Duration::from_secs(10)).await;
        let result = cb.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_toward_threshold_policy() {
        let cb = CircuitBreaker::new(
            "inference-embed",
            BreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(5),
                half_open_policy: HalfOpenPolicy::CountTowardThreshold,
            },
        );
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.consecutive_failures(), 1);

        // A second trial is admitted and its failure reaches the threshold
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new("inference-chat", config(3));

        fail(&cb).await;
        assert_eq!(cb.consecutive_failures(), 1);
        succeed(&cb).await;
        assert_eq!(cb.consecutive_failures(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);

        // Need 3 more failures to open
        fail(&cb).await;
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_releases_slot() {
        let cb = CircuitBreaker::new("inference-chat", config(1));
        fail(&cb).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            cb.call(|| std::future::pending::<Result<(), &str>>()),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_marks_trial_eligibility() {
        let cb = CircuitBreaker::new("inference-chat", config(1));
        assert!(!cb.snapshot().trial_eligible);

        fail(&cb).await;
        let open = cb.snapshot();
        assert_eq!(open.state, CircuitState::Open);
        assert!(!open.trial_eligible);

        // Reported without anyone calling in
        tokio::time::advance(Duration::from_secs(31)).await;
        let waiting = cb.snapshot();
        assert_eq!(waiting.state, CircuitState::Open);
        assert!(waiting.trial_eligible);
        assert_eq!(waiting.open_for, Some(Duration::from_secs(31)));

        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!cb.snapshot().trial_eligible);
    }

    #[tokio::test]
    async fn test_call_with_fallback_when_open() {
        let cb = CircuitBreaker::new("inference-chat", config(1));
        fail(&cb).await;

        let value = cb
            .call_with_fallback(
                || async { Ok::<_, &str>("live") },
                |e| match e {
                    BreakerError::Open(_) => "fallback",
                    BreakerError::Inner(_) => "error",
                },
            )
            .await;
        assert_eq!(value, "fallback");
    }

    #[tokio::test]
    async fn test_outcomes_reported_to_health() {
        let health = Arc::new(HealthMonitor::new(HealthConfig::default()));
        let cb = CircuitBreaker::new("inference-chat", config(1)).with_health(Arc::clone(&health));

        succeed(&cb).await;
        fail(&cb).await;
        fail(&cb).await; // rejected

        let stats = &health.snapshot().dependencies["inference-chat"];
        assert_eq!(stats.calls, 3);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.rejected, 1);
    }

    #[tokio::test]
    async fn test_registry_breakers_are_independent() {
        let registry = BreakerRegistry::new(config(2));

        for _ in 0..2 {
            let _ = registry
                .call("inference-chat", || async { Err::<(), _>("down") })
                .await;
        }

        assert_eq!(registry.get("inference-chat").state(), CircuitState::Open);
        assert_eq!(registry.get("inference-embed").state(), CircuitState::Closed);
        assert!(Arc::ptr_eq(
            &registry.get("inference-chat"),
            &registry.get("inference-chat")
        ));

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].dependency, "inference-chat");
        assert!(snapshots[0].open_for.is_some());

        registry.reset();
        assert_eq!(registry.get("inference-chat").state(), CircuitState::Closed);
    }
}
