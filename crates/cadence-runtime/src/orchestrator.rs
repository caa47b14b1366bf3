//! Cycle orchestrator.
//!
//! Drives one decision cycle at a time through
//! `Idle → RunningCritical → RunningParallel → Reporting → Idle`,
//! delegating step execution to the [`PriorityExecutor`] and assembling a
//! [`CycleReport`] at the end. A cycle never fails: step errors surface as
//! outcomes in the report.

use cadence_core::{CycleReport, CycleTotals, Mode, OrchestratorConfig};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::executor::{Execution, PriorityExecutor};
use crate::resilience::{BreakerRegistry, HealthMonitor, HealthSnapshot};
use crate::steps::{validate_steps, CycleContext, Step, StepOperation};
use crate::RuntimeError;

const DEFAULT_REPORT_CAPACITY: usize = 16;

/// Where the orchestrator is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    RunningCritical,
    RunningParallel,
    Reporting,
}

/// Aggregate statistics across cycles.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    pub totals: CycleTotals,
    pub last_report: Option<Arc<CycleReport>>,
}

/// Returns the phase to `Idle` however the cycle ends.
struct PhaseGuard<'a> {
    phase: &'a RwLock<CyclePhase>,
}

impl PhaseGuard<'_> {
    fn enter(&self, next: CyclePhase) {
        *self.phase.write() = next;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.phase.write() = CyclePhase::Idle;
    }
}

/// Runs decision cycles.
///
/// # Architecture
/// - Breakers and the health monitor are created at construction and shared
///   with the executor; breakers report every call to the monitor
/// - The health mode read at cycle start scales tier budgets
/// - Reports are kept as running totals and broadcast to subscribers
pub struct CycleOrchestrator {
    config: OrchestratorConfig,
    steps: Vec<Step>,
    executor: PriorityExecutor,
    health: Arc<HealthMonitor>,

    /// Held for the whole cycle
    cycle_lock: tokio::sync::Mutex<()>,
    phase: RwLock<CyclePhase>,
    next_cycle: AtomicU64,
    stats: Mutex<OrchestratorStats>,
    reports: broadcast::Sender<Arc<CycleReport>>,
}

impl CycleOrchestrator {
    pub fn builder() -> CycleOrchestratorBuilder {
        CycleOrchestratorBuilder::new()
    }

    /// Run one cycle.
    ///
    /// Waits for any cycle already running. Cycle numbers are caller-chosen;
    /// [`run_next_cycle`](Self::run_next_cycle) continues after the highest
    /// one seen.
    pub async fn run_cycle(&self, cycle: u64) -> CycleReport {
        let _running = self.cycle_lock.lock().await;
        let phase = PhaseGuard { phase: &self.phase };
        self.next_cycle.fetch_max(cycle.saturating_add(1), Ordering::SeqCst);

        let started = Instant::now();
        let mode = self.health.current_mode();
        let ctx = Arc::new(CycleContext::new(cycle, mode));
        tracing::info!(cycle, mode = %mode, steps = self.steps.len(), "Cycle started");

        let plan = self.executor.plan(&self.steps, mode);
        let mut execution = Execution::default();

        phase.enter(CyclePhase::RunningCritical);
        self.executor.run_critical(&plan, &ctx, &mut execution).await;

        phase.enter(CyclePhase::RunningParallel);
        self.executor.run_parallel(&plan, &ctx, &mut execution).await;

        phase.enter(CyclePhase::Reporting);
        let (records, timings) = execution.into_parts();
        let report = CycleReport::assemble(
            cycle,
            ctx.started_at(),
            self.health.current_mode(),
            records,
            &timings,
            started.elapsed(),
        );

        let degraded = report.degraded_steps().count();
        if degraded > 0 {
            tracing::warn!(
                cycle,
                mode = %report.mode,
                degraded,
                elapsed = ?report.total_elapsed,
                "Cycle finished with degraded steps"
            );
        } else {
            tracing::info!(cycle, mode = %report.mode, elapsed = ?report.total_elapsed, "Cycle finished");
        }

        let shared = Arc::new(report.clone());
        {
            let mut stats = self.stats.lock();
            stats.totals.absorb(&report);
            stats.last_report = Some(Arc::clone(&shared));
        }
        // No subscribers is fine
        let _ = self.reports.send(shared);

        report
    }

    /// Run the cycle after the highest numbered one so far (starting at 1).
    pub async fn run_next_cycle(&self) -> CycleReport {
        let cycle = self.next_cycle.fetch_add(1, Ordering::SeqCst);
        self.run_cycle(cycle).await
    }

    /// Run cycles every `interval` until `shutdown` is cancelled.
    ///
    /// A cycle in progress when shutdown fires is finished first. Returns
    /// the number of cycles run.
    pub async fn run_loop(&self, interval: Duration, shutdown: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ran = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.run_next_cycle().await;
            ran += 1;
        }

        tracing::info!(cycles = ran, "Cycle loop stopped");
        ran
    }

    /// Spawn the periodic health check.
    pub fn start_health_monitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.health.spawn(Arc::clone(self.executor.breakers()), shutdown)
    }

    /// Run one health check now.
    pub fn check_health(&self) -> Mode {
        self.health.check_registry(self.executor.breakers())
    }

    /// Receive every report from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CycleReport>> {
        self.reports.subscribe()
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().clone()
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.read()
    }

    pub fn mode(&self) -> Mode {
        self.health.current_mode()
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.executor.breakers()
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        self.executor.cache()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Builder for CycleOrchestrator.
pub struct CycleOrchestratorBuilder {
    config: OrchestratorConfig,
    bindings: BTreeMap<String, Arc<dyn StepOperation>>,
    steps: Vec<Step>,
    health: Option<Arc<HealthMonitor>>,
    breakers: Option<Arc<BreakerRegistry>>,
    cache: Option<Arc<ResultCache>>,
    report_capacity: usize,
}

impl CycleOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            bindings: BTreeMap::new(),
            steps: Vec::new(),
            health: None,
            breakers: None,
            cache: None,
            report_capacity: DEFAULT_REPORT_CAPACITY,
        }
    }

    /// Set the configuration. Steps declared in it need an operation bound
    /// with [`bind`](Self::bind).
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the operation of a step declared in the configuration.
    pub fn bind(mut self, step: impl Into<String>, operation: Arc<dyn StepOperation>) -> Self {
        self.bindings.insert(step.into(), operation);
        self
    }

    /// Add a step defined in code, after the configured ones.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Use an existing health monitor.
    pub fn health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = Some(health);
        self
    }

    /// Use an existing breaker registry. It should already report to the
    /// health monitor.
    pub fn breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Reports buffered for slow subscribers.
    pub fn report_capacity(mut self, capacity: usize) -> Self {
        self.report_capacity = capacity.max(1);
        self
    }

    /// Validate everything and build the orchestrator.
    pub fn build(self) -> Result<CycleOrchestrator, RuntimeError> {
        let Self {
            config,
            mut bindings,
            steps: extra,
            health,
            breakers,
            cache,
            report_capacity,
        } = self;

        config.validate()?;

        let mut problems = Vec::new();
        let mut steps = Vec::with_capacity(config.steps.len() + extra.len());
        for declared in &config.steps {
            match bindings.remove(&declared.name) {
                Some(operation) => steps.push(Step::from_config(declared.clone(), operation)),
                None => problems.push(format!("step '{}': no operation bound", declared.name)),
            }
        }
        for unknown in bindings.keys() {
            problems.push(format!("operation bound to unknown step '{}'", unknown));
        }
        if !problems.is_empty() {
            return Err(cadence_core::ConfigError::Invalid(problems).into());
        }

        steps.extend(extra);
        validate_steps(&steps)?;

        let health = health.unwrap_or_else(|| Arc::new(HealthMonitor::new(config.health.clone())));
        let breakers = breakers.unwrap_or_else(|| {
            Arc::new(BreakerRegistry::new(config.breaker.clone()).with_health(Arc::clone(&health)))
        });
        let cache = cache.unwrap_or_default();
        let executor = PriorityExecutor::from_config(&config, breakers, cache);
        let (reports, _) = broadcast::channel(report_capacity);

        tracing::debug!(steps = steps.len(), "Orchestrator built");

        Ok(CycleOrchestrator {
            config,
            steps,
            executor,
            health,
            cycle_lock: tokio::sync::Mutex::new(()),
            phase: RwLock::new(CyclePhase::Idle),
            next_cycle: AtomicU64::new(1),
            stats: Mutex::new(OrchestratorStats::default()),
            reports,
        })
    }
}

impl Default for CycleOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use crate::steps::fn_operation;
    use cadence_core::{
        BreakerConfig, FallbackSource, Priority, SkipReason, StepConfig, StepError, StepOutcome,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn failing(calls: &Arc<AtomicUsize>) -> Arc<dyn StepOperation> {
        let calls = Arc::clone(calls);
        fn_operation(move |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("503 service unavailable")) }
        })
    }

    fn succeeding() -> Arc<dyn StepOperation> {
        fn_operation(|ctx: Arc<CycleContext>| async move { Ok(json!({ "cycle": ctx.cycle() })) })
    }

    fn agent_config(failure_threshold: u32) -> OrchestratorConfig {
        let mut config = OrchestratorConfig {
            breaker: BreakerConfig {
                failure_threshold,
                ..Default::default()
            },
            ..Default::default()
        };

        let step = |name: &str, priority, dependency: &str| {
            let mut step = StepConfig::new(name, priority, Duration::from_secs(1));
            step.dependency = Some(dependency.to_string());
            step
        };

        let mut perceive = step("perceive", Priority::Critical, "sensor");
        perceive.fallback = Some(json!("nothing new"));
        let mut select = step("select-goal", Priority::Critical, "inference-chat");
        select.fallback = Some(json!({ "goal": "rest" }));

        config.steps = vec![
            perceive,
            select,
            step("plan", Priority::Important, "inference-chat"),
            step("narrate", Priority::Optional, "inference-chat"),
        ];
        config
    }

    #[tokio::test]
    async fn test_emergency_with_two_dependencies_open() {
        let calls = Arc::new(AtomicUsize::new(0));
        let orchestrator = CycleOrchestrator::builder()
            .config(agent_config(1))
            .bind("perceive", failing(&calls))
            .bind("select-goal", failing(&calls))
            .bind("plan", failing(&calls))
            .bind("narrate", failing(&calls))
            .build()
            .unwrap();

        // Cycle 1 trips both breakers
        let first = orchestrator.run_cycle(1).await;
        assert_eq!(first.tier(Priority::Critical).fell_back, 2);
        assert_eq!(orchestrator.breakers().get("sensor").state(), CircuitState::Open);
        assert_eq!(orchestrator.breakers().get("inference-chat").state(), CircuitState::Open);

        assert_eq!(orchestrator.check_health(), Mode::Emergency);
        let invoked = calls.load(Ordering::SeqCst);

        let report = orchestrator.run_cycle(2).await;
        assert_eq!(report.mode, Mode::Emergency);

        // CRITICAL steps ran on fallbacks without reaching the dependencies
        assert_eq!(calls.load(Ordering::SeqCst), invoked);
        assert_eq!(
            report.outcome("perceive"),
            Some(&StepOutcome::FellBack {
                value: json!("nothing new"),
                reason: StepError::unavailable("sensor"),
                source: FallbackSource::Custom,
            })
        );
        assert_eq!(
            report.outcome("select-goal").and_then(|o| o.failure()),
            Some(&StepError::unavailable("inference-chat"))
        );

        for name in ["plan", "narrate"] {
            assert_eq!(
                report.outcome(name),
                Some(&StepOutcome::Skipped {
                    reason: SkipReason::ModeOmitted { mode: Mode::Emergency }
                })
            );
        }

        let critical = report.tier(Priority::Critical);
        assert_eq!((critical.completed, critical.fell_back, critical.skipped), (0, 2, 0));
        assert_eq!(report.tier(Priority::Important).completed, 0);
        assert_eq!(report.tier(Priority::Optional).completed, 0);
        assert_eq!(report.dependencies["inference-chat"].rejected, 1);
    }

    fn gated(up: &Arc<AtomicBool>) -> Arc<dyn StepOperation> {
        let up = Arc::clone(up);
        fn_operation(move |_ctx| {
            let up = up.load(Ordering::SeqCst);
            async move {
                if !up {
                    anyhow::bail!("connection refused");
                }
                Ok(json!("ok"))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_recovers_when_only_omitted_tiers_use_the_dependencies() {
        let up = Arc::new(AtomicBool::new(false));
        let mut config = OrchestratorConfig {
            breaker: BreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut plan = StepConfig::new("plan", Priority::Important, Duration::from_secs(1));
        plan.dependency = Some("inference-chat".to_string());
        let mut embed = StepConfig::new("embed", Priority::Optional, Duration::from_secs(1));
        embed.dependency = Some("inference-embed".to_string());
        config.steps = vec![plan, embed];

        let orchestrator = CycleOrchestrator::builder()
            .config(config)
            .bind("plan", gated(&up))
            .bind("embed", gated(&up))
            .build()
            .unwrap();

        orchestrator.run_next_cycle().await;
        assert_eq!(orchestrator.check_health(), Mode::Emergency);

        // Nothing in EMERGENCY calls either dependency again
        up.store(true, Ordering::SeqCst);
        let mut last = None;
        for _ in 0..20 {
            tokio::time::advance(Duration::from_secs(60)).await;
            last = Some(orchestrator.run_next_cycle().await);
            if orchestrator.check_health() == Mode::Normal {
                break;
            }
        }

        assert_eq!(orchestrator.mode(), Mode::Normal);
        for dependency in ["inference-chat", "inference-embed"] {
            assert_eq!(orchestrator.breakers().get(dependency).state(), CircuitState::Closed);
        }
        let last = last.unwrap();
        assert!(last.outcome("plan").unwrap().is_completed());
        assert!(last.outcome("embed").unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_highest_cycle_number_does_not_overflow() {
        let orchestrator = CycleOrchestrator::builder()
            .step(Step::new("narrate", Priority::Optional, Duration::from_secs(1), succeeding()))
            .build()
            .unwrap();

        let report = orchestrator.run_cycle(u64::MAX).await;
        assert_eq!(report.cycle, u64::MAX);
        assert!(report.outcome("narrate").unwrap().is_completed());
    }

    #[tokio::test]
    async fn test_success_after_failure_resets_breaker() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let flaky = fn_operation(move |_ctx| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("cold start");
                }
                Ok(json!("explore"))
            }
        });

        let orchestrator = CycleOrchestrator::builder()
            .step(
                Step::new("select-goal", Priority::Critical, Duration::from_secs(1), flaky)
                    .dependency("inference-chat")
                    .fallback_value(json!("rest")),
            )
            .build()
            .unwrap();

        orchestrator.run_next_cycle().await;
        let breaker = orchestrator.breakers().get("inference-chat");
        assert_eq!(breaker.consecutive_failures(), 1);

        let report = orchestrator.run_next_cycle().await;
        assert_eq!(report.cycle, 2);
        assert!(report.outcome("select-goal").unwrap().is_completed());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_build_reports_binding_problems() {
        let calls = Arc::new(AtomicUsize::new(0));
        let err = CycleOrchestrator::builder()
            .config(agent_config(3))
            .bind("perceive", failing(&calls))
            .bind("select-goal", failing(&calls))
            .bind("narrate", failing(&calls))
            .bind("reflect", failing(&calls))
            .build()
            .err()
            .unwrap();

        let RuntimeError::Config(config) = err;
        let problems = config.problems();
        assert!(problems.contains(&"step 'plan': no operation bound".to_string()));
        assert!(problems.contains(&"operation bound to unknown step 'reflect'".to_string()));
    }

    #[tokio::test]
    async fn test_build_rejects_critical_without_fallback() {
        let result = CycleOrchestrator::builder()
            .step(Step::new("act", Priority::Critical, Duration::from_secs(1), succeeding()))
            .build();

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_build_rejects_declared_critical_without_fallback() {
        let mut config = agent_config(3);
        config.steps[1].fallback = None;

        let calls = Arc::new(AtomicUsize::new(0));
        let err = CycleOrchestrator::builder()
            .config(config)
            .bind("perceive", failing(&calls))
            .bind("select-goal", failing(&calls))
            .bind("plan", failing(&calls))
            .bind("narrate", failing(&calls))
            .build()
            .err()
            .unwrap();

        let RuntimeError::Config(config) = err;
        assert_eq!(
            config.problems(),
            &["step 'select-goal': CRITICAL steps must declare a fallback".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stats_and_subscribers() {
        let orchestrator = CycleOrchestrator::builder()
            .step(
                Step::new("act", Priority::Critical, Duration::from_secs(1), succeeding())
                    .fallback_value(json!("wait")),
            )
            .step(Step::new("narrate", Priority::Optional, Duration::from_secs(1), succeeding()))
            .build()
            .unwrap();
        let mut reports = orchestrator.subscribe();

        orchestrator.run_next_cycle().await;
        orchestrator.run_next_cycle().await;

        assert_eq!(reports.recv().await.unwrap().cycle, 1);
        assert_eq!(reports.recv().await.unwrap().cycle, 2);

        let stats = orchestrator.stats();
        assert_eq!(stats.totals.cycles, 2);
        assert_eq!(stats.totals.tiers[&Priority::Critical].completed, 2);
        assert_eq!(stats.totals.tiers[&Priority::Optional].completed, 2);
        assert_eq!(stats.totals.modes["NORMAL"], 2);
        assert_eq!(stats.last_report.unwrap().cycle, 2);

        assert_eq!(orchestrator.phase(), CyclePhase::Idle);
        let cached = orchestrator.cache().get("act").await.unwrap();
        assert_eq!(cached.value, json!({ "cycle": 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_until_shutdown() {
        let orchestrator = Arc::new(
            CycleOrchestrator::builder()
                .step(Step::new("narrate", Priority::Optional, Duration::from_secs(1), succeeding()))
                .build()
                .unwrap(),
        );
        let shutdown = CancellationToken::new();

        let runner = {
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { orchestrator.run_loop(Duration::from_secs(10), shutdown).await })
        };

        // Ticks at 0s, 10s and 20s
        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();

        assert_eq!(runner.await.unwrap(), 3);
        assert_eq!(orchestrator.stats().totals.cycles, 3);
    }
}
