//! Priority-tiered step execution.
//!
//! # Execution Flow
//! 1. Plan: partition steps by tier; tiers the mode omits are Skipped
//! 2. CRITICAL: strictly sequential, each step under its own timeout
//! 3. IMPORTANT and OPTIONAL: concurrently, each tier racing its budget
//!
//! Every step call goes through its dependency's circuit breaker. No step
//! error escapes this module: each one becomes a `FellBack` outcome.

use cadence_core::{
    Mode, OrchestratorConfig, Priority, SkipReason, StepError, StepOutcome, StepRecord,
    TierConfigs, TierTiming,
};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::resilience::{BreakerError, BreakerRegistry, BudgetPlan, FallbackResolver, TierBudget};
use crate::steps::{CycleContext, Step};

/// Steps of one cycle, partitioned by tier.
///
/// Each step keeps its declaration index so records can be put back in
/// declaration order.
#[derive(Debug)]
pub struct CyclePlan<'a> {
    pub mode: Mode,
    budgets: BudgetPlan,
    critical: Vec<(usize, &'a Step)>,
    important: Vec<(usize, &'a Step)>,
    optional: Vec<(usize, &'a Step)>,
    omitted: Vec<(usize, StepRecord)>,
}

impl CyclePlan<'_> {
    /// Number of steps that will be attempted.
    pub fn runnable(&self) -> usize {
        self.critical.len() + self.important.len() + self.optional.len()
    }

    /// Steps the mode leaves out of this cycle.
    pub fn omitted(&self) -> impl Iterator<Item = &StepRecord> {
        self.omitted.iter().map(|(_, record)| record)
    }
}

/// Records and tier timings of one cycle.
#[derive(Debug, Default)]
pub struct Execution {
    records: BTreeMap<usize, StepRecord>,
    timings: BTreeMap<Priority, TierTiming>,
}

impl Execution {
    /// Records in declaration order.
    pub fn records(&self) -> impl Iterator<Item = &StepRecord> {
        self.records.values()
    }

    pub fn timings(&self) -> &BTreeMap<Priority, TierTiming> {
        &self.timings
    }

    /// Step name to outcome.
    pub fn outcomes(&self) -> BTreeMap<String, StepOutcome> {
        self.records
            .values()
            .map(|r| (r.name.clone(), r.outcome.clone()))
            .collect()
    }

    pub fn into_parts(self) -> (Vec<StepRecord>, BTreeMap<Priority, TierTiming>) {
        (self.records.into_values().collect(), self.timings)
    }
}

/// How a step in a concurrent tier ended.
enum TierRun {
    Finished(StepRecord),

    /// Cancelled by the tier deadline after starting
    Cancelled(Duration),

    /// Never started before the deadline
    NotStarted,
}

/// Runs steps by priority under per-tier budgets.
pub struct PriorityExecutor {
    tiers: TierConfigs,
    degraded_factor: f64,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<ResultCache>,
    resolver: FallbackResolver,
}

impl PriorityExecutor {
    pub fn new(
        tiers: TierConfigs,
        degraded_factor: f64,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<ResultCache>,
    ) -> Self {
        let resolver = FallbackResolver::new(Arc::clone(&cache));
        Self {
            tiers,
            degraded_factor,
            breakers,
            cache,
            resolver,
        }
    }

    pub fn from_config(
        config: &OrchestratorConfig,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self::new(
            config.tiers.clone(),
            config.health.degraded_budget_factor,
            breakers,
            cache,
        )
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Run every step of one cycle.
    pub async fn execute(&self, steps: &[Step], ctx: &Arc<CycleContext>) -> Execution {
        let plan = self.plan(steps, ctx.mode());
        let mut execution = Execution::default();
        self.run_critical(&plan, ctx, &mut execution).await;
        self.run_parallel(&plan, ctx, &mut execution).await;
        execution
    }

    /// Partition steps by tier and compute budgets for `mode`.
    pub fn plan<'a>(&self, steps: &'a [Step], mode: Mode) -> CyclePlan<'a> {
        let mut plan = CyclePlan {
            mode,
            budgets: BudgetPlan::new(&self.tiers, mode, self.degraded_factor),
            critical: Vec::new(),
            important: Vec::new(),
            optional: Vec::new(),
            omitted: Vec::new(),
        };

        for (index, step) in steps.iter().enumerate() {
            if !mode.admits(step.priority()) {
                let outcome = StepOutcome::Skipped {
                    reason: SkipReason::ModeOmitted { mode },
                };
                plan.omitted.push((index, record(step, outcome, Duration::ZERO)));
                continue;
            }

            match step.priority() {
                Priority::Critical => plan.critical.push((index, step)),
                Priority::Important => plan.important.push((index, step)),
                Priority::Optional => plan.optional.push((index, step)),
            }
        }

        if !plan.omitted.is_empty() {
            tracing::info!(mode = %mode, omitted = plan.omitted.len(), "Mode omits lower tiers");
        }
        plan
    }

    /// CRITICAL tier: one step at a time in declaration order.
    ///
    /// The tier budget is measured, never enforced. Each step's value
    /// (genuine or substitute) is published into the cycle context.
    pub async fn run_critical(&self, plan: &CyclePlan<'_>, ctx: &Arc<CycleContext>, execution: &mut Execution) {
        let mut budget = plan.budgets.tier(Priority::Critical);
        budget.start();

        for &(index, step) in &plan.critical {
            let record = self.run_step(step, ctx).await;
            if let Some(value) = record.outcome.value() {
                ctx.publish(step.name(), value.clone());
            }
            execution.records.insert(index, record);
        }

        let timing = TierTiming {
            elapsed: budget.elapsed(),
            budget: budget.budget,
        };
        if timing.elapsed > timing.budget {
            tracing::warn!(
                elapsed = ?timing.elapsed,
                budget = ?timing.budget,
                "CRITICAL tier exceeded its budget"
            );
        }
        execution.timings.insert(Priority::Critical, timing);
    }

    /// IMPORTANT and OPTIONAL tiers, concurrently.
    pub async fn run_parallel(&self, plan: &CyclePlan<'_>, ctx: &Arc<CycleContext>, execution: &mut Execution) {
        let (important, optional) = tokio::join!(
            self.run_tier(&plan.important, ctx, plan.budgets.tier(Priority::Important)),
            self.run_tier(&plan.optional, ctx, plan.budgets.tier(Priority::Optional)),
        );

        for (priority, (records, timing)) in [(Priority::Important, important), (Priority::Optional, optional)] {
            execution.records.extend(records);
            execution.timings.insert(priority, timing);
        }
        for (index, record) in &plan.omitted {
            execution.records.insert(*index, record.clone());
        }
    }

    /// Run one concurrent tier against its deadline.
    async fn run_tier(
        &self,
        steps: &[(usize, &Step)],
        ctx: &Arc<CycleContext>,
        mut budget: TierBudget,
    ) -> (Vec<(usize, StepRecord)>, TierTiming) {
        if steps.is_empty() {
            return (
                Vec::new(),
                TierTiming {
                    elapsed: Duration::ZERO,
                    budget: budget.budget,
                },
            );
        }

        if budget.is_empty() {
            tracing::warn!(tier = %budget.priority, "Tier has no budget, skipping all steps");
            let records = steps
                .iter()
                .map(|&(index, step)| (index, skipped(step, SkipReason::BudgetExhausted)))
                .collect();
            return (records, TierTiming::default());
        }

        let deadline = budget.start();
        let token = CancellationToken::new();
        let semaphore = budget.max_concurrency.map(Semaphore::new);

        let mut pending: FuturesUnordered<_> = steps
            .iter()
            .map(|&(index, step)| {
                let token = &token;
                let semaphore = semaphore.as_ref();
                async move { (index, step, self.run_guarded(step, ctx, token, semaphore).await) }
            })
            .collect();

        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        let mut runs = Vec::with_capacity(steps.len());
        while !pending.is_empty() {
            tokio::select! {
                Some(done) = pending.next() => runs.push(done),
                _ = &mut expiry, if !token.is_cancelled() => {
                    tracing::warn!(
                        tier = %budget.priority,
                        budget = ?budget.budget,
                        "Tier budget exhausted, cancelling unfinished steps"
                    );
                    token.cancel();
                }
            }
        }
        drop(pending);

        let mut records = Vec::with_capacity(runs.len());
        for (index, step, run) in runs {
            let record = match run {
                TierRun::Finished(record) => record,
                TierRun::Cancelled(elapsed) => {
                    let outcome = self.fall_back(step, StepError::CancelledByBudget).await;
                    record(step, outcome, elapsed)
                }
                TierRun::NotStarted => skipped(step, SkipReason::BudgetExhausted),
            };
            records.push((index, record));
        }

        let timing = TierTiming {
            elapsed: budget.elapsed(),
            budget: budget.budget,
        };
        (records, timing)
    }

    /// Wait for a concurrency slot, then run unless the tier is cancelled.
    async fn run_guarded(
        &self,
        step: &Step,
        ctx: &Arc<CycleContext>,
        token: &CancellationToken,
        semaphore: Option<&Semaphore>,
    ) -> TierRun {
        let _permit = match semaphore {
            Some(semaphore) => tokio::select! {
                biased;
                _ = token.cancelled() => return TierRun::NotStarted,
                permit = semaphore.acquire() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return TierRun::NotStarted,
                },
            },
            None => None,
        };
        if token.is_cancelled() {
            return TierRun::NotStarted;
        }

        let started = Instant::now();
        tokio::select! {
            biased;
            _ = token.cancelled() => TierRun::Cancelled(started.elapsed()),
            record = self.run_step(step, ctx) => TierRun::Finished(record),
        }
    }

    /// Attempt a step once and resolve its outcome.
    async fn run_step(&self, step: &Step, ctx: &Arc<CycleContext>) -> StepRecord {
        let started = Instant::now();

        let outcome = match self.attempt(step, ctx).await {
            Ok(value) => {
                self.cache.put(step.name(), value.clone(), ctx.cycle()).await;
                tracing::debug!(step = %step.name(), elapsed = ?started.elapsed(), "Step completed");
                StepOutcome::Completed { value }
            }
            Err(reason) => self.fall_back(step, reason).await,
        };

        record(step, outcome, started.elapsed())
    }

    /// Run the operation under its timeout, through the dependency's breaker.
    async fn attempt(&self, step: &Step, ctx: &Arc<CycleContext>) -> Result<Value, StepError> {
        let timeout = step.timeout();
        let invoke = move || async move {
            let run = AssertUnwindSafe(step.operation().run(Arc::clone(ctx))).catch_unwind();
            match tokio::time::timeout(timeout, run).await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(e))) => Err(StepError::operation(format!("{:#}", e))),
                Ok(Err(panic)) => Err(StepError::operation(panic_message(panic.as_ref()))),
                Err(_) => Err(StepError::timeout(timeout)),
            }
        };

        match step.dependency_name() {
            Some(dependency) => self
                .breakers
                .call(dependency, invoke)
                .await
                .map_err(|e| match e {
                    BreakerError::Open(open) => StepError::unavailable(open.dependency),
                    BreakerError::Inner(e) => e,
                }),
            None => invoke().await,
        }
    }

    async fn fall_back(&self, step: &Step, reason: StepError) -> StepOutcome {
        let resolved = self.resolver.resolve(step, &reason).await;
        tracing::warn!(
            step = %step.name(),
            tier = %step.priority(),
            reason = %reason,
            source = ?resolved.source,
            "Step fell back"
        );

        StepOutcome::FellBack {
            value: resolved.value,
            reason,
            source: resolved.source,
        }
    }
}

fn record(step: &Step, outcome: StepOutcome, elapsed: Duration) -> StepRecord {
    StepRecord {
        name: step.name().to_string(),
        priority: step.priority(),
        dependency: step.dependency_name().map(String::from),
        outcome,
        elapsed,
    }
}

fn skipped(step: &Step, reason: SkipReason) -> StepRecord {
    record(step, StepOutcome::Skipped { reason }, Duration::ZERO)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("step panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("step panicked: {}", message)
    } else {
        "step panicked".to_string()
    }
}
