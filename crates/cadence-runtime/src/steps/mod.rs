//! Steps: the units of cycle work.
//!
//! A step pairs a declaration ([`StepConfig`]: name, tier, timeout,
//! dependency, result kind) with an asynchronous [`StepOperation`] and an
//! optional fallback. Steps are built once and shared by every cycle.

mod inference;

pub use inference::{InferenceStep, ResponseFormat};

use async_trait::async_trait;
use cadence_core::config::{check_step, check_unique_names};
use cadence_core::{ConfigError, Mode, Priority, ResultKind, StepConfig, StepError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// Shared state of one cycle, handed to every step.
///
/// Results of completed CRITICAL steps are published here so later steps in
/// the chain can build on them.
#[derive(Debug)]
pub struct CycleContext {
    cycle: u64,
    mode: Mode,
    started_at: DateTime<Utc>,
    results: RwLock<BTreeMap<String, Value>>,
}

impl CycleContext {
    pub fn new(cycle: u64, mode: Mode) -> Self {
        Self {
            cycle,
            mode,
            started_at: Utc::now(),
            results: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Health mode when the cycle started.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Result published by an earlier step.
    pub fn result(&self, step: &str) -> Option<Value> {
        self.results.read().get(step).cloned()
    }

    pub fn results(&self) -> BTreeMap<String, Value> {
        self.results.read().clone()
    }

    pub(crate) fn publish(&self, step: &str, value: Value) {
        self.results.write().insert(step.to_string(), value);
    }
}

/// The work a step performs.
///
/// # Contract
/// - Called at most once per cycle; the orchestrator never retries
/// - May be cancelled at any await point (timeouts, tier budgets)
/// - Errors are converted to `OperationError` outcomes, never propagated
#[async_trait]
pub trait StepOperation: Send + Sync {
    async fn run(&self, ctx: Arc<CycleContext>) -> anyhow::Result<Value>;
}

/// Adapter turning an async closure into a [`StepOperation`].
pub struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> StepOperation for FnOperation<F>
where
    F: Fn(Arc<CycleContext>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn run(&self, ctx: Arc<CycleContext>) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shared step operation.
pub fn fn_operation<F, Fut>(f: F) -> Arc<dyn StepOperation>
where
    F: Fn(Arc<CycleContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(FnOperation(f))
}

type FallbackFn = dyn Fn(&StepError) -> Option<Value> + Send + Sync;

/// A step's own fallback, tried before the cache and the static default.
#[derive(Clone)]
pub enum Fallback {
    /// A fixed substitute value
    Value(Value),

    /// Computed from the failure; `None` defers to the cache
    With(Arc<FallbackFn>),
}

impl Fallback {
    /// Produce a substitute. A panicking producer yields nothing.
    pub fn produce(&self, reason: &StepError) -> Option<Value> {
        match self {
            Fallback::Value(value) => Some(value.clone()),
            Fallback::With(f) => match catch_unwind(AssertUnwindSafe(|| f(reason))) {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(reason = %reason, "Custom fallback panicked");
                    None
                }
            },
        }
    }
}

impl fmt::Debug for Fallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fallback::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Fallback::With(_) => f.write_str("With(..)"),
        }
    }
}

/// A named unit of cycle work.
#[derive(Clone)]
pub struct Step {
    config: StepConfig,
    operation: Arc<dyn StepOperation>,
    fallback: Option<Fallback>,
}

impl Step {
    pub fn new(
        name: impl Into<String>,
        priority: Priority,
        timeout: Duration,
        operation: Arc<dyn StepOperation>,
    ) -> Self {
        Self::from_config(StepConfig::new(name, priority, timeout), operation)
    }

    /// Bind an operation to a declared step. A declared fallback value
    /// becomes the step's custom fallback.
    pub fn from_config(config: StepConfig, operation: Arc<dyn StepOperation>) -> Self {
        let fallback = config.fallback.clone().map(Fallback::Value);
        Self {
            config,
            operation,
            fallback,
        }
    }

    /// Route calls through this dependency's circuit breaker.
    pub fn dependency(mut self, dependency: impl Into<String>) -> Self {
        self.config.dependency = Some(dependency.into());
        self
    }

    pub fn kind(mut self, kind: ResultKind) -> Self {
        self.config.kind = kind;
        self
    }

    pub fn fallback_value(mut self, value: Value) -> Self {
        self.config.fallback = Some(value.clone());
        self.fallback = Some(Fallback::Value(value));
        self
    }

    pub fn fallback_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&StepError) -> Option<Value> + Send + Sync + 'static,
    {
        self.fallback = Some(Fallback::With(Arc::new(f)));
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn priority(&self) -> Priority {
        self.config.priority
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn dependency_name(&self) -> Option<&str> {
        self.config.dependency.as_deref()
    }

    pub fn result_kind(&self) -> ResultKind {
        self.config.kind
    }

    pub fn fallback(&self) -> Option<&Fallback> {
        self.fallback.as_ref()
    }

    pub fn operation(&self) -> &Arc<dyn StepOperation> {
        &self.operation
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("config", &self.config)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// Validate a step list before the first cycle.
///
/// CRITICAL steps must declare a fallback: a rejected call on the critical
/// chain has nowhere else to go.
pub fn validate_steps(steps: &[Step]) -> Result<(), ConfigError> {
    let mut problems = Vec::new();

    for step in steps {
        check_step(step.config(), &mut problems);
        if step.priority() == Priority::Critical && step.fallback().is_none() {
            problems.push(format!(
                "step '{}': CRITICAL steps must declare a fallback",
                step.name()
            ));
        }
    }
    check_unique_names(steps.iter().map(|s| s.name()), &mut problems);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems))
    }
}
