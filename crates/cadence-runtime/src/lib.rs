//! # cadence-runtime
//!
//! Asynchronous runtime for the resilient decision cycle.
//!
//! An agent repeats a cycle of decision steps, some of which call slow or
//! failing external dependencies. This crate keeps every cycle moving:
//!
//! - Each dependency sits behind a circuit breaker
//! - A health monitor folds breaker states and latencies into an operating
//!   mode that scales tier budgets
//! - CRITICAL steps run sequentially and always produce a value; IMPORTANT
//!   and OPTIONAL steps run concurrently until their tier budget runs out
//! - Failed steps fall back to a custom value, the last good result, or a
//!   static default
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence_runtime::{fn_operation, CycleOrchestrator};
//! use cadence_core::OrchestratorConfig;
//!
//! let orchestrator = CycleOrchestrator::builder()
//!     .config(OrchestratorConfig::from_yaml_file("cadence.yaml")?)
//!     .bind("select-goal", fn_operation(|ctx| async move { choose_goal(&ctx).await }))
//!     .build()?;
//!
//! let shutdown = CancellationToken::new();
//! orchestrator.start_health_monitor(shutdown.clone());
//! let report = orchestrator.run_next_cycle().await;
//! println!("{}", report.to_json()?);
//! ```

use thiserror::Error;

pub mod cache;
pub mod executor;
pub mod orchestrator;
pub mod providers;
pub mod resilience;
pub mod steps;

pub use cache::{CachedResult, ResultCache};
pub use executor::{CyclePlan, Execution, PriorityExecutor};
pub use orchestrator::{CycleOrchestrator, CycleOrchestratorBuilder, CyclePhase, OrchestratorStats};
pub use providers::{
    ChatMessage, InferenceDependency, InferenceError, InferenceRequest, InferenceResponse,
};
pub use resilience::{
    BreakerError, BreakerRegistry, BreakerSnapshot, CallOutcome, CircuitBreaker, CircuitState,
    FallbackResolver, HealthMonitor, HealthSnapshot, ResolvedFallback,
};
pub use steps::{
    fn_operation, validate_steps, CycleContext, Fallback, InferenceStep, ResponseFormat, Step,
    StepOperation,
};

/// Errors from the runtime.
///
/// Only raised while building an orchestrator; a running cycle never fails.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] cadence_core::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::OrchestratorConfig;

    #[test]
    fn test_config_errors_convert() {
        let mut config = OrchestratorConfig::default();
        config.breaker.failure_threshold = 0;

        let err: RuntimeError = config.validate().unwrap_err().into();
        assert!(err.to_string().starts_with("Configuration error: Invalid configuration"));
    }
}
