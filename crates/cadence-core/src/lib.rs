//! # cadence-core
//!
//! Domain model for a resilient decision-cycle orchestrator.
//!
//! An agent runs a repeating cycle of decision steps, each of which may call
//! a slow or unavailable external dependency. This crate holds the parts of
//! that system that need no runtime:
//!
//! - **Types**: priority tiers, operating modes, the step error taxonomy and
//!   the tagged `StepOutcome` (Completed / FellBack / Skipped)
//! - **Configuration**: YAML/JSON loading with startup validation
//! - **Reports**: pure assembly of a `CycleReport` from step records
//!
//! The async machinery (circuit breakers, health monitor, executor,
//! orchestrator) lives in `cadence-runtime`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cadence_core::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::from_yaml_file("cadence.yaml")?;
//! for step in &config.steps {
//!     println!("{} [{}] timeout={:?}", step.name, step.priority, step.timeout);
//! }
//! ```

pub mod config;
pub mod durations;
pub mod report;
pub mod types;

// Re-export main types at crate root
pub use config::{
    BreakerConfig, ConfigError, HalfOpenPolicy, HealthConfig, OrchestratorConfig, StepConfig,
    TierConfig, TierConfigs,
};
pub use report::{CycleReport, CycleTotals, DependencyStats, StepRecord, TierSummary, TierTiming};
pub use types::{
    CircuitOpenError, FallbackSource, Mode, Priority, ResultKind, SkipReason, StepError,
    StepOutcome,
};
