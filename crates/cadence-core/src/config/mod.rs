//! Orchestrator configuration.
//!
//! Configuration is supplied externally as YAML or JSON and validated before
//! the first cycle runs. Invalid values are a startup error, never a
//! mid-cycle one.

mod parser;
mod validation;

pub use parser::{
    BreakerConfig, ConfigError, HalfOpenPolicy, HealthConfig, OrchestratorConfig, StepConfig,
    TierConfig, TierConfigs,
};
pub use validation::{check_step, check_unique_names, is_valid_name};
