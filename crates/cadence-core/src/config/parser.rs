//! Configuration model and parsing from YAML/JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::durations;
use crate::types::{Priority, ResultKind};

use super::validation;

/// Errors that can occur when loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl ConfigError {
    /// Individual validation problems, empty for parse errors.
    pub fn problems(&self) -> &[String] {
        match self {
            ConfigError::Invalid(problems) => problems,
            _ => &[],
        }
    }
}

/// What a HALF_OPEN breaker does when its trial call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// Any trial failure reopens the circuit
    #[default]
    ReopenImmediately,

    /// Trial failures count toward `failure_threshold` like closed-state failures
    CountTowardThreshold,
}

/// Circuit breaker configuration, shared by every dependency's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a trial call
    #[serde(with = "durations::human")]
    pub reset_timeout: Duration,

    pub half_open_policy: HalfOpenPolicy,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            half_open_policy: HalfOpenPolicy::ReopenImmediately,
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Interval between background health checks
    #[serde(with = "durations::human")]
    pub check_interval: Duration,

    /// p95 latency above this marks a dependency unhealthy
    #[serde(with = "durations::human")]
    pub latency_ceiling: Duration,

    /// Latency samples kept per dependency
    pub latency_window: usize,

    /// Samples required before p95 is trusted
    pub min_latency_samples: usize,

    /// Samples older than this are ignored
    #[serde(with = "durations::human")]
    pub latency_max_age: Duration,

    /// DEGRADED lasting this long escalates to EMERGENCY
    #[serde(with = "durations::human")]
    pub degraded_escalation_after: Duration,

    /// Budget multiplier applied under DEGRADED and EMERGENCY, in (0, 1]
    pub degraded_budget_factor: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            latency_ceiling: Duration::from_secs(10),
            latency_window: 32,
            min_latency_samples: 5,
            latency_max_age: Duration::from_secs(300),
            degraded_escalation_after: Duration::from_secs(300),
            degraded_budget_factor: 0.5,
        }
    }
}

/// Budget settings for one priority tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Aggregate wall-clock budget for the tier within one cycle
    #[serde(with = "durations::human")]
    pub budget: Duration,

    /// Optional cap on steps in flight at once (concurrent tiers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

impl TierConfig {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            max_concurrency: None,
        }
    }
}

/// Per-tier budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfigs {
    pub critical: TierConfig,
    pub important: TierConfig,
    pub optional: TierConfig,
}

impl Default for TierConfigs {
    fn default() -> Self {
        Self {
            critical: TierConfig::new(Duration::from_secs(60)),
            important: TierConfig::new(Duration::from_secs(30)),
            optional: TierConfig::new(Duration::from_secs(15)),
        }
    }
}

impl TierConfigs {
    pub fn get(&self, priority: Priority) -> &TierConfig {
        match priority {
            Priority::Critical => &self.critical,
            Priority::Important => &self.important,
            Priority::Optional => &self.optional,
        }
    }
}

/// Declaration of one step. Operations are bound in code by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique within a cycle
    pub name: String,

    pub priority: Priority,

    /// Per-step timeout
    #[serde(with = "durations::human")]
    pub timeout: Duration,

    /// External dependency the step calls, selects its circuit breaker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,

    /// Result type, selects the static default
    #[serde(default)]
    pub kind: ResultKind,

    /// Declared fallback value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Value>,
}

impl StepConfig {
    pub fn new(name: impl Into<String>, priority: Priority, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            priority,
            timeout,
            dependency: None,
            kind: ResultKind::default(),
            fallback: None,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub breaker: BreakerConfig,
    pub health: HealthConfig,
    pub tiers: TierConfigs,
    pub steps: Vec<StepConfig>,
}

impl OrchestratorConfig {
    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config = Self::from_yaml(&contents)?;
        tracing::debug!(path = %path.display(), steps = config.steps.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config = Self::from_json(&contents)?;
        tracing::debug!(path = %path.display(), steps = config.steps.len(), "Loaded configuration");
        Ok(config)
    }

    /// Look up a declared step.
    pub fn step(&self, name: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validate every setting, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        validation::check_settings(self, &mut problems);
        for step in &self.steps {
            validation::check_step(step, &mut problems);
            validation::check_declared_fallback(step, &mut problems);
        }
        validation::check_unique_names(self.steps.iter().map(|s| s.name.as_str()), &mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
