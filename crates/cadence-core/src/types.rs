//! Core types for decision-cycle orchestration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Priority tier of a step.
///
/// Ordering follows importance: `Critical < Important < Optional`, so a
/// `BTreeMap<Priority, _>` iterates tiers in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Runs sequentially, always attempted, never skipped
    Critical,

    /// Runs concurrently under the tier budget
    Important,

    /// Runs concurrently, first to go when the system degrades
    Optional,
}

impl Priority {
    /// All tiers in execution order.
    pub const ALL: [Priority; 3] = [Priority::Critical, Priority::Important, Priority::Optional];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::Important => "IMPORTANT",
            Priority::Optional => "OPTIONAL",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System-wide operating mode computed by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    #[default]
    Normal,

    /// One dependency is unhealthy
    Degraded,

    /// Signals look healthy again, awaiting confirmation
    Recovery,

    /// Multiple dependencies unhealthy, or degraded for too long
    Emergency,
}

impl Mode {
    /// Whether steps of the given tier run at all in this mode.
    ///
    /// Under EMERGENCY only the CRITICAL chain runs.
    pub fn admits(&self, priority: Priority) -> bool {
        !matches!(self, Mode::Emergency) || priority == Priority::Critical
    }

    /// Multiplier applied to tier budgets in this mode.
    pub fn budget_factor(&self, degraded_factor: f64) -> f64 {
        match self {
            Mode::Normal | Mode::Recovery => 1.0,
            Mode::Degraded | Mode::Emergency => degraded_factor,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "NORMAL",
            Mode::Degraded => "DEGRADED",
            Mode::Recovery => "RECOVERY",
            Mode::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared result type of a step, used to pick a static default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    #[default]
    Text,
    Number,
    Flag,
    List,
    Record,
    Empty,
}

impl ResultKind {
    /// Built-in static default, the last resort of fallback resolution.
    pub fn default_value(&self) -> Value {
        match self {
            ResultKind::Text => Value::String(String::new()),
            ResultKind::Number => Value::from(0),
            ResultKind::Flag => Value::Bool(false),
            ResultKind::List => Value::Array(Vec::new()),
            ResultKind::Record => Value::Object(serde_json::Map::new()),
            ResultKind::Empty => Value::Null,
        }
    }
}

/// Why a step could not complete normally.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepError {
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("dependency '{dependency}' unavailable (circuit open)")]
    DependencyUnavailable { dependency: String },

    #[error("operation failed: {message}")]
    OperationError { message: String },

    #[error("cancelled by tier budget")]
    CancelledByBudget,
}

impl StepError {
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout {
            after_ms: after.as_millis() as u64,
        }
    }

    pub fn unavailable(dependency: impl Into<String>) -> Self {
        Self::DependencyUnavailable {
            dependency: dependency.into(),
        }
    }

    pub fn operation(message: impl fmt::Display) -> Self {
        Self::OperationError {
            message: message.to_string(),
        }
    }

    /// Short machine-readable label.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Timeout { .. } => "timeout",
            StepError::DependencyUnavailable { .. } => "dependency_unavailable",
            StepError::OperationError { .. } => "operation_error",
            StepError::CancelledByBudget => "cancelled_by_budget",
        }
    }
}

/// Raised by a circuit breaker that rejects a call and has no fallback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit open for dependency '{dependency}'")]
pub struct CircuitOpenError {
    pub dependency: String,
}

/// Where a fallback value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FallbackSource {
    /// The step's own declared fallback
    Custom,

    /// Last successful result, captured at `cycle`
    Cache { cycle: u64 },

    /// Static default for the step's result kind
    Default,
}

/// Why a step was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipReason {
    /// The tier budget ran out before the step started
    BudgetExhausted,

    /// The operating mode omits this tier
    ModeOmitted { mode: Mode },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BudgetExhausted => f.write_str("tier budget exhausted"),
            SkipReason::ModeOmitted { mode } => write!(f, "omitted in {} mode", mode),
        }
    }
}

/// Outcome of one step in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed {
        value: Value,
    },
    FellBack {
        value: Value,
        reason: StepError,
        source: FallbackSource,
    },
    Skipped {
        reason: SkipReason,
    },
}

impl StepOutcome {
    /// The value downstream steps should see, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            StepOutcome::Completed { value } | StepOutcome::FellBack { value, .. } => Some(value),
            StepOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StepOutcome::Completed { .. })
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, StepOutcome::FellBack { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, StepOutcome::Skipped { .. })
    }

    /// The failure reason for fell-back outcomes.
    pub fn failure(&self) -> Option<&StepError> {
        match self {
            StepOutcome::FellBack { reason, .. } => Some(reason),
            _ => None,
        }
    }
}
