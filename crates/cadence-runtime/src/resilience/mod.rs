//! Resilience patterns for cadence-runtime.
//!
//! This module provides:
//! - Circuit breakers per external dependency
//! - Health monitoring and the operating mode
//! - Per-tier time budgets
//! - Fallback resolution for failed steps

mod budget;
mod circuit_breaker;
mod fallback;
mod health;

pub use budget::{BudgetPlan, TierBudget};
pub use circuit_breaker::{BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use fallback::{FallbackResolver, ResolvedFallback};
pub use health::{CallOutcome, DependencyHealth, HealthError, HealthMonitor, HealthSnapshot};
