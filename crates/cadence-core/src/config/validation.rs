//! Startup validation rules.
//!
//! Checks append human-readable problems to a list so that a single startup
//! failure reports everything wrong with the configuration at once.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

use super::parser::{OrchestratorConfig, StepConfig};
use crate::types::Priority;

lazy_static! {
    static ref NAME_PATTERN: Regex = Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").unwrap();
}

/// Step and dependency names: lowercase, digits, `_`, `.`, `-`.
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

pub(super) fn check_settings(config: &OrchestratorConfig, problems: &mut Vec<String>) {
    let breaker = &config.breaker;
    if breaker.failure_threshold == 0 {
        problems.push("breaker.failure_threshold must be at least 1".to_string());
    }
    if breaker.reset_timeout.is_zero() {
        problems.push("breaker.reset_timeout must be positive".to_string());
    }

    let health = &config.health;
    if health.check_interval.is_zero() {
        problems.push("health.check_interval must be positive".to_string());
    }
    if health.latency_ceiling.is_zero() {
        problems.push("health.latency_ceiling must be positive".to_string());
    }
    if health.latency_window == 0 {
        problems.push("health.latency_window must be at least 1".to_string());
    }
    if health.min_latency_samples == 0 || health.min_latency_samples > health.latency_window {
        problems.push(format!(
            "health.min_latency_samples must be between 1 and latency_window ({})",
            health.latency_window
        ));
    }
    if health.latency_max_age.is_zero() {
        problems.push("health.latency_max_age must be positive".to_string());
    }
    if health.degraded_escalation_after.is_zero() {
        problems.push("health.degraded_escalation_after must be positive".to_string());
    }
    let factor = health.degraded_budget_factor;
    if !(factor > 0.0 && factor <= 1.0) {
        problems.push(format!(
            "health.degraded_budget_factor must be in (0, 1], got {}",
            factor
        ));
    }

    for priority in Priority::ALL {
        let tier = config.tiers.get(priority);
        if tier.budget.is_zero() {
            problems.push(format!("tiers.{}: budget must be positive", priority));
        }
        if tier.max_concurrency == Some(0) {
            problems.push(format!("tiers.{}: max_concurrency must be at least 1", priority));
        }
    }
}

/// Per-step checks that do not depend on other steps.
pub fn check_step(step: &StepConfig, problems: &mut Vec<String>) {
    if !is_valid_name(&step.name) {
        problems.push(format!("invalid step name '{}'", step.name));
    }
    if step.timeout.is_zero() {
        problems.push(format!("step '{}': timeout must be positive", step.name));
    }
    if let Some(dependency) = &step.dependency {
        if !is_valid_name(dependency) {
            problems.push(format!(
                "step '{}': invalid dependency name '{}'",
                step.name, dependency
            ));
        }
    }
}

/// A declared CRITICAL step must carry a fallback value.
///
/// Steps built in code may supply a computed fallback instead; those are
/// checked where the operation is bound.
pub fn check_declared_fallback(step: &StepConfig, problems: &mut Vec<String>) {
    if step.priority == Priority::Critical && step.fallback.is_none() {
        problems.push(format!(
            "step '{}': CRITICAL steps must declare a fallback",
            step.name
        ));
    }
}

/// Step names must be unique within a cycle.
pub fn check_unique_names<'a>(
    names: impl IntoIterator<Item = &'a str>,
    problems: &mut Vec<String>,
) {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            problems.push(format!("duplicate step name '{}'", name));
        }
    }
}
