//! Cycle reports.
//!
//! A `CycleReport` is assembled from per-step records by a pure function:
//! no I/O, no clocks. The runtime measures, this module counts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::durations;
use crate::types::{Mode, Priority, StepError, StepOutcome};

/// What happened to one step in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<String>,
    pub outcome: StepOutcome,
    #[serde(rename = "elapsed_ms", with = "durations::millis")]
    pub elapsed: Duration,
}

/// Wall-clock time a tier took against its (mode-scaled) budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TierTiming {
    pub elapsed: Duration,
    pub budget: Duration,
}

/// Per-tier counts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TierSummary {
    pub completed: u32,
    pub fell_back: u32,
    pub skipped: u32,
    #[serde(rename = "elapsed_ms", with = "durations::millis")]
    pub elapsed: Duration,
    #[serde(rename = "budget_ms", with = "durations::millis")]
    pub budget: Duration,
}

impl TierSummary {
    fn count(&mut self, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Completed { .. } => self.completed += 1,
            StepOutcome::FellBack { .. } => self.fell_back += 1,
            StepOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    /// Steps accounted for in this tier.
    pub fn total(&self) -> u32 {
        self.completed + self.fell_back + self.skipped
    }

    /// Only meaningful for CRITICAL, where budgets are tracked but not enforced.
    pub fn over_budget(&self) -> bool {
        self.elapsed > self.budget
    }
}

/// Per-dependency call accounting.
///
/// Every routed call counts toward `calls`, including calls the breaker
/// rejected and calls cancelled by the tier budget.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DependencyStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
    pub cancelled: u64,
}

impl DependencyStats {
    fn count(&mut self, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Completed { .. } => self.successes += 1,
            StepOutcome::FellBack { reason, .. } => match reason {
                StepError::DependencyUnavailable { .. } => self.rejected += 1,
                StepError::CancelledByBudget => self.cancelled += 1,
                StepError::Timeout { .. } | StepError::OperationError { .. } => self.failures += 1,
            },
            StepOutcome::Skipped { .. } => return,
        }
        self.calls += 1;
    }

    /// Fraction of calls that succeeded, 1.0 when nothing was called.
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            1.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }

    pub fn merge(&mut self, other: &DependencyStats) {
        self.calls += other.calls;
        self.successes += other.successes;
        self.failures += other.failures;
        self.rejected += other.rejected;
        self.cancelled += other.cancelled;
    }
}

/// Structured result of one cycle, for observability collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,

    /// Health mode at cycle end
    pub mode: Mode,

    pub tiers: BTreeMap<Priority, TierSummary>,
    pub dependencies: BTreeMap<String, DependencyStats>,
    pub steps: Vec<StepRecord>,

    #[serde(rename = "total_elapsed_ms", with = "durations::millis")]
    pub total_elapsed: Duration,
}

impl CycleReport {
    /// Assemble a report from step records.
    ///
    /// Every tier is present in `tiers`, even when it had no steps.
    pub fn assemble(
        cycle: u64,
        started_at: DateTime<Utc>,
        mode: Mode,
        records: Vec<StepRecord>,
        timings: &BTreeMap<Priority, TierTiming>,
        total_elapsed: Duration,
    ) -> Self {
        let mut tiers: BTreeMap<Priority, TierSummary> = Priority::ALL
            .iter()
            .map(|p| {
                let timing = timings.get(p).copied().unwrap_or_default();
                (
                    *p,
                    TierSummary {
                        elapsed: timing.elapsed,
                        budget: timing.budget,
                        ..Default::default()
                    },
                )
            })
            .collect();
        let mut dependencies: BTreeMap<String, DependencyStats> = BTreeMap::new();

        for record in &records {
            tiers
                .entry(record.priority)
                .or_default()
                .count(&record.outcome);

            if let Some(dependency) = &record.dependency {
                if !record.outcome.is_skipped() {
                    dependencies
                        .entry(dependency.clone())
                        .or_default()
                        .count(&record.outcome);
                }
            }
        }

        Self {
            cycle,
            started_at,
            mode,
            tiers,
            dependencies,
            steps: records,
            total_elapsed,
        }
    }

    pub fn tier(&self, priority: Priority) -> TierSummary {
        self.tiers.get(&priority).cloned().unwrap_or_default()
    }

    /// Outcome recorded for a step.
    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.outcome)
    }

    /// Steps that did not complete normally.
    pub fn degraded_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|r| !r.outcome.is_completed())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Running totals across cycles.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CycleTotals {
    pub cycles: u64,
    pub tiers: BTreeMap<Priority, TierSummary>,
    pub dependencies: BTreeMap<String, DependencyStats>,

    /// Cycles ended in each mode
    pub modes: BTreeMap<String, u64>,
}

impl CycleTotals {
    pub fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;

        for (priority, summary) in &report.tiers {
            let total = self.tiers.entry(*priority).or_default();
            total.completed += summary.completed;
            total.fell_back += summary.fell_back;
            total.skipped += summary.skipped;
            total.elapsed += summary.elapsed;
            total.budget += summary.budget;
        }

        for (name, stats) in &report.dependencies {
            self.dependencies.entry(name.clone()).or_default().merge(stats);
        }

        *self.modes.entry(report.mode.to_string()).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FallbackSource, SkipReason};
    use proptest::prelude::*;
    use serde_json::json;

    fn record(name: &str, priority: Priority, dependency: Option<&str>, outcome: StepOutcome) -> StepRecord {
        StepRecord {
            name: name.to_string(),
            priority,
            dependency: dependency.map(String::from),
            outcome,
            elapsed: Duration::from_millis(10),
        }
    }

    fn fell_back(reason: StepError) -> StepOutcome {
        StepOutcome::FellBack {
            value: json!(null),
            reason,
            source: FallbackSource::Default,
        }
    }

    #[test]
    fn test_assemble_counts_by_tier_and_dependency() {
        let records = vec![
            record("goal", Priority::Critical, Some("chat"), StepOutcome::Completed { value: json!("explore") }),
            record("act", Priority::Critical, Some("chat"), fell_back(StepError::unavailable("chat"))),
            record("belief", Priority::Important, Some("embed"), fell_back(StepError::timeout(Duration::from_secs(1)))),
            record("narrate", Priority::Optional, Some("chat"), fell_back(StepError::CancelledByBudget)),
            record(
                "dream",
                Priority::Optional,
                Some("chat"),
                StepOutcome::Skipped { reason: SkipReason::BudgetExhausted },
            ),
        ];

        let report = CycleReport::assemble(
            3,
            Utc::now(),
            Mode::Degraded,
            records,
            &BTreeMap::new(),
            Duration::from_secs(2),
        );

        let critical = report.tier(Priority::Critical);
        assert_eq!((critical.completed, critical.fell_back, critical.skipped), (1, 1, 0));
        let optional = report.tier(Priority::Optional);
        assert_eq!((optional.completed, optional.fell_back, optional.skipped), (0, 1, 1));

        let chat = &report.dependencies["chat"];
        assert_eq!(chat.calls, 3);
        assert_eq!(chat.successes, 1);
        assert_eq!(chat.rejected, 1);
        assert_eq!(chat.cancelled, 1);
        assert!((chat.success_rate() - 1.0 / 3.0).abs() < 1e-9);

        let embed = &report.dependencies["embed"];
        assert_eq!(embed.failures, 1);
        assert_eq!(embed.success_rate(), 0.0);

        assert_eq!(report.degraded_steps().count(), 4);
    }

    #[test]
    fn test_empty_cycle_has_all_tiers() {
        let report = CycleReport::assemble(
            1,
            Utc::now(),
            Mode::Normal,
            vec![],
            &BTreeMap::new(),
            Duration::ZERO,
        );
        assert_eq!(report.tiers.len(), 3);
        assert!(report.dependencies.is_empty());
    }

    #[test]
    fn test_report_json_shape() {
        let mut timings = BTreeMap::new();
        timings.insert(
            Priority::Critical,
            TierTiming {
                elapsed: Duration::from_millis(1500),
                budget: Duration::from_secs(1),
            },
        );
        let report = CycleReport::assemble(
            9,
            Utc::now(),
            Mode::Normal,
            vec![record("goal", Priority::Critical, None, StepOutcome::Completed { value: json!(1) })],
            &timings,
            Duration::from_millis(1600),
        );

        assert!(report.tier(Priority::Critical).over_budget());

        let value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(value["cycle"], 9);
        assert_eq!(value["mode"], "NORMAL");
        assert_eq!(value["total_elapsed_ms"], 1600);
        assert_eq!(value["tiers"]["CRITICAL"]["elapsed_ms"], 1500);
        assert_eq!(value["steps"][0]["outcome"]["status"], "completed");
    }

    #[test]
    fn test_totals_absorb() {
        let report = CycleReport::assemble(
            1,
            Utc::now(),
            Mode::Emergency,
            vec![record("goal", Priority::Critical, Some("chat"), fell_back(StepError::unavailable("chat")))],
            &BTreeMap::new(),
            Duration::from_millis(5),
        );

        let mut totals = CycleTotals::default();
        totals.absorb(&report);
        totals.absorb(&report);

        assert_eq!(totals.cycles, 2);
        assert_eq!(totals.tiers[&Priority::Critical].fell_back, 2);
        assert_eq!(totals.dependencies["chat"].rejected, 2);
        assert_eq!(totals.modes["EMERGENCY"], 2);
    }

    fn outcome_strategy() -> impl Strategy<Value = StepOutcome> {
        prop_oneof![
            Just(StepOutcome::Completed { value: json!("ok") }),
            Just(fell_back(StepError::timeout(Duration::from_millis(5)))),
            Just(fell_back(StepError::operation("boom"))),
            Just(fell_back(StepError::unavailable("chat"))),
        ]
    }

    proptest! {
        #[test]
        fn property_every_critical_step_counted_once(outcomes in proptest::collection::vec(outcome_strategy(), 0..20)) {
            let records: Vec<StepRecord> = outcomes
                .into_iter()
                .enumerate()
                .map(|(i, o)| record(&format!("step-{}", i), Priority::Critical, Some("chat"), o))
                .collect();
            let declared = records.len() as u32;

            let report = CycleReport::assemble(
                1,
                Utc::now(),
                Mode::Normal,
                records,
                &BTreeMap::new(),
                Duration::ZERO,
            );
            let critical = report.tier(Priority::Critical);

            prop_assert_eq!(critical.completed + critical.fell_back, declared);
            prop_assert_eq!(critical.skipped, 0);
            let calls = report.dependencies.get("chat").map(|d| d.calls).unwrap_or(0);
            prop_assert_eq!(calls, declared as u64);
        }
    }
}
