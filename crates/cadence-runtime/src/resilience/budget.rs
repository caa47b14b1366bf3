//! Time budget management for priority tiers.
//!
//! Each tier gets an aggregate wall-clock budget per cycle, scaled down by
//! the health mode. CRITICAL budgets are tracked for reporting only; the
//! concurrent tiers are cancelled when theirs runs out.

use cadence_core::{Mode, Priority, TierConfig, TierConfigs};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Budget for one tier in one cycle.
#[derive(Debug, Clone)]
pub struct TierBudget {
    pub priority: Priority,

    /// Budget after mode scaling
    pub budget: Duration,

    /// Concurrency cap, if any
    pub max_concurrency: Option<usize>,

    /// Set when the tier starts running
    started_at: Option<Instant>,
}

impl TierBudget {
    /// Budget for a tier under a mode.
    pub fn for_mode(priority: Priority, tier: &TierConfig, mode: Mode, degraded_factor: f64) -> Self {
        let factor = if mode.admits(priority) {
            mode.budget_factor(degraded_factor)
        } else {
            0.0
        };

        Self {
            priority,
            budget: tier.budget.mul_f64(factor),
            max_concurrency: tier.max_concurrency,
            started_at: None,
        }
    }

    /// Start the clock. Returns the deadline.
    pub fn start(&mut self) -> Instant {
        let now = Instant::now();
        self.started_at = Some(now);
        now + self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|at| at.elapsed()).unwrap_or_default()
    }

    /// A zero budget means the tier does not run at all.
    pub fn is_empty(&self) -> bool {
        self.budget.is_zero()
    }
}

/// Budgets for every tier of one cycle.
#[derive(Debug, Clone)]
pub struct BudgetPlan {
    pub mode: Mode,
    budgets: BTreeMap<Priority, TierBudget>,
}

impl BudgetPlan {
    pub fn new(tiers: &TierConfigs, mode: Mode, degraded_factor: f64) -> Self {
        let budgets = Priority::ALL
            .iter()
            .map(|p| (*p, TierBudget::for_mode(*p, tiers.get(*p), mode, degraded_factor)))
            .collect();

        Self { mode, budgets }
    }

    /// Fresh (unstarted) budget for a tier.
    pub fn tier(&self, priority: Priority) -> TierBudget {
        self.budgets
            .get(&priority)
            .cloned()
            .unwrap_or(TierBudget {
                priority,
                budget: Duration::ZERO,
                max_concurrency: None,
                started_at: None,
            })
    }
}
