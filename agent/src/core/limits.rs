//! Cumulative run statistics and the step/cost budget checked against them.

use serde::{Deserialize, Serialize};

/// Counters owned by one agent run.
///
/// `cost` and `n_calls` cover acting-model queries only. Verifier queries are
/// tracked in their own fields so budget checks see the acting model alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub cost: f64,
    pub n_calls: u64,
    pub step_count: u64,
    pub verifier_cost: f64,
    pub verifier_calls: u64,
}

impl RunStats {
    /// Count an acting-model query as soon as it is issued.
    pub fn record_call(&mut self) {
        self.n_calls += 1;
    }

    pub fn record_cost(&mut self, cost: f64) {
        self.cost += cost.max(0.0);
    }

    pub fn record_verifier(&mut self, calls: u64, cost: f64) {
        self.verifier_calls += calls;
        self.verifier_cost += cost.max(0.0);
    }
}

/// Step and cost budget. A limit of zero disables that check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub step_limit: u64,
    pub cost_limit: f64,
}

impl Limits {
    /// True once either enabled limit has been reached.
    pub fn exceeded(&self, stats: &RunStats) -> bool {
        (self.step_limit > 0 && stats.step_count >= self.step_limit)
            || (self.cost_limit > 0.0 && stats.cost >= self.cost_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limits_never_trigger() {
        let limits = Limits::default();
        let stats = RunStats {
            cost: 1e9,
            step_count: 1_000_000,
            ..RunStats::default()
        };
        assert!(!limits.exceeded(&stats));
    }

    #[test]
    fn step_limit_triggers_at_equality() {
        let limits = Limits {
            step_limit: 2,
            cost_limit: 0.0,
        };
        let mut stats = RunStats {
            step_count: 1,
            ..RunStats::default()
        };
        assert!(!limits.exceeded(&stats));
        stats.step_count = 2;
        assert!(limits.exceeded(&stats));
    }

    #[test]
    fn cost_limit_triggers_at_equality() {
        let limits = Limits {
            step_limit: 0,
            cost_limit: 1.0,
        };
        let mut stats = RunStats::default();
        stats.record_call();
        stats.record_cost(0.5);
        assert!(!limits.exceeded(&stats));
        stats.record_call();
        stats.record_cost(0.5);
        assert!(limits.exceeded(&stats));
        assert_eq!(stats.n_calls, 2);
    }

    /// Verifies verifier spend does not count toward the acting budget.
    #[test]
    fn verifier_cost_is_tracked_separately() {
        let limits = Limits {
            step_limit: 0,
            cost_limit: 1.0,
        };
        let mut stats = RunStats::default();
        stats.record_verifier(3, 5.0);
        assert!(!limits.exceeded(&stats));
        assert_eq!(stats.n_calls, 0);
        assert_eq!(stats.verifier_calls, 3);
    }
}
