use serde::{Deserialize, Serialize};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Additive counters for one conversation or a whole corpus.
///
/// Merging is a field-wise sum with `Metrics::default()` as identity, so
/// per-conversation metrics can be folded in any order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// Ground-truth api turns matched by at least one prediction
    pub matches: u64,
    /// API-call predictions made
    pub predictions: u64,
    /// Ground-truth api turns
    pub ground_truths: u64,
    /// API-call predictions not flagged as bad actions
    pub valid_actions: u64,
    /// API-call predictions; same universe as `predictions`
    pub actions: u64,
    pub bad_actions: u64,
    /// 1 for a conversation that passed, 0 otherwise
    pub success: u64,
    pub num_conversations: u64,
}

impl Add for Metrics {
    type Output = Metrics;

    fn add(mut self, other: Metrics) -> Metrics {
        self += other;
        self
    }
}

impl AddAssign for Metrics {
    fn add_assign(&mut self, other: Metrics) {
        self.matches += other.matches;
        self.predictions += other.predictions;
        self.ground_truths += other.ground_truths;
        self.valid_actions += other.valid_actions;
        self.actions += other.actions;
        self.bad_actions += other.bad_actions;
        self.success += other.success;
        self.num_conversations += other.num_conversations;
    }
}

impl Sum for Metrics {
    fn sum<I: Iterator<Item = Metrics>>(iter: I) -> Metrics {
        iter.fold(Metrics::default(), Add::add)
    }
}

impl Metrics {
    /// Derive corpus-level ratios from the summed counters
    pub fn report(&self) -> Report {
        Report {
            num_conversations: self.num_conversations,
            precision: ratio(self.matches, self.predictions),
            recall: ratio(self.matches, self.ground_truths),
            action_precision: ratio(self.valid_actions, self.actions),
            bad_action_rate: ratio(self.bad_actions, self.actions),
            success_rate: ratio(self.success, self.num_conversations),
        }
    }
}

/// `None` when the denominator is zero
fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    if denominator == 0 {
        None
    } else {
        Some(numerator as f64 / denominator as f64)
    }
}

/// Final corpus-level numbers; ratios are `null` when undefined
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub num_conversations: u64,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub action_precision: Option<f64>,
    pub bad_action_rate: Option<f64>,
    pub success_rate: Option<f64>,
}
