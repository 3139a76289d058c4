// 📊 Aggregate State - denormalized per-field summary kept next to the entity
//
// `distribution[i]` counts live votes for `range[i]`. The day/week/month
// counters are running deltas: every score change adds (new - old) to all
// three. Resetting them is left to whoever owns the windowing.

use crate::formula;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    pub distribution: Vec<u64>,
    pub score: f64,
    pub score_day: f64,
    pub score_week: f64,
    pub score_month: f64,
}

impl AggregateState {
    pub fn zeroed(buckets: usize) -> Self {
        AggregateState {
            distribution: vec![0; buckets],
            score: 0.0,
            score_day: 0.0,
            score_week: 0.0,
            score_month: 0.0,
        }
    }

    /// Reset a distribution that no longer matches the field's range length.
    /// The engine rebuilds stale distributions from the ledger before this runs.
    pub fn fit_to(&mut self, buckets: usize) {
        if self.distribution.len() != buckets {
            warn!(
                stored = self.distribution.len(),
                expected = buckets,
                "distribution length mismatch, resetting buckets"
            );
            self.distribution = vec![0; buckets];
        }
    }

    pub fn add_vote(&mut self, index: usize) {
        self.distribution[index] += 1;
    }

    /// Decrement a bucket, clamping at zero
    pub fn remove_vote(&mut self, index: usize) {
        match self.distribution[index].checked_sub(1) {
            Some(count) => self.distribution[index] = count,
            None => warn!(bucket = index, "vote count underflow, bucket left at 0"),
        }
    }

    /// Store a new score and push the delta into the rolling counters
    pub fn set_score(&mut self, value: f64) {
        let delta = value - self.score;
        self.score_day += delta;
        self.score_week += delta;
        self.score_month += delta;
        self.score = value;
    }

    pub fn total_votes(&self) -> u64 {
        formula::total_votes(&self.distribution)
    }

    pub fn snapshot(&self, range: &[i64]) -> AggregateSnapshot {
        AggregateSnapshot {
            score: self.score,
            score_avg: formula::average(&self.distribution, range),
            score_sum: formula::weighted_sum(&self.distribution, range),
            distribution: self.distribution.clone(),
        }
    }
}

/// Read-only view handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub score: f64,
    pub score_avg: f64,
    pub score_sum: i64,
    pub distribution: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_counters_accumulate_deltas() {
        let mut state = AggregateState::zeroed(2);

        state.set_score(0.5);
        state.set_score(0.75);
        state.set_score(0.25);

        assert_eq!(state.score, 0.25);
        assert_eq!(state.score_day, 0.25);
        assert_eq!(state.score_week, 0.25);

        // Counters drift from the score once someone else resets them
        state.score_day = 0.0;
        state.set_score(1.0);
        assert_eq!(state.score_day, 0.75);
        assert_eq!(state.score_month, 1.0);
    }

    #[test]
    fn test_remove_vote_clamps() {
        let mut state = AggregateState::zeroed(3);
        state.add_vote(1);
        state.remove_vote(1);
        state.remove_vote(1);

        assert_eq!(state.distribution, vec![0, 0, 0]);
        assert_eq!(state.total_votes(), 0);
    }

    #[test]
    fn test_fit_to() {
        let mut state = AggregateState::zeroed(2);
        state.add_vote(0);

        state.fit_to(2);
        assert_eq!(state.distribution, vec![1, 0]);

        state.fit_to(5);
        assert_eq!(state.distribution, vec![0; 5]);
    }

    #[test]
    fn test_snapshot() {
        let mut state = AggregateState::zeroed(5);
        state.add_vote(2);
        state.add_vote(4);

        let snap = state.snapshot(&[1, 2, 3, 4, 5]);
        assert_eq!(snap.score_avg, 4.0);
        assert_eq!(snap.score_sum, 8);
        assert_eq!(snap.distribution, vec![0, 0, 1, 0, 1]);

        let empty = AggregateState::zeroed(5).snapshot(&[1, 2, 3, 4, 5]);
        assert_eq!(empty.score_avg, 0.0);
        assert_eq!(empty.score_sum, 0);
    }
}
