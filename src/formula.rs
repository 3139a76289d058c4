// 🧮 Rating Formulas - distribution → score
// Pure functions: (distribution, range) -> f64, no side effects.
//
// A field picks one of these by configuration, or brings its own through
// `Formula::new` as long as it keeps the same signature.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// z used by the binary lower-bound formula (≈ 79% confidence)
pub const WILSON_Z: f64 = 1.25;

/// Value the weighted average is pulled toward when `prior_weight > 0`
pub const DEFAULT_PRIOR_VALUE: f64 = 0.1;

/// Pseudo-count of the prior; 0 leaves the plain average untouched
pub const DEFAULT_PRIOR_WEIGHT: f64 = 0.0;

// ============================================================================
// FORMULA HANDLE
// ============================================================================

type FormulaFn = dyn Fn(&[u64], &[i64]) -> f64 + Send + Sync;

/// Named, cloneable rating formula
#[derive(Clone)]
pub struct Formula {
    name: String,
    func: Arc<FormulaFn>,
}

impl Formula {
    /// Wrap any function with the formula signature
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[u64], &[i64]) -> f64 + Send + Sync + 'static,
    {
        Formula {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Wilson lower bound over a (downs, ups) distribution
    pub fn binary_lower_bound() -> Self {
        Formula::new("binary_lower_bound", binary_lower_bound)
    }

    /// Weighted average of the range values, default prior
    pub fn weighted_average() -> Self {
        Formula::new("weighted_average", weighted_average)
    }

    pub fn from_kind(kind: &FormulaKind) -> Self {
        match *kind {
            FormulaKind::BinaryLowerBound => Formula::binary_lower_bound(),
            FormulaKind::WeightedAverage {
                prior_weight,
                prior_value,
            } => Formula::new("weighted_average", move |distribution, range| {
                weighted_average_with_prior(distribution, range, prior_weight, prior_value)
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn apply(&self, distribution: &[u64], range: &[i64]) -> f64 {
        (self.func)(distribution, range)
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Formula").field("name", &self.name).finish()
    }
}

// ============================================================================
// FORMULA SELECTION (configuration)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormulaKind {
    BinaryLowerBound,
    WeightedAverage {
        #[serde(default = "default_prior_weight")]
        prior_weight: f64,
        #[serde(default = "default_prior_value")]
        prior_value: f64,
    },
}

fn default_prior_weight() -> f64 {
    DEFAULT_PRIOR_WEIGHT
}

fn default_prior_value() -> f64 {
    DEFAULT_PRIOR_VALUE
}

impl Default for FormulaKind {
    fn default() -> Self {
        FormulaKind::BinaryLowerBound
    }
}

impl FormulaKind {
    pub fn weighted_average() -> Self {
        FormulaKind::WeightedAverage {
            prior_weight: DEFAULT_PRIOR_WEIGHT,
            prior_value: DEFAULT_PRIOR_VALUE,
        }
    }
}

// ============================================================================
// REFERENCE FORMULAS
// ============================================================================

/// Lower bound of the Wilson score interval for a two-bucket distribution.
///
/// The first bucket counts down votes, the second up votes. Anything that is
/// not exactly two buckets, or has no votes, scores 0.
pub fn binary_lower_bound(distribution: &[u64], _range: &[i64]) -> f64 {
    let (downs, ups) = match distribution {
        [downs, ups] => (*downs as f64, *ups as f64),
        _ => return 0.0,
    };

    let n = downs + ups;
    if n == 0.0 {
        return 0.0;
    }

    let z = WILSON_Z;
    let p = ups / n;

    let left = p + z * z / (2.0 * n);
    let right = z * (p * (1.0 - p) / n + z * z / (4.0 * n * n)).sqrt();
    let under = 1.0 + z * z / n;

    (left - right) / under
}

/// Average of the range values weighted by their vote counts
pub fn weighted_average(distribution: &[u64], range: &[i64]) -> f64 {
    weighted_average_with_prior(
        distribution,
        range,
        DEFAULT_PRIOR_WEIGHT,
        DEFAULT_PRIOR_VALUE,
    )
}

/// Weighted average blended toward `prior_value` with `prior_weight`
/// pseudo-votes: `v/(v+w)·avg + w/(v+w)·prior`.
pub fn weighted_average_with_prior(
    distribution: &[u64],
    range: &[i64],
    prior_weight: f64,
    prior_value: f64,
) -> f64 {
    if distribution.is_empty() || range.is_empty() || distribution.len() != range.len() {
        return 0.0;
    }

    let votes = total_votes(distribution) as f64;
    if votes <= 0.0 {
        return 0.0;
    }

    let avg = weighted_sum_f64(distribution, range) / votes;
    let blend = votes + prior_weight;

    (votes / blend) * avg + (prior_weight / blend) * prior_value
}

/// Σ range[i]·distribution[i], saturating at the i64 bounds
pub fn weighted_sum(distribution: &[u64], range: &[i64]) -> i64 {
    let sum = range
        .iter()
        .zip(distribution)
        .map(|(value, count)| i128::from(*value) * i128::from(*count))
        .fold(0i128, i128::saturating_add);

    i64::try_from(sum).unwrap_or(if sum < 0 { i64::MIN } else { i64::MAX })
}

fn weighted_sum_f64(distribution: &[u64], range: &[i64]) -> f64 {
    range
        .iter()
        .zip(distribution)
        .map(|(value, count)| *value as f64 * *count as f64)
        .sum()
}

pub fn total_votes(distribution: &[u64]) -> u64 {
    distribution.iter().sum()
}

/// Plain average, 0 when nobody voted
pub fn average(distribution: &[u64], range: &[i64]) -> f64 {
    let votes = total_votes(distribution);
    if votes == 0 {
        return 0.0;
    }
    weighted_sum_f64(distribution, range) / votes as f64
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_lower_bound_fixture() {
        let score = binary_lower_bound(&[1, 9], &[0, 1]);

        assert!((score - 0.723129).abs() < 1e-6, "got {}", score);
        assert!(score < 0.9, "lower bound must sit below the raw ratio");
    }

    #[test]
    fn test_binary_lower_bound_edges() {
        assert_eq!(binary_lower_bound(&[0, 0], &[0, 1]), 0.0);
        assert_eq!(binary_lower_bound(&[], &[]), 0.0);
        assert_eq!(binary_lower_bound(&[1, 2, 3], &[1, 2, 3]), 0.0);
        assert!(binary_lower_bound(&[5, 0], &[0, 1]).abs() < 1e-12);

        // More evidence at the same ratio raises the bound
        let few = binary_lower_bound(&[1, 9], &[0, 1]);
        let many = binary_lower_bound(&[10, 90], &[0, 1]);
        assert!(many > few);
    }

    #[test]
    fn test_weighted_average() {
        let range = [1, 2, 3, 4, 5];

        assert_eq!(weighted_average(&[0, 0, 1, 0, 1], &range), 4.0);
        assert_eq!(weighted_average(&[0, 0, 0, 0, 0], &range), 0.0);
        assert_eq!(weighted_average(&[1, 1], &range), 0.0, "length mismatch");
        assert_eq!(weighted_average(&[], &[]), 0.0);
    }

    #[test]
    fn test_prior_pulls_toward_fixed_value() {
        let range = [1, 2, 3, 4, 5];
        let dist = [0, 0, 0, 0, 2];

        let plain = weighted_average_with_prior(&dist, &range, 0.0, 0.1);
        let blended = weighted_average_with_prior(&dist, &range, 2.0, 0.1);

        assert_eq!(plain, 5.0);
        // (2/4)·5 + (2/4)·0.1
        assert!((blended - 2.55).abs() < 1e-12);
    }

    #[test]
    fn test_formula_from_kind_and_custom() {
        let weighted = Formula::from_kind(&FormulaKind::weighted_average());
        assert_eq!(weighted.name(), "weighted_average");
        assert_eq!(weighted.apply(&[0, 0, 1, 0, 1], &[1, 2, 3, 4, 5]), 4.0);

        let binary = Formula::from_kind(&FormulaKind::default());
        assert_eq!(binary.name(), "binary_lower_bound");

        let count_only = Formula::new("count", |dist, _| total_votes(dist) as f64);
        assert_eq!(count_only.apply(&[3, 4], &[1, 2]), 7.0);
    }

    #[test]
    fn test_formula_kind_json() {
        let kind: FormulaKind =
            serde_json::from_str(r#"{"kind": "weighted_average"}"#).unwrap();
        assert_eq!(kind, FormulaKind::weighted_average());

        let kind: FormulaKind =
            serde_json::from_str(r#"{"kind": "weighted_average", "prior_weight": 3.0}"#)
                .unwrap();
        assert_eq!(
            kind,
            FormulaKind::WeightedAverage {
                prior_weight: 3.0,
                prior_value: 0.1
            }
        );
    }

    #[test]
    fn test_sums() {
        assert_eq!(weighted_sum(&[0, 0, 1, 0, 1], &[1, 2, 3, 4, 5]), 8);
        assert_eq!(average(&[0, 0, 1, 0, 1], &[1, 2, 3, 4, 5]), 4.0);
        assert_eq!(average(&[0, 0], &[0, 1]), 0.0);
    }

    #[test]
    fn test_sums_saturate_on_huge_ranges() {
        let big = i64::MAX / 2 + 1;

        assert_eq!(weighted_sum(&[2], &[big]), i64::MAX);
        assert_eq!(weighted_sum(&[3], &[i64::MIN]), i64::MIN);
        assert_eq!(weighted_sum(&[1, 1], &[i64::MAX, i64::MIN]), -1);

        let avg = average(&[2], &[big]);
        assert!((avg - big as f64).abs() / (big as f64) < 1e-12);
    }
}
