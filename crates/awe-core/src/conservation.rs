//! Weight conservation checks for the population.
//!
//! The weighted-ensemble estimator is only unbiased if probability is
//! neither created nor destroyed. Two laws are enforced at every iteration
//! boundary:
//!
//! ```text
//! sum(weights) == 1                              (global)
//! sum(weights of colour c) == expected(c)  for all c   (per colour)
//! ```
//!
//! A violation produces a [`WeightAnomaly`], which the controller treats as
//! fatal: continuing would silently produce statistically invalid output.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use awe_types::Color;

use crate::system::System;

/// Default absolute tolerance for weight sums.
pub const DEFAULT_WEIGHT_TOLERANCE: f64 = 1e-9;

/// Where in the iteration a check ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStage {
    /// The population handed to the executor.
    BeforeTasks,
    /// The evaluated population after failed walkers were folded in.
    Assembled,
    /// The resampler's output.
    Resampled,
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BeforeTasks => "before tasks",
            Self::Assembled => "after assembly",
            Self::Resampled => "after resampling",
        };
        f.write_str(name)
    }
}

/// Description of a conservation violation.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightAnomaly {
    /// Iteration the anomaly was detected in.
    pub iteration: u64,
    /// Stage the anomaly was detected at.
    pub stage: CheckStage,
    /// Per-colour `(expected, actual)` pairs that disagree. The global sum
    /// is reported under the `None` key when only it is off.
    pub imbalances: BTreeMap<Option<Color>, (f64, f64)>,
    /// Human-readable summary.
    pub message: String,
}

impl fmt::Display for WeightAnomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for WeightAnomaly {}

/// The result of a conservation check.
#[derive(Debug, Clone, PartialEq)]
pub enum WeightCheck {
    /// Weight is conserved.
    Balanced,
    /// Weight was gained or lost.
    Anomaly(WeightAnomaly),
}

impl WeightCheck {
    /// Convert into a `Result`, for `?` at call sites.
    pub fn into_result(self) -> Result<(), WeightAnomaly> {
        match self {
            Self::Balanced => Ok(()),
            Self::Anomaly(anomaly) => Err(anomaly),
        }
    }
}

/// Verify that the population's total weight is one.
pub fn verify_total(
    iteration: u64,
    stage: CheckStage,
    system: &System,
    tolerance: f64,
) -> WeightCheck {
    let total = system.total_weight();
    if total.is_finite() && (total - 1.0).abs() <= tolerance {
        return WeightCheck::Balanced;
    }

    let mut imbalances = BTreeMap::new();
    imbalances.insert(None, (1.0, total));
    WeightCheck::Anomaly(WeightAnomaly {
        iteration,
        stage,
        imbalances,
        message: format!(
            "WEIGHT_ANOMALY at iteration {iteration} ({stage}): total weight {total:.12} != 1",
        ),
    })
}

/// Verify that each colour class holds the expected weight.
///
/// Colours present on only one side are compared against zero.
pub fn verify_colors(
    iteration: u64,
    stage: CheckStage,
    expected: &BTreeMap<Option<Color>, f64>,
    system: &System,
    tolerance: f64,
) -> WeightCheck {
    let actual = system.color_weights();
    let colors: BTreeSet<Option<Color>> = expected.keys().chain(actual.keys()).copied().collect();

    let mut imbalances = BTreeMap::new();
    for color in colors {
        let want = expected.get(&color).copied().unwrap_or(0.0);
        let got = actual.get(&color).copied().unwrap_or(0.0);
        if !got.is_finite() || (want - got).abs() > tolerance {
            imbalances.insert(color, (want, got));
        }
    }

    if imbalances.is_empty() {
        WeightCheck::Balanced
    } else {
        let count = imbalances.len();
        WeightCheck::Anomaly(WeightAnomaly {
            iteration,
            stage,
            imbalances,
            message: format!(
                "WEIGHT_ANOMALY at iteration {iteration} ({stage}): weight leaked across {count} colour class(es)",
            ),
        })
    }
}

/// Run the global check and, if it passes, the per-colour check.
pub fn verify_conservation(
    iteration: u64,
    stage: CheckStage,
    expected: &BTreeMap<Option<Color>, f64>,
    system: &System,
    tolerance: f64,
) -> WeightCheck {
    let result = verify_total(iteration, stage, system, tolerance);
    if let WeightCheck::Anomaly(_) = &result {
        return result;
    }
    verify_colors(iteration, stage, expected, system, tolerance)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use awe_types::{Cell, CellId, Snapshot};

    use super::*;

    fn system_with(weights: &[(Option<Color>, f64)]) -> System {
        let mut system = System::new();
        system.add_cell(Cell::new(CellId(0))).unwrap();
        for &(color, weight) in weights {
            system
                .add_walker(CellId(0), color, weight, Snapshot::default())
                .unwrap();
        }
        system
    }

    #[test]
    fn balanced_population_passes() {
        let system = system_with(&[(Some(Color(0)), 0.4), (Some(Color(1)), 0.6)]);
        let expected = system.color_weights();
        assert_eq!(
            verify_conservation(1, CheckStage::Resampled, &expected, &system, 1e-9),
            WeightCheck::Balanced
        );
    }

    #[test]
    fn lost_weight_is_an_anomaly() {
        let system = system_with(&[(None, 0.4), (None, 0.5)]);
        let WeightCheck::Anomaly(anomaly) =
            verify_total(3, CheckStage::Assembled, &system, 1e-9)
        else {
            unreachable!("expected an anomaly");
        };
        assert_eq!(anomaly.iteration, 3);
        assert!(anomaly.message.contains("after assembly"));
        assert!(anomaly.imbalances.contains_key(&None));
    }

    #[test]
    fn cross_color_leak_is_an_anomaly() {
        let system = system_with(&[(Some(Color(0)), 0.3), (Some(Color(1)), 0.7)]);
        let mut expected = BTreeMap::new();
        expected.insert(Some(Color(0)), 0.5);
        expected.insert(Some(Color(1)), 0.5);
        let result = verify_conservation(0, CheckStage::Resampled, &expected, &system, 1e-9);
        let anomaly = result.into_result().unwrap_err();
        assert_eq!(anomaly.imbalances.len(), 2);
    }

    #[test]
    fn vanished_color_is_compared_against_zero() {
        let system = system_with(&[(Some(Color(0)), 1.0)]);
        let mut expected = BTreeMap::new();
        expected.insert(Some(Color(0)), 0.9);
        expected.insert(Some(Color(1)), 0.1);
        let anomaly = verify_colors(0, CheckStage::Resampled, &expected, &system, 1e-9)
            .into_result()
            .unwrap_err();
        assert_eq!(anomaly.imbalances.get(&Some(Color(1))), Some(&(0.1, 0.0)));
    }
}
