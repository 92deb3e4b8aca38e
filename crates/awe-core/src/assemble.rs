//! Fold task results back into a population.
//!
//! Every walker that advanced moves to the cell its task reported and
//! starts the next iteration from the task's output snapshot. Walkers that
//! failed permanently are dropped and their weight is spread over the
//! surviving walkers of the same colour, in proportion to their weights.
//! If a colour has no survivors at all, its failed walkers are kept
//! unadvanced so the colour's weight is not lost.

use std::collections::BTreeMap;

use awe_types::{Color, WalkerId};
use tracing::warn;

use crate::executor::ExecutionReport;
use crate::system::{System, SystemError};

/// Errors raised while assembling the evaluated population.
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    /// The executor reported neither a result nor a failure for a walker.
    #[error("no result or failure reported for walker {0}")]
    MissingResult(WalkerId),

    /// A task placed its walker in a cell that does not exist.
    #[error("invalid task result: {0}")]
    System(#[from] SystemError),
}

/// The evaluated population and what happened to failed walkers.
#[derive(Debug, Clone)]
pub struct Assembly {
    /// Population to resample.
    pub system: System,
    /// Walkers that advanced.
    pub advanced: usize,
    /// Failed walkers whose weight went to same-colour survivors.
    pub dropped: Vec<WalkerId>,
    /// Failed walkers kept unadvanced because their colour had no survivor.
    pub retained: Vec<WalkerId>,
}

/// Build the evaluated population from `before` and the executor report.
///
/// Walker order follows `before`; ids are reassigned densely.
pub fn assemble(before: &System, report: &ExecutionReport) -> Result<Assembly, AssembleError> {
    let mut survivor_weight: BTreeMap<Option<Color>, f64> = BTreeMap::new();
    let mut failed_weight: BTreeMap<Option<Color>, f64> = BTreeMap::new();
    for walker in before.walkers() {
        if report.results.contains_key(&walker.id) {
            *survivor_weight.entry(walker.color).or_insert(0.0) += walker.weight;
        } else if report.failures.contains_key(&walker.id) {
            *failed_weight.entry(walker.color).or_insert(0.0) += walker.weight;
        } else {
            return Err(AssembleError::MissingResult(walker.id));
        }
    }

    let scale: BTreeMap<Option<Color>, f64> = survivor_weight
        .iter()
        .map(|(color, &alive)| {
            let lost = failed_weight.get(color).copied().unwrap_or(0.0);
            let factor = if alive > 0.0 { (alive + lost) / alive } else { 1.0 };
            (*color, factor)
        })
        .collect();

    let mut system = before.empty_like();
    let mut dropped = Vec::new();
    let mut retained = Vec::new();
    let mut advanced = 0_usize;

    for walker in before.walkers() {
        if let Some(output) = report.results.get(&walker.id) {
            let factor = scale.get(&walker.color).copied().unwrap_or(1.0);
            system
                .add_walker(
                    output.cell_id,
                    walker.color,
                    (walker.weight * factor).min(1.0),
                    output.snapshot.clone(),
                )
                .map_err(|e| match e {
                    SystemError::UnknownCell { cell, .. } => SystemError::UnknownCell {
                        walker: walker.id,
                        cell,
                    },
                    other => other,
                })?;
            advanced = advanced.saturating_add(1);
        } else if survivor_weight
            .get(&walker.color)
            .is_some_and(|&alive| alive > 0.0)
        {
            dropped.push(walker.id);
        } else {
            system.add_walker(
                walker.cell_id,
                walker.color,
                walker.weight,
                walker.start.clone(),
            )?;
            retained.push(walker.id);
        }
    }

    if !dropped.is_empty() || !retained.is_empty() {
        warn!(
            dropped = dropped.len(),
            retained = retained.len(),
            "Failed walkers folded into population"
        );
    }

    Ok(Assembly {
        system,
        advanced,
        dropped,
        retained,
    })
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use awe_types::{Cell, CellId, Snapshot, TaskOutput};

    use super::*;
    use crate::executor::WalkerFailure;

    fn population() -> System {
        let mut system = System::new();
        for id in 0..4 {
            system.add_cell(Cell::new(CellId(id))).unwrap();
        }
        let red = Some(Color(0));
        let blue = Some(Color(1));
        system.add_walker(CellId(0), red, 0.25, Snapshot::from(vec![0])).unwrap();
        system.add_walker(CellId(1), red, 0.25, Snapshot::from(vec![1])).unwrap();
        system.add_walker(CellId(2), red, 0.25, Snapshot::from(vec![2])).unwrap();
        system.add_walker(CellId(3), blue, 0.25, Snapshot::from(vec![3])).unwrap();
        system
    }

    fn advanced_to(cell: u64) -> TaskOutput {
        TaskOutput {
            snapshot: Snapshot::from(vec![9]),
            cell_id: CellId(cell),
        }
    }

    fn failure() -> WalkerFailure {
        WalkerFailure {
            attempts: 3,
            reason: String::from("boom"),
        }
    }

    #[test]
    fn successful_walkers_move_to_reported_cells() {
        let before = population();
        let mut report = ExecutionReport::default();
        for (walker, cell) in [(0, 3), (1, 2), (2, 1), (3, 0)] {
            report.results.insert(WalkerId(walker), advanced_to(cell));
        }
        let assembly = assemble(&before, &report).unwrap();

        assert_eq!(assembly.advanced, 4);
        let cells: Vec<CellId> = assembly.system.walkers().iter().map(|w| w.cell_id).collect();
        assert_eq!(cells, vec![CellId(3), CellId(2), CellId(1), CellId(0)]);
        assert_eq!(assembly.system.walkers()[0].start, Snapshot::from(vec![9]));
        assert_eq!(assembly.system.walkers()[0].color, Some(Color(0)));
    }

    #[test]
    fn failed_weight_goes_to_same_colour_survivors() {
        let before = population();
        let mut report = ExecutionReport::default();
        report.results.insert(WalkerId(0), advanced_to(0));
        report.results.insert(WalkerId(1), advanced_to(1));
        report.failures.insert(WalkerId(2), failure());
        report.results.insert(WalkerId(3), advanced_to(3));

        let assembly = assemble(&before, &report).unwrap();
        assert_eq!(assembly.dropped, vec![WalkerId(2)]);
        assert_eq!(assembly.system.walker_count(), 3);

        let colors = assembly.system.color_weights();
        assert!((colors[&Some(Color(0))] - 0.75).abs() < 1e-12);
        assert!((colors[&Some(Color(1))] - 0.25).abs() < 1e-12);
        assert!((assembly.system.total_weight() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn colour_without_survivors_keeps_failed_walkers() {
        let before = population();
        let mut report = ExecutionReport::default();
        for walker in 0..3 {
            report.results.insert(WalkerId(walker), advanced_to(walker));
        }
        report.failures.insert(WalkerId(3), failure());

        let assembly = assemble(&before, &report).unwrap();
        assert_eq!(assembly.retained, vec![WalkerId(3)]);
        let kept = &assembly.system.walkers()[3];
        assert_eq!(kept.cell_id, CellId(3));
        assert_eq!(kept.start, Snapshot::from(vec![3]));
        assert_eq!(kept.weight, 0.25);
    }

    #[test]
    fn lone_survivor_of_a_normalized_population_stays_valid() {
        for n in 2..300_u64 {
            let mut before = System::new();
            before.add_cell(Cell::new(CellId(0))).unwrap();
            for _ in 0..n {
                before
                    .add_walker(CellId(0), Some(Color(0)), 1.0, Snapshot::from(vec![0]))
                    .unwrap();
            }
            before.normalize_weights();

            let mut report = ExecutionReport::default();
            for walker in 0..n - 1 {
                report.failures.insert(WalkerId(walker), failure());
            }
            report.results.insert(WalkerId(n - 1), advanced_to(0));

            let assembly = assemble(&before, &report).unwrap();
            assert_eq!(assembly.system.walker_count(), 1);
            let survivor = assembly.system.walkers()[0].weight;
            assert!(survivor <= 1.0, "n = {n}: weight {survivor}");
            assert!((survivor - 1.0).abs() < 1e-12);
            assembly.system.validate_within(0.0).unwrap();
        }
    }

    #[test]
    fn missing_walker_is_an_error() {
        let before = population();
        let report = ExecutionReport::default();
        assert!(matches!(
            assemble(&before, &report),
            Err(AssembleError::MissingResult(WalkerId(0)))
        ));
    }

    #[test]
    fn result_in_unknown_cell_is_rejected() {
        let before = population();
        let mut report = ExecutionReport::default();
        for walker in 0..4 {
            report.results.insert(WalkerId(walker), advanced_to(walker));
        }
        report.results.insert(WalkerId(1), advanced_to(77));
        assert!(matches!(
            assemble(&before, &report),
            Err(AssembleError::System(SystemError::UnknownCell {
                walker: WalkerId(1),
                cell: CellId(77)
            }))
        ));
    }
}
