//! The population the algorithm operates on.
//!
//! A [`System`] maps cell ids to [`Cell`]s and holds an ordered collection of
//! [`Walker`]s. Walkers reference cells by id; the only structural invariant
//! is that every referenced cell exists. [`SinkStates`] is the colour
//! partition, built once at run start and shared read-only afterwards.

use std::collections::{BTreeMap, BTreeSet};

use awe_types::{Cell, CellId, Color, Snapshot, Walker, WalkerId};

use crate::conservation::DEFAULT_WEIGHT_TOLERANCE;

/// Errors raised when building or validating a population.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SystemError {
    /// A cell id was added twice.
    #[error("cell {0} already exists")]
    DuplicateCell(CellId),

    /// A walker references a cell that is not in the system.
    #[error("walker {walker} references unknown cell {cell}")]
    UnknownCell {
        /// The offending walker.
        walker: WalkerId,
        /// The missing cell.
        cell: CellId,
    },

    /// A walker weight is negative, above one by more than the tolerance,
    /// or not finite.
    #[error("walker {walker} has invalid weight {weight}")]
    InvalidWeight {
        /// The offending walker.
        walker: WalkerId,
        /// The weight.
        weight: f64,
    },

    /// A cell was put into two sink regions.
    #[error("cell {cell} is already in sink region {existing}, cannot add it to {requested}")]
    OverlappingSink {
        /// The cell.
        cell: CellId,
        /// Region it already belongs to.
        existing: Color,
        /// Region it was added to.
        requested: Color,
    },
}

/// Grouping key used by resampling: colour class first, then cell.
pub type Bucket = (Option<Color>, CellId);

/// The full population: cells plus weighted walkers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct System {
    cells: BTreeMap<CellId, Cell>,
    walkers: Vec<Walker>,
}

impl System {
    /// Create an empty system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a system with the same cells and no walkers.
    #[must_use]
    pub fn empty_like(&self) -> Self {
        Self {
            cells: self.cells.clone(),
            walkers: Vec::new(),
        }
    }

    /// Add a cell.
    pub fn add_cell(&mut self, cell: Cell) -> Result<(), SystemError> {
        if self.cells.contains_key(&cell.id) {
            return Err(SystemError::DuplicateCell(cell.id));
        }
        self.cells.insert(cell.id, cell);
        Ok(())
    }

    /// Add a walker and return the id it was given.
    ///
    /// Ids are dense and follow insertion order.
    pub fn add_walker(
        &mut self,
        cell_id: CellId,
        color: Option<Color>,
        weight: f64,
        start: Snapshot,
    ) -> Result<WalkerId, SystemError> {
        let id = WalkerId(self.walkers.len() as u64);
        if !self.cells.contains_key(&cell_id) {
            return Err(SystemError::UnknownCell {
                walker: id,
                cell: cell_id,
            });
        }
        self.walkers.push(Walker {
            id,
            cell_id,
            color,
            weight,
            start,
        });
        Ok(id)
    }

    /// Rebuild a system from persisted parts, keeping walker ids as given.
    pub fn from_parts(
        cells: impl IntoIterator<Item = Cell>,
        walkers: Vec<Walker>,
    ) -> Result<Self, SystemError> {
        let mut system = Self::new();
        for cell in cells {
            system.add_cell(cell)?;
        }
        system.walkers = walkers;
        system.validate()?;
        Ok(system)
    }

    /// Look up a cell.
    pub fn cell(&self, id: CellId) -> Option<&Cell> {
        self.cells.get(&id)
    }

    /// All cells in id order.
    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.values()
    }

    /// Number of cells.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// All walkers in id order.
    pub fn walkers(&self) -> &[Walker] {
        &self.walkers
    }

    /// Look up a walker.
    pub fn walker(&self, id: WalkerId) -> Option<&Walker> {
        usize::try_from(id.0)
            .ok()
            .and_then(|index| self.walkers.get(index))
            .filter(|w| w.id == id)
            .or_else(|| self.walkers.iter().find(|w| w.id == id))
    }

    /// Number of walkers.
    pub fn walker_count(&self) -> usize {
        self.walkers.len()
    }

    /// Sum of all walker weights.
    pub fn total_weight(&self) -> f64 {
        self.walkers.iter().map(|w| w.weight).sum()
    }

    /// Total weight per colour class.
    pub fn color_weights(&self) -> BTreeMap<Option<Color>, f64> {
        let mut totals = BTreeMap::new();
        for walker in &self.walkers {
            *totals.entry(walker.color).or_insert(0.0) += walker.weight;
        }
        totals
    }

    /// Walkers grouped by `(colour, cell)`, each group in id order.
    pub fn buckets(&self) -> BTreeMap<Bucket, Vec<&Walker>> {
        let mut buckets: BTreeMap<Bucket, Vec<&Walker>> = BTreeMap::new();
        for walker in &self.walkers {
            buckets
                .entry((walker.color, walker.cell_id))
                .or_default()
                .push(walker);
        }
        buckets
    }

    /// Scale every weight so they sum to one. No-op on a weightless system.
    pub fn normalize_weights(&mut self) {
        let total = self.total_weight();
        if total > 0.0 {
            for walker in &mut self.walkers {
                walker.weight /= total;
            }
        }
    }

    /// Check referential integrity and weight sanity.
    pub fn validate(&self) -> Result<(), SystemError> {
        self.validate_within(DEFAULT_WEIGHT_TOLERANCE)
    }

    /// Like [`validate`](Self::validate), allowing a single weight to exceed
    /// one by `tolerance` of rounding drift.
    pub fn validate_within(&self, tolerance: f64) -> Result<(), SystemError> {
        let ceiling = 1.0 + tolerance.max(0.0);
        for walker in &self.walkers {
            if !self.cells.contains_key(&walker.cell_id) {
                return Err(SystemError::UnknownCell {
                    walker: walker.id,
                    cell: walker.cell_id,
                });
            }
            if !walker.weight.is_finite() || !(0.0..=ceiling).contains(&walker.weight) {
                return Err(SystemError::InvalidWeight {
                    walker: walker.id,
                    weight: walker.weight,
                });
            }
        }
        Ok(())
    }
}

/// Colour partition: which sink region each cell belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStates {
    color_cells: BTreeMap<Color, BTreeSet<CellId>>,
    cell_color: BTreeMap<CellId, Color>,
}

impl SinkStates {
    /// Create an empty partition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `cells` into the sink region of `color`.
    ///
    /// Regions are disjoint; re-adding a cell to its own region is allowed.
    pub fn add(
        &mut self,
        color: Color,
        cells: impl IntoIterator<Item = CellId>,
    ) -> Result<&mut Self, SystemError> {
        for cell in cells {
            match self.cell_color.get(&cell) {
                Some(&existing) if existing != color => {
                    return Err(SystemError::OverlappingSink {
                        cell,
                        existing,
                        requested: color,
                    });
                }
                _ => {
                    self.cell_color.insert(cell, color);
                    self.color_cells.entry(color).or_default().insert(cell);
                }
            }
        }
        Ok(self)
    }

    /// Colour of a cell, or `None` if it is in no region.
    pub fn color(&self, cell: CellId) -> Option<Color> {
        self.cell_color.get(&cell).copied()
    }

    /// Cells in a region.
    pub fn cells(&self, color: Color) -> Option<&BTreeSet<CellId>> {
        self.color_cells.get(&color)
    }

    /// All colours in ascending order.
    pub fn colors(&self) -> impl Iterator<Item = Color> + '_ {
        self.color_cells.keys().copied()
    }

    /// Number of colours.
    pub fn ncolors(&self) -> usize {
        self.color_cells.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn two_cell_system() -> System {
        let mut system = System::new();
        system.add_cell(Cell::new(CellId(0))).unwrap();
        system.add_cell(Cell::new(CellId(1))).unwrap();
        system
    }

    #[test]
    fn walker_ids_follow_insertion_order() {
        let mut system = two_cell_system();
        let a = system.add_walker(CellId(0), None, 0.25, Snapshot::default()).unwrap();
        let b = system.add_walker(CellId(1), None, 0.75, Snapshot::default()).unwrap();
        assert_eq!((a, b), (WalkerId(0), WalkerId(1)));
        assert_eq!(system.walker(b).map(|w| w.cell_id), Some(CellId(1)));
        assert_eq!(system.total_weight(), 1.0);
    }

    #[test]
    fn walker_in_unknown_cell_is_rejected() {
        let mut system = two_cell_system();
        let err = system
            .add_walker(CellId(9), None, 1.0, Snapshot::default())
            .unwrap_err();
        assert_eq!(
            err,
            SystemError::UnknownCell {
                walker: WalkerId(0),
                cell: CellId(9)
            }
        );
    }

    #[test]
    fn duplicate_cell_is_rejected() {
        let mut system = two_cell_system();
        assert_eq!(
            system.add_cell(Cell::new(CellId(1))),
            Err(SystemError::DuplicateCell(CellId(1)))
        );
    }

    #[test]
    fn from_parts_validates_references() {
        let walker = Walker {
            id: WalkerId(0),
            cell_id: CellId(5),
            color: None,
            weight: 1.0,
            start: Snapshot::default(),
        };
        let result = System::from_parts([Cell::new(CellId(0))], vec![walker]);
        assert!(matches!(result, Err(SystemError::UnknownCell { .. })));
    }

    #[test]
    fn validate_catches_bad_weights() {
        let mut system = two_cell_system();
        system.add_walker(CellId(0), None, f64::NAN, Snapshot::default()).unwrap();
        assert!(matches!(
            system.validate(),
            Err(SystemError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn rounding_drift_above_one_is_tolerated() {
        let mut system = two_cell_system();
        system
            .add_walker(CellId(0), None, 1.0 + f64::EPSILON, Snapshot::default())
            .unwrap();
        assert!(system.validate().is_ok());
        assert!(matches!(
            system.validate_within(0.0),
            Err(SystemError::InvalidWeight { .. })
        ));

        let mut heavy = two_cell_system();
        heavy.add_walker(CellId(1), None, 1.001, Snapshot::default()).unwrap();
        assert!(matches!(
            heavy.validate(),
            Err(SystemError::InvalidWeight { .. })
        ));
    }

    #[test]
    fn buckets_split_by_color_then_cell() {
        let mut system = two_cell_system();
        system.add_walker(CellId(0), Some(Color(1)), 0.1, Snapshot::default()).unwrap();
        system.add_walker(CellId(0), Some(Color(0)), 0.2, Snapshot::default()).unwrap();
        system.add_walker(CellId(0), Some(Color(0)), 0.3, Snapshot::default()).unwrap();
        let buckets = system.buckets();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets.get(&(Some(Color(0)), CellId(0))).map(Vec::len), Some(2));
        let weights = system.color_weights();
        assert!((weights.get(&Some(Color(0))).copied().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn normalize_makes_weights_sum_to_one() {
        let mut system = two_cell_system();
        system.add_walker(CellId(0), None, 0.2, Snapshot::default()).unwrap();
        system.add_walker(CellId(1), None, 0.6, Snapshot::default()).unwrap();
        system.normalize_weights();
        assert!((system.total_weight() - 1.0).abs() < 1e-12);
        assert!((system.walkers()[0].weight - 0.25).abs() < 1e-12);
    }

    #[test]
    fn sink_regions_are_disjoint() {
        let mut partition = SinkStates::new();
        partition.add(Color(0), (0..5).map(CellId)).unwrap();
        partition.add(Color(1), (5..10).map(CellId)).unwrap();
        assert_eq!(partition.color(CellId(4)), Some(Color(0)));
        assert_eq!(partition.color(CellId(5)), Some(Color(1)));
        assert_eq!(partition.color(CellId(42)), None);
        assert_eq!(partition.ncolors(), 2);

        let err = partition.add(Color(1), [CellId(2)]).unwrap_err();
        assert!(matches!(err, SystemError::OverlappingSink { .. }));
        // Re-adding to the same region is fine.
        assert!(partition.add(Color(0), [CellId(2)]).is_ok());
    }
}
