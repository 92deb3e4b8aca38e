//! Core entity structs: cells, walkers, and their opaque snapshots.
//!
//! A [`Cell`] is a region of state space, a [`Walker`] is one weighted
//! replicate of simulation state sitting in a cell. Walkers reference cells
//! by id; cells never own walkers.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{CellId, WalkerId};

/// A colour label partitioning cells into disjoint analysis regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(pub u32);

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A discretized region of state space.
///
/// Immutable once created within an iteration. The `core` tag marks a
/// committed region for a colour class and is carried unchanged across
/// iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Unique cell identifier.
    pub id: CellId,
    /// Committed/absorbing region tag, if any.
    pub core: Option<u32>,
    /// Colour assigned by the partition, if the cell lies in a sink region.
    pub color: Option<Color>,
}

impl Cell {
    /// Create an uncoloured cell with no core tag.
    pub const fn new(id: CellId) -> Self {
        Self {
            id,
            core: None,
            color: None,
        }
    }

    /// Create an uncoloured cell tagged as core region `core`.
    pub const fn with_core(id: CellId, core: u32) -> Self {
        Self {
            id,
            core: Some(core),
            color: None,
        }
    }

    /// Return a copy of this cell carrying the given colour.
    #[must_use]
    pub const fn colored(mut self, color: Option<Color>) -> Self {
        self.color = color;
        self
    }
}

/// Opaque structural snapshot of one walker.
///
/// The workflow never looks inside; it only moves the bytes between the
/// population, the task queue, and the checkpoint store. Cloning is cheap.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Snapshot(Bytes);

impl Snapshot {
    /// Wrap raw bytes.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume into the underlying buffer.
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshot({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Snapshot {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<Bytes> for Snapshot {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

/// One weighted replicate of simulation state assigned to a cell.
#[derive(Debug, Clone, PartialEq)]
pub struct Walker {
    /// Iteration-local identity.
    pub id: WalkerId,
    /// Owning cell.
    pub cell_id: CellId,
    /// Colour class, inherited from the cell at creation.
    pub color: Option<Color>,
    /// Statistical weight in `[0, 1]`.
    pub weight: f64,
    /// Snapshot the walker's next task starts from.
    pub start: Snapshot,
}
