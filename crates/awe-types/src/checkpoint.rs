//! Persisted checkpoint record format.
//!
//! A checkpoint is the iteration number plus the full population. Snapshot
//! bytes are stored out of line; the record only references them, so the
//! JSON stays small and stores may keep blobs wherever suits them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::Color;
use crate::ids::{CellId, RunId, WalkerId};

/// Version written into every record.
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// One persisted cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    /// Cell id.
    pub id: CellId,
    /// Core tag.
    pub core: Option<u32>,
    /// Partition colour.
    pub color: Option<Color>,
}

/// One persisted walker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkerRecord {
    /// Walker id.
    pub id: WalkerId,
    /// Owning cell.
    pub cell_id: CellId,
    /// Colour class.
    pub color: Option<Color>,
    /// Weight.
    pub weight: f64,
    /// Store-specific reference to the snapshot blob.
    pub snapshot: String,
    /// Length of the snapshot blob in bytes.
    pub snapshot_len: u64,
}

/// The persisted form of `(iteration, system)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Format version of this record.
    pub format_version: u32,
    /// Run this checkpoint belongs to.
    pub run_id: RunId,
    /// Last completed iteration.
    pub iteration: u64,
    /// When the checkpoint was written.
    pub saved_at: DateTime<Utc>,
    /// Cells in id order.
    pub cells: Vec<CellRecord>,
    /// Walkers in id order.
    pub walkers: Vec<WalkerRecord>,
}
