//! Conversion between [`Checkpoint`] and the persisted [`CheckpointRecord`].
//!
//! Snapshot bytes never go into the record. Each walker carries a
//! store-chosen reference plus the expected blob length, and the store
//! resolves the reference when loading.

use awe_core::{Checkpoint, System};
use awe_types::{
    CHECKPOINT_FORMAT_VERSION, Cell, CellRecord, CheckpointRecord, Snapshot, Walker, WalkerId,
    WalkerRecord,
};
use bytes::Bytes;
use chrono::Utc;

use crate::error::StoreError;

/// Build the record for `checkpoint`, naming each walker's blob with `key`.
pub fn encode(checkpoint: &Checkpoint, key: impl Fn(WalkerId) -> String) -> CheckpointRecord {
    let system = &checkpoint.system;
    CheckpointRecord {
        format_version: CHECKPOINT_FORMAT_VERSION,
        run_id: checkpoint.run_id,
        iteration: checkpoint.iteration,
        saved_at: Utc::now(),
        cells: system
            .cells()
            .map(|cell| CellRecord {
                id: cell.id,
                core: cell.core,
                color: cell.color,
            })
            .collect(),
        walkers: system
            .walkers()
            .iter()
            .map(|walker| WalkerRecord {
                id: walker.id,
                cell_id: walker.cell_id,
                color: walker.color,
                weight: walker.weight,
                snapshot: key(walker.id),
                snapshot_len: walker.start.len() as u64,
            })
            .collect(),
    }
}

/// Rebuild a checkpoint, fetching each walker's blob through `blob`.
///
/// Blobs whose length disagrees with the record are reported as corrupt.
pub fn decode(
    record: CheckpointRecord,
    mut blob: impl FnMut(&WalkerRecord) -> Result<Bytes, StoreError>,
) -> Result<Checkpoint, StoreError> {
    if record.format_version != CHECKPOINT_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion(record.format_version));
    }

    let mut walkers = Vec::with_capacity(record.walkers.len());
    for entry in &record.walkers {
        let data = blob(entry)?;
        if data.len() as u64 != entry.snapshot_len {
            return Err(StoreError::Corrupt(format!(
                "snapshot {} of walker {} is {} bytes, expected {}",
                entry.snapshot,
                entry.id,
                data.len(),
                entry.snapshot_len
            )));
        }
        walkers.push(Walker {
            id: entry.id,
            cell_id: entry.cell_id,
            color: entry.color,
            weight: entry.weight,
            start: Snapshot::from(data),
        });
    }

    let cells = record.cells.iter().map(|c| Cell {
        id: c.id,
        core: c.core,
        color: c.color,
    });
    let system = System::from_parts(cells, walkers)?;
    Ok(Checkpoint {
        run_id: record.run_id,
        iteration: record.iteration,
        system,
    })
}
