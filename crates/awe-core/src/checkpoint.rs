//! Checkpoint persistence contract.
//!
//! The controller persists `(iteration, system)` through a
//! [`CheckpointStore`]. Stores must make `save` atomic with respect to a
//! crash: a reader either sees the previous checkpoint or the new one, never
//! a partial write. Durable stores live in `awe-store`; this module provides
//! the trait, the value type, and an in-memory store for tests and dry runs.

use std::future::Future;
use std::sync::{Arc, Mutex};

use awe_types::RunId;

use crate::system::{System, SystemError};

/// Errors raised by checkpoint stores.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Filesystem access failed.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding the record failed.
    #[error("checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored data is inconsistent.
    #[error("checkpoint is corrupt: {0}")]
    Corrupt(String),

    /// The restored population violates the entity invariants.
    #[error("checkpoint population is invalid: {0}")]
    InvalidSystem(#[from] SystemError),

    /// A backend-specific failure (database, network).
    #[error("checkpoint backend error: {0}")]
    Backend(String),
}

/// A durable snapshot of run progress.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Run the checkpoint belongs to.
    pub run_id: RunId,
    /// Last completed iteration.
    pub iteration: u64,
    /// Population entering the next iteration.
    pub system: System,
}

/// Persist and restore run progress.
pub trait CheckpointStore: Send {
    /// Atomically replace the stored checkpoint.
    fn save(
        &mut self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Return the most recent complete checkpoint, if any.
    fn load(&mut self) -> impl Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send;
}

/// In-memory store. Clones share state, so a test can "crash" an engine and
/// resume a new one from the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    slot: Arc<Mutex<Option<Checkpoint>>>,
    saves: Arc<Mutex<u64>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }

    /// The stored checkpoint, if any.
    pub fn latest(&self) -> Option<Checkpoint> {
        self.slot.lock().ok().and_then(|slot| slot.clone())
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| CheckpointError::Backend(format!("memory store poisoned: {e}")))?;
        *slot = Some(checkpoint.clone());
        if let Ok(mut saves) = self.saves.lock() {
            *saves = saves.saturating_add(1);
        }
        Ok(())
    }

    async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let slot = self
            .slot
            .lock()
            .map_err(|e| CheckpointError::Backend(format!("memory store poisoned: {e}")))?;
        Ok(slot.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use awe_types::{Cell, CellId, Snapshot};

    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let mut store = MemoryCheckpointStore::new();
        assert!(store.load().await.unwrap().is_none());

        let mut system = System::new();
        system.add_cell(Cell::with_core(CellId(1), 0)).unwrap();
        system.add_walker(CellId(1), None, 1.0, Snapshot::from(vec![7])).unwrap();
        let checkpoint = Checkpoint {
            run_id: RunId::new(),
            iteration: 4,
            system,
        };

        store.save(&checkpoint).await.unwrap();
        let shared = store.clone();
        assert_eq!(shared.latest(), Some(checkpoint.clone()));
        assert_eq!(store.load().await.unwrap(), Some(checkpoint));
        assert_eq!(shared.save_count(), 1);
    }
}
