//! Filesystem checkpoint store.
//!
//! Layout under the store root:
//!
//! ```text
//! CURRENT                      name of the committed generation
//! iter-7/checkpoint.json       CheckpointRecord
//! iter-7/snapshots/w-0.bin     one blob per walker
//! iter-8/...
//! ```
//!
//! A save builds the whole generation in a hidden temp directory, fsyncs it,
//! renames it into place, and only then swaps `CURRENT` (temp file, fsync,
//! rename). A crash at any point leaves `CURRENT` naming a complete
//! generation, or absent. Generations beyond `keep` are pruned afterwards.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use awe_core::{Checkpoint, CheckpointError, CheckpointStore};
use awe_types::{CheckpointRecord, WalkerId};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::record;

/// Name of the pointer file.
pub const CURRENT_FILE: &str = "CURRENT";

/// Name of the record inside a generation.
pub const RECORD_FILE: &str = "checkpoint.json";

/// Snapshot subdirectory inside a generation.
pub const SNAPSHOT_DIR: &str = "snapshots";

const GENERATION_PREFIX: &str = "iter-";

/// Default number of generations kept on disk.
pub const DEFAULT_KEEP: usize = 2;

/// Checkpoint store writing generation directories under a root.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
    keep: usize,
}

impl FileCheckpointStore {
    /// Create a store rooted at `root`. The directory is created on first
    /// save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep: DEFAULT_KEEP,
        }
    }

    /// Keep at most `keep` generations (at least one).
    #[must_use]
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Generation directories currently on disk, oldest first.
    pub fn generations(&self) -> Result<Vec<String>, StoreError> {
        list_generations(&self.root)
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let root = self.root.clone();
        let keep = self.keep;
        let checkpoint = checkpoint.clone();
        let iteration = checkpoint.iteration;

        let generation = tokio::task::spawn_blocking(move || {
            write_generation(&root, keep, &checkpoint)
        })
        .await
        .map_err(|e| CheckpointError::Backend(format!("checkpoint writer panicked: {e}")))??;

        info!(iteration, generation = %generation, "Checkpoint saved");
        Ok(())
    }

    async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        let root = self.root.clone();
        let loaded = tokio::task::spawn_blocking(move || read_current(&root))
            .await
            .map_err(|e| CheckpointError::Backend(format!("checkpoint reader panicked: {e}")))??;
        if let Some(checkpoint) = &loaded {
            debug!(iteration = checkpoint.iteration, "Checkpoint loaded");
        }
        Ok(loaded)
    }
}

fn snapshot_name(id: WalkerId) -> String {
    format!("w-{id}.bin")
}

/// Parse `iter-<N>` or `iter-<N>.<k>` into `(N, k)`.
fn parse_generation(name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix(GENERATION_PREFIX)?;
    match rest.split_once('.') {
        Some((iteration, suffix)) => Some((iteration.parse().ok()?, suffix.parse().ok()?)),
        None => Some((rest.parse().ok()?, 0)),
    }
}

fn list_generations(root: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut generations = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Some(key) = parse_generation(name) {
                generations.push((key, name.to_owned()));
            }
        }
    }
    generations.sort();
    Ok(generations.into_iter().map(|(_, name)| name).collect())
}

fn write_file_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sync_dir(path: &Path) {
    // Not every platform can fsync a directory handle.
    if let Ok(dir) = fs::File::open(path) {
        let _ = dir.sync_all();
    }
}

/// Replace `path` atomically: temp file, fsync, rename, fsync parent.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{name}.tmp.{}.{}",
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    write_file_synced(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent);
    }
    Ok(())
}

fn write_generation(root: &Path, keep: usize, checkpoint: &Checkpoint) -> Result<String, StoreError> {
    fs::create_dir_all(root)?;

    let tmp = root.join(format!(
        ".{GENERATION_PREFIX}{}.tmp.{}",
        checkpoint.iteration,
        std::process::id()
    ));
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    let snapshots = tmp.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snapshots)?;

    for walker in checkpoint.system.walkers() {
        write_file_synced(
            &snapshots.join(snapshot_name(walker.id)),
            walker.start.as_bytes(),
        )?;
    }
    sync_dir(&snapshots);

    let record = record::encode(checkpoint, snapshot_name);
    write_file_synced(&tmp.join(RECORD_FILE), &serde_json::to_vec_pretty(&record)?)?;
    sync_dir(&tmp);

    let generation = free_generation_name(root, checkpoint.iteration);
    fs::rename(&tmp, root.join(&generation))?;
    sync_dir(root);

    atomic_write(&root.join(CURRENT_FILE), format!("{generation}\n").as_bytes())?;
    prune(root, keep, &generation);
    Ok(generation)
}

/// `iter-<N>`, or `iter-<N>.<k>` if that iteration was saved before.
fn free_generation_name(root: &Path, iteration: u64) -> String {
    let base = format!("{GENERATION_PREFIX}{iteration}");
    if !root.join(&base).exists() {
        return base;
    }
    let mut suffix = 1_u64;
    loop {
        let name = format!("{base}.{suffix}");
        if !root.join(&name).exists() {
            return name;
        }
        suffix = suffix.saturating_add(1);
    }
}

/// Delete old generations and abandoned temp directories. Failures are
/// logged; the new checkpoint is already committed.
fn prune(root: &Path, keep: usize, current: &str) {
    let generations = match list_generations(root) {
        Ok(generations) => generations,
        Err(e) => {
            warn!(error = %e, "Failed to list checkpoint generations");
            return;
        }
    };
    let excess = generations.len().saturating_sub(keep);
    for name in generations.iter().take(excess) {
        if name == current {
            continue;
        }
        if let Err(e) = fs::remove_dir_all(root.join(name)) {
            warn!(generation = %name, error = %e, "Failed to prune checkpoint generation");
        } else {
            debug!(generation = %name, "Pruned checkpoint generation");
        }
    }

    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let is_stale_tmp = name
            .to_str()
            .is_some_and(|n| n.starts_with(&format!(".{GENERATION_PREFIX}")));
        if is_stale_tmp && entry.path().is_dir() {
            let _ = fs::remove_dir_all(entry.path());
        }
    }
}

fn read_current(root: &Path) -> Result<Option<Checkpoint>, StoreError> {
    let pointer = match fs::read_to_string(root.join(CURRENT_FILE)) {
        Ok(pointer) => pointer,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let generation = pointer.trim();
    if parse_generation(generation).is_none() {
        return Err(StoreError::Corrupt(format!(
            "{CURRENT_FILE} holds an invalid generation name {generation:?}"
        )));
    }

    let dir = root.join(generation);
    let record_path = dir.join(RECORD_FILE);
    let text = match fs::read(&record_path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::Corrupt(format!(
                "{CURRENT_FILE} points to missing generation {generation}"
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let record: CheckpointRecord = serde_json::from_slice(&text)?;

    let snapshots = dir.join(SNAPSHOT_DIR);
    let checkpoint = record::decode(record, |entry| {
        if entry.snapshot.contains(['/', '\\']) || entry.snapshot.starts_with('.') {
            return Err(StoreError::Corrupt(format!(
                "invalid snapshot reference {:?}",
                entry.snapshot
            )));
        }
        match fs::read(snapshots.join(&entry.snapshot)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::Corrupt(
                format!("missing snapshot {} for walker {}", entry.snapshot, entry.id),
            )),
            Err(e) => Err(e.into()),
        }
    })?;
    Ok(Some(checkpoint))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use awe_core::System;
    use awe_types::{Cell, CellId, Color, RunId, Snapshot};

    use super::*;

    fn checkpoint(iteration: u64) -> Checkpoint {
        let mut system = System::new();
        system.add_cell(Cell::new(CellId(0)).colored(Some(Color(0)))).unwrap();
        system.add_cell(Cell::with_core(CellId(1), 1)).unwrap();
        system
            .add_walker(CellId(0), Some(Color(0)), 0.5, Snapshot::from(vec![1, 2]))
            .unwrap();
        system
            .add_walker(CellId(1), None, 0.5, Snapshot::from(vec![3, 4, 5]))
            .unwrap();
        Checkpoint {
            run_id: RunId::new(),
            iteration,
            system,
        }
    }

    #[tokio::test]
    async fn load_without_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("missing"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load_restores_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path());
        let saved = checkpoint(3);
        store.save(&saved).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        let pointer = fs::read_to_string(dir.path().join(CURRENT_FILE)).unwrap();
        assert_eq!(pointer.trim(), "iter-3");
    }

    #[tokio::test]
    async fn old_generations_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path()).with_keep(2);
        for iteration in 0..5 {
            store.save(&checkpoint(iteration)).await.unwrap();
        }
        assert_eq!(store.generations().unwrap(), vec!["iter-3", "iter-4"]);
        assert_eq!(store.load().await.unwrap().unwrap().iteration, 4);
    }

    #[tokio::test]
    async fn resaving_an_iteration_keeps_previous_generation_intact() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path()).with_keep(3);
        store.save(&checkpoint(2)).await.unwrap();
        let again = checkpoint(2);
        store.save(&again).await.unwrap();

        assert_eq!(store.generations().unwrap(), vec!["iter-2", "iter-2.1"]);
        assert_eq!(store.load().await.unwrap().unwrap().run_id, again.run_id);
    }

    #[tokio::test]
    async fn dangling_pointer_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CURRENT_FILE), "iter-9\n").unwrap();
        let mut store = FileCheckpointStore::new(dir.path());
        assert!(matches!(
            store.load().await,
            Err(CheckpointError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn missing_or_truncated_blob_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path());
        store.save(&checkpoint(0)).await.unwrap();
        let blobs = dir.path().join("iter-0").join(SNAPSHOT_DIR);

        fs::write(blobs.join("w-1.bin"), [3_u8]).unwrap();
        assert!(matches!(store.load().await, Err(CheckpointError::Corrupt(_))));

        fs::remove_file(blobs.join("w-1.bin")).unwrap();
        assert!(matches!(store.load().await, Err(CheckpointError::Corrupt(_))));
    }

    #[test]
    fn generation_names_parse() {
        assert_eq!(parse_generation("iter-12"), Some((12, 0)));
        assert_eq!(parse_generation("iter-12.3"), Some((12, 3)));
        assert_eq!(parse_generation("iter-x"), None);
        assert_eq!(parse_generation("CURRENT"), None);
    }
}
