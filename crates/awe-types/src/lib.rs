//! Shared type definitions for the AWE weighted-ensemble workflow.
//!
//! This crate is the single source of truth for the types that cross crate
//! and process boundaries: the entity model, task descriptions, the staging
//! manifest, the worker wire format, and the persisted checkpoint record.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe identifiers for cells, walkers, tasks, and runs
//! - [`entities`] -- Cells, walkers, colours, and opaque snapshots
//! - [`task`] -- Task specs, outcomes, and resource usage
//! - [`staging`] -- Files registered once and shared read-only with workers
//! - [`wire`] -- Engine/worker message framing and subjects
//! - [`checkpoint`] -- Persisted `(iteration, population)` record

pub mod checkpoint;
pub mod entities;
pub mod ids;
pub mod staging;
pub mod task;
pub mod wire;

// Re-export primary types at crate root for convenience.
pub use checkpoint::{CHECKPOINT_FORMAT_VERSION, CellRecord, CheckpointRecord, WalkerRecord};
pub use entities::{Cell, Color, Snapshot, Walker};
pub use ids::{CellId, RunId, TaskId, WalkerId};
pub use staging::StagingManifest;
pub use task::{ResourceUsage, TaskCompletion, TaskOutcome, TaskOutput, TaskSpec};
