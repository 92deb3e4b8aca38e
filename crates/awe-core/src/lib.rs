//! Core weighted-ensemble workflow for AWE.
//!
//! This crate owns the population model and the three moving parts of an
//! iteration:
//!
//! 1. **Execute**: fan one task per walker out to a [`WorkQueue`] and collect
//!    exactly one result per walker, tolerating failures, stragglers, and
//!    duplicate replicas ([`TaskExecutor`]).
//! 2. **Assemble**: fold the results back into the population, moving the
//!    weight of permanently failed walkers onto same-colour survivors.
//! 3. **Resample**: split and merge walkers per colour and cell so each
//!    occupied cell keeps a fixed walker count without changing any colour's
//!    total weight ([`MultiColor`]).
//!
//! [`AweEngine`] runs those steps in a loop, checks weight conservation at
//! every boundary, and checkpoints through a [`CheckpointStore`].
//!
//! # Modules
//!
//! - [`system`] -- Population (`System`) and colour partition (`SinkStates`)
//! - [`conservation`] -- Weight conservation checks
//! - [`resample`] -- Resampler trait, `MultiColor`, `SaveWeights`
//! - [`executor`] -- Work queue trait and fault-tolerant task executor
//! - [`local`] -- In-process work queue
//! - [`monitor`] -- Per-task resource usage records
//! - [`assemble`] -- Folding task results into the population
//! - [`checkpoint`] -- Checkpoint store contract and in-memory store
//! - [`controller`] -- The iteration controller
//! - [`config`] -- YAML configuration

pub mod assemble;
pub mod checkpoint;
pub mod config;
pub mod conservation;
pub mod controller;
pub mod executor;
pub mod local;
pub mod monitor;
pub mod resample;
pub mod system;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, MemoryCheckpointStore};
pub use config::{AweConfig, ConfigError};
pub use controller::{
    AweEngine, ControllerConfig, ControllerError, EnginePhase, IterationCallback,
    IterationSummary, NoOpCallback, RunEndReason, RunResult, StopSignal,
};
pub use executor::{
    ExecutionReport, ExecutorConfig, ExecutorError, QueueError, TaskExecutor, WorkQueue,
};
pub use local::{LocalQueue, TaskRunner};
pub use resample::{ColorFlux, MultiColor, ResampleError, Resampled, Resampler, SaveWeights};
pub use system::{SinkStates, System, SystemError};
