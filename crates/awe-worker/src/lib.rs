//! Task worker for AWE.
//!
//! A worker pulls walker tasks from the engine over NATS, runs the staged
//! execute script for each one in a private sandbox directory, and reports
//! the resulting snapshot and cell assignment.
//!
//! # Architecture
//!
//! ```text
//! NATS (task.<name>) --> NATS (started)
//!             --> sandbox (link staged files, write structure.pdb)
//!             --> sh execute-task.sh
//!             --> read structure2.pdb + cell2.dat --> NATS (result)
//! ```
//!
//! [`ScriptRunner`] is also a [`TaskRunner`](awe_core::TaskRunner), so the
//! engine can run the same sandboxes in-process when no workers are
//! deployed.
//!
//! # Modules
//!
//! - [`config`] -- Environment configuration
//! - [`error`] -- Worker error type
//! - [`sandbox`] -- Per-task sandbox and script execution
//! - [`worker`] -- NATS message loop

pub mod config;
pub mod error;
pub mod sandbox;
pub mod worker;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use sandbox::{SandboxError, ScriptRunner};
pub use worker::Worker;
