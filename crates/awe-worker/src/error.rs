//! Error types for the task worker.
//!
//! [`WorkerError`] covers startup and the message loop. Failures of a single
//! task are [`SandboxError`](crate::sandbox::SandboxError)s and never stop the
//! worker; they are reported back to the engine as failed results.

use std::path::PathBuf;

/// Errors that can occur while running the worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Failed to connect to or communicate with the NATS server.
    #[error("NATS error: {0}")]
    Nats(String),

    /// Configuration is invalid.
    #[error("config error: {0}")]
    Config(String),

    /// A staged file named in the manifest does not exist under the data root.
    #[error("staged file not found: {}", path.display())]
    Staging {
        /// Resolved path that is missing.
        path: PathBuf,
    },

    /// The work directory could not be prepared.
    #[error("work directory error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be framed or parsed.
    #[error("wire error: {0}")]
    Wire(#[from] awe_types::wire::WireError),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
