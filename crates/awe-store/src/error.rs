//! Error types for the checkpoint stores.
//!
//! Store internals use [`StoreError`]; at the [`CheckpointStore`] boundary it
//! is folded into the controller-facing [`CheckpointError`].
//!
//! [`CheckpointStore`]: awe_core::CheckpointStore

use awe_core::{CheckpointError, SystemError};

/// Errors that can occur in the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored data is incomplete or inconsistent.
    #[error("Corrupt checkpoint: {0}")]
    Corrupt(String),

    /// The record was written by an incompatible version.
    #[error("Unsupported checkpoint format version {0}")]
    UnsupportedVersion(u32),

    /// The restored population is invalid.
    #[error("Invalid population: {0}")]
    System(#[from] SystemError),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for CheckpointError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(e) => Self::Io(e),
            StoreError::Serialization(e) => Self::Serialization(e),
            StoreError::System(e) => Self::InvalidSystem(e),
            StoreError::Corrupt(msg) => Self::Corrupt(msg),
            StoreError::UnsupportedVersion(v) => {
                Self::Corrupt(format!("unsupported format version {v}"))
            }
            other => Self::Backend(other.to_string()),
        }
    }
}
