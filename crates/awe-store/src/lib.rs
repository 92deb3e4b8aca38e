//! Durable checkpoint stores for AWE.
//!
//! Both stores implement [`awe_core::CheckpointStore`] and persist the same
//! [`CheckpointRecord`](awe_types::CheckpointRecord), with snapshot bytes
//! kept out of line.
//!
//! # Modules
//!
//! - [`file`] -- Generation directories plus an atomically swapped pointer
//! - [`postgres`] -- `PostgreSQL` tables, one transaction per save
//! - [`record`] -- Checkpoint to record conversion
//! - [`error`] -- Shared error types

pub mod error;
pub mod file;
pub mod postgres;
pub mod record;

pub use error::StoreError;
pub use file::FileCheckpointStore;
pub use postgres::PostgresCheckpointStore;
