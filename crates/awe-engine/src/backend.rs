//! Runtime selection of the queue and checkpoint backends.
//!
//! The controller is generic over its queue and store. The configuration
//! picks both at startup, so each choice is wrapped in an enum that forwards
//! to the selected implementation.

use std::time::Duration;

use awe_core::config::{AweConfig, CheckpointBackend, QueueBackend};
use awe_core::{
    Checkpoint, CheckpointError, CheckpointStore, LocalQueue, QueueError, WorkQueue,
};
use awe_store::{FileCheckpointStore, PostgresCheckpointStore};
use awe_types::wire::Subjects;
use awe_types::{StagingManifest, TaskCompletion, TaskId, TaskSpec};
use awe_worker::ScriptRunner;
use tokio::time::Instant;
use tracing::info;

use crate::error::EngineError;
use crate::nats_queue::NatsQueue;

/// The configured work queue.
#[derive(Debug)]
pub enum Queue {
    /// Remote workers over NATS.
    Nats(Box<NatsQueue>),
    /// Sandboxes run in this process.
    Local(LocalQueue<ScriptRunner>),
}

impl Queue {
    /// Open the queue named by `config.queue.backend`.
    pub async fn open(config: &AweConfig, manifest: &StagingManifest) -> Result<Self, EngineError> {
        match config.queue.backend {
            QueueBackend::Nats => {
                let subjects = Subjects::for_project(config.queue.name.as_deref());
                let queue = NatsQueue::connect(
                    &config.queue.nats_url(),
                    subjects,
                    manifest,
                    config.queue.task_timeout(),
                )
                .await?;
                Ok(Self::Nats(Box::new(queue)))
            }
            QueueBackend::Local => {
                let work_dir = std::env::temp_dir().join(format!("awe-{}", std::process::id()));
                let runner = ScriptRunner::new(".", &work_dir, manifest.clone());
                runner.check_staging().await.map_err(|e| EngineError::Setup {
                    message: e.to_string(),
                })?;
                info!(
                    workers = config.queue.local_workers,
                    work_dir = %work_dir.display(),
                    "Running tasks in-process"
                );
                Ok(Self::Local(LocalQueue::new(runner, config.queue.local_workers)))
            }
        }
    }
}

impl WorkQueue for Queue {
    async fn submit(&mut self, spec: TaskSpec) -> Result<(), QueueError> {
        match self {
            Self::Nats(queue) => queue.submit(spec).await,
            Self::Local(queue) => queue.submit(spec).await,
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Option<TaskCompletion>, QueueError> {
        match self {
            Self::Nats(queue) => queue.wait(timeout).await,
            Self::Local(queue) => queue.wait(timeout).await,
        }
    }

    async fn cancel(&mut self, task_id: TaskId) -> Result<(), QueueError> {
        match self {
            Self::Nats(queue) => queue.cancel(task_id).await,
            Self::Local(queue) => queue.cancel(task_id).await,
        }
    }

    fn idle_workers(&self) -> usize {
        match self {
            Self::Nats(queue) => queue.idle_workers(),
            Self::Local(queue) => queue.idle_workers(),
        }
    }

    fn started_at(&self, task_id: TaskId) -> Option<Instant> {
        match self {
            Self::Nats(queue) => queue.started_at(task_id),
            Self::Local(queue) => queue.started_at(task_id),
        }
    }
}

/// The configured checkpoint store.
#[derive(Debug)]
pub enum Store {
    /// Generation directories on disk.
    File(FileCheckpointStore),
    /// `PostgreSQL` tables.
    Postgres(PostgresCheckpointStore),
}

impl Store {
    /// Open the store named by `config.checkpoint.backend`.
    pub async fn open(config: &AweConfig) -> Result<Self, EngineError> {
        let settings = &config.checkpoint;
        match settings.backend {
            CheckpointBackend::File => {
                info!(dir = %settings.dir.display(), keep = settings.keep, "Using file checkpoint store");
                Ok(Self::File(
                    FileCheckpointStore::new(&settings.dir).with_keep(settings.keep),
                ))
            }
            CheckpointBackend::Postgres => {
                let url = settings.postgres_url.as_deref().ok_or_else(|| EngineError::Setup {
                    message: "checkpoint.postgres_url (or DATABASE_URL) is required for the postgres backend"
                        .to_owned(),
                })?;
                let store = PostgresCheckpointStore::connect(url, &settings.run_name)
                    .await?
                    .with_keep(settings.keep);
                Ok(Self::Postgres(store))
            }
        }
    }
}

impl CheckpointStore for Store {
    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        match self {
            Self::File(store) => store.save(checkpoint).await,
            Self::Postgres(store) => store.save(checkpoint).await,
        }
    }

    async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        match self {
            Self::File(store) => store.load().await,
            Self::Postgres(store) => store.load().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AweConfig::default();
        config.checkpoint.dir = dir.path().join("checkpoints");
        let mut store = Store::open(&config).await.unwrap();
        assert!(matches!(store, Store::File(_)));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn postgres_store_needs_a_url() {
        let mut config = AweConfig::default();
        config.checkpoint.backend = CheckpointBackend::Postgres;
        config.checkpoint.postgres_url = None;
        let err = Store::open(&config).await.unwrap_err();
        assert!(matches!(err, EngineError::Setup { .. }));
    }

    #[tokio::test]
    async fn local_queue_refuses_missing_script() {
        let mut config = AweConfig::default();
        config.queue.backend = QueueBackend::Local;
        let manifest = StagingManifest::new("no-such-dir/execute-task.sh");
        let err = Queue::open(&config, &manifest).await.unwrap_err();
        assert!(matches!(err, EngineError::Setup { .. }));
    }
}
