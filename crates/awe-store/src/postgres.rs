//! `PostgreSQL` checkpoint store.
//!
//! One row per saved iteration in `awe_checkpoints` (the JSON record) and
//! one row per walker in `awe_walker_snapshots` (the raw snapshot bytes),
//! both keyed by run name. A save is a single transaction, so `load` only
//! ever sees complete checkpoints.
//!
//! Uses [`sqlx`] with runtime query construction (not compile-time checked)
//! to avoid requiring a live database at build time. All queries are
//! parameterized.

use std::collections::BTreeMap;
use std::time::Duration;

use awe_core::{Checkpoint, CheckpointError, CheckpointStore};
use awe_types::{CheckpointRecord, WalkerId};
use bytes::Bytes;
use sqlx::PgPool;
use sqlx::Row as _;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::record;

/// Default maximum number of connections in the pool.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default number of checkpoints kept per run.
const DEFAULT_KEEP: i64 = 2;

const SCHEMA: [&str; 2] = [
    r"CREATE TABLE IF NOT EXISTS awe_checkpoints (
        run_name   TEXT        NOT NULL,
        iteration  BIGINT      NOT NULL,
        run_id     UUID        NOT NULL,
        state      JSONB       NOT NULL,
        saved_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (run_name, iteration)
    )",
    r"CREATE TABLE IF NOT EXISTS awe_walker_snapshots (
        run_name   TEXT   NOT NULL,
        iteration  BIGINT NOT NULL,
        walker_id  BIGINT NOT NULL,
        data       BYTEA  NOT NULL,
        PRIMARY KEY (run_name, iteration, walker_id),
        FOREIGN KEY (run_name, iteration)
            REFERENCES awe_checkpoints (run_name, iteration) ON DELETE CASCADE
    )",
];

/// Checkpoint store backed by `PostgreSQL`.
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: PgPool,
    run_name: String,
    keep: i64,
}

impl PostgresCheckpointStore {
    /// Connect to `url` and create the schema if needed.
    pub async fn connect(url: &str, run_name: &str) -> Result<Self, StoreError> {
        let options: PgConnectOptions = url
            .parse()
            .map_err(|e: sqlx::Error| StoreError::Config(format!("Invalid database URL: {e}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .connect_with(options)
            .await?;
        info!(run_name, "Connected to PostgreSQL checkpoint store");

        let store = Self::from_pool(pool, run_name);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not touched.
    pub fn from_pool(pool: PgPool, run_name: &str) -> Self {
        Self {
            pool,
            run_name: run_name.to_owned(),
            keep: DEFAULT_KEEP,
        }
    }

    /// Keep at most `keep` checkpoints for this run (at least one).
    #[must_use]
    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = i64::try_from(keep.max(1)).unwrap_or(i64::MAX);
        self
    }

    /// Create the checkpoint tables if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Checkpoint schema ready");
        Ok(())
    }

    /// Return a reference to the underlying [`PgPool`].
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let iteration = i64::try_from(checkpoint.iteration).unwrap_or(i64::MAX);
        let record = record::encode(checkpoint, |id| format!("pg:{id}"));
        let state = serde_json::to_value(&record)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(r"DELETE FROM awe_checkpoints WHERE run_name = $1 AND iteration = $2")
            .bind(&self.run_name)
            .bind(iteration)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r"INSERT INTO awe_checkpoints (run_name, iteration, run_id, state, saved_at)
              VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&self.run_name)
        .bind(iteration)
        .bind(checkpoint.run_id.into_inner())
        .bind(&state)
        .bind(record.saved_at)
        .execute(&mut *tx)
        .await?;

        for walker in checkpoint.system.walkers() {
            let walker_id = i64::try_from(walker.id.0).unwrap_or(i64::MAX);
            sqlx::query(
                r"INSERT INTO awe_walker_snapshots (run_name, iteration, walker_id, data)
                  VALUES ($1, $2, $3, $4)",
            )
            .bind(&self.run_name)
            .bind(iteration)
            .bind(walker_id)
            .bind(walker.start.as_bytes())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r"DELETE FROM awe_checkpoints
              WHERE run_name = $1
                AND iteration NOT IN (
                    SELECT iteration FROM awe_checkpoints
                    WHERE run_name = $1
                    ORDER BY iteration DESC
                    LIMIT $2
                )",
        )
        .bind(&self.run_name)
        .bind(self.keep)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            run_name = %self.run_name,
            iteration = checkpoint.iteration,
            walkers = checkpoint.system.walker_count(),
            "Checkpoint saved"
        );
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        let Some(row) = sqlx::query(
            r"SELECT iteration, state FROM awe_checkpoints
              WHERE run_name = $1
              ORDER BY iteration DESC
              LIMIT 1",
        )
        .bind(&self.run_name)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let iteration: i64 = row.try_get("iteration")?;
        let state: serde_json::Value = row.try_get("state")?;
        let record: CheckpointRecord = serde_json::from_value(state)?;

        let rows = sqlx::query(
            r"SELECT walker_id, data FROM awe_walker_snapshots
              WHERE run_name = $1 AND iteration = $2",
        )
        .bind(&self.run_name)
        .bind(iteration)
        .fetch_all(&self.pool)
        .await?;

        let mut blobs: BTreeMap<WalkerId, Bytes> = BTreeMap::new();
        for row in rows {
            let walker_id: i64 = row.try_get("walker_id")?;
            let data: Vec<u8> = row.try_get("data")?;
            let walker_id = u64::try_from(walker_id)
                .map_err(|e| StoreError::Corrupt(format!("walker id {walker_id}: {e}")))?;
            blobs.insert(WalkerId(walker_id), Bytes::from(data));
        }

        let checkpoint = record::decode(record, |entry| {
            blobs.remove(&entry.id).ok_or_else(|| {
                StoreError::Corrupt(format!("missing snapshot for walker {}", entry.id))
            })
        })?;
        debug!(iteration = checkpoint.iteration, "Checkpoint loaded");
        Ok(Some(checkpoint))
    }
}

impl CheckpointStore for PostgresCheckpointStore {
    async fn save(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.save_checkpoint(checkpoint).await.map_err(Into::into)
    }

    async fn load(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        self.load_checkpoint().await.map_err(Into::into)
    }
}
