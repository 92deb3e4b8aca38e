//! Per-task resource usage records.
//!
//! When monitoring is enabled the executor records one line per replica
//! reaching a terminal state and appends them, as JSON lines, to a summary
//! file at the end of every iteration.

use std::path::{Path, PathBuf};

use awe_types::{TaskId, WalkerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt as _;

/// Terminal status of a recorded replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// First successful replica of its walker.
    Succeeded,
    /// The replica failed.
    Failed,
    /// The replica succeeded after another replica already had.
    Duplicate,
    /// The replica was cancelled by fast abort.
    FastAborted,
}

/// One monitor line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    /// Iteration the replica belonged to.
    pub iteration: u64,
    /// Walker it advanced.
    pub walker: WalkerId,
    /// Replica id.
    pub task_id: TaskId,
    /// Worker that ran it, when known.
    pub worker: Option<String>,
    /// How it ended.
    pub status: TaskStatus,
    /// Wall-clock time in milliseconds.
    pub wall_time_ms: u64,
    /// Failures the walker had accumulated when this replica ended.
    pub failures: u32,
    /// When the record was taken.
    pub recorded_at: DateTime<Utc>,
}

/// Buffers task records and appends them to the summary file.
#[derive(Debug)]
pub struct ResourceMonitor {
    path: PathBuf,
    pending: Vec<TaskRecord>,
}

impl ResourceMonitor {
    /// Create a monitor writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: Vec::new(),
        }
    }

    /// Default summary file name for this process.
    pub fn default_path() -> PathBuf {
        PathBuf::from(format!("awe-{}-resource-usage", std::process::id()))
    }

    /// The summary file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer a record.
    pub fn record(&mut self, record: TaskRecord) {
        self.pending.push(record);
    }

    /// Records not yet written.
    pub fn pending(&self) -> &[TaskRecord] {
        &self.pending
    }

    /// Append buffered records to the summary file.
    pub async fn flush(&mut self) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let mut buffer = Vec::new();
        for record in &self.pending {
            serde_json::to_writer(&mut buffer, record).map_err(std::io::Error::other)?;
            buffer.push(b'\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        let written = self.pending.len();
        self.pending.clear();
        Ok(written)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flush_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = ResourceMonitor::new(dir.path().join("usage"));
        for status in [TaskStatus::Succeeded, TaskStatus::Duplicate] {
            monitor.record(TaskRecord {
                iteration: 0,
                walker: WalkerId(1),
                task_id: TaskId(2),
                worker: Some(String::from("local")),
                status,
                wall_time_ms: 10,
                failures: 0,
                recorded_at: Utc::now(),
            });
        }
        assert_eq!(monitor.flush().await.unwrap(), 2);
        assert_eq!(monitor.flush().await.unwrap(), 0);

        let text = std::fs::read_to_string(monitor.path()).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("\"status\":\"duplicate\""));
    }
}
