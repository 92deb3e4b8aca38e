//! Task request/outcome types for executor-queue communication.
//!
//! One [`TaskSpec`] is produced per walker per iteration. A queue backend
//! reports each replica's terminal state as a [`TaskCompletion`].

use serde::{Deserialize, Serialize};

use crate::entities::Snapshot;
use crate::ids::{CellId, TaskId, WalkerId};

/// One opaque unit of simulation + assignment work.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    /// Replica identifier, unique for the run.
    pub task_id: TaskId,
    /// Walker this task advances.
    pub walker_id: WalkerId,
    /// Iteration the task belongs to.
    pub iteration: u64,
    /// Snapshot the simulation starts from.
    pub snapshot: Snapshot,
}

/// Result of a successful task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    /// Snapshot at the end of the simulation segment.
    pub snapshot: Snapshot,
    /// Cell the walker was assigned to afterwards.
    pub cell_id: CellId,
}

/// Terminal state of one task replica.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The task produced a new snapshot and assignment.
    Succeeded(TaskOutput),
    /// The task failed; the reason is free-form.
    Failed {
        /// Why the replica failed.
        reason: String,
    },
}

impl TaskOutcome {
    /// Shorthand for a failed outcome.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    /// Whether the outcome is a success.
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }
}

/// Resource consumption reported by whoever ran a replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Worker that executed the replica.
    pub worker: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub wall_time_ms: u64,
    /// Process exit code of the task script, when one ran.
    pub exit_code: Option<i32>,
}

/// A replica reaching a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    /// Which replica finished.
    pub task_id: TaskId,
    /// How it finished.
    pub outcome: TaskOutcome,
    /// What it consumed.
    pub usage: ResourceUsage,
}
