//! Wire format between the engine and remote workers.
//!
//! Every message is one compact JSON header line, a `\n`, then an optional
//! raw body. Task and result bodies carry snapshot bytes unencoded so large
//! structures do not pay for base64 or JSON arrays.
//!
//! # Subject Convention
//!
//! All subjects live under a namespace derived from the project name
//! (`awe.<name>`, or `awe.default` in standalone mode):
//!
//! - **Task publish:** `<ns>.task.<worker>`, addressed to one worker with a
//!   free slot
//! - **Task started:** `<ns>.started`
//! - **Result publish:** `<ns>.result`
//! - **Cancel broadcast:** `<ns>.cancel`
//! - **Heartbeat:** `<ns>.heartbeat`
//! - **Manifest request/reply:** `<ns>.manifest`

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::entities::Snapshot;
use crate::ids::{CellId, TaskId, WalkerId};
use crate::task::{ResourceUsage, TaskCompletion, TaskOutcome, TaskOutput, TaskSpec};

/// Errors while framing or parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame has no header terminator.
    #[error("frame is missing its header line")]
    MissingHeader,

    /// The header is not valid JSON for the expected type.
    #[error("invalid frame header: {0}")]
    Header(#[from] serde_json::Error),
}

/// Subject names for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subjects {
    namespace: String,
}

impl Subjects {
    /// Build subjects for a project name; `None` means standalone mode.
    pub fn for_project(name: Option<&str>) -> Self {
        let project = name.filter(|n| !n.is_empty()).unwrap_or("default");
        Self {
            namespace: format!("awe.{project}"),
        }
    }

    /// Build subjects for an explicit namespace.
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Subject tasks for `worker` are published on.
    ///
    /// Characters that would split or wildcard the subject are replaced, so
    /// any worker name maps to a single token.
    pub fn task_for(&self, worker: &str) -> String {
        let token: String = worker
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}.task.{token}", self.namespace)
    }

    /// Subject workers announce task starts on.
    pub fn started(&self) -> String {
        format!("{}.started", self.namespace)
    }

    /// Subject results are published on.
    pub fn result(&self) -> String {
        format!("{}.result", self.namespace)
    }

    /// Subject cancellations are broadcast on.
    pub fn cancel(&self) -> String {
        format!("{}.cancel", self.namespace)
    }

    /// Subject worker heartbeats are published on.
    pub fn heartbeat(&self) -> String {
        format!("{}.heartbeat", self.namespace)
    }

    /// Subject the staging manifest is served on.
    pub fn manifest(&self) -> String {
        format!("{}.manifest", self.namespace)
    }
}

/// Header of a task message. The body is the start snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHeader {
    /// Replica identifier.
    pub task_id: TaskId,
    /// Walker being advanced.
    pub walker_id: WalkerId,
    /// Iteration number.
    pub iteration: u64,
}

/// Status carried in a result header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultStatus {
    /// The body is the end snapshot; the walker landed in `cell_id`.
    Ok {
        /// Assigned cell.
        cell_id: CellId,
    },
    /// The task failed; the body is empty.
    Failed {
        /// Why it failed.
        reason: String,
    },
}

/// Header of a result message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultHeader {
    /// Replica identifier.
    pub task_id: TaskId,
    /// Outcome.
    #[serde(flatten)]
    pub status: ResultStatus,
    /// Resource usage of the replica.
    #[serde(default)]
    pub usage: ResourceUsage,
}

/// Sent by a worker when a task takes a slot and begins executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStarted {
    /// Replica that started.
    pub task_id: TaskId,
    /// Worker running it.
    pub worker: String,
}

/// Request to abandon a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    /// Replica to cancel.
    pub task_id: TaskId,
}

/// Periodic liveness and capacity report from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    /// Worker name.
    pub worker: String,
    /// Concurrent task slots.
    pub slots: u32,
    /// Slots currently running a task.
    pub busy: u32,
    /// When the heartbeat was sent.
    pub sent_at: DateTime<Utc>,
}

impl WorkerHeartbeat {
    /// Slots not running anything.
    pub const fn idle(&self) -> u32 {
        self.slots.saturating_sub(self.busy)
    }
}

/// Frame a header and body.
pub fn encode_frame<H: Serialize>(header: &H, body: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut frame = serde_json::to_vec(header)?;
    frame.reserve(body.len().saturating_add(1));
    frame.push(b'\n');
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Split a frame into its parsed header and body.
pub fn decode_frame<H: DeserializeOwned>(frame: &Bytes) -> Result<(H, Bytes), WireError> {
    let newline = frame
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(WireError::MissingHeader)?;
    let header = serde_json::from_slice(frame.get(..newline).unwrap_or_default())?;
    let body = frame.slice(newline.saturating_add(1)..);
    Ok((header, body))
}

/// Encode a task for publication.
pub fn encode_task(spec: &TaskSpec) -> Result<Vec<u8>, WireError> {
    let header = TaskHeader {
        task_id: spec.task_id,
        walker_id: spec.walker_id,
        iteration: spec.iteration,
    };
    encode_frame(&header, spec.snapshot.as_bytes())
}

/// Decode a received task.
pub fn decode_task(frame: &Bytes) -> Result<TaskSpec, WireError> {
    let (header, body): (TaskHeader, Bytes) = decode_frame(frame)?;
    Ok(TaskSpec {
        task_id: header.task_id,
        walker_id: header.walker_id,
        iteration: header.iteration,
        snapshot: Snapshot::from(body),
    })
}

/// Encode a completion for publication.
pub fn encode_result(completion: &TaskCompletion) -> Result<Vec<u8>, WireError> {
    let (status, body) = match &completion.outcome {
        TaskOutcome::Succeeded(output) => (
            ResultStatus::Ok {
                cell_id: output.cell_id,
            },
            output.snapshot.as_bytes(),
        ),
        TaskOutcome::Failed { reason } => (
            ResultStatus::Failed {
                reason: reason.clone(),
            },
            &[][..],
        ),
    };
    let header = ResultHeader {
        task_id: completion.task_id,
        status,
        usage: completion.usage.clone(),
    };
    encode_frame(&header, body)
}

/// Decode a received completion.
pub fn decode_result(frame: &Bytes) -> Result<TaskCompletion, WireError> {
    let (header, body): (ResultHeader, Bytes) = decode_frame(frame)?;
    let outcome = match header.status {
        ResultStatus::Ok { cell_id } => TaskOutcome::Succeeded(TaskOutput {
            snapshot: Snapshot::from(body),
            cell_id,
        }),
        ResultStatus::Failed { reason } => TaskOutcome::Failed { reason },
    };
    Ok(TaskCompletion {
        task_id: header.task_id,
        outcome,
        usage: header.usage,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn subjects_default_to_standalone_namespace() {
        let subjects = Subjects::for_project(None);
        assert_eq!(subjects.task_for("node-1"), "awe.default.task.node-1");
        assert_eq!(subjects.started(), "awe.default.started");
        assert_eq!(Subjects::for_project(Some("")).namespace(), "awe.default");
        assert_eq!(Subjects::for_project(Some("ala")).result(), "awe.ala.result");
    }

    #[test]
    fn worker_names_become_one_subject_token() {
        let subjects = Subjects::with_namespace("awe.ala");
        assert_eq!(subjects.task_for("gpu.node 3>*"), "awe.ala.task.gpu_node_3__");
    }

    #[test]
    fn body_may_contain_newlines() {
        let spec = TaskSpec {
            task_id: TaskId(9),
            walker_id: WalkerId(3),
            iteration: 2,
            snapshot: Snapshot::from(b"ATOM 1\nATOM 2\n".to_vec()),
        };
        let frame = Bytes::from(encode_task(&spec).unwrap());
        assert_eq!(decode_task(&frame).unwrap(), spec);
    }

    #[test]
    fn failed_result_has_empty_body() {
        let completion = TaskCompletion {
            task_id: TaskId(1),
            outcome: TaskOutcome::failed("mdrun exited with status 1"),
            usage: ResourceUsage {
                worker: Some(String::from("node-3")),
                wall_time_ms: 1200,
                exit_code: Some(1),
            },
        };
        let frame = Bytes::from(encode_result(&completion).unwrap());
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("\"status\":\"failed\""));
        assert_eq!(decode_result(&frame).unwrap(), completion);
    }

    #[test]
    fn frame_without_header_is_rejected() {
        let frame = Bytes::from_static(b"no newline here");
        let result: Result<(CancelRequest, Bytes), _> = decode_frame(&frame);
        assert!(matches!(result, Err(WireError::MissingHeader)));
    }

    #[test]
    fn heartbeat_idle_never_underflows() {
        let beat = WorkerHeartbeat {
            worker: String::from("w"),
            slots: 2,
            busy: 5,
            sent_at: Utc::now(),
        };
        assert_eq!(beat.idle(), 0);
    }
}
