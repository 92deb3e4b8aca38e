//! The worker's NATS loop.
//!
//! The worker asks the engine for the staging manifest, then subscribes to
//! its own task subject. The engine addresses a task to a worker only when
//! that worker's heartbeat shows a free slot, and the worker only pulls the
//! next message while it has one, so tasks never queue up behind a busy
//! worker. Each task announces itself on the started subject when it begins,
//! runs in its own tokio task, and publishes its completion on the result
//! subject. Cancel requests abort the matching task (the script process is
//! killed with it).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use awe_types::wire::{self, CancelRequest, Subjects, TaskStarted, WorkerHeartbeat};
use awe_types::{ResourceUsage, StagingManifest, TaskCompletion, TaskId, TaskOutcome, TaskSpec};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::sandbox::ScriptRunner;

/// A connected worker.
pub struct Worker {
    client: async_nats::Client,
    subjects: Subjects,
    config: WorkerConfig,
}

impl Worker {
    /// Connect to the NATS server named in `config`.
    pub async fn connect(config: WorkerConfig) -> Result<Self, WorkerError> {
        info!(url = %config.nats_url, "Connecting to NATS server");
        let client = async_nats::connect(config.nats_url.as_str())
            .await
            .map_err(|e| WorkerError::Nats(format!("failed to connect to {}: {e}", config.nats_url)))?;
        info!("NATS connection established");
        Ok(Self {
            client,
            subjects: Subjects::with_namespace(config.namespace.clone()),
            config,
        })
    }

    /// Request the staging manifest, retrying until an engine answers.
    pub async fn fetch_manifest(&self) -> Result<StagingManifest, WorkerError> {
        let subject = self.subjects.manifest();
        loop {
            match self.client.request(subject.clone(), Bytes::new()).await {
                Ok(reply) => {
                    let manifest: StagingManifest = serde_json::from_slice(&reply.payload)?;
                    info!(
                        execute = %manifest.execute,
                        cached = manifest.cache.len(),
                        "Staging manifest received"
                    );
                    return Ok(manifest);
                }
                Err(e) => {
                    debug!(subject = %subject, error = %e, "No engine answered the manifest request yet");
                    tokio::time::sleep(self.config.manifest_retry).await;
                }
            }
        }
    }

    /// Serve tasks until the task subscription ends.
    pub async fn run(self, runner: ScriptRunner) -> Result<(), WorkerError> {
        let mut tasks = self
            .client
            .subscribe(self.subjects.task_for(&self.config.name))
            .await
            .map_err(|e| WorkerError::Nats(format!("failed to subscribe to tasks: {e}")))?;
        let mut cancels = self
            .client
            .subscribe(self.subjects.cancel())
            .await
            .map_err(|e| WorkerError::Nats(format!("failed to subscribe to cancels: {e}")))?;

        let runner = Arc::new(runner);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TaskId>();
        let mut running = Running::default();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);

        info!(
            worker = %self.config.name,
            slots = self.config.slots,
            namespace = self.subjects.namespace(),
            "Worker started, awaiting tasks"
        );

        loop {
            let has_slot = running.len() < self.config.slots;
            tokio::select! {
                message = tasks.next(), if has_slot => {
                    let Some(message) = message else { break };
                    let spec = match wire::decode_task(&message.payload) {
                        Ok(spec) => spec,
                        Err(e) => {
                            warn!(error = %e, "Malformed task, skipping");
                            continue;
                        }
                    };
                    let task_id = spec.task_id;
                    debug!(task_id = %task_id, walker_id = %spec.walker_id, "Task received");
                    let handle = tokio::spawn(run_task(
                        self.client.clone(),
                        self.subjects.clone(),
                        self.config.name.clone(),
                        Arc::clone(&runner),
                        spec,
                        done_tx.clone(),
                    ));
                    running.insert(task_id, handle.abort_handle());
                }
                message = cancels.next() => {
                    let Some(message) = message else { break };
                    match serde_json::from_slice::<CancelRequest>(&message.payload) {
                        Ok(request) => {
                            if running.cancel(request.task_id) {
                                info!(task_id = %request.task_id, "Task cancelled");
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed cancel request, skipping"),
                    }
                }
                Some(task_id) = done_rx.recv() => {
                    running.finish(task_id);
                }
                _ = heartbeat.tick() => {
                    self.publish_heartbeat(running.len()).await;
                }
            }
        }

        running.abort_all();
        info!("Task subscription ended, worker shutting down");
        Ok(())
    }

    async fn publish_heartbeat(&self, busy: usize) {
        let beat = WorkerHeartbeat {
            worker: self.config.name.clone(),
            slots: u32::try_from(self.config.slots).unwrap_or(u32::MAX),
            busy: u32::try_from(busy.min(self.config.slots)).unwrap_or(u32::MAX),
            sent_at: Utc::now(),
        };
        match serde_json::to_vec(&beat) {
            Ok(payload) => {
                if let Err(e) = self
                    .client
                    .publish(self.subjects.heartbeat(), payload.into())
                    .await
                {
                    warn!(error = %e, "Failed to publish heartbeat");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize heartbeat"),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("namespace", &self.subjects.namespace())
            .field("name", &self.config.name)
            .finish_non_exhaustive()
    }
}

/// Tasks accepted and not yet finished or cancelled.
#[derive(Debug, Default)]
struct Running {
    tasks: BTreeMap<TaskId, AbortHandle>,
}

impl Running {
    fn insert(&mut self, task_id: TaskId, handle: AbortHandle) {
        if let Some(previous) = self.tasks.insert(task_id, handle) {
            previous.abort();
        }
    }

    fn finish(&mut self, task_id: TaskId) {
        self.tasks.remove(&task_id);
    }

    fn cancel(&mut self, task_id: TaskId) -> bool {
        self.tasks.remove(&task_id).is_some_and(|handle| {
            handle.abort();
            true
        })
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    fn abort_all(&mut self) {
        for (_, handle) in std::mem::take(&mut self.tasks) {
            handle.abort();
        }
    }
}

/// Announce, run, and report one task.
async fn run_task(
    client: async_nats::Client,
    subjects: Subjects,
    worker: String,
    runner: Arc<ScriptRunner>,
    spec: TaskSpec,
    done: mpsc::UnboundedSender<TaskId>,
) {
    let task_id = spec.task_id;
    let started = TaskStarted {
        task_id,
        worker: worker.clone(),
    };
    match serde_json::to_vec(&started) {
        Ok(payload) => {
            if let Err(e) = client.publish(subjects.started(), payload.into()).await {
                warn!(task_id = %task_id, error = %e, "Failed to announce task start");
            }
        }
        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to encode task start"),
    }

    let completion = complete(&runner, &worker, &spec).await;
    match wire::encode_result(&completion) {
        Ok(frame) => {
            if let Err(e) = client.publish(subjects.result(), frame.into()).await {
                warn!(task_id = %task_id, error = %e, "Failed to publish result");
            }
        }
        Err(e) => warn!(task_id = %task_id, error = %e, "Failed to encode result"),
    }
    // The loop outlives every task it spawns.
    let _ = done.send(task_id);
}

/// Execute `spec` and describe how it ended.
pub async fn complete(runner: &ScriptRunner, worker: &str, spec: &TaskSpec) -> TaskCompletion {
    let started = Instant::now();
    let (outcome, exit_code) = match runner.execute(spec).await {
        Ok(execution) => (TaskOutcome::Succeeded(execution.output), execution.exit_code),
        Err(e) => {
            warn!(task_id = %spec.task_id, error = %e, "Task failed");
            let code = e.exit_code();
            (TaskOutcome::failed(e.to_string()), code)
        }
    };
    let wall_time = started.elapsed();
    debug!(
        task_id = %spec.task_id,
        success = outcome.is_success(),
        wall_time_ms = millis(wall_time),
        "Task finished"
    );
    TaskCompletion {
        task_id: spec.task_id,
        outcome,
        usage: ResourceUsage {
            worker: Some(worker.to_owned()),
            wall_time_ms: millis(wall_time),
            exit_code,
        },
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
