//! NATS-backed work queue.
//!
//! Worker heartbeats on `<namespace>.heartbeat` tell the queue which workers
//! exist and how many slots each has. Submitted tasks wait in a local backlog
//! and are published on `<namespace>.task.<worker>` only to a worker with a
//! free slot, so no task sits in a busy worker's inbox while another worker
//! idles. Workers announce each task on `<namespace>.started` when it begins,
//! and results come back on `<namespace>.result`; cancellations go out on
//! `<namespace>.cancel`. The staging manifest is served on
//! `<namespace>.manifest` for workers joining the run.
//!
//! Core NATS delivery is at-most-once. A task with no result within the task
//! timeout is reported as a failed replica and cancelled, so a lost message
//! turns into a retry instead of a hang. The timeout counts from the worker's
//! start announcement, or from publication if none arrived.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use awe_core::{QueueError, WorkQueue};
use awe_types::wire::{self, CancelRequest, Subjects, TaskStarted, WorkerHeartbeat};
use awe_types::{ResourceUsage, StagingManifest, TaskCompletion, TaskId, TaskOutcome, TaskSpec};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Workers silent for longer than this no longer count toward capacity.
const HEARTBEAT_TTL: Duration = Duration::from_secs(10);

/// Work queue over a NATS connection.
pub struct NatsQueue {
    client: async_nats::Client,
    subjects: Subjects,
    results: async_nats::Subscriber,
    started: async_nats::Subscriber,
    heartbeats: async_nats::Subscriber,
    tracker: Tracker,
    _manifest: ManifestServer,
}

impl NatsQueue {
    /// Connect, subscribe to results and heartbeats, and start serving the
    /// staging manifest.
    pub async fn connect(
        url: &str,
        subjects: Subjects,
        manifest: &StagingManifest,
        task_timeout: Duration,
    ) -> Result<Self, EngineError> {
        info!(url, namespace = subjects.namespace(), "Connecting to NATS server");
        let client = async_nats::connect(url).await.map_err(|e| EngineError::Nats {
            message: format!("failed to connect to {url}: {e}"),
        })?;

        // Subscribe before the first task goes out so no result is missed.
        let results = subscribe(&client, subjects.result()).await?;
        let started = subscribe(&client, subjects.started()).await?;
        let heartbeats = subscribe(&client, subjects.heartbeat()).await?;
        let manifest = ManifestServer::start(&client, subjects.manifest(), manifest).await?;
        client.flush().await.map_err(|e| EngineError::Nats {
            message: format!("flush failed: {e}"),
        })?;
        info!("NATS work queue ready");

        Ok(Self {
            client,
            subjects,
            results,
            started,
            heartbeats,
            tracker: Tracker::new(task_timeout, HEARTBEAT_TTL),
            _manifest: manifest,
        })
    }

    /// Publish backlog tasks while some worker has a free slot.
    async fn dispatch(&mut self) -> Result<(), QueueError> {
        while let Some((worker, spec)) = self.tracker.next_assignment(Instant::now()) {
            let task_id = spec.task_id;
            let frame = wire::encode_task(&spec).map_err(|e| QueueError::Submit {
                task_id,
                message: e.to_string(),
            })?;
            self.client
                .publish(self.subjects.task_for(&worker), frame.into())
                .await
                .map_err(|e| QueueError::Submit {
                    task_id,
                    message: e.to_string(),
                })?;
            debug!(
                task_id = %task_id,
                walker_id = %spec.walker_id,
                worker = %worker,
                "Task published"
            );
            self.tracker.assigned(task_id, worker, Instant::now());
        }
        Ok(())
    }

    async fn publish_cancel(&self, task_id: TaskId) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(&CancelRequest { task_id })
            .map_err(|e| QueueError::Transport(format!("failed to encode cancel: {e}")))?;
        self.client
            .publish(self.subjects.cancel(), payload.into())
            .await
            .map_err(|e| QueueError::Transport(format!("failed to publish cancel: {e}")))
    }
}

impl std::fmt::Debug for NatsQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsQueue")
            .field("namespace", &self.subjects.namespace())
            .field("in_flight", &self.tracker.pending.len())
            .field("backlog", &self.tracker.backlog.len())
            .field("workers", &self.tracker.workers.len())
            .finish_non_exhaustive()
    }
}

impl WorkQueue for NatsQueue {
    async fn submit(&mut self, spec: TaskSpec) -> Result<(), QueueError> {
        self.tracker.enqueue(spec);
        self.dispatch().await
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Option<TaskCompletion>, QueueError> {
        let began = Instant::now();
        loop {
            self.dispatch().await?;
            if let Some(task_id) = self.tracker.expire_one(Instant::now()) {
                warn!(
                    task_id = %task_id,
                    timeout_secs = self.tracker.task_timeout.as_secs(),
                    "Task timed out, cancelling"
                );
                self.publish_cancel(task_id).await?;
                return Ok(Some(timed_out(task_id, self.tracker.task_timeout)));
            }

            let remaining = timeout.saturating_sub(began.elapsed());
            if remaining.is_zero() {
                return Ok(None);
            }
            let nap = self
                .tracker
                .until_next_expiry(Instant::now())
                .map_or(remaining, |d| d.min(remaining));

            tokio::select! {
                message = self.results.next() => {
                    let Some(message) = message else {
                        return Err(QueueError::Closed);
                    };
                    match wire::decode_result(&message.payload) {
                        Ok(completion) => {
                            if self.tracker.finished(completion.task_id) {
                                return Ok(Some(completion));
                            }
                            debug!(
                                task_id = %completion.task_id,
                                "Ignoring result for a task no longer outstanding"
                            );
                        }
                        Err(e) => warn!(error = %e, "Malformed result, skipping"),
                    }
                }
                message = self.started.next() => {
                    let Some(message) = message else {
                        return Err(QueueError::Closed);
                    };
                    match serde_json::from_slice::<TaskStarted>(&message.payload) {
                        Ok(start) => {
                            if self.tracker.started(start.task_id, Instant::now()) {
                                debug!(task_id = %start.task_id, worker = %start.worker, "Task started");
                            }
                        }
                        Err(e) => warn!(error = %e, "Malformed start announcement, skipping"),
                    }
                }
                message = self.heartbeats.next() => {
                    let Some(message) = message else {
                        return Err(QueueError::Closed);
                    };
                    match serde_json::from_slice::<WorkerHeartbeat>(&message.payload) {
                        Ok(beat) => self.tracker.heartbeat(&beat, Instant::now()),
                        Err(e) => warn!(error = %e, "Malformed heartbeat, skipping"),
                    }
                }
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn cancel(&mut self, task_id: TaskId) -> Result<(), QueueError> {
        if self.tracker.withdraw(task_id) {
            debug!(task_id = %task_id, "Dropping unpublished task");
        } else if self.tracker.finished(task_id) {
            debug!(task_id = %task_id, "Cancelling task");
            self.publish_cancel(task_id).await?;
        }
        Ok(())
    }

    fn idle_workers(&self) -> usize {
        self.tracker.idle(Instant::now())
    }

    fn started_at(&self, task_id: TaskId) -> Option<Instant> {
        self.tracker.started_at(task_id)
    }
}

async fn subscribe(
    client: &async_nats::Client,
    subject: String,
) -> Result<async_nats::Subscriber, EngineError> {
    client
        .subscribe(subject.clone())
        .await
        .map_err(|e| EngineError::Nats {
            message: format!("failed to subscribe to {subject}: {e}"),
        })
}

/// The failed completion reported for a task that never answered.
fn timed_out(task_id: TaskId, timeout: Duration) -> TaskCompletion {
    TaskCompletion {
        task_id,
        outcome: TaskOutcome::failed(format!("no result within {}s", timeout.as_secs())),
        usage: ResourceUsage {
            worker: None,
            wall_time_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            exit_code: None,
        },
    }
}

/// Answers manifest requests until dropped.
struct ManifestServer(JoinHandle<()>);

impl ManifestServer {
    async fn start(
        client: &async_nats::Client,
        subject: String,
        manifest: &StagingManifest,
    ) -> Result<Self, EngineError> {
        let payload: bytes::Bytes = serde_json::to_vec(manifest)
            .map_err(|e| EngineError::Setup {
                message: format!("failed to encode staging manifest: {e}"),
            })?
            .into();
        let mut requests = subscribe(client, subject.clone()).await?;
        let client = client.clone();
        let handle = tokio::spawn(async move {
            while let Some(request) = requests.next().await {
                let Some(reply) = request.reply else {
                    continue;
                };
                debug!(reply = %reply, "Serving staging manifest");
                if let Err(e) = client.publish(reply, payload.clone()).await {
                    warn!(error = %e, "Failed to answer manifest request");
                }
            }
        });
        info!(subject = %subject, "Serving staging manifest");
        Ok(Self(handle))
    }
}

impl Drop for ManifestServer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A worker's last reported capacity.
#[derive(Debug, Clone, Copy)]
struct Seen {
    slots: u32,
    at: Instant,
}

/// A published task awaiting its result.
#[derive(Debug, Clone)]
struct Pending {
    worker: String,
    published: Instant,
    started: Option<Instant>,
}

impl Pending {
    /// The instant the task timeout counts from.
    fn clock(&self) -> Instant {
        self.started.unwrap_or(self.published)
    }
}

/// Unpublished tasks, outstanding tasks, and known worker capacity.
#[derive(Debug)]
struct Tracker {
    backlog: VecDeque<TaskSpec>,
    pending: BTreeMap<TaskId, Pending>,
    workers: BTreeMap<String, Seen>,
    task_timeout: Duration,
    heartbeat_ttl: Duration,
}

impl Tracker {
    const fn new(task_timeout: Duration, heartbeat_ttl: Duration) -> Self {
        Self {
            backlog: VecDeque::new(),
            pending: BTreeMap::new(),
            workers: BTreeMap::new(),
            task_timeout,
            heartbeat_ttl,
        }
    }

    fn enqueue(&mut self, spec: TaskSpec) {
        self.backlog.push_back(spec);
    }

    /// Remove an unpublished task; true if it was in the backlog.
    fn withdraw(&mut self, task_id: TaskId) -> bool {
        let before = self.backlog.len();
        self.backlog.retain(|spec| spec.task_id != task_id);
        self.backlog.len() != before
    }

    /// Pop the next backlog task and the live worker with the most free
    /// slots, if there is one.
    fn next_assignment(&mut self, now: Instant) -> Option<(String, TaskSpec)> {
        if self.backlog.is_empty() {
            return None;
        }
        let (worker, _) = self
            .free_slots(now)
            .into_iter()
            .filter(|(_, free)| *free > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))?;
        let spec = self.backlog.pop_front()?;
        Some((worker, spec))
    }

    fn assigned(&mut self, task_id: TaskId, worker: String, now: Instant) {
        self.pending.insert(
            task_id,
            Pending {
                worker,
                published: now,
                started: None,
            },
        );
    }

    /// Record a start announcement; true if the task is outstanding.
    fn started(&mut self, task_id: TaskId, now: Instant) -> bool {
        self.pending.get_mut(&task_id).is_some_and(|pending| {
            pending.started.get_or_insert(now);
            true
        })
    }

    fn started_at(&self, task_id: TaskId) -> Option<Instant> {
        self.pending.get(&task_id).and_then(|pending| pending.started)
    }

    /// Stop tracking `task_id`; true if it was outstanding.
    fn finished(&mut self, task_id: TaskId) -> bool {
        self.pending.remove(&task_id).is_some()
    }

    /// Remove and return one task older than the timeout.
    fn expire_one(&mut self, now: Instant) -> Option<TaskId> {
        let expired = self
            .pending
            .iter()
            .find(|(_, pending)| now.saturating_duration_since(pending.clock()) >= self.task_timeout)
            .map(|(id, _)| *id)?;
        self.pending.remove(&expired);
        Some(expired)
    }

    /// Time until the next outstanding task times out.
    fn until_next_expiry(&self, now: Instant) -> Option<Duration> {
        self.pending
            .values()
            .map(|pending| {
                self.task_timeout
                    .saturating_sub(now.saturating_duration_since(pending.clock()))
            })
            .min()
    }

    fn heartbeat(&mut self, beat: &WorkerHeartbeat, now: Instant) {
        let known = self.workers.contains_key(&beat.worker);
        self.workers.insert(
            beat.worker.clone(),
            Seen {
                slots: beat.slots,
                at: now,
            },
        );
        if known {
            debug!(worker = %beat.worker, slots = beat.slots, idle = beat.idle(), "Worker heartbeat");
        } else {
            info!(worker = %beat.worker, slots = beat.slots, "Worker joined");
        }
    }

    /// Free slots of each worker heard from recently.
    fn free_slots(&self, now: Instant) -> Vec<(String, usize)> {
        self.workers
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(seen.at) <= self.heartbeat_ttl)
            .map(|(name, seen)| {
                let slots = usize::try_from(seen.slots).unwrap_or(usize::MAX);
                let busy = self
                    .pending
                    .values()
                    .filter(|pending| pending.worker == *name)
                    .count();
                (name.clone(), slots.saturating_sub(busy))
            })
            .collect()
    }

    /// Free slots not already claimed by the backlog.
    fn idle(&self, now: Instant) -> usize {
        self.free_slots(now)
            .into_iter()
            .map(|(_, free)| free)
            .fold(0_usize, usize::saturating_add)
            .saturating_sub(self.backlog.len())
    }
}
