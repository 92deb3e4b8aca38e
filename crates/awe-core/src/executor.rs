//! Fault-tolerant fan-out of one iteration's simulation tasks.
//!
//! The [`TaskExecutor`] submits one task per walker to a [`WorkQueue`] and
//! collects exactly one result per walker. Along the way it:
//!
//! - resubmits failed replicas until the walker exceeds its restart limit,
//! - replicates outstanding walkers onto idle workers (fewest replicas
//!   first, up to `max_replicas`),
//! - keeps the first successful replica and cancels the rest, counting any
//!   late successes as duplicates,
//! - cancels and resubmits replicas that have been running far longer than
//!   the observed mean execution time (fast abort). Age counts from the
//!   moment the queue reports the replica started, so time spent waiting
//!   for a free worker never triggers an abort,
//! - optionally records per-replica resource usage.
//!
//! The queue is abstract so the same logic drives the in-process
//! [`LocalQueue`](crate::local::LocalQueue) and the NATS-backed worker pool.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use awe_types::{
    Snapshot, TaskCompletion, TaskId, TaskOutcome, TaskOutput, TaskSpec, Walker, WalkerId,
};
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::monitor::{ResourceMonitor, TaskRecord, TaskStatus};

/// Minimum number of successful tasks before fast abort is considered.
pub const FAST_ABORT_MIN_SAMPLES: u64 = 3;

/// Default replica ceiling per walker.
pub const DEFAULT_MAX_REPLICAS: u32 = 50;

/// Errors raised by a queue backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The task could not be handed to the backend.
    #[error("failed to submit task {task_id}: {message}")]
    Submit {
        /// The task that was rejected.
        task_id: TaskId,
        /// Backend-specific detail.
        message: String,
    },

    /// The transport to the workers failed.
    #[error("queue transport error: {0}")]
    Transport(String),

    /// The backend shut down while tasks were outstanding.
    #[error("queue closed")]
    Closed,
}

/// A task-dispatch backend.
///
/// `submit` must not block on task execution. `wait` returns the next
/// terminal replica, or `None` if none arrived within `timeout`.
/// `started_at` reports when a replica began executing on a worker; it is
/// `None` while the replica is still queued.
pub trait WorkQueue: Send {
    /// Enqueue one replica.
    fn submit(&mut self, spec: TaskSpec) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Wait up to `timeout` for the next terminal replica.
    fn wait(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<TaskCompletion>, QueueError>> + Send;

    /// Best-effort cancellation. Unknown or finished ids are ignored.
    fn cancel(&mut self, task_id: TaskId) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Worker slots currently free to take a replica.
    fn idle_workers(&self) -> usize;

    /// When `task_id` started running, if it has.
    fn started_at(&self, task_id: TaskId) -> Option<Instant>;
}

/// Executor tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Failures tolerated per walker before it is abandoned; `None` retries
    /// forever.
    pub restarts: Option<u32>,
    /// Maximum concurrent replicas per walker. `1` disables replication.
    pub max_replicas: u32,
    /// Fast-abort multiplier; values `<= 0` disable fast abort.
    pub fast_abort_multiplier: f64,
    /// How long a single `wait` may block before housekeeping runs.
    pub poll_interval: Duration,
    /// Where to append resource usage records, if monitoring is on.
    pub monitor: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            restarts: None,
            max_replicas: DEFAULT_MAX_REPLICAS,
            fast_abort_multiplier: -1.0,
            poll_interval: Duration::from_millis(250),
            monitor: None,
        }
    }
}

impl ExecutorConfig {
    /// Whether a walker with `failures` failures may be retried.
    pub const fn may_retry(&self, failures: u32) -> bool {
        match self.restarts {
            None => true,
            Some(limit) => failures <= limit,
        }
    }

    fn fast_abort_enabled(&self) -> bool {
        self.fast_abort_multiplier.is_finite() && self.fast_abort_multiplier > 0.0
    }
}

/// A walker abandoned after exhausting its restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkerFailure {
    /// Failed replicas, including fast-aborted ones.
    pub attempts: u32,
    /// Reason reported by the last failed replica.
    pub reason: String,
}

/// Outcome of one [`TaskExecutor::execute`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionReport {
    /// One output per successfully advanced walker.
    pub results: BTreeMap<WalkerId, TaskOutput>,
    /// Walkers that failed permanently.
    pub failures: BTreeMap<WalkerId, WalkerFailure>,
    /// Replicas submitted in total, including the first per walker.
    pub submitted: u64,
    /// Replica failures that were retried or absorbed by another replica.
    pub transient_failures: u64,
    /// Successful replicas discarded because another replica won.
    pub duplicates: u64,
    /// Replicas cancelled for running too long.
    pub fast_aborts: u64,
}

impl ExecutionReport {
    /// Whether every walker produced a result.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Errors that end an `execute` call.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The queue backend failed.
    #[error("work queue error: {0}")]
    Queue(#[from] QueueError),

    /// Two walkers in the population share an id.
    #[error("walker {0} appears more than once")]
    DuplicateWalker(WalkerId),
}

/// Running mean of successful execution times.
#[derive(Debug, Clone, Copy, Default)]
struct RuntimeStats {
    count: u64,
    total: Duration,
}

impl RuntimeStats {
    fn record(&mut self, elapsed: Duration) {
        self.count = self.count.saturating_add(1);
        self.total = self.total.saturating_add(elapsed);
    }

    fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let count = u32::try_from(self.count).unwrap_or(u32::MAX);
        self.total.checked_div(count)
    }
}

#[derive(Debug)]
struct WalkerState {
    snapshot: Snapshot,
    failures: u32,
    last_reason: String,
    replicas: BTreeMap<TaskId, Instant>,
    done: bool,
}

/// Book-keeping for the walkers of one `execute` call.
#[derive(Debug, Default)]
struct Round {
    iteration: u64,
    walkers: BTreeMap<WalkerId, WalkerState>,
    owners: BTreeMap<TaskId, WalkerId>,
    outstanding: usize,
    report: ExecutionReport,
}

/// Submits tasks and assembles exactly one result per walker.
#[derive(Debug)]
pub struct TaskExecutor<Q> {
    queue: Q,
    config: ExecutorConfig,
    next_task: u64,
    stats: RuntimeStats,
    monitor: Option<ResourceMonitor>,
}

impl<Q: WorkQueue> TaskExecutor<Q> {
    /// Create an executor over `queue`.
    pub fn new(queue: Q, config: ExecutorConfig) -> Self {
        let monitor = config.monitor.clone().map(ResourceMonitor::new);
        Self {
            queue,
            config,
            next_task: 0,
            stats: RuntimeStats::default(),
            monitor,
        }
    }

    /// The executor's configuration.
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Borrow the underlying queue.
    pub const fn queue(&self) -> &Q {
        &self.queue
    }

    /// Mean execution time of successful replicas so far.
    pub fn mean_runtime(&self) -> Option<Duration> {
        self.stats.mean()
    }

    /// Advance every walker by one task and collect the results.
    ///
    /// Returns once every walker either has a result or has failed
    /// permanently. Replicas still running at that point are cancelled.
    pub async fn execute(
        &mut self,
        iteration: u64,
        walkers: &[Walker],
    ) -> Result<ExecutionReport, ExecutorError> {
        let mut round = Round {
            iteration,
            ..Round::default()
        };
        for walker in walkers {
            let state = WalkerState {
                snapshot: walker.start.clone(),
                failures: 0,
                last_reason: String::new(),
                replicas: BTreeMap::new(),
                done: false,
            };
            if round.walkers.insert(walker.id, state).is_some() {
                return Err(ExecutorError::DuplicateWalker(walker.id));
            }
        }
        round.outstanding = round.walkers.len();

        info!(
            iteration,
            walkers = round.outstanding,
            "Submitting iteration tasks"
        );
        let ids: Vec<WalkerId> = round.walkers.keys().copied().collect();
        for walker_id in ids {
            self.submit_replica(&mut round, walker_id).await?;
        }

        while round.outstanding > 0 {
            self.replicate(&mut round).await?;
            if let Some(completion) = self.queue.wait(self.config.poll_interval).await? {
                self.handle_completion(&mut round, completion).await?;
            }
            self.fast_abort(&mut round).await?;
        }

        self.cancel_stragglers(&mut round).await?;
        self.flush_monitor().await;

        let report = round.report;
        info!(
            iteration,
            succeeded = report.results.len(),
            failed = report.failures.len(),
            submitted = report.submitted,
            duplicates = report.duplicates,
            fast_aborts = report.fast_aborts,
            "Iteration tasks finished"
        );
        Ok(report)
    }

    async fn submit_replica(
        &mut self,
        round: &mut Round,
        walker_id: WalkerId,
    ) -> Result<(), ExecutorError> {
        let Some(state) = round.walkers.get_mut(&walker_id) else {
            return Ok(());
        };
        let task_id = TaskId(self.next_task);
        self.next_task = self.next_task.saturating_add(1);

        let spec = TaskSpec {
            task_id,
            walker_id,
            iteration: round.iteration,
            snapshot: state.snapshot.clone(),
        };
        self.queue.submit(spec).await?;
        state.replicas.insert(task_id, Instant::now());
        round.owners.insert(task_id, walker_id);
        round.report.submitted = round.report.submitted.saturating_add(1);
        debug!(
            task_id = %task_id,
            walker_id = %walker_id,
            replicas = state.replicas.len(),
            "Submitted replica"
        );
        Ok(())
    }

    async fn handle_completion(
        &mut self,
        round: &mut Round,
        completion: TaskCompletion,
    ) -> Result<(), ExecutorError> {
        let TaskCompletion {
            task_id,
            outcome,
            usage,
        } = completion;
        let Some(walker_id) = round.owners.remove(&task_id) else {
            debug!(task_id = %task_id, "Ignoring result for unknown or aborted replica");
            return Ok(());
        };
        let Some(state) = round.walkers.get_mut(&walker_id) else {
            return Ok(());
        };
        let started = state.replicas.remove(&task_id);
        let elapsed = if usage.wall_time_ms > 0 {
            Duration::from_millis(usage.wall_time_ms)
        } else {
            started.map_or(Duration::ZERO, |at| at.elapsed())
        };

        let status = match outcome {
            TaskOutcome::Succeeded(_) if state.done => {
                round.report.duplicates = round.report.duplicates.saturating_add(1);
                debug!(task_id = %task_id, walker_id = %walker_id, "Discarding duplicate result");
                TaskStatus::Duplicate
            }
            TaskOutcome::Succeeded(output) => {
                self.stats.record(elapsed);
                state.done = true;
                round.outstanding = round.outstanding.saturating_sub(1);
                round.report.results.insert(walker_id, output);
                TaskStatus::Succeeded
            }
            TaskOutcome::Failed { reason } => {
                if !state.done {
                    self.record_failure(round, walker_id, reason).await?;
                }
                TaskStatus::Failed
            }
        };

        let failures = round.walkers.get(&walker_id).map_or(0, |s| s.failures);
        self.record_usage(TaskRecord {
            iteration: round.iteration,
            walker: walker_id,
            task_id,
            worker: usage.worker,
            status,
            wall_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            failures,
            recorded_at: Utc::now(),
        });

        if status == TaskStatus::Succeeded {
            self.cancel_siblings(round, walker_id).await?;
        }
        Ok(())
    }

    /// Count a failed replica and decide whether to retry the walker.
    async fn record_failure(
        &mut self,
        round: &mut Round,
        walker_id: WalkerId,
        reason: String,
    ) -> Result<(), ExecutorError> {
        let Some(state) = round.walkers.get_mut(&walker_id) else {
            return Ok(());
        };
        state.failures = state.failures.saturating_add(1);
        state.last_reason = reason;
        warn!(
            walker_id = %walker_id,
            failures = state.failures,
            reason = %state.last_reason,
            "Task replica failed"
        );

        if !state.replicas.is_empty() {
            // Another replica may still succeed.
            round.report.transient_failures = round.report.transient_failures.saturating_add(1);
            return Ok(());
        }
        if self.config.may_retry(state.failures) {
            round.report.transient_failures = round.report.transient_failures.saturating_add(1);
            return self.submit_replica(round, walker_id).await;
        }

        state.done = true;
        round.outstanding = round.outstanding.saturating_sub(1);
        warn!(
            walker_id = %walker_id,
            attempts = state.failures,
            "Walker failed permanently"
        );
        round.report.failures.insert(
            walker_id,
            WalkerFailure {
                attempts: state.failures,
                reason: state.last_reason.clone(),
            },
        );
        Ok(())
    }

    /// Put idle workers to use on the walkers with the fewest replicas.
    async fn replicate(&mut self, round: &mut Round) -> Result<(), ExecutorError> {
        if self.config.max_replicas <= 1 {
            return Ok(());
        }
        let idle = self.queue.idle_workers();
        if idle == 0 {
            return Ok(());
        }
        let limit = usize::try_from(self.config.max_replicas).unwrap_or(usize::MAX);
        let mut candidates: Vec<(usize, WalkerId)> = round
            .walkers
            .iter()
            .filter(|(_, state)| !state.done && state.replicas.len() < limit)
            .map(|(id, state)| (state.replicas.len(), *id))
            .collect();
        candidates.sort_unstable();

        for (_, walker_id) in candidates.into_iter().take(idle) {
            self.submit_replica(round, walker_id).await?;
        }
        Ok(())
    }

    /// Cancel replicas that have run longer than `multiplier` times the mean.
    async fn fast_abort(&mut self, round: &mut Round) -> Result<(), ExecutorError> {
        if !self.config.fast_abort_enabled() || self.stats.count < FAST_ABORT_MIN_SAMPLES {
            return Ok(());
        }
        let Some(mean) = self.stats.mean() else {
            return Ok(());
        };
        let threshold = mean.mul_f64(self.config.fast_abort_multiplier);

        let queue = &self.queue;
        let now = Instant::now();
        let overdue: Vec<(WalkerId, TaskId, Duration)> = round
            .walkers
            .iter()
            .filter(|(_, state)| !state.done)
            .flat_map(|(walker_id, state)| {
                state.replicas.keys().filter_map(move |task_id| {
                    // Queued replicas have no age yet.
                    let age = now.saturating_duration_since(queue.started_at(*task_id)?);
                    (age > threshold).then_some((*walker_id, *task_id, age))
                })
            })
            .collect();

        for (walker_id, task_id, age) in overdue {
            self.queue.cancel(task_id).await?;
            round.owners.remove(&task_id);
            if let Some(state) = round.walkers.get_mut(&walker_id) {
                state.replicas.remove(&task_id);
            }
            round.report.fast_aborts = round.report.fast_aborts.saturating_add(1);
            info!(
                task_id = %task_id,
                walker_id = %walker_id,
                age_ms = u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX),
                "Fast-aborting slow replica"
            );

            let failures = round.walkers.get(&walker_id).map_or(0, |s| s.failures);
            self.record_usage(TaskRecord {
                iteration: round.iteration,
                walker: walker_id,
                task_id,
                worker: None,
                status: TaskStatus::FastAborted,
                wall_time_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                failures,
                recorded_at: Utc::now(),
            });
            self.record_failure(
                round,
                walker_id,
                format!("fast abort after {}ms", age.as_millis()),
            )
            .await?;
        }
        Ok(())
    }

    /// Cancel the other replicas of a walker that just succeeded.
    ///
    /// Their ids stay owned so a late success is counted as a duplicate.
    async fn cancel_siblings(
        &mut self,
        round: &mut Round,
        walker_id: WalkerId,
    ) -> Result<(), ExecutorError> {
        let siblings: Vec<TaskId> = round
            .walkers
            .get(&walker_id)
            .map(|state| state.replicas.keys().copied().collect())
            .unwrap_or_default();
        for task_id in siblings {
            debug!(task_id = %task_id, walker_id = %walker_id, "Cancelling redundant replica");
            self.queue.cancel(task_id).await?;
        }
        Ok(())
    }

    async fn cancel_stragglers(&mut self, round: &mut Round) -> Result<(), ExecutorError> {
        let remaining: Vec<TaskId> = round.owners.keys().copied().collect();
        for task_id in remaining {
            self.queue.cancel(task_id).await?;
        }
        round.owners.clear();
        Ok(())
    }

    fn record_usage(&mut self, record: TaskRecord) {
        if let Some(monitor) = self.monitor.as_mut() {
            monitor.record(record);
        }
    }

    async fn flush_monitor(&mut self) {
        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };
        if let Err(e) = monitor.flush().await {
            warn!(
                path = %monitor.path().display(),
                error = %e,
                "Failed to write resource usage records"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::collections::VecDeque;

    use awe_types::{CellId, ResourceUsage};

    use super::*;

    /// Scripted queue: each submitted task is answered by `respond`.
    struct ScriptedQueue<F> {
        respond: F,
        ready: VecDeque<TaskCompletion>,
        submitted: Vec<TaskSpec>,
        cancelled: Vec<TaskId>,
        started: BTreeMap<TaskId, Instant>,
        idle: usize,
    }

    impl<F> ScriptedQueue<F>
    where
        F: FnMut(&TaskSpec) -> Vec<TaskOutcome> + Send,
    {
        fn new(respond: F) -> Self {
            Self {
                respond,
                ready: VecDeque::new(),
                submitted: Vec::new(),
                cancelled: Vec::new(),
                started: BTreeMap::new(),
                idle: 0,
            }
        }
    }

    impl<F> WorkQueue for ScriptedQueue<F>
    where
        F: FnMut(&TaskSpec) -> Vec<TaskOutcome> + Send,
    {
        async fn submit(&mut self, spec: TaskSpec) -> Result<(), QueueError> {
            for outcome in (self.respond)(&spec) {
                self.ready.push_back(TaskCompletion {
                    task_id: spec.task_id,
                    outcome,
                    usage: ResourceUsage {
                        worker: Some(String::from("scripted")),
                        wall_time_ms: 5,
                        exit_code: Some(0),
                    },
                });
            }
            self.submitted.push(spec);
            self.idle = self.idle.saturating_sub(1);
            Ok(())
        }

        async fn wait(&mut self, _timeout: Duration) -> Result<Option<TaskCompletion>, QueueError> {
            Ok(self.ready.pop_front())
        }

        async fn cancel(&mut self, task_id: TaskId) -> Result<(), QueueError> {
            self.cancelled.push(task_id);
            Ok(())
        }

        fn idle_workers(&self) -> usize {
            self.idle
        }

        fn started_at(&self, task_id: TaskId) -> Option<Instant> {
            self.started.get(&task_id).copied()
        }
    }

    fn walkers(n: u64) -> Vec<Walker> {
        (0..n)
            .map(|i| Walker {
                id: WalkerId(i),
                cell_id: CellId(i),
                color: None,
                weight: 1.0,
                start: Snapshot::from(vec![u8::try_from(i).unwrap()]),
            })
            .collect()
    }

    fn success(spec: &TaskSpec) -> TaskOutcome {
        TaskOutcome::Succeeded(TaskOutput {
            snapshot: spec.snapshot.clone(),
            cell_id: CellId(spec.walker_id.0 + 10),
        })
    }

    fn no_replication(restarts: Option<u32>) -> ExecutorConfig {
        ExecutorConfig {
            restarts,
            max_replicas: 1,
            poll_interval: Duration::from_millis(1),
            ..ExecutorConfig::default()
        }
    }

    #[tokio::test]
    async fn one_result_per_walker() {
        let queue = ScriptedQueue::new(|spec| vec![success(spec)]);
        let mut executor = TaskExecutor::new(queue, no_replication(Some(0)));
        let report = executor.execute(0, &walkers(4)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.results.len(), 4);
        assert_eq!(report.submitted, 4);
        assert_eq!(report.results[&WalkerId(2)].cell_id, CellId(12));
    }

    #[tokio::test]
    async fn failed_task_is_retried_until_success() {
        let mut calls = 0_u32;
        let queue = ScriptedQueue::new(move |spec| {
            if spec.walker_id == WalkerId(1) && calls < 2 {
                calls += 1;
                vec![TaskOutcome::failed("segfault")]
            } else {
                vec![success(spec)]
            }
        });
        let mut executor = TaskExecutor::new(queue, no_replication(None));
        let report = executor.execute(3, &walkers(2)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.transient_failures, 2);
        assert_eq!(report.submitted, 4);
    }

    #[tokio::test]
    async fn walker_fails_permanently_after_restart_limit() {
        let queue = ScriptedQueue::new(|spec| {
            if spec.walker_id == WalkerId(0) {
                vec![TaskOutcome::failed("bad input")]
            } else {
                vec![success(spec)]
            }
        });
        let mut executor = TaskExecutor::new(queue, no_replication(Some(2)));
        let report = executor.execute(0, &walkers(3)).await.unwrap();

        assert_eq!(report.results.len(), 2);
        let failure = &report.failures[&WalkerId(0)];
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.reason, "bad input");
        // Initial attempt plus two restarts.
        assert_eq!(
            executor
                .queue()
                .submitted
                .iter()
                .filter(|s| s.walker_id == WalkerId(0))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn late_replica_success_is_a_duplicate() {
        // t0: w0 ok, t1: w1 fails, t2: w0 replica ok, t3: w1 replica ok.
        let queue = ScriptedQueue::new(|spec| {
            if spec.task_id == TaskId(1) {
                vec![TaskOutcome::failed("node lost")]
            } else {
                vec![success(spec)]
            }
        });
        let config = ExecutorConfig {
            max_replicas: 3,
            poll_interval: Duration::from_millis(1),
            ..ExecutorConfig::default()
        };
        let mut executor = TaskExecutor::new(queue, config);
        executor.queue.idle = 4;
        let report = executor.execute(0, &walkers(2)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.submitted, 4);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.transient_failures, 1);
        assert!(executor.queue().cancelled.contains(&TaskId(2)));
    }

    #[tokio::test]
    async fn replicas_go_to_least_replicated_walkers() {
        let queue = ScriptedQueue::new(|_| Vec::new());
        let config = ExecutorConfig {
            max_replicas: 2,
            poll_interval: Duration::from_millis(1),
            ..ExecutorConfig::default()
        };
        let mut executor = TaskExecutor::new(queue, config);

        let mut round = Round::default();
        for walker in walkers(3) {
            round.walkers.insert(
                walker.id,
                WalkerState {
                    snapshot: walker.start,
                    failures: 0,
                    last_reason: String::new(),
                    replicas: BTreeMap::new(),
                    done: false,
                },
            );
        }
        executor.submit_replica(&mut round, WalkerId(0)).await.unwrap();
        executor.queue.idle = 2;
        executor.replicate(&mut round).await.unwrap();

        let targets: Vec<WalkerId> = executor
            .queue()
            .submitted
            .iter()
            .map(|s| s.walker_id)
            .collect();
        assert_eq!(targets, vec![WalkerId(0), WalkerId(1), WalkerId(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_replica_is_never_fast_aborted() {
        let queue = ScriptedQueue::new(|_| Vec::new());
        let config = ExecutorConfig {
            restarts: Some(0),
            max_replicas: 1,
            fast_abort_multiplier: 2.0,
            poll_interval: Duration::from_millis(1),
            monitor: None,
        };
        let mut executor = TaskExecutor::new(queue, config);
        for _ in 0..FAST_ABORT_MIN_SAMPLES {
            executor.stats.record(Duration::from_millis(100));
        }

        let mut round = Round::default();
        for walker in walkers(2) {
            round.walkers.insert(
                walker.id,
                WalkerState {
                    snapshot: walker.start,
                    failures: 0,
                    last_reason: String::new(),
                    replicas: BTreeMap::new(),
                    done: false,
                },
            );
        }
        round.outstanding = 2;
        executor.submit_replica(&mut round, WalkerId(0)).await.unwrap();
        executor.submit_replica(&mut round, WalkerId(1)).await.unwrap();
        // Only walker 1's replica ever reaches a worker.
        executor.queue.started.insert(TaskId(1), Instant::now());

        tokio::time::advance(Duration::from_secs(5)).await;
        executor.fast_abort(&mut round).await.unwrap();

        assert_eq!(executor.queue().cancelled, vec![TaskId(1)]);
        assert_eq!(round.report.fast_aborts, 1);
        assert!(round.walkers[&WalkerId(0)].replicas.contains_key(&TaskId(0)));
        assert!(round.report.failures.contains_key(&WalkerId(1)));
    }

    #[test]
    fn retry_policy_honours_limit() {
        let bounded = no_replication(Some(1));
        assert!(bounded.may_retry(1));
        assert!(!bounded.may_retry(2));
        assert!(no_replication(None).may_retry(u32::MAX));
    }

    #[test]
    fn mean_runtime_averages_samples() {
        let mut stats = RuntimeStats::default();
        assert!(stats.mean().is_none());
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(30));
        assert_eq!(stats.mean(), Some(Duration::from_millis(20)));
    }
}
