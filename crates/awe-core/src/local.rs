//! In-process work queue.
//!
//! [`LocalQueue`] runs replicas as tokio tasks, at most `workers` at a time,
//! through a user-supplied [`TaskRunner`]. It backs the integration tests
//! and single-machine runs. A replica counts as started once it holds a
//! pool slot, not when it was submitted.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use awe_types::{ResourceUsage, TaskCompletion, TaskId, TaskOutcome, TaskSpec};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::executor::{QueueError, WorkQueue};

/// Worker name reported in resource usage for local replicas.
pub const LOCAL_WORKER: &str = "local";

/// Runs one simulation-plus-assignment task.
pub trait TaskRunner: Send + Sync + 'static {
    /// Execute `spec` and report how it ended.
    fn run(&self, spec: TaskSpec) -> impl Future<Output = TaskOutcome> + Send;
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Progress reported by a pool task.
#[derive(Debug)]
enum LocalEvent {
    Started { task_id: TaskId, at: Instant },
    Finished(TaskCompletion),
}

/// A bounded pool of tokio tasks.
#[derive(Debug)]
pub struct LocalQueue<R> {
    runner: Arc<R>,
    workers: usize,
    permits: Arc<Semaphore>,
    running: BTreeMap<TaskId, AbortHandle>,
    started: BTreeMap<TaskId, Instant>,
    tx: mpsc::UnboundedSender<LocalEvent>,
    rx: mpsc::UnboundedReceiver<LocalEvent>,
}

impl<R: TaskRunner> LocalQueue<R> {
    /// Create a pool running at most `workers` replicas concurrently.
    pub fn new(runner: R, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            runner: Arc::new(runner),
            workers,
            permits: Arc::new(Semaphore::new(workers)),
            running: BTreeMap::new(),
            started: BTreeMap::new(),
            tx,
            rx,
        }
    }

    /// Pool size.
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Replicas submitted and not yet reported or cancelled.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }
}

impl<R: TaskRunner> WorkQueue for LocalQueue<R> {
    async fn submit(&mut self, spec: TaskSpec) -> Result<(), QueueError> {
        let task_id = spec.task_id;
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        let tx = self.tx.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let started = Instant::now();
            // The receiver lives as long as the queue.
            let _ = tx.send(LocalEvent::Started {
                task_id,
                at: started,
            });
            let inner = tokio::spawn(async move { runner.run(spec).await });
            let _guard = AbortOnDrop(inner.abort_handle());
            let outcome = match inner.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Local task did not complete");
                    TaskOutcome::failed(format!("task aborted: {e}"))
                }
            };
            let usage = ResourceUsage {
                worker: Some(String::from(LOCAL_WORKER)),
                wall_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                exit_code: None,
            };
            let _ = tx.send(LocalEvent::Finished(TaskCompletion {
                task_id,
                outcome,
                usage,
            }));
        });
        self.running.insert(task_id, handle.abort_handle());
        Ok(())
    }

    async fn wait(&mut self, timeout: Duration) -> Result<Option<TaskCompletion>, QueueError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(LocalEvent::Started { task_id, at }) => {
                        if self.running.contains_key(&task_id) {
                            self.started.insert(task_id, at);
                        }
                    }
                    Some(LocalEvent::Finished(completion)) => {
                        self.running.remove(&completion.task_id);
                        self.started.remove(&completion.task_id);
                        return Ok(Some(completion));
                    }
                    None => return Err(QueueError::Closed),
                },
                () = &mut deadline => return Ok(None),
            }
        }
    }

    async fn cancel(&mut self, task_id: TaskId) -> Result<(), QueueError> {
        self.started.remove(&task_id);
        if let Some(handle) = self.running.remove(&task_id) {
            debug!(task_id = %task_id, "Cancelling local task");
            handle.abort();
        }
        Ok(())
    }

    fn idle_workers(&self) -> usize {
        self.workers.saturating_sub(self.running.len())
    }

    fn started_at(&self, task_id: TaskId) -> Option<Instant> {
        self.started.get(&task_id).copied()
    }
}

impl<R> Drop for LocalQueue<R> {
    fn drop(&mut self) {
        for handle in self.running.values() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use awe_types::{CellId, Snapshot, TaskOutput, WalkerId};

    use super::*;

    struct Sleepy;

    impl TaskRunner for Sleepy {
        async fn run(&self, spec: TaskSpec) -> TaskOutcome {
            tokio::time::sleep(Duration::from_secs(spec.walker_id.0)).await;
            TaskOutcome::Succeeded(TaskOutput {
                snapshot: spec.snapshot,
                cell_id: CellId(spec.walker_id.0),
            })
        }
    }

    struct Panicky;

    impl TaskRunner for Panicky {
        #[allow(clippy::panic)]
        async fn run(&self, _spec: TaskSpec) -> TaskOutcome {
            panic!("engine exploded");
        }
    }

    fn spec(task: u64, walker: u64) -> TaskSpec {
        TaskSpec {
            task_id: TaskId(task),
            walker_id: WalkerId(walker),
            iteration: 0,
            snapshot: Snapshot::from(vec![1, 2, 3]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completions_arrive_in_finish_order() {
        let mut queue = LocalQueue::new(Sleepy, 4);
        queue.submit(spec(0, 5)).await.unwrap();
        queue.submit(spec(1, 1)).await.unwrap();
        assert_eq!(queue.idle_workers(), 2);

        let first = queue.wait(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(first.task_id, TaskId(1));
        assert!(first.outcome.is_success());
        assert_eq!(first.usage.worker.as_deref(), Some(LOCAL_WORKER));

        let second = queue.wait(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(second.task_id, TaskId(0));
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_without_completion() {
        let mut queue = LocalQueue::new(Sleepy, 1);
        queue.submit(spec(0, 100)).await.unwrap();
        assert!(queue.wait(Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_reports() {
        let mut queue = LocalQueue::new(Sleepy, 2);
        queue.submit(spec(0, 10)).await.unwrap();
        queue.cancel(TaskId(0)).await.unwrap();
        assert_eq!(queue.idle_workers(), 2);
        assert!(queue.wait(Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_time_is_taken_when_a_slot_frees() {
        let mut queue = LocalQueue::new(Sleepy, 1);
        queue.submit(spec(0, 4)).await.unwrap();
        queue.submit(spec(1, 4)).await.unwrap();
        assert!(queue.wait(Duration::from_secs(1)).await.unwrap().is_none());
        let first = queue.started_at(TaskId(0)).unwrap();
        assert!(queue.started_at(TaskId(1)).is_none());

        let done = queue.wait(Duration::from_secs(10)).await.unwrap().unwrap();
        assert_eq!(done.task_id, TaskId(0));
        assert!(queue.started_at(TaskId(0)).is_none());

        assert!(queue.wait(Duration::from_secs(1)).await.unwrap().is_none());
        let second = queue.started_at(TaskId(1)).unwrap();
        assert_eq!(second.saturating_duration_since(first), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn panicking_runner_reports_failure() {
        let mut queue = LocalQueue::new(Panicky, 1);
        queue.submit(spec(7, 0)).await.unwrap();
        let completion = queue.wait(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(completion.task_id, TaskId(7));
        assert!(!completion.outcome.is_success());
    }
}
