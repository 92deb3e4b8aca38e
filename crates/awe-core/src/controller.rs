//! Iteration controller.
//!
//! [`AweEngine`] drives the weighted-ensemble loop:
//!
//! ```text
//! INIT ──load checkpoint──▶ RUNNING ──every checkpoint_freq──▶ CHECKPOINTING
//!                              ▲                                    │
//!                              └────────────────────────────────────┘
//!                              │
//!                              └──iterations done / stop / fatal──▶ TERMINATED
//! ```
//!
//! One iteration submits a task per walker, folds the results back into the
//! population, and resamples. Weight conservation is checked before the
//! tasks run, after assembly, and after resampling; any violation is fatal.
//! Resampling is seeded per iteration, so a run resumed from the checkpoint
//! of iteration `k` produces the same populations as an uninterrupted run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use awe_types::{Color, RunId};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::assemble::{AssembleError, assemble};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::config::{CheckpointFailurePolicy, RunConfig};
use crate::conservation::{
    CheckStage, DEFAULT_WEIGHT_TOLERANCE, WeightAnomaly, verify_conservation, verify_total,
};
use crate::executor::{ExecutorError, TaskExecutor, WorkQueue};
use crate::resample::{ColorFlux, ResampleError, Resampler};
use crate::system::{System, SystemError};

/// Lifecycle of an [`AweEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Loading state.
    Init,
    /// Executing iterations.
    Running,
    /// Persisting a checkpoint.
    Checkpointing,
    /// Finished, cleanly or not.
    Terminated,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEndReason {
    /// All requested iterations were executed.
    Completed,
    /// The restored checkpoint already covered every requested iteration.
    MaxIterationsReached,
    /// A stop was requested; the run ended after a checkpoint.
    Interrupted,
}

/// Category of a fatal error, for operators and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The population broke an entity or weight invariant.
    Invariant,
    /// The resampler failed.
    Resampler,
    /// The executor or its queue failed.
    Executor,
    /// Loading or saving a checkpoint failed.
    Checkpoint,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invariant => "invariant",
            Self::Resampler => "resampler",
            Self::Executor => "executor",
            Self::Checkpoint => "checkpoint",
        };
        f.write_str(name)
    }
}

/// Errors that end a run.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// The population is structurally invalid.
    #[error("invalid population: {0}")]
    Invariant(#[from] SystemError),

    /// Weight was created or destroyed.
    #[error("{0}")]
    WeightAnomaly(#[from] WeightAnomaly),

    /// Task results could not be folded into the population.
    #[error("failed to assemble results: {0}")]
    Assemble(#[from] AssembleError),

    /// The resampler failed.
    #[error("resampling failed: {0}")]
    Resample(#[from] ResampleError),

    /// The executor failed.
    #[error("task execution failed: {0}")]
    Executor(#[from] ExecutorError),

    /// Loading, or saving under the `abort` policy, failed.
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl ControllerError {
    /// The failure class for this error.
    pub const fn failure_class(&self) -> FailureClass {
        match self {
            Self::Invariant(_) | Self::WeightAnomaly(_) | Self::Assemble(_) => {
                FailureClass::Invariant
            }
            Self::Resample(_) => FailureClass::Resampler,
            Self::Executor(_) => FailureClass::Executor,
            Self::Checkpoint(_) => FailureClass::Checkpoint,
        }
    }
}

/// Controller settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Total iterations in the run.
    pub iterations: u64,
    /// Checkpoint iterations that are a multiple of this (and the last).
    pub checkpoint_freq: u64,
    /// Absolute tolerance for weight sums.
    pub weight_tolerance: f64,
    /// What a failed save does.
    pub on_checkpoint_failure: CheckpointFailurePolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            checkpoint_freq: 1,
            weight_tolerance: DEFAULT_WEIGHT_TOLERANCE,
            on_checkpoint_failure: CheckpointFailurePolicy::Warn,
        }
    }
}

impl From<&RunConfig> for ControllerConfig {
    fn from(run: &RunConfig) -> Self {
        Self {
            iterations: run.iterations,
            checkpoint_freq: run.checkpoint_freq.max(1),
            weight_tolerance: run.weight_tolerance,
            on_checkpoint_failure: run.on_checkpoint_failure,
        }
    }
}

/// Whether the iteration's checkpoint was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointStatus {
    /// Not due this iteration.
    Skipped,
    /// Written.
    Saved,
    /// The save failed and the run continued.
    Failed(String),
}

/// What happened in one iteration.
#[derive(Debug, Clone)]
pub struct IterationSummary {
    /// Iteration number.
    pub iteration: u64,
    /// Walkers submitted.
    pub walkers_in: usize,
    /// Walkers after resampling.
    pub walkers_out: usize,
    /// Walkers whose task succeeded.
    pub advanced: usize,
    /// Walkers that failed permanently and were folded into survivors.
    pub dropped: usize,
    /// Walkers that failed permanently and were kept unadvanced.
    pub retained: usize,
    /// Replicas submitted.
    pub submitted: u64,
    /// Replica failures that were retried.
    pub transient_failures: u64,
    /// Late successes discarded.
    pub duplicates: u64,
    /// Replicas cancelled for running too long.
    pub fast_aborts: u64,
    /// Weight moved between colours.
    pub flux: ColorFlux,
    /// Weight per colour after resampling.
    pub color_weights: BTreeMap<Option<Color>, f64>,
    /// Checkpoint outcome.
    pub checkpoint: CheckpointStatus,
    /// Wall time for the iteration.
    pub elapsed: Duration,
}

/// Callback invoked after each iteration completes.
pub trait IterationCallback: Send {
    /// Called once per completed iteration.
    fn on_iteration(&mut self, summary: &IterationSummary, system: &System);
}

/// A callback that does nothing.
pub struct NoOpCallback;

impl IterationCallback for NoOpCallback {
    fn on_iteration(&mut self, _summary: &IterationSummary, _system: &System) {}
}

/// Cooperative stop request, shared between the engine and a signal handler.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop after the current iteration.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a run.
#[derive(Debug)]
pub struct RunResult {
    /// Run identity (restored on resume).
    pub run_id: RunId,
    /// Why the run ended.
    pub end_reason: RunEndReason,
    /// First iteration executed by this invocation.
    pub start_iteration: u64,
    /// Last iteration completed, if any.
    pub last_iteration: Option<u64>,
    /// Iterations executed by this invocation.
    pub iterations_run: u64,
    /// Saves that failed under the `warn` policy.
    pub checkpoint_failures: u64,
    /// Final population.
    pub system: System,
}

/// The AWE iteration controller.
#[derive(Debug)]
pub struct AweEngine<Q, R, S> {
    executor: TaskExecutor<Q>,
    resampler: R,
    store: S,
    config: ControllerConfig,
    phase: EnginePhase,
    stop: StopSignal,
}

impl<Q, R, S> AweEngine<Q, R, S>
where
    Q: WorkQueue,
    R: Resampler,
    S: CheckpointStore,
{
    /// Create an engine.
    pub fn new(
        executor: TaskExecutor<Q>,
        resampler: R,
        store: S,
        config: ControllerConfig,
    ) -> Self {
        Self {
            executor,
            resampler,
            store,
            config,
            phase: EnginePhase::Init,
            stop: StopSignal::new(),
        }
    }

    /// Use an externally owned stop signal.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Handle for requesting a stop.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Current lifecycle phase.
    pub const fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// The checkpoint store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The resampler.
    pub const fn resampler(&self) -> &R {
        &self.resampler
    }

    /// The executor.
    pub const fn executor(&self) -> &TaskExecutor<Q> {
        &self.executor
    }

    /// Run until the configured iteration count, a stop, or a fatal error.
    ///
    /// `initial` is used only when the store has no checkpoint.
    pub async fn run(
        &mut self,
        initial: System,
        callback: &mut impl IterationCallback,
    ) -> Result<RunResult, ControllerError> {
        self.phase = EnginePhase::Init;
        let result = self.run_inner(initial, callback).await;
        self.phase = EnginePhase::Terminated;
        if let Err(e) = &result {
            error!(class = %e.failure_class(), error = %e, "Run failed");
        }
        result
    }

    async fn run_inner(
        &mut self,
        initial: System,
        callback: &mut impl IterationCallback,
    ) -> Result<RunResult, ControllerError> {
        let tolerance = self.config.weight_tolerance;
        let (mut system, start, run_id) = match self.store.load().await? {
            Some(checkpoint) => {
                info!(
                    run_id = %checkpoint.run_id,
                    iteration = checkpoint.iteration,
                    walkers = checkpoint.system.walker_count(),
                    "Resuming from checkpoint"
                );
                (
                    checkpoint.system,
                    checkpoint.iteration.saturating_add(1),
                    checkpoint.run_id,
                )
            }
            None => {
                let run_id = RunId::new();
                info!(run_id = %run_id, walkers = initial.walker_count(), "Starting new run");
                (initial, 0, run_id)
            }
        };
        system.validate_within(tolerance)?;
        verify_total(start, CheckStage::BeforeTasks, &system, tolerance).into_result()?;

        let mut result = RunResult {
            run_id,
            end_reason: RunEndReason::Completed,
            start_iteration: start,
            last_iteration: None,
            iterations_run: 0,
            checkpoint_failures: 0,
            system: System::new(),
        };

        if start >= self.config.iterations {
            info!(
                start,
                iterations = self.config.iterations,
                "Checkpoint already covers every requested iteration"
            );
            result.end_reason = RunEndReason::MaxIterationsReached;
            result.system = system;
            return Ok(result);
        }

        self.phase = EnginePhase::Running;
        for iteration in start..self.config.iterations {
            let started = Instant::now();
            let (next, mut summary) = self.iterate(iteration, &system).await?;
            system = next;

            let is_last = iteration.saturating_add(1) >= self.config.iterations;
            let stopping = self.stop.is_stopped();
            let due = iteration % self.config.checkpoint_freq.max(1) == 0;
            summary.checkpoint = if due || is_last || stopping {
                self.checkpoint(run_id, iteration, &system, &mut result)
                    .await?
            } else {
                CheckpointStatus::Skipped
            };
            summary.elapsed = started.elapsed();

            info!(
                iteration,
                walkers_in = summary.walkers_in,
                walkers_out = summary.walkers_out,
                failed = summary.dropped.saturating_add(summary.retained),
                duplicates = summary.duplicates,
                checkpoint = ?summary.checkpoint,
                elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
                "Iteration complete"
            );
            callback.on_iteration(&summary, &system);

            result.last_iteration = Some(iteration);
            result.iterations_run = result.iterations_run.saturating_add(1);

            if stopping && !is_last {
                info!(iteration, "Stop requested, ending run");
                result.end_reason = RunEndReason::Interrupted;
                break;
            }
        }

        result.system = system;
        Ok(result)
    }

    /// Execute, assemble, and resample one iteration.
    async fn iterate(
        &mut self,
        iteration: u64,
        system: &System,
    ) -> Result<(System, IterationSummary), ControllerError> {
        let tolerance = self.config.weight_tolerance;
        verify_total(iteration, CheckStage::BeforeTasks, system, tolerance).into_result()?;
        let expected = system.color_weights();

        let report = self.executor.execute(iteration, system.walkers()).await?;
        let assembly = assemble(system, &report)?;
        assembly.system.validate_within(tolerance)?;
        verify_conservation(
            iteration,
            CheckStage::Assembled,
            &expected,
            &assembly.system,
            tolerance,
        )
        .into_result()?;

        let resampled = self.resampler.resample(iteration, &assembly.system)?;
        resampled.system.validate_within(tolerance)?;
        let expected = resampled.flux.apply(&assembly.system.color_weights());
        verify_conservation(
            iteration,
            CheckStage::Resampled,
            &expected,
            &resampled.system,
            tolerance,
        )
        .into_result()?;

        for ((from, to), weight) in resampled.flux.moves() {
            info!(
                iteration,
                from = ?from.map(|c| c.0),
                to = ?to.map(|c| c.0),
                weight,
                "Colour transition"
            );
        }

        let summary = IterationSummary {
            iteration,
            walkers_in: system.walker_count(),
            walkers_out: resampled.system.walker_count(),
            advanced: assembly.advanced,
            dropped: assembly.dropped.len(),
            retained: assembly.retained.len(),
            submitted: report.submitted,
            transient_failures: report.transient_failures,
            duplicates: report.duplicates,
            fast_aborts: report.fast_aborts,
            color_weights: resampled.system.color_weights(),
            flux: resampled.flux,
            checkpoint: CheckpointStatus::Skipped,
            elapsed: Duration::ZERO,
        };
        Ok((resampled.system, summary))
    }

    async fn checkpoint(
        &mut self,
        run_id: RunId,
        iteration: u64,
        system: &System,
        result: &mut RunResult,
    ) -> Result<CheckpointStatus, ControllerError> {
        self.phase = EnginePhase::Checkpointing;
        let checkpoint = Checkpoint {
            run_id,
            iteration,
            system: system.clone(),
        };
        let saved = self.store.save(&checkpoint).await;
        self.phase = EnginePhase::Running;

        match saved {
            Ok(()) => Ok(CheckpointStatus::Saved),
            Err(e) => match self.config.on_checkpoint_failure {
                CheckpointFailurePolicy::Abort => Err(e.into()),
                CheckpointFailurePolicy::Warn => {
                    warn!(
                        iteration,
                        error = %e,
                        "Checkpoint save failed, continuing from the previous checkpoint"
                    );
                    result.checkpoint_failures = result.checkpoint_failures.saturating_add(1);
                    Ok(CheckpointStatus::Failed(e.to_string()))
                }
            },
        }
    }
}

/// Log the outcome of a run.
pub fn log_run_end(result: &RunResult) {
    info!(
        run_id = %result.run_id,
        reason = ?result.end_reason,
        start_iteration = result.start_iteration,
        last_iteration = ?result.last_iteration,
        iterations_run = result.iterations_run,
        walkers = result.system.walker_count(),
        "Run ended"
    );
    if result.checkpoint_failures > 0 {
        warn!(
            failures = result.checkpoint_failures,
            "Some checkpoints could not be saved"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::future::Future;

    use awe_types::{Cell, CellId, Snapshot, TaskOutcome, TaskOutput, TaskSpec};

    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::executor::ExecutorConfig;
    use crate::local::{LocalQueue, TaskRunner};
    use crate::resample::Resampled;

    /// Leaves every walker in its cell.
    struct Stay;

    impl TaskRunner for Stay {
        async fn run(&self, spec: TaskSpec) -> TaskOutcome {
            let cell = CellId(u64::from(spec.snapshot.as_bytes().first().copied().unwrap_or(0)));
            TaskOutcome::Succeeded(TaskOutput {
                snapshot: spec.snapshot,
                cell_id: cell,
            })
        }
    }

    /// Returns its input unchanged.
    struct Identity;

    impl Resampler for Identity {
        fn resample(&mut self, _iteration: u64, system: &System) -> Result<Resampled, ResampleError> {
            Ok(Resampled {
                system: system.clone(),
                flux: ColorFlux::default(),
            })
        }
    }

    /// Doubles every weight.
    struct Inflate;

    impl Resampler for Inflate {
        fn resample(&mut self, _iteration: u64, system: &System) -> Result<Resampled, ResampleError> {
            let mut next = system.empty_like();
            for walker in system.walkers() {
                next.add_walker(walker.cell_id, walker.color, walker.weight * 2.0, walker.start.clone())?;
            }
            Ok(Resampled {
                system: next,
                flux: ColorFlux::default(),
            })
        }
    }

    /// Store whose saves always fail.
    #[derive(Default)]
    struct BrokenStore;

    impl CheckpointStore for BrokenStore {
        fn save(
            &mut self,
            _checkpoint: &Checkpoint,
        ) -> impl Future<Output = Result<(), CheckpointError>> + Send {
            async { Err(CheckpointError::Backend(String::from("disk full"))) }
        }

        fn load(
            &mut self,
        ) -> impl Future<Output = Result<Option<Checkpoint>, CheckpointError>> + Send {
            async { Ok(None) }
        }
    }

    fn population() -> System {
        let mut system = System::new();
        for id in 0..2 {
            system.add_cell(Cell::new(CellId(id))).unwrap();
        }
        for (cell, weight) in [(0_u8, 0.5), (1, 0.5)] {
            system
                .add_walker(CellId(u64::from(cell)), None, weight, Snapshot::from(vec![cell]))
                .unwrap();
        }
        system
    }

    fn executor() -> TaskExecutor<LocalQueue<Stay>> {
        TaskExecutor::new(
            LocalQueue::new(Stay, 2),
            ExecutorConfig {
                max_replicas: 1,
                poll_interval: Duration::from_millis(10),
                ..ExecutorConfig::default()
            },
        )
    }

    fn config(iterations: u64, checkpoint_freq: u64) -> ControllerConfig {
        ControllerConfig {
            iterations,
            checkpoint_freq,
            ..ControllerConfig::default()
        }
    }

    #[tokio::test]
    async fn runs_requested_iterations_and_checkpoints() {
        let store = MemoryCheckpointStore::new();
        let mut engine = AweEngine::new(executor(), Identity, store.clone(), config(4, 2));
        let result = engine.run(population(), &mut NoOpCallback).await.unwrap();

        assert_eq!(result.end_reason, RunEndReason::Completed);
        assert_eq!(result.iterations_run, 4);
        assert_eq!(result.last_iteration, Some(3));
        assert_eq!(engine.phase(), EnginePhase::Terminated);
        // After iterations 0, 2 and the last.
        assert_eq!(store.save_count(), 3);
        assert_eq!(store.latest().unwrap().iteration, 3);
    }

    /// Iterations whose checkpoint was written.
    #[derive(Default)]
    struct SavedIterations(Vec<u64>);

    impl IterationCallback for SavedIterations {
        fn on_iteration(&mut self, summary: &IterationSummary, _system: &System) {
            if summary.checkpoint == CheckpointStatus::Saved {
                self.0.push(summary.iteration);
            }
        }
    }

    #[tokio::test]
    async fn checkpoints_land_on_multiples_of_the_frequency() {
        let mut saved = SavedIterations::default();
        let mut engine = AweEngine::new(
            executor(),
            Identity,
            MemoryCheckpointStore::new(),
            config(8, 3),
        );
        engine.run(population(), &mut saved).await.unwrap();
        assert_eq!(saved.0, vec![0, 3, 6, 7]);
    }

    #[tokio::test]
    async fn resume_past_target_reports_max_iterations() {
        let store = MemoryCheckpointStore::new();
        let mut first = AweEngine::new(executor(), Identity, store.clone(), config(2, 1));
        first.run(population(), &mut NoOpCallback).await.unwrap();

        let mut second = AweEngine::new(executor(), Identity, store.clone(), config(2, 1));
        let result = second.run(population(), &mut NoOpCallback).await.unwrap();
        assert_eq!(result.end_reason, RunEndReason::MaxIterationsReached);
        assert_eq!(result.iterations_run, 0);
        assert_eq!(result.start_iteration, 2);
    }

    #[tokio::test]
    async fn weight_gain_is_fatal_invariant_failure() {
        let mut engine = AweEngine::new(
            executor(),
            Inflate,
            MemoryCheckpointStore::new(),
            config(1, 1),
        );
        let err = engine.run(population(), &mut NoOpCallback).await.unwrap_err();
        assert_eq!(err.failure_class(), FailureClass::Invariant);
        assert!(err.to_string().contains("WEIGHT_ANOMALY"));
        assert_eq!(engine.phase(), EnginePhase::Terminated);
    }

    #[tokio::test]
    async fn checkpoint_failure_warns_by_default() {
        let mut engine = AweEngine::new(executor(), Identity, BrokenStore, config(2, 1));
        let result = engine.run(population(), &mut NoOpCallback).await.unwrap();
        assert_eq!(result.end_reason, RunEndReason::Completed);
        assert_eq!(result.checkpoint_failures, 2);
    }

    #[tokio::test]
    async fn checkpoint_failure_aborts_when_configured() {
        let mut cfg = config(2, 1);
        cfg.on_checkpoint_failure = CheckpointFailurePolicy::Abort;
        let mut engine = AweEngine::new(executor(), Identity, BrokenStore, cfg);
        let err = engine.run(population(), &mut NoOpCallback).await.unwrap_err();
        assert_eq!(err.failure_class(), FailureClass::Checkpoint);
    }

    #[tokio::test]
    async fn stop_signal_interrupts_after_checkpoint() {
        let store = MemoryCheckpointStore::new();
        let mut engine = AweEngine::new(executor(), Identity, store.clone(), config(10, 5));
        engine.stop_signal().stop();
        let result = engine.run(population(), &mut NoOpCallback).await.unwrap();

        assert_eq!(result.end_reason, RunEndReason::Interrupted);
        assert_eq!(result.iterations_run, 1);
        assert_eq!(store.latest().unwrap().iteration, 0);
    }

    #[tokio::test]
    async fn invalid_initial_weight_is_rejected() {
        let mut system = population();
        system.normalize_weights();
        let mut lopsided = system.empty_like();
        lopsided
            .add_walker(CellId(0), None, 0.3, Snapshot::default())
            .unwrap();
        let mut engine = AweEngine::new(
            executor(),
            Identity,
            MemoryCheckpointStore::new(),
            config(1, 1),
        );
        let err = engine.run(lopsided, &mut NoOpCallback).await.unwrap_err();
        assert!(matches!(err, ControllerError::WeightAnomaly(_)));
    }

    #[test]
    fn failure_class_names() {
        assert_eq!(FailureClass::Resampler.to_string(), "resampler");
        assert_eq!(FailureClass::Executor.to_string(), "executor");
    }
}
