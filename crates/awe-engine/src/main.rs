//! AWE engine binary.
//!
//! This is the driver that wires together the two-colour ensemble, the work
//! queue, the resampler, and the checkpoint store, then runs the iteration
//! controller until the configured iteration count is reached or the
//! operator interrupts it.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from `awe-config.yaml` (or the path given as the
//!    first argument)
//! 2. Initialize structured logging (tracing)
//! 3. Open the checkpoint store
//! 4. Build the colour partition and, for a fresh run, the initial population
//! 5. Register staged files and open the work queue (NATS or in-process)
//! 6. Build the resampler (`SaveWeights` around `MultiColor`)
//! 7. Install the Ctrl-C handler
//! 8. Run the controller
//! 9. Log the result

mod backend;
mod error;
mod nats_queue;
mod setup;
mod transitions;

use std::path::PathBuf;
use std::sync::Arc;

use awe_core::config::AweConfig;
use awe_core::controller::log_run_end;
use awe_core::{
    AweEngine, CheckpointStore, ControllerConfig, MultiColor, SaveWeights, StopSignal, System,
    TaskExecutor,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::backend::{Queue, Store};
use crate::error::EngineError;
use crate::transitions::TransitionLog;

/// Configuration file used when no path is given.
const DEFAULT_CONFIG: &str = "awe-config.yaml";

/// Targets raised to `debug` by `queue.debug`.
const QUEUE_DEBUG_DIRECTIVES: &str = "awe_core::executor=debug,awe_engine::nats_queue=debug";

/// Application entry point for the engine.
///
/// # Errors
///
/// Returns an error if any initialization step or the run itself fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration.
    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);
    let config = if config_path.exists() {
        AweConfig::from_file(&config_path)?
    } else {
        let mut config = AweConfig::parse("")?;
        config.apply_env_overrides();
        config
    };

    // 2. Initialize structured logging.
    init_logging(&config);
    info!(
        config = %config_path.display(),
        found = config_path.exists(),
        iterations = config.run.iterations,
        nstates = config.ensemble.nstates,
        nwalkers = config.ensemble.nwalkers,
        "awe-engine starting"
    );

    run(config).await?;
    Ok(())
}

async fn run(config: AweConfig) -> Result<(), EngineError> {
    // 3. Open the checkpoint store.
    let mut store = Store::open(&config).await?;
    let resuming = store
        .load()
        .await
        .map_err(|e| EngineError::Setup {
            message: format!("failed to read checkpoint: {e}"),
        })?
        .is_some();

    // 4. Partition and initial population.
    let sinks = Arc::new(setup::partition(&config.ensemble)?);
    info!(
        split = config.ensemble.split(),
        colors = sinks.ncolors(),
        "Colour partition built"
    );
    let initial = if resuming {
        info!("Checkpoint found, initial population not rebuilt");
        System::new()
    } else {
        setup::initial_system(&config.ensemble, &sinks, config.run.seed).await?
    };

    // 5. Staging and work queue.
    let manifest = setup::staging_manifest(&config);
    info!(
        execute = %manifest.execute,
        cached = manifest.cache.len(),
        "Staging manifest registered"
    );
    let queue = Queue::open(&config, &manifest).await?;
    let executor = TaskExecutor::new(queue, config.queue.executor_config());

    // 6. Resampler.
    let multicolor = MultiColor::new(config.ensemble.nwalkers, Arc::clone(&sinks), config.run.seed)?;
    let resampler = SaveWeights::new(multicolor, &config.ensemble.weights_file);

    // 7. Ctrl-C requests a clean stop after the current iteration.
    let stop = StopSignal::new();
    let handler = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current iteration");
            handler.stop();
        }
    });

    // 8. Run.
    let mut engine = AweEngine::new(
        executor,
        resampler,
        store,
        ControllerConfig::from(&config.run),
    )
    .with_stop_signal(stop);
    let mut transitions = TransitionLog::new(&config.ensemble.transitions_file);
    let result = engine.run(initial, &mut transitions).await?;

    // 9. Report.
    log_run_end(&result);
    if transitions.failures() > 0 {
        warn!(
            path = %transitions.path().display(),
            failures = transitions.failures(),
            "Some colour transitions were not recorded"
        );
    }
    for (color, weight) in result.system.color_weights() {
        info!(color = ?color.map(|c| c.0), weight, "Final colour weight");
    }
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(config: &AweConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        if config.queue.debug {
            EnvFilter::new(format!("{level},{QUEUE_DEBUG_DIRECTIVES}"))
        } else {
            EnvFilter::new(level)
        }
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
