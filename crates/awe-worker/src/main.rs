//! Task worker entry point for AWE.
//!
//! Connects to the engine's NATS server, fetches the staging manifest,
//! checks that every staged file exists under the data root, then serves
//! tasks until the connection drops.

use awe_worker::{ScriptRunner, Worker, WorkerConfig, WorkerError};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, staging, or the NATS connection fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("awe-worker starting");

    let config = WorkerConfig::from_env()?;
    info!(
        nats_url = %config.nats_url,
        namespace = %config.namespace,
        data_root = %config.data_root.display(),
        work_dir = %config.work_dir.display(),
        slots = config.slots,
        "configuration loaded"
    );

    tokio::fs::create_dir_all(&config.work_dir).await?;

    let worker = Worker::connect(config.clone()).await?;
    let manifest = worker.fetch_manifest().await?;

    let runner = ScriptRunner::new(&config.data_root, &config.work_dir, manifest)
        .keep_sandboxes(config.keep_sandboxes);
    if let Err(e) = runner.check_staging().await {
        return Err(match e {
            awe_worker::SandboxError::Missing(path) => WorkerError::Staging { path }.into(),
            other => other.into(),
        });
    }
    info!(staged = runner.staged().len(), "staged files present");

    worker.run(runner).await?;
    Ok(())
}
