//! Configuration loading and typed config structures for an AWE run.
//!
//! The run is described by `awe-config.yaml`. Every field has a default, so
//! an empty file yields a runnable configuration (100 cells, 4 walkers per
//! cell, two colours split at cell 50, NATS queue on port 9123).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::conservation::DEFAULT_WEIGHT_TOLERANCE;
use crate::executor::{DEFAULT_MAX_REPLICAS, ExecutorConfig};
use crate::monitor::ResourceMonitor;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level run configuration, mirroring `awe-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AweConfig {
    /// Iteration count, checkpointing cadence, seeding.
    #[serde(default)]
    pub run: RunConfig,

    /// Initial population layout.
    #[serde(default)]
    pub ensemble: EnsembleConfig,

    /// Task queue backend and executor tunables.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Files shipped to workers.
    #[serde(default)]
    pub staging: StagingConfig,

    /// Where checkpoints go.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AweConfig {
    /// Load configuration from a YAML file.
    ///
    /// Environment variables override connection strings:
    /// - `AWE_NATS_URL` overrides `queue.nats_url`
    /// - `DATABASE_URL` overrides `checkpoint.postgres_url`
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AWE_NATS_URL") {
            self.queue.nats_url = Some(val);
        }
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.checkpoint.postgres_url = Some(val);
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.ensemble.nstates == 0 {
            return invalid("ensemble.nstates must be at least 1");
        }
        if self.ensemble.nwalkers == 0 {
            return invalid("ensemble.nwalkers must be at least 1");
        }
        if self.ensemble.split() > self.ensemble.nstates {
            return invalid("ensemble.split must not exceed ensemble.nstates");
        }
        if self.run.checkpoint_freq == 0 {
            return invalid("run.checkpoint_freq must be at least 1");
        }
        if !(self.run.weight_tolerance.is_finite() && self.run.weight_tolerance > 0.0) {
            return invalid("run.weight_tolerance must be positive");
        }
        if self.queue.maxreps == 0 {
            return invalid("queue.maxreps must be at least 1");
        }
        if self.checkpoint.keep == 0 {
            return invalid("checkpoint.keep must be at least 1");
        }
        Ok(())
    }
}

/// What to do when persisting a checkpoint fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointFailurePolicy {
    /// Log and continue; the previous checkpoint stays valid.
    #[default]
    Warn,
    /// Stop the run.
    Abort,
}

/// Run-level settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunConfig {
    /// Total number of iterations in the run.
    #[serde(default = "default_iterations")]
    pub iterations: u64,

    /// Checkpoint every this many iterations.
    #[serde(default = "default_checkpoint_freq")]
    pub checkpoint_freq: u64,

    /// Seed for initial weights and resampling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Absolute tolerance for weight sums.
    #[serde(default = "default_weight_tolerance")]
    pub weight_tolerance: f64,

    /// Behaviour when a checkpoint cannot be saved.
    #[serde(default)]
    pub on_checkpoint_failure: CheckpointFailurePolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            checkpoint_freq: default_checkpoint_freq(),
            seed: default_seed(),
            weight_tolerance: default_weight_tolerance(),
            on_checkpoint_failure: CheckpointFailurePolicy::default(),
        }
    }
}

/// Initial population layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnsembleConfig {
    /// Number of cells.
    #[serde(default = "default_nstates")]
    pub nstates: u64,

    /// Walkers per occupied cell (initially and after resampling).
    #[serde(default = "default_nwalkers")]
    pub nwalkers: usize,

    /// First cell of the second colour region. Defaults to `nstates / 2`.
    #[serde(default)]
    pub split: Option<u64>,

    /// Topology file staged alongside the execute script.
    #[serde(default)]
    pub topology: Option<PathBuf>,

    /// Template for initial walker snapshots; `{cell}` and `{walker}` are
    /// substituted.
    #[serde(default = "default_walker_template")]
    pub walker_template: String,

    /// Pre-resampling weights CSV.
    #[serde(default = "default_weights_file")]
    pub weights_file: PathBuf,

    /// Colour transitions CSV.
    #[serde(default = "default_transitions_file")]
    pub transitions_file: PathBuf,
}

impl EnsembleConfig {
    /// Resolved colour boundary.
    pub fn split(&self) -> u64 {
        self.split.unwrap_or(self.nstates / 2)
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            nstates: default_nstates(),
            nwalkers: default_nwalkers(),
            split: None,
            topology: None,
            walker_template: default_walker_template(),
            weights_file: default_weights_file(),
            transitions_file: default_transitions_file(),
        }
    }
}

/// Which queue implementation runs the tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Remote workers over NATS.
    #[default]
    Nats,
    /// In-process tokio pool.
    Local,
}

/// Queue and executor settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueueConfig {
    /// Backend selection.
    #[serde(default)]
    pub backend: QueueBackend,

    /// Failures tolerated per walker; `null` retries forever.
    #[serde(default)]
    pub restarts: Option<u32>,

    /// Maximum concurrent replicas per walker.
    #[serde(default = "default_maxreps")]
    pub maxreps: u32,

    /// Fast-abort multiplier; `<= 0` disables it.
    #[serde(default = "default_fastabort")]
    pub fastabort: f64,

    /// Port used to build the default NATS URL.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Project name; selects the subject namespace.
    #[serde(default)]
    pub name: Option<String>,

    /// Explicit NATS URL.
    #[serde(default)]
    pub nats_url: Option<String>,

    /// Record per-task resource usage.
    #[serde(default)]
    pub monitor: bool,

    /// Resource usage file; defaults to `awe-<pid>-resource-usage`.
    #[serde(default)]
    pub summaryfile: Option<PathBuf>,

    /// Verbose executor and queue logging.
    #[serde(default)]
    pub debug: bool,

    /// Longest single wait for a result before housekeeping.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Tasks without a result after this long count as failed.
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Pool size for the local backend.
    #[serde(default = "default_local_workers")]
    pub local_workers: usize,
}

impl QueueConfig {
    /// NATS URL to connect to.
    pub fn nats_url(&self) -> String {
        self.nats_url
            .clone()
            .unwrap_or_else(|| format!("nats://127.0.0.1:{}", self.port))
    }

    /// Per-task deadline.
    pub const fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Executor tunables derived from this section.
    pub fn executor_config(&self) -> ExecutorConfig {
        let monitor = self.monitor.then(|| {
            self.summaryfile
                .clone()
                .unwrap_or_else(ResourceMonitor::default_path)
        });
        ExecutorConfig {
            restarts: self.restarts,
            max_replicas: self.maxreps,
            fast_abort_multiplier: self.fastabort,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            monitor,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            restarts: None,
            maxreps: default_maxreps(),
            fastabort: default_fastabort(),
            port: default_port(),
            name: None,
            nats_url: None,
            monitor: false,
            summaryfile: None,
            debug: false,
            poll_interval_ms: default_poll_interval_ms(),
            task_timeout_secs: default_task_timeout_secs(),
            local_workers: default_local_workers(),
        }
    }
}

/// Files registered once per run and shared with every task.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StagingConfig {
    /// Script that runs one simulation segment and the cell assignment.
    #[serde(default = "default_execute")]
    pub execute: String,

    /// Additional read-only files; may contain `$OS` and `$ARCH`.
    #[serde(default)]
    pub cache: Vec<String>,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            execute: default_execute(),
            cache: Vec::new(),
        }
    }
}

/// Checkpoint store selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    /// Generation directories on the local filesystem.
    #[default]
    File,
    /// `PostgreSQL` tables.
    Postgres,
}

/// Checkpoint store settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckpointConfig {
    /// Store selection.
    #[serde(default)]
    pub backend: CheckpointBackend,

    /// Root directory for the file store.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,

    /// Generations kept by the file store.
    #[serde(default = "default_keep")]
    pub keep: usize,

    /// Connection string for the Postgres store.
    #[serde(default)]
    pub postgres_url: Option<String>,

    /// Key separating runs sharing one database.
    #[serde(default = "default_run_name")]
    pub run_name: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            dir: default_checkpoint_dir(),
            keep: default_keep(),
            postgres_url: None,
            run_name: default_run_name(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

const fn default_iterations() -> u64 {
    5
}

const fn default_checkpoint_freq() -> u64 {
    1
}

const fn default_seed() -> u64 {
    42
}

const fn default_weight_tolerance() -> f64 {
    DEFAULT_WEIGHT_TOLERANCE
}

const fn default_nstates() -> u64 {
    100
}

const fn default_nwalkers() -> usize {
    4
}

fn default_walker_template() -> String {
    String::from("pdbs/State{cell}-{walker}.pdb")
}

fn default_weights_file() -> PathBuf {
    PathBuf::from("walker-weights.csv")
}

fn default_transitions_file() -> PathBuf {
    PathBuf::from("color-transitions.csv")
}

const fn default_maxreps() -> u32 {
    DEFAULT_MAX_REPLICAS
}

const fn default_fastabort() -> f64 {
    -1.0
}

const fn default_port() -> u16 {
    9123
}

const fn default_poll_interval_ms() -> u64 {
    250
}

const fn default_task_timeout_secs() -> u64 {
    3600
}

const fn default_local_workers() -> usize {
    4
}

fn default_execute() -> String {
    String::from("execute-task.sh")
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("awe-checkpoints")
}

const fn default_keep() -> usize {
    2
}

fn default_run_name() -> String {
    String::from("awe")
}

fn default_log_level() -> String {
    String::from("info")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = AweConfig::parse("").unwrap();
        assert_eq!(config, AweConfig::default());
        assert_eq!(config.run.iterations, 5);
        assert_eq!(config.ensemble.nstates, 100);
        assert_eq!(config.ensemble.nwalkers, 4);
        assert_eq!(config.ensemble.split(), 50);
        assert_eq!(config.queue.maxreps, 50);
        assert_eq!(config.queue.restarts, None);
        assert_eq!(config.queue.nats_url(), "nats://127.0.0.1:9123");
        assert_eq!(config.checkpoint.keep, 2);
    }

    #[test]
    fn parse_full_yaml() {
        let yaml = r#"
run:
  iterations: 20
  checkpoint_freq: 5
  seed: 7
  on_checkpoint_failure: abort
ensemble:
  nstates: 10
  nwalkers: 2
  split: 3
  walker_template: "init/{cell}.{walker}.pdb"
queue:
  backend: local
  restarts: 3
  maxreps: 4
  fastabort: 3.0
  port: 4222
  name: villin
  monitor: true
  summaryfile: usage.jsonl
  local_workers: 8
staging:
  execute: run.sh
  cache: ["bin/$OS-$ARCH/mdrun", "topol.tpr"]
checkpoint:
  backend: postgres
  postgres_url: "postgres://localhost/awe"
  run_name: villin-1
logging:
  level: debug
  json: true
"#;
        let config = AweConfig::parse(yaml).unwrap();
        assert_eq!(config.run.iterations, 20);
        assert_eq!(config.run.on_checkpoint_failure, CheckpointFailurePolicy::Abort);
        assert_eq!(config.ensemble.split(), 3);
        assert_eq!(config.queue.backend, QueueBackend::Local);
        assert_eq!(config.queue.nats_url(), "nats://127.0.0.1:4222");
        assert_eq!(config.staging.cache.len(), 2);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Postgres);
        assert!(config.logging.json);

        let executor = config.queue.executor_config();
        assert_eq!(executor.restarts, Some(3));
        assert_eq!(executor.max_replicas, 4);
        assert_eq!(executor.fast_abort_multiplier, 3.0);
        assert_eq!(executor.monitor, Some(PathBuf::from("usage.jsonl")));
    }

    #[test]
    fn monitor_off_means_no_summary_file() {
        let config = AweConfig::default();
        assert!(config.queue.executor_config().monitor.is_none());
    }

    #[test]
    fn split_beyond_states_is_rejected() {
        let err = AweConfig::parse("ensemble:\n  nstates: 10\n  split: 11\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_checkpoint_freq_is_rejected() {
        let err = AweConfig::parse("run:\n  checkpoint_freq: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_backend_fails_to_parse() {
        let err = AweConfig::parse("queue:\n  backend: condor\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
    }
}
