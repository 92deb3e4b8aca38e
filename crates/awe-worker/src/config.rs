//! Worker configuration.
//!
//! All configuration is loaded from environment variables. A worker needs to
//! know how to reach NATS, which namespace its engine publishes under, where
//! the staged files live, and how many tasks to run at once.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::WorkerError;

/// Default NATS URL, matching the engine's default port.
const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:9123";

/// Default subject namespace (the engine's standalone mode).
const DEFAULT_NAMESPACE: &str = "awe.default";

/// Default heartbeat period in milliseconds.
const DEFAULT_HEARTBEAT_MS: u64 = 2000;

/// Default pause between manifest requests while the engine is not up.
const DEFAULT_MANIFEST_RETRY_MS: u64 = 1000;

/// Complete worker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// NATS server URL.
    pub nats_url: String,
    /// Subject namespace, e.g. `awe.default` or `awe.<project>`.
    pub namespace: String,
    /// Name reported in heartbeats and resource usage.
    pub name: String,
    /// Directory the manifest's staged paths are resolved under.
    pub data_root: PathBuf,
    /// Directory holding per-task sandboxes.
    pub work_dir: PathBuf,
    /// Concurrent task slots.
    pub slots: usize,
    /// Heartbeat period.
    pub heartbeat: Duration,
    /// Pause between manifest requests.
    pub manifest_retry: Duration,
    /// Leave sandboxes on disk after a task finishes.
    pub keep_sandboxes: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `AWE_NATS_URL` -- NATS server (default `nats://127.0.0.1:9123`)
    /// - `AWE_NAMESPACE` -- subject namespace (default `awe.default`)
    /// - `AWE_WORKER_NAME` -- worker name, unique per run (default
    ///   `<HOSTNAME>-<pid>`, or `worker-<pid>` without `HOSTNAME`)
    /// - `AWE_DATA_ROOT` -- staged file root (default `.`)
    /// - `AWE_WORK_DIR` -- sandbox root (default `<tmp>/awe-worker`)
    /// - `AWE_SLOTS` -- concurrent tasks (default: available parallelism)
    /// - `AWE_HEARTBEAT_MS` -- heartbeat period (default 2000)
    /// - `AWE_MANIFEST_RETRY_MS` -- manifest retry pause (default 1000)
    /// - `AWE_KEEP_SANDBOXES` -- keep task directories (default `false`)
    pub fn from_env() -> Result<Self, WorkerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, WorkerError> {
        let nats_url = lookup("AWE_NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.to_owned());
        let namespace = lookup("AWE_NAMESPACE").unwrap_or_else(|| DEFAULT_NAMESPACE.to_owned());
        let name = lookup("AWE_WORKER_NAME")
            .unwrap_or_else(|| {
                let host = lookup("HOSTNAME").unwrap_or_else(|| "worker".to_owned());
                format!("{host}-{}", std::process::id())
            });
        let data_root = lookup("AWE_DATA_ROOT").map_or_else(|| PathBuf::from("."), PathBuf::from);
        let work_dir = lookup("AWE_WORK_DIR").map_or_else(
            || std::env::temp_dir().join("awe-worker"),
            PathBuf::from,
        );

        let slots = match lookup("AWE_SLOTS") {
            Some(raw) => parse::<usize>("AWE_SLOTS", &raw)?,
            None => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        };
        if slots == 0 {
            return Err(WorkerError::Config("AWE_SLOTS must be at least 1".to_owned()));
        }

        let heartbeat_ms = lookup("AWE_HEARTBEAT_MS")
            .map(|raw| parse::<u64>("AWE_HEARTBEAT_MS", &raw))
            .transpose()?
            .unwrap_or(DEFAULT_HEARTBEAT_MS);
        let manifest_retry_ms = lookup("AWE_MANIFEST_RETRY_MS")
            .map(|raw| parse::<u64>("AWE_MANIFEST_RETRY_MS", &raw))
            .transpose()?
            .unwrap_or(DEFAULT_MANIFEST_RETRY_MS);
        let keep_sandboxes = lookup("AWE_KEEP_SANDBOXES")
            .map(|raw| parse::<bool>("AWE_KEEP_SANDBOXES", &raw))
            .transpose()?
            .unwrap_or(false);

        Ok(Self {
            nats_url,
            namespace,
            name,
            data_root,
            work_dir,
            slots,
            heartbeat: Duration::from_millis(heartbeat_ms.max(1)),
            manifest_retry: Duration::from_millis(manifest_retry_ms.max(1)),
            keep_sandboxes,
        })
    }
}

fn parse<T>(name: &str, raw: &str) -> Result<T, WorkerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| WorkerError::Config(format!("invalid {name}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.nats_url, DEFAULT_NATS_URL);
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.data_root, PathBuf::from("."));
        assert!(config.slots >= 1);
        assert_eq!(config.heartbeat, Duration::from_secs(2));
        assert!(!config.keep_sandboxes);
        assert!(config.name.starts_with("worker-"));
    }

    #[test]
    fn variables_override_defaults() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("AWE_NATS_URL", "nats://queue:4222"),
            ("AWE_NAMESPACE", "awe.ala"),
            ("AWE_WORKER_NAME", "node-7"),
            ("AWE_DATA_ROOT", "/srv/awe"),
            ("AWE_WORK_DIR", "/scratch/awe"),
            ("AWE_SLOTS", " 8 "),
            ("AWE_HEARTBEAT_MS", "500"),
            ("AWE_KEEP_SANDBOXES", "true"),
        ]))
        .unwrap();
        assert_eq!(config.nats_url, "nats://queue:4222");
        assert_eq!(config.namespace, "awe.ala");
        assert_eq!(config.name, "node-7");
        assert_eq!(config.data_root, PathBuf::from("/srv/awe"));
        assert_eq!(config.work_dir, PathBuf::from("/scratch/awe"));
        assert_eq!(config.slots, 8);
        assert_eq!(config.heartbeat, Duration::from_millis(500));
        assert!(config.keep_sandboxes);
    }

    #[test]
    fn default_name_uses_the_host() {
        let config = WorkerConfig::from_lookup(lookup(&[("HOSTNAME", "gpu-04")])).unwrap();
        assert_eq!(config.name, format!("gpu-04-{}", std::process::id()));
    }

    #[test]
    fn zero_slots_is_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("AWE_SLOTS", "0")])).unwrap_err();
        assert!(matches!(err, WorkerError::Config(_)));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("AWE_HEARTBEAT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("AWE_HEARTBEAT_MS"));
    }
}
