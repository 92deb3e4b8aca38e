//! Per-task sandboxes running the staged execute script.
//!
//! Each task gets a fresh directory under the work dir. Every staged file is
//! linked in by file name, the walker's snapshot is written as
//! `structure.pdb`, and the execute script runs with the sandbox as its
//! working directory. A successful script leaves the new snapshot in
//! `structure2.pdb` and the assigned cell id in `cell2.dat`.
//!
//! ```text
//! task-17/
//!   execute-task.sh -> <data_root>/awe-instance-data/execute-task.sh
//!   mdrun           -> <data_root>/awe-generic-data/binaries/Linux-x86_64/mdrun
//!   structure.pdb      (input)
//!   structure2.pdb     (output)
//!   cell2.dat          (output)
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use awe_core::TaskRunner;
use awe_types::staging::platform_os;
use awe_types::{CellId, Snapshot, StagingManifest, TaskOutcome, TaskOutput, TaskSpec};
use tokio::process::Command;
use tracing::{debug, warn};

/// Snapshot handed to the script.
pub const INPUT_FILE: &str = "structure.pdb";

/// Snapshot the script leaves behind.
pub const OUTPUT_FILE: &str = "structure2.pdb";

/// Cell assignment the script leaves behind.
pub const CELL_FILE: &str = "cell2.dat";

/// Bytes of script stderr kept in a failure reason.
const STDERR_TAIL: usize = 512;

/// Why one task could not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Filesystem work around the script failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A staged path does not exist under the data root.
    #[error("staged file not found: {}", .0.display())]
    Missing(PathBuf),

    /// The script exited unsuccessfully.
    #[error("task script failed (exit code {exit_code:?}): {stderr}")]
    Script {
        /// Exit code, if the script was not killed by a signal.
        exit_code: Option<i32>,
        /// Tail of the script's stderr.
        stderr: String,
    },

    /// The script succeeded but left an expected output missing.
    #[error("task script did not write {0}")]
    MissingOutput(&'static str),

    /// `cell2.dat` does not hold a cell id.
    #[error("invalid cell assignment {0:?}")]
    Assignment(String),
}

impl SandboxError {
    /// Script exit code, when the failure came from the script itself.
    pub const fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Script { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

/// A finished script run.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    /// New snapshot and cell.
    pub output: TaskOutput,
    /// Script exit code.
    pub exit_code: Option<i32>,
}

/// Runs tasks by executing the staged script in a sandbox directory.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    data_root: PathBuf,
    work_dir: PathBuf,
    manifest: StagingManifest,
    os: String,
    arch: String,
    keep_sandboxes: bool,
}

impl ScriptRunner {
    /// Create a runner for this machine's platform.
    pub fn new(
        data_root: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        manifest: StagingManifest,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            work_dir: work_dir.into(),
            manifest,
            os: platform_os().to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            keep_sandboxes: false,
        }
    }

    /// Resolve `$OS` and `$ARCH` for another platform.
    #[must_use]
    pub fn with_platform(mut self, os: impl Into<String>, arch: impl Into<String>) -> Self {
        self.os = os.into();
        self.arch = arch.into();
        self
    }

    /// Leave sandboxes on disk after each task.
    #[must_use]
    pub const fn keep_sandboxes(mut self, keep: bool) -> Self {
        self.keep_sandboxes = keep;
        self
    }

    /// The manifest this runner stages.
    pub const fn manifest(&self) -> &StagingManifest {
        &self.manifest
    }

    /// Staged paths for this platform, script first.
    pub fn staged(&self) -> Vec<PathBuf> {
        self.manifest.resolve(&self.data_root, &self.os, &self.arch)
    }

    /// Fail fast if any staged path is missing.
    pub async fn check_staging(&self) -> Result<(), SandboxError> {
        for path in self.staged() {
            if !exists(&path).await {
                return Err(SandboxError::Missing(path));
            }
        }
        Ok(())
    }

    /// Run one task to completion.
    ///
    /// The sandbox is removed afterwards unless sandboxes are kept. A task
    /// aborted mid-run leaves its sandbox behind; the next task with the same
    /// id replaces it.
    pub async fn execute(&self, spec: &TaskSpec) -> Result<Execution, SandboxError> {
        let dir = self.work_dir.join(format!("task-{}", spec.task_id));
        let result = self.execute_in(&dir, spec).await;
        if !self.keep_sandboxes {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove sandbox");
                }
            }
        }
        result
    }

    async fn execute_in(&self, dir: &Path, spec: &TaskSpec) -> Result<Execution, SandboxError> {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(dir = %dir.display(), "Replaced stale sandbox"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SandboxError::io("clearing sandbox")(e)),
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(SandboxError::io("creating sandbox"))?;

        let staged = self.staged();
        for path in &staged {
            link_into(path, dir).await?;
        }
        let script = staged
            .first()
            .and_then(|p| p.file_name())
            .ok_or_else(|| SandboxError::Missing(PathBuf::from(&self.manifest.execute)))?;

        tokio::fs::write(dir.join(INPUT_FILE), spec.snapshot.as_bytes())
            .await
            .map_err(SandboxError::io("writing input snapshot"))?;

        debug!(
            task_id = %spec.task_id,
            walker_id = %spec.walker_id,
            iteration = spec.iteration,
            "Running task script"
        );
        let output = Command::new("sh")
            .arg(script)
            .current_dir(dir)
            .env("AWE_TASK_ID", spec.task_id.to_string())
            .env("AWE_WALKER_ID", spec.walker_id.to_string())
            .env("AWE_ITERATION", spec.iteration.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(SandboxError::io("spawning task script"))?;

        if !output.status.success() {
            return Err(SandboxError::Script {
                exit_code: output.status.code(),
                stderr: tail(&output.stderr),
            });
        }

        let snapshot = read_output(dir, OUTPUT_FILE).await?;
        let assignment = read_output(dir, CELL_FILE).await?;
        let cell_id = parse_cell(&assignment)?;

        Ok(Execution {
            output: TaskOutput {
                snapshot: Snapshot::from(snapshot),
                cell_id,
            },
            exit_code: output.status.code(),
        })
    }
}

impl TaskRunner for ScriptRunner {
    async fn run(&self, spec: TaskSpec) -> TaskOutcome {
        match self.execute(&spec).await {
            Ok(execution) => TaskOutcome::Succeeded(execution.output),
            Err(e) => {
                warn!(task_id = %spec.task_id, error = %e, "Task failed");
                TaskOutcome::failed(e.to_string())
            }
        }
    }
}

/// Parse the decimal cell id the assignment step writes.
pub fn parse_cell(raw: &[u8]) -> Result<CellId, SandboxError> {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    match trimmed.parse::<u64>() {
        Ok(id) => Ok(CellId(id)),
        Err(_) => Err(SandboxError::Assignment(trimmed.to_owned())),
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn link_into(path: &Path, dir: &Path) -> Result<(), SandboxError> {
    if !exists(path).await {
        return Err(SandboxError::Missing(path.to_path_buf()));
    }
    let Some(name) = path.file_name() else {
        return Err(SandboxError::Missing(path.to_path_buf()));
    };
    let source = std::path::absolute(path).map_err(SandboxError::io("resolving staged path"))?;
    let target = dir.join(name);

    #[cfg(unix)]
    tokio::fs::symlink(&source, &target)
        .await
        .map_err(SandboxError::io(format!("linking {}", source.display())))?;

    #[cfg(not(unix))]
    tokio::fs::copy(&source, &target)
        .await
        .map_err(SandboxError::io(format!("copying {}", source.display())))?;

    Ok(())
}

async fn read_output(dir: &Path, name: &'static str) -> Result<Vec<u8>, SandboxError> {
    match tokio::fs::read(dir.join(name)).await {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SandboxError::MissingOutput(name)),
        Err(e) => Err(SandboxError::io(format!("reading {name}"))(e)),
    }
}

fn tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim_end();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    text.get(start..).unwrap_or_default().to_owned()
}
