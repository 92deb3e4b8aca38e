//! Files and binaries made available read-only to every worker.
//!
//! The manifest is path-addressed: workers resolve each entry under their
//! own data root. `$OS` and `$ARCH` placeholders are expanded per worker so
//! one manifest can name platform-specific binaries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Registered task script and cached inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingManifest {
    /// The script every task runs.
    pub execute: String,
    /// Shared read-only inputs linked into each task sandbox.
    pub cache: Vec<String>,
}

impl StagingManifest {
    /// Create a manifest around the task script.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            cache: Vec::new(),
        }
    }

    /// Register a cached input. Duplicates are ignored.
    pub fn cache(&mut self, path: impl Into<String>) -> &mut Self {
        let path = path.into();
        if !self.cache.contains(&path) {
            self.cache.push(path);
        }
        self
    }

    /// Resolve every entry (script first) for the given platform under `root`.
    pub fn resolve(&self, root: &Path, os: &str, arch: &str) -> Vec<PathBuf> {
        std::iter::once(&self.execute)
            .chain(self.cache.iter())
            .map(|entry| root.join(expand_platform(entry, os, arch)))
            .collect()
    }
}

/// Substitute `$OS` and `$ARCH` in a staged path.
pub fn expand_platform(path: &str, os: &str, arch: &str) -> String {
    path.replace("$OS", os).replace("$ARCH", arch)
}

/// Platform name in the `uname -s` spelling used by binary directories.
pub fn platform_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "Darwin",
        "freebsd" => "FreeBSD",
        "windows" => "Windows",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_platform_placeholders() {
        assert_eq!(
            expand_platform("bin/$OS-$ARCH/mdrun", "Linux", "x86_64"),
            "bin/Linux-x86_64/mdrun"
        );
    }

    #[test]
    fn cache_ignores_duplicates() {
        let mut manifest = StagingManifest::new("execute-task.sh");
        manifest.cache("sim.mdp").cache("sim.mdp").cache("env.sh");
        assert_eq!(manifest.cache, vec!["sim.mdp", "env.sh"]);
    }

    #[test]
    fn resolve_puts_script_first() {
        let mut manifest = StagingManifest::new("run.sh");
        manifest.cache("bin/$OS/tool");
        let paths = manifest.resolve(Path::new("/data"), "Linux", "aarch64");
        assert_eq!(
            paths,
            vec![PathBuf::from("/data/run.sh"), PathBuf::from("/data/bin/Linux/tool")]
        );
    }
}
