//! Colour transition log.
//!
//! After every iteration the weight that crossed between sink regions is
//! appended to `color-transitions.csv`, one row per `(from, to)` pair. An
//! iteration without any crossing still writes a zero row so the file has
//! one entry per iteration. A failed write is logged and never ends the run.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use awe_core::{IterationCallback, IterationSummary, System};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Serialize)]
struct TransitionRow {
    iteration: u64,
    from: Option<u32>,
    to: Option<u32>,
    weight: f64,
}

/// Appends colour flux to a CSV file.
#[derive(Debug)]
pub struct TransitionLog {
    path: PathBuf,
    failures: u64,
}

impl TransitionLog {
    /// Log to `path`, which is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            failures: 0,
        }
    }

    /// The transitions file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes that failed.
    pub const fn failures(&self) -> u64 {
        self.failures
    }

    fn append(&self, summary: &IterationSummary) -> Result<(), csv::Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let fresh = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);

        if summary.flux.is_empty() {
            writer.serialize(TransitionRow {
                iteration: summary.iteration,
                from: None,
                to: None,
                weight: 0.0,
            })?;
        }
        for ((from, to), weight) in summary.flux.moves() {
            writer.serialize(TransitionRow {
                iteration: summary.iteration,
                from: from.map(|c| c.0),
                to: to.map(|c| c.0),
                weight,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl IterationCallback for TransitionLog {
    fn on_iteration(&mut self, summary: &IterationSummary, _system: &System) {
        if let Err(e) = self.append(summary) {
            self.failures = self.failures.saturating_add(1);
            warn!(
                path = %self.path.display(),
                iteration = summary.iteration,
                error = %e,
                "Failed to append colour transitions"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use awe_core::ColorFlux;
    use awe_core::controller::CheckpointStatus;
    use awe_types::Color;

    use super::*;

    fn summary(iteration: u64, flux: ColorFlux) -> IterationSummary {
        IterationSummary {
            iteration,
            walkers_in: 4,
            walkers_out: 4,
            advanced: 4,
            dropped: 0,
            retained: 0,
            submitted: 4,
            transient_failures: 0,
            duplicates: 0,
            fast_aborts: 0,
            flux,
            color_weights: BTreeMap::new(),
            checkpoint: CheckpointStatus::Saved,
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn rows_accumulate_under_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("color-transitions.csv");
        let mut log = TransitionLog::new(&path);

        let mut flux = ColorFlux::default();
        flux.record(Some(Color(0)), Some(Color(1)), 0.25);
        log.on_iteration(&summary(0, flux), &System::new());
        log.on_iteration(&summary(1, ColorFlux::default()), &System::new());

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec!["iteration,from,to,weight", "0,0,1,0.25", "1,,,0.0"]
        );
        assert_eq!(log.failures(), 0);
    }

    #[test]
    fn unwritable_path_is_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TransitionLog::new(dir.path().join("missing").join("t.csv"));
        log.on_iteration(&summary(0, ColorFlux::default()), &System::new());
        assert_eq!(log.failures(), 1);
    }
}
