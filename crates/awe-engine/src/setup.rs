//! Builds the starting state of a run.
//!
//! The initial ensemble is the classic two-colour layout: cells
//! `[0, split)` form sink region 0 and `[split, nstates)` sink region 1.
//! The first third of the cells is tagged core 0 and the last third core 1.
//! Every cell starts with `nwalkers` walkers whose snapshots are read from
//! the walker template and whose weights are drawn at random, then
//! normalized to sum to one.

use std::path::PathBuf;

use awe_core::config::{AweConfig, EnsembleConfig};
use awe_core::{SinkStates, System};
use awe_types::{Cell, CellId, Color, Snapshot, StagingManifest};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::error::EngineError;

/// Colour of the cells below the split.
pub const LOW_COLOR: Color = Color(0);

/// Colour of the cells at or above the split.
pub const HIGH_COLOR: Color = Color(1);

/// Two sink regions split at `ensemble.split`.
pub fn partition(ensemble: &EnsembleConfig) -> Result<SinkStates, EngineError> {
    let split = ensemble.split();
    let mut sinks = SinkStates::new();
    sinks.add(LOW_COLOR, (0..split).map(CellId))?;
    sinks.add(HIGH_COLOR, (split..ensemble.nstates).map(CellId))?;
    Ok(sinks)
}

/// Core tag of a cell: the first third is core 0, the last third core 1.
pub fn core_of(cell: u64, nstates: u64) -> Option<u32> {
    if cell < nstates / 3 {
        Some(0)
    } else if cell > nstates.saturating_mul(2) / 3 {
        Some(1)
    } else {
        None
    }
}

/// Path of a walker's initial snapshot.
pub fn snapshot_path(template: &str, cell: u64, walker: usize) -> PathBuf {
    PathBuf::from(
        template
            .replace("{cell}", &cell.to_string())
            .replace("{walker}", &walker.to_string()),
    )
}

/// Build the initial population, reading snapshots from disk.
pub async fn initial_system(
    ensemble: &EnsembleConfig,
    sinks: &SinkStates,
    seed: u64,
) -> Result<System, EngineError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut system = System::new();

    for id in 0..ensemble.nstates {
        let cell_id = CellId(id);
        let color = sinks.color(cell_id);
        let cell = match core_of(id, ensemble.nstates) {
            Some(core) => Cell::with_core(cell_id, core),
            None => Cell::new(cell_id),
        };
        system.add_cell(cell.colored(color))?;

        for walker in 0..ensemble.nwalkers {
            let path = snapshot_path(&ensemble.walker_template, id, walker);
            let data = tokio::fs::read(&path)
                .await
                .map_err(|source| EngineError::Snapshot {
                    path: path.clone(),
                    source,
                })?;
            let weight: f64 = rng.random();
            system.add_walker(cell_id, color, weight, Snapshot::from(data))?;
        }
        debug!(cell = id, walkers = ensemble.nwalkers, "Cell loaded");
    }

    system.normalize_weights();
    system.validate()?;
    info!(
        cells = system.cell_count(),
        walkers = system.walker_count(),
        colors = sinks.ncolors(),
        "Initial population built"
    );
    Ok(system)
}

/// Files registered for every task: the execute script, the configured
/// cache, and the topology when one is named.
pub fn staging_manifest(config: &AweConfig) -> StagingManifest {
    let mut manifest = StagingManifest::new(config.staging.execute.clone());
    for entry in &config.staging.cache {
        manifest.cache(entry.clone());
    }
    if let Some(topology) = &config.ensemble.topology {
        manifest.cache(topology.to_string_lossy().into_owned());
    }
    manifest
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn ensemble(dir: &std::path::Path, nstates: u64, nwalkers: usize) -> EnsembleConfig {
        EnsembleConfig {
            nstates,
            nwalkers,
            walker_template: dir
                .join("State{cell}-{walker}.pdb")
                .to_string_lossy()
                .into_owned(),
            ..EnsembleConfig::default()
        }
    }

    fn write_snapshots(dir: &std::path::Path, nstates: u64, nwalkers: usize) {
        for cell in 0..nstates {
            for walker in 0..nwalkers {
                let path = dir.join(format!("State{cell}-{walker}.pdb"));
                std::fs::write(path, format!("MODEL {cell} {walker}\n")).unwrap();
            }
        }
    }

    #[test]
    fn cores_cover_the_outer_thirds() {
        let cores: Vec<Option<u32>> = (0..10).map(|c| core_of(c, 10)).collect();
        assert_eq!(cores[0], Some(0));
        assert_eq!(cores[2], Some(0));
        assert_eq!(cores[3], None);
        assert_eq!(cores[6], None);
        assert_eq!(cores[7], Some(1));
        assert_eq!(cores[9], Some(1));
    }

    #[test]
    fn partition_splits_at_half_by_default() {
        let config = EnsembleConfig::default();
        let sinks = partition(&config).unwrap();
        assert_eq!(sinks.color(CellId(0)), Some(LOW_COLOR));
        assert_eq!(sinks.color(CellId(49)), Some(LOW_COLOR));
        assert_eq!(sinks.color(CellId(50)), Some(HIGH_COLOR));
        assert_eq!(sinks.color(CellId(99)), Some(HIGH_COLOR));
        assert_eq!(sinks.color(CellId(100)), None);
    }

    #[test]
    fn template_substitutes_cell_and_walker() {
        let path = snapshot_path("pdbs/State{cell}-{walker}.pdb", 12, 3);
        assert_eq!(path, PathBuf::from("pdbs/State12-3.pdb"));
    }

    #[tokio::test]
    async fn initial_population_is_normalized_and_coloured() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshots(dir.path(), 6, 2);
        let config = ensemble(dir.path(), 6, 2);
        let sinks = partition(&config).unwrap();

        let system = initial_system(&config, &sinks, 42).await.unwrap();
        assert_eq!(system.cell_count(), 6);
        assert_eq!(system.walker_count(), 12);
        assert!((system.total_weight() - 1.0).abs() < 1e-12);
        for walker in system.walkers() {
            assert_eq!(walker.color, sinks.color(walker.cell_id));
        }
        assert_eq!(system.cell(CellId(0)).unwrap().core, Some(0));
        assert_eq!(system.cell(CellId(5)).unwrap().core, Some(1));
        assert_eq!(system.walkers()[3].start.as_bytes(), b"MODEL 1 1\n");
    }

    #[tokio::test]
    async fn same_seed_gives_same_weights() {
        let dir = tempfile::tempdir().unwrap();
        write_snapshots(dir.path(), 4, 3);
        let config = ensemble(dir.path(), 4, 3);
        let sinks = partition(&config).unwrap();

        let a = initial_system(&config, &sinks, 7).await.unwrap();
        let b = initial_system(&config, &sinks, 7).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn missing_snapshot_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ensemble(dir.path(), 2, 1);
        let sinks = partition(&config).unwrap();
        let err = initial_system(&config, &sinks, 1).await.unwrap_err();
        assert!(matches!(err, EngineError::Snapshot { ref path, .. } if path.ends_with("State0-0.pdb")));
    }

    #[test]
    fn manifest_includes_cache_and_topology() {
        let mut config = AweConfig::default();
        config.staging.cache = vec!["bin/$OS-$ARCH/mdrun".to_owned(), "sim.mdp".to_owned()];
        config.ensemble.topology = Some(PathBuf::from("topol.pdb"));
        let manifest = staging_manifest(&config);
        assert_eq!(manifest.execute, "execute-task.sh");
        assert_eq!(manifest.cache, vec!["bin/$OS-$ARCH/mdrun", "sim.mdp", "topol.pdb"]);
    }
}
