//! Weighted-ensemble resampling.
//!
//! A [`Resampler`] turns the evaluated population of one iteration into the
//! next iteration's population. Two implementations are provided:
//!
//! - [`MultiColor`] -- recolours walkers that entered another sink region,
//!   then, independently per colour class and per occupied cell, draws a
//!   fixed number of children from the cell's walkers with probability
//!   proportional to weight. Each child carries an equal share of the
//!   cell's weight, so the cell (and therefore the colour) keeps exactly the
//!   weight it had.
//! - [`SaveWeights`] -- a pass-through decorator that appends the
//!   pre-resampling weights to a CSV file before delegating.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use awe_types::Color;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, trace};

use crate::system::{SinkStates, System, SystemError};

/// Errors that can occur while resampling.
#[derive(Debug, thiserror::Error)]
pub enum ResampleError {
    /// The per-cell walker target must be positive.
    #[error("target walker count must be at least 1")]
    InvalidTarget,

    /// Building the output population failed.
    #[error("system error: {source}")]
    System {
        /// The underlying system error.
        #[from]
        source: SystemError,
    },

    /// Writing the weights file failed.
    #[error("failed to write weights file {path}: {source}")]
    Io {
        /// The weights file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Encoding a weights row failed.
    #[error("failed to encode weights row: {source}")]
    Csv {
        /// The underlying CSV error.
        #[from]
        source: csv::Error,
    },
}

/// Weight that moved between colour classes in one iteration.
///
/// Keys are `(from, to)`; only actual changes are recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorFlux {
    moves: BTreeMap<(Option<Color>, Option<Color>), f64>,
}

impl ColorFlux {
    /// Record `weight` moving from one colour to another.
    pub fn record(&mut self, from: Option<Color>, to: Option<Color>, weight: f64) {
        if from != to {
            *self.moves.entry((from, to)).or_insert(0.0) += weight;
        }
    }

    /// Weight moved from `from` to `to`.
    pub fn get(&self, from: Option<Color>, to: Option<Color>) -> f64 {
        self.moves.get(&(from, to)).copied().unwrap_or(0.0)
    }

    /// All recorded moves.
    pub fn moves(&self) -> impl Iterator<Item = ((Option<Color>, Option<Color>), f64)> + '_ {
        self.moves.iter().map(|(&key, &weight)| (key, weight))
    }

    /// Whether no weight changed colour.
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Per-colour totals after applying these moves to `before`.
    pub fn apply(&self, before: &BTreeMap<Option<Color>, f64>) -> BTreeMap<Option<Color>, f64> {
        let mut after = before.clone();
        for (&(from, to), &weight) in &self.moves {
            *after.entry(from).or_insert(0.0) -= weight;
            *after.entry(to).or_insert(0.0) += weight;
        }
        after
    }
}

/// Output of one resampling step.
#[derive(Debug, Clone)]
pub struct Resampled {
    /// The next iteration's population.
    pub system: System,
    /// Colour changes applied before resampling.
    pub flux: ColorFlux,
}

/// A resampling strategy.
pub trait Resampler: Send {
    /// Produce the next population from the evaluated one.
    ///
    /// Implementations must preserve the total weight of every colour class,
    /// except for weight moved by recolouring, which must be reported in
    /// [`Resampled::flux`].
    fn resample(&mut self, iteration: u64, system: &System) -> Result<Resampled, ResampleError>;
}

/// Colour-aware multinomial resampling.
#[derive(Debug, Clone)]
pub struct MultiColor {
    target_walkers: usize,
    partition: Arc<SinkStates>,
    seed: u64,
}

impl MultiColor {
    /// Create a resampler keeping `target_walkers` walkers per occupied
    /// `(colour, cell)` bucket.
    pub fn new(
        target_walkers: usize,
        partition: Arc<SinkStates>,
        seed: u64,
    ) -> Result<Self, ResampleError> {
        if target_walkers == 0 {
            return Err(ResampleError::InvalidTarget);
        }
        Ok(Self {
            target_walkers,
            partition,
            seed,
        })
    }

    /// Walkers kept per occupied bucket.
    pub const fn target_walkers(&self) -> usize {
        self.target_walkers
    }

    /// RNG for one iteration; identical across a crash and resume.
    fn rng_for(&self, iteration: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ iteration.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    /// Reassign colours from the partition and return the recoloured
    /// population together with the weight that moved.
    fn recolor(&self, system: &System) -> Result<(System, ColorFlux), ResampleError> {
        let mut flux = ColorFlux::default();
        let mut recolored = system.empty_like();
        for walker in system.walkers() {
            let color = self.partition.color(walker.cell_id).or(walker.color);
            flux.record(walker.color, color, walker.weight);
            recolored.add_walker(walker.cell_id, color, walker.weight, walker.start.clone())?;
        }
        Ok((recolored, flux))
    }
}

impl Resampler for MultiColor {
    fn resample(&mut self, iteration: u64, system: &System) -> Result<Resampled, ResampleError> {
        let (recolored, flux) = self.recolor(system)?;
        let mut rng = self.rng_for(iteration);
        let mut next = system.empty_like();

        for ((color, cell), walkers) in recolored.buckets() {
            let weights: Vec<f64> = walkers.iter().map(|w| w.weight).collect();
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                debug!(iteration, %cell, "dropping weightless cell");
                continue;
            }

            let counts = multinomial(&mut rng, &weights, total, self.target_walkers);
            let child_weight = (total / self.target_walkers as f64).min(1.0);
            for (parent, &count) in walkers.iter().zip(&counts) {
                for _ in 0..count {
                    next.add_walker(cell, color, child_weight, parent.start.clone())?;
                }
            }
            trace!(
                iteration,
                %cell,
                color = ?color,
                parents = walkers.len(),
                survivors = counts.iter().filter(|&&c| c > 0).count(),
                "resampled cell"
            );
        }

        debug!(
            iteration,
            walkers_in = system.walker_count(),
            walkers_out = next.walker_count(),
            recolored = !flux.is_empty(),
            "multicolor resampling complete"
        );
        Ok(Resampled { system: next, flux })
    }
}

/// Draw `draws` samples over `weights` (summing to `total`) and count how
/// often each index was picked.
fn multinomial(rng: &mut StdRng, weights: &[f64], total: f64, draws: usize) -> Vec<usize> {
    let cumulative: Vec<f64> = weights
        .iter()
        .scan(0.0, |acc, &w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    let last = weights.len().saturating_sub(1);

    let mut counts = vec![0_usize; weights.len()];
    for _ in 0..draws {
        let u = rng.random::<f64>() * total;
        let index = cumulative.partition_point(|&c| c <= u).min(last);
        if let Some(count) = counts.get_mut(index) {
            *count = count.saturating_add(1);
        }
    }
    counts
}

/// One line of the weights file.
#[derive(Debug, Serialize)]
struct WeightRow {
    iteration: u64,
    walker: u64,
    cell: u64,
    color: Option<u32>,
    weight: f64,
}

/// Decorator that records the pre-resampling weights, then delegates.
#[derive(Debug)]
pub struct SaveWeights<R> {
    inner: R,
    path: PathBuf,
}

impl<R: Resampler> SaveWeights<R> {
    /// Wrap `inner`, appending rows to the CSV file at `path`.
    pub fn new(inner: R, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }

    /// The weights file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The wrapped strategy.
    pub const fn inner(&self) -> &R {
        &self.inner
    }

    fn append(&self, iteration: u64, system: &System) -> Result<(), ResampleError> {
        let io_err = |source| ResampleError::Io {
            path: self.path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let fresh = file.metadata().map_err(io_err)?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(file);
        for walker in system.walkers() {
            writer.serialize(WeightRow {
                iteration,
                walker: walker.id.0,
                cell: walker.cell_id.0,
                color: walker.color.map(|c| c.0),
                weight: walker.weight,
            })?;
        }
        writer.flush().map_err(io_err)?;
        Ok(())
    }
}

impl<R: Resampler> Resampler for SaveWeights<R> {
    fn resample(&mut self, iteration: u64, system: &System) -> Result<Resampled, ResampleError> {
        self.append(iteration, system)?;
        self.inner.resample(iteration, system)
    }
}
