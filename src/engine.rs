use crate::error::AnalysisError;
use crate::model::{OutputGrid, Series};
use crate::smoother::{CurveFit, Mode, check_cutoff};
use crate::stats::{Accumulator, Summary};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Realizations reduced sequentially by one task.
const REALIZATIONS_PER_CHUNK: usize = 64;

/// Parameters of the Monte Carlo propagation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineParams {
    /// Filter cutoff of the smoother, in days.
    pub cutoff_period: f64,
    /// Number of perturbed realizations.
    pub n_iterations: usize,
    /// Seed of the random number generator.
    pub seed: u64,
}

/// Monte Carlo uncertainty propagation engine.
///
/// Perturbs each observation within its uncertainty, smooths every perturbed
/// realization and reduces the resulting curves to a mean and standard
/// deviation at each output time.
///
/// Realization `i` draws from stream `i` of a ChaCha12 generator seeded with
/// the engine seed, so realizations are independent of each other and of the
/// order in which worker threads pick them up.
#[derive(Debug, Clone)]
pub struct Engine {
    params: EngineParams,
}

impl Engine {
    /// # Errors
    /// Returns [`AnalysisError::InvalidParameter`] for a non-positive cutoff or
    /// zero iterations.
    pub fn new(params: EngineParams) -> Result<Self, AnalysisError> {
        check_cutoff(params.cutoff_period)?;
        if params.n_iterations == 0 {
            return Err(AnalysisError::invalid(
                "n_iterations",
                "must be positive, but is 0",
            ));
        }
        if params.n_iterations == 1 {
            log::warn!("a single realization gives no uncertainty estimate");
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Engine with the same parameters and an independent seed derived from `key`.
    pub fn derive(&self, key: u64) -> Self {
        // Realizations use the low streams.
        let mut seeder = ChaCha12Rng::seed_from_u64(self.params.seed);
        seeder.set_stream(u64::MAX - key);
        Self {
            params: EngineParams {
                seed: seeder.random(),
                ..self.params
            },
        }
    }

    /// Propagate the uncertainty of `series` through the smoother onto `grid`.
    ///
    /// # Errors
    /// Fails with the error of the first failing realization; no partial
    /// ensemble is ever summarized.
    pub fn propagate(
        &self,
        series: &Series,
        grid: &OutputGrid,
        mode: Mode,
    ) -> Result<Summary, AnalysisError> {
        let n_iterations = self.params.n_iterations;
        let n_chunks = n_iterations.div_ceil(REALIZATIONS_PER_CHUNK);

        let chunk_acc_vecs = (0..n_chunks)
            .into_par_iter()
            .map(|i_chunk| -> Result<Vec<Accumulator>, AnalysisError> {
                let i_first = i_chunk * REALIZATIONS_PER_CHUNK;
                let i_last = (i_first + REALIZATIONS_PER_CHUNK).min(n_iterations);

                let mut acc_vec = vec![Accumulator::new(); grid.len()];
                for i_real in i_first..i_last {
                    let row = self.perform_realization(i_real, series, grid, mode)?;
                    for (acc, val) in acc_vec.iter_mut().zip(row) {
                        acc.add(val);
                    }
                }
                Ok(acc_vec)
            })
            .collect::<Result<Vec<_>, AnalysisError>>()?;

        // Merge in chunk order so the result does not depend on scheduling.
        let mut acc_vec = vec![Accumulator::new(); grid.len()];
        for chunk_acc_vec in &chunk_acc_vecs {
            for (acc, chunk_acc) in acc_vec.iter_mut().zip(chunk_acc_vec) {
                acc.merge(chunk_acc);
            }
        }

        Ok(Summary::from_accumulators(
            mode,
            grid.times(),
            &extrapolated_flags(series, grid),
            &acc_vec,
        ))
    }

    /// Generate every realization and keep them all.
    ///
    /// Uses the same random streams as [`Engine::propagate`], so summarizing the
    /// ensemble reproduces its result up to rounding.
    pub fn generate_ensemble(
        &self,
        series: &Series,
        grid: &OutputGrid,
        mode: Mode,
    ) -> Result<Ensemble, AnalysisError> {
        let rows = (0..self.params.n_iterations)
            .into_par_iter()
            .map(|i_real| self.perform_realization(i_real, series, grid, mode))
            .collect::<Result<Vec<_>, AnalysisError>>()?;

        Ok(Ensemble {
            mode,
            times: grid.times().to_vec(),
            extrapolated: extrapolated_flags(series, grid),
            rows,
        })
    }

    fn perform_realization(
        &self,
        i_real: usize,
        series: &Series,
        grid: &OutputGrid,
        mode: Mode,
    ) -> Result<Vec<f64>, AnalysisError> {
        let mut rng = ChaCha12Rng::seed_from_u64(self.params.seed);
        rng.set_stream(i_real as u64);

        let values = perturb_values(series, &mut rng);
        let fit = CurveFit::new(series.times(), &values, self.params.cutoff_period)?;

        let row: Vec<f64> = grid
            .times()
            .iter()
            .map(|&time| fit.evaluate(time, mode))
            .collect();
        if row.iter().any(|val| !val.is_finite()) {
            return Err(AnalysisError::DegenerateInput(format!(
                "realization {i_real} produced non-finite curve values"
            )));
        }

        Ok(row)
    }
}

/// Draw one value per observation from `N(value, uncertainty)`.
///
/// Observations without uncertainty are passed through unchanged.
fn perturb_values<R: Rng>(series: &Series, rng: &mut R) -> Vec<f64> {
    series
        .values()
        .iter()
        .zip(series.uncertainties())
        .map(|(&val, &unc)| {
            if unc > 0.0 {
                let z: f64 = rng.sample(StandardNormal);
                val + unc * z
            } else {
                val
            }
        })
        .collect()
}

fn extrapolated_flags(series: &Series, grid: &OutputGrid) -> Vec<bool> {
    match series.span() {
        Some((start, end)) => grid
            .times()
            .iter()
            .map(|&time| time < start || time > end)
            .collect(),
        None => vec![true; grid.len()],
    }
}

/// All realizations of a propagation, one row per realization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ensemble {
    pub mode: Mode,
    pub times: Vec<f64>,
    pub extrapolated: Vec<bool>,
    pub rows: Vec<Vec<f64>>,
}

impl Ensemble {
    /// Column-wise mean and standard deviation.
    pub fn summarize(&self) -> Summary {
        let mut acc_vec = vec![Accumulator::new(); self.times.len()];
        for row in &self.rows {
            for (acc, &val) in acc_vec.iter_mut().zip(row) {
                acc.add(val);
            }
        }
        Summary::from_accumulators(self.mode, &self.times, &self.extrapolated, &acc_vec)
    }

    /// Save the ensemble to a MessagePack file.
    pub fn save<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize ensemble")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    /// Load an ensemble saved with [`Ensemble::save`].
    pub fn load<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let ensemble = decode::from_read(&mut reader).context("failed to deserialize ensemble")?;
        Ok(ensemble)
    }
}
