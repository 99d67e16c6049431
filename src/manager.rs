use crate::analysis::{compare_window_ensembles, compare_windows, pair_monthly, run_windows};
use crate::config::Config;
use crate::data::{load_dataset, write_rows};
use crate::engine::{Engine, EngineParams, Ensemble};
use crate::harmonize::harmonize;
use crate::model::{OutputGrid, Series, Window};
use anyhow::{Context, Result, bail};
use glob::glob;
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Seed key of the harmonized record.
const HARMONIZED_KEY: u64 = 2;

pub struct Manager {
    run_dir: PathBuf,
    cfg: Config,
}

impl Manager {
    pub fn new<P: AsRef<Path>>(run_dir: P) -> Result<Self> {
        let run_dir = run_dir.as_ref().to_path_buf();

        let cfg = Config::from_file(run_dir.join("config.toml")).context("failed to construct cfg")?;
        log::info!("{cfg:#?}");

        if let Some(threads) = cfg.smoothing.threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .context("failed to build thread pool")?;
        }

        Ok(Self { run_dir, cfg })
    }

    pub fn compare(&self, save_ensemble: bool) -> Result<()> {
        let (reference, candidate) = self.load_datasets()?;
        let grid = self.grid()?;
        let engine = self.engine()?;

        let windows: BTreeMap<String, Window> = self
            .cfg
            .windows
            .iter()
            .map(|window| (window.label.clone(), window.clone()))
            .collect();
        if windows.is_empty() {
            bail!("no comparison windows configured");
        }

        self.create_output_dir()?;

        let modes = &self.cfg.smoothing.modes;
        let result = if save_ensemble {
            run_windows(&windows, modes, |window, mode| {
                let kept =
                    compare_window_ensembles(window, &reference, &candidate, &grid, &engine, mode)?;
                self.save_ensemble(&kept.reference, &window.label, "reference")?;
                self.save_ensemble(&kept.candidate, &window.label, "candidate")?;
                Ok(kept.comparison)
            })
        } else {
            compare_windows(&windows, &reference, &candidate, &grid, &engine, modes)
        };
        let comparisons = result.context("failed to compare windows")?;

        for comparison in &comparisons {
            let file = self.output_file(&format!("compare-{}-{}.csv", comparison.label, comparison.mode));
            write_rows(file, comparison.differences()).context("failed to write comparison")?;
        }

        Ok(())
    }

    fn save_ensemble(&self, ensemble: &Ensemble, label: &str, record: &str) -> Result<()> {
        let mode = ensemble.mode;
        let file = self.output_file(&format!("ensemble-{label}-{mode}-{record}.msgpack"));
        ensemble
            .save(&file)
            .with_context(|| format!("failed to save {file:?}"))?;
        log::info!("wrote {file:?}");
        Ok(())
    }

    pub fn monthly(&self) -> Result<()> {
        let (reference, candidate) = self.load_datasets()?;

        let pairs = pair_monthly(&reference, &candidate).context("failed to pair monthly means")?;
        log::info!("{} months present in both records", pairs.len());

        self.create_output_dir()?;
        write_rows(self.output_file("monthly.csv"), &pairs).context("failed to write monthly means")?;

        Ok(())
    }

    pub fn harmonize(&self) -> Result<()> {
        let Some(harmonization) = &self.cfg.harmonization else {
            bail!("no harmonization configured");
        };
        let (reference, candidate) = self.load_datasets()?;

        let merged = harmonize(
            &reference,
            &candidate,
            &harmonization.offsets,
            &harmonization.exclusions,
        );
        let (start, end) = merged.span().context("harmonized record is empty")?;
        log::info!("harmonized record has {} observations", merged.len());

        self.create_output_dir()?;
        write_rows(self.output_file("harmonized.csv"), merged.iter())
            .context("failed to write harmonized record")?;

        let grid = self
            .grid()?
            .restrict(start, end)
            .context("failed to restrict grid to harmonized record")?;
        let engine = self.engine()?.derive(HARMONIZED_KEY);
        for &mode in &self.cfg.smoothing.modes {
            let summary = engine
                .propagate(&merged, &grid, mode)
                .with_context(|| format!("failed to smooth harmonized record ({mode})"))?;
            write_rows(self.output_file(&format!("harmonized-{mode}.csv")), &summary.points)
                .context("failed to write harmonized summary")?;
        }

        Ok(())
    }

    pub fn clean(&self) -> Result<()> {
        let mut n_removed = 0;
        for extension in ["csv", "msgpack"] {
            for file in self.output_files(extension)? {
                fs::remove_file(&file).with_context(|| format!("failed to remove {file:?}"))?;
                n_removed += 1;
            }
        }
        log::info!("removed {n_removed} output files");

        Ok(())
    }

    fn load_datasets(&self) -> Result<(Series, Series)> {
        let reference = load_dataset(self.run_dir.join(&self.cfg.reference.file), &self.cfg.reference)
            .context("failed to load reference")?;
        let candidate = load_dataset(self.run_dir.join(&self.cfg.candidate.file), &self.cfg.candidate)
            .context("failed to load candidate")?;
        Ok((reference, candidate))
    }

    fn grid(&self) -> Result<OutputGrid> {
        let grid = &self.cfg.grid;
        OutputGrid::linspace(grid.start, grid.end, grid.n_points).context("failed to build output grid")
    }

    fn engine(&self) -> Result<Engine> {
        let seed = match self.cfg.smoothing.seed {
            Some(seed) => seed,
            None => {
                let mut rng = ChaCha12Rng::try_from_os_rng()?;
                let seed = rng.next_u64();
                log::info!("drew seed {seed}");
                seed
            }
        };

        let engine = Engine::new(EngineParams {
            cutoff_period: self.cfg.smoothing.cutoff_period,
            n_iterations: self.cfg.smoothing.n_iterations,
            seed,
        })
        .context("failed to construct engine")?;
        Ok(engine)
    }

    fn output_dir(&self) -> PathBuf {
        self.run_dir.join("output")
    }

    fn create_output_dir(&self) -> Result<()> {
        let output_dir = self.output_dir();
        fs::create_dir_all(&output_dir).with_context(|| format!("failed to create {output_dir:?}"))
    }

    fn output_file(&self, name: &str) -> PathBuf {
        self.output_dir().join(name)
    }

    fn output_files(&self, extension: &str) -> Result<Vec<PathBuf>> {
        let pattern = self.output_dir().join(format!("*.{extension}"));
        let pattern = pattern.to_str().context("pattern is not valid UTF-8")?;
        let files = glob(pattern)
            .context("failed to glob output files")?
            .filter_map(Result::ok)
            .filter(|p| p.is_file())
            .collect();
        Ok(files)
    }
}
