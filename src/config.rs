use crate::harmonize::{Exclusion, Offset};
use crate::model::Window;
use crate::smoother::Mode;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt::Debug, fs, ops::RangeBounds, path::Path, path::PathBuf};

/// Run configuration.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    pub smoothing: SmoothingConfig,
    pub grid: GridConfig,

    pub reference: DatasetConfig,
    pub candidate: DatasetConfig,

    /// Comparison windows, keyed by label.
    #[serde(default)]
    pub windows: Vec<Window>,

    pub harmonization: Option<HarmonizationConfig>,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SmoothingConfig {
    /// Low-pass cutoff period in days.
    pub cutoff_period: f64,
    /// Number of Monte Carlo realizations.
    pub n_iterations: usize,
    #[serde(default = "default_modes")]
    pub modes: Vec<Mode>,
    /// Master seed, drawn from the OS when absent.
    pub seed: Option<u64>,
    /// Size of the global thread pool, rayon's default when absent.
    pub threads: Option<usize>,
}

fn default_modes() -> Vec<Mode> {
    vec![Mode::Smooth, Mode::Trend]
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub start: f64,
    pub end: f64,
    pub n_points: usize,
}

#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    /// Decimal years.
    #[default]
    Decimal,
    /// Calendar dates parsed with `date_format`.
    Date,
}

#[derive(Debug, PartialEq, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Δ14C in permil.
    #[default]
    D14c,
    /// Fraction modern.
    Fm,
}

/// Location and layout of one CSV record.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    /// Path of the CSV file, relative to the run directory.
    pub file: PathBuf,
    pub time_column: String,
    pub value_column: String,
    pub uncertainty_column: String,
    #[serde(default)]
    pub time_format: TimeFormat,
    pub date_format: Option<String>,
    #[serde(default)]
    pub value_kind: ValueKind,
}

#[derive(Debug, PartialEq, Clone, Default, Serialize, Deserialize)]
pub struct HarmonizationConfig {
    #[serde(default)]
    pub offsets: Vec<Offset>,
    #[serde(default)]
    pub exclusions: Vec<Exclusion>,
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be a TOML document describing a [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents = fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let smoothing = &self.smoothing;
        check_num(smoothing.cutoff_period, 0.0..100_000.0).context("invalid cutoff period")?;
        if smoothing.cutoff_period <= 0.0 {
            bail!("cutoff period must be positive");
        }
        check_num(smoothing.n_iterations, 1..10_000_000).context("invalid number of iterations")?;
        if smoothing.modes.is_empty() {
            bail!("at least one smoothing mode is required");
        }
        if let Some(threads) = smoothing.threads {
            check_num(threads, 1..1_024).context("invalid number of threads")?;
        }

        check_num(self.grid.n_points, 1..1_000_000).context("invalid number of grid points")?;
        check_interval(self.grid.start, self.grid.end).context("invalid grid")?;

        self.reference.validate().context("invalid reference dataset")?;
        self.candidate.validate().context("invalid candidate dataset")?;

        let mut labels = BTreeSet::new();
        for window in &self.windows {
            check_interval(window.start, window.end)
                .with_context(|| format!("invalid window {}", window.label))?;
            if !labels.insert(window.label.as_str()) {
                bail!("window label {} is not unique", window.label);
            }
        }

        if let Some(harmonization) = &self.harmonization {
            harmonization.validate().context("invalid harmonization")?;
        }

        Ok(())
    }
}

impl DatasetConfig {
    fn validate(&self) -> Result<()> {
        if self.time_format == TimeFormat::Date && self.date_format.is_none() {
            bail!("date_format is required when time_format is date");
        }
        Ok(())
    }
}

impl HarmonizationConfig {
    fn validate(&self) -> Result<()> {
        for (i_off, off) in self.offsets.iter().enumerate() {
            check_interval(off.start, off.end).with_context(|| format!("invalid offset {i_off}"))?;
            if !off.offset.is_finite() {
                bail!("offset {i_off} must be finite");
            }
            check_num(off.error, 0.0..f64::INFINITY)
                .with_context(|| format!("invalid error of offset {i_off}"))?;
        }

        let mut sorted: Vec<&Offset> = self.offsets.iter().collect();
        sorted.sort_by(|a, b| a.start.total_cmp(&b.start));
        if let Some(pair) = sorted.windows(2).find(|pair| pair[1].start < pair[0].end) {
            bail!(
                "offset intervals [{}, {}) and [{}, {}) overlap",
                pair[0].start,
                pair[0].end,
                pair[1].start,
                pair[1].end
            );
        }

        for (i_exc, exc) in self.exclusions.iter().enumerate() {
            check_interval(exc.start, exc.end).with_context(|| format!("invalid exclusion {i_exc}"))?;
        }

        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

fn check_interval(start: f64, end: f64) -> Result<()> {
    if !start.is_finite() || !end.is_finite() {
        bail!("interval bounds must be finite, but are {start:?} and {end:?}");
    }
    if start >= end {
        bail!("interval start must be before its end, but {start} >= {end}");
    }
    Ok(())
}
