//! Observation series, output grids and comparison windows.

use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};

/// Single measurement of a record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Decimal year.
    pub time: f64,
    /// Measured value.
    pub value: f64,
    /// One-sigma measurement uncertainty.
    pub uncertainty: f64,
}

/// Time-ordered series of observations.
///
/// Sorted by time at construction and immutable afterwards.
/// Slices, offsets and merges produce new series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    times: Vec<f64>,
    values: Vec<f64>,
    uncertainties: Vec<f64>,
}

impl Series {
    /// Create a series from parallel vectors, sorting them by time.
    ///
    /// # Errors
    /// Returns [`AnalysisError::InvalidParameter`] if the vectors differ in length,
    /// if a time or value is not finite, or if an uncertainty is negative or not finite.
    pub fn new(
        times: Vec<f64>,
        values: Vec<f64>,
        uncertainties: Vec<f64>,
    ) -> Result<Self, AnalysisError> {
        let n_obs = times.len();
        if values.len() != n_obs || uncertainties.len() != n_obs {
            return Err(AnalysisError::invalid(
                "series",
                format!(
                    "times, values and uncertainties must have the same length, but have {}, {} and {}",
                    n_obs,
                    values.len(),
                    uncertainties.len()
                ),
            ));
        }
        if let Some(time) = times.iter().find(|t| !t.is_finite()) {
            return Err(AnalysisError::invalid("times", format!("non-finite time {time}")));
        }
        if let Some(value) = values.iter().find(|v| !v.is_finite()) {
            return Err(AnalysisError::invalid("values", format!("non-finite value {value}")));
        }
        if let Some(unc) = uncertainties
            .iter()
            .find(|&&unc| !unc.is_finite() || unc < 0.0)
        {
            return Err(AnalysisError::invalid(
                "uncertainties",
                format!("uncertainty must be finite and non-negative, but is {unc}"),
            ));
        }

        let mut order: Vec<usize> = (0..n_obs).collect();
        order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));

        Ok(Self {
            times: order.iter().map(|&i| times[i]).collect(),
            values: order.iter().map(|&i| values[i]).collect(),
            uncertainties: order.iter().map(|&i| uncertainties[i]).collect(),
        })
    }

    pub fn from_observations(obs_vec: &[Observation]) -> Result<Self, AnalysisError> {
        Self::new(
            obs_vec.iter().map(|obs| obs.time).collect(),
            obs_vec.iter().map(|obs| obs.value).collect(),
            obs_vec.iter().map(|obs| obs.uncertainty).collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn uncertainties(&self) -> &[f64] {
        &self.uncertainties
    }

    pub fn iter(&self) -> impl Iterator<Item = Observation> + '_ {
        self.times
            .iter()
            .zip(&self.values)
            .zip(&self.uncertainties)
            .map(|((&time, &value), &uncertainty)| Observation {
                time,
                value,
                uncertainty,
            })
    }

    /// First and last time of the series, if any.
    pub fn span(&self) -> Option<(f64, f64)> {
        Some((*self.times.first()?, *self.times.last()?))
    }

    /// Observations with `start <= time <= end`.
    pub fn slice(&self, start: f64, end: f64) -> Self {
        self.filter(|obs| obs.time >= start && obs.time <= end)
    }

    /// Observations satisfying `keep`, in time order.
    pub fn filter<F: Fn(&Observation) -> bool>(&self, keep: F) -> Self {
        self.map(|obs| keep(&obs).then_some(obs))
    }

    /// Apply `f` to every observation, dropping the `None` results.
    ///
    /// The result is sorted again, so `f` may move observations in time.
    pub(crate) fn map<F: Fn(Observation) -> Option<Observation>>(&self, f: F) -> Self {
        Self::from_unsorted(self.iter().filter_map(f).collect())
    }

    /// Union of both series, in time order.
    pub fn merge(&self, other: &Series) -> Self {
        Self::from_unsorted(self.iter().chain(other.iter()).collect())
    }

    fn from_unsorted(mut obs_vec: Vec<Observation>) -> Self {
        obs_vec.sort_by(|a, b| a.time.total_cmp(&b.time));
        let mut series = Self::default();
        for obs in obs_vec {
            series.times.push(obs.time);
            series.values.push(obs.value);
            series.uncertainties.push(obs.uncertainty);
        }
        series
    }
}

/// Times at which a smoothed curve is evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputGrid {
    times: Vec<f64>,
}

impl OutputGrid {
    /// # Errors
    /// Returns [`AnalysisError::InvalidParameter`] if `times` is empty, has
    /// non-finite entries or is not in non-decreasing order.
    pub fn new(times: Vec<f64>) -> Result<Self, AnalysisError> {
        if times.is_empty() {
            return Err(AnalysisError::invalid("output_times", "must not be empty"));
        }
        if let Some(time) = times.iter().find(|t| !t.is_finite()) {
            return Err(AnalysisError::invalid(
                "output_times",
                format!("non-finite time {time}"),
            ));
        }
        if let Some(pair) = times.windows(2).find(|pair| pair[1] < pair[0]) {
            return Err(AnalysisError::invalid(
                "output_times",
                format!("must be ordered, but {} follows {}", pair[1], pair[0]),
            ));
        }
        Ok(Self { times })
    }

    /// `n_points` evenly spaced times from `start` to `end`, both included.
    pub fn linspace(start: f64, end: f64, n_points: usize) -> Result<Self, AnalysisError> {
        let times = match n_points {
            0 => Vec::new(),
            1 => vec![start],
            _ => {
                let step = (end - start) / (n_points - 1) as f64;
                (0..n_points).map(|i| start + i as f64 * step).collect()
            }
        };
        Self::new(times)
    }

    /// Grid times with `start <= time <= end`.
    ///
    /// # Errors
    /// Returns [`AnalysisError::InvalidParameter`] if no grid time is left.
    pub fn restrict(&self, start: f64, end: f64) -> Result<Self, AnalysisError> {
        Self::new(
            self.times
                .iter()
                .copied()
                .filter(|&time| time >= start && time <= end)
                .collect(),
        )
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }
}

/// Labelled time interval, both ends included.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Window {
    pub label: String,
    pub start: f64,
    pub end: f64,
}
