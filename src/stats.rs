use crate::smoother::Mode;
use serde::{Deserialize, Serialize};

/// Running mean and variance (Welford).
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorReport {
    pub mean: f64,
    pub std_dev: f64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    /// Combine with the accumulator of a disjoint set of values (Chan et al.).
    pub fn merge(&mut self, other: &Accumulator) {
        if other.n_vals == 0 {
            return;
        }
        if self.n_vals == 0 {
            *self = other.clone();
            return;
        }
        let n_vals = self.n_vals + other.n_vals;
        let diff = other.mean - self.mean;
        self.mean += diff * other.n_vals as f64 / n_vals as f64;
        self.diff_2_sum +=
            other.diff_2_sum + diff * diff * (self.n_vals * other.n_vals) as f64 / n_vals as f64;
        self.n_vals = n_vals;
    }

    pub fn n_vals(&self) -> usize {
        self.n_vals
    }

    /// Mean and sample standard deviation.
    ///
    /// A single value has no spread: its standard deviation is reported as 0.
    pub fn report(&self) -> AccumulatorReport {
        AccumulatorReport {
            mean: if self.n_vals > 0 { self.mean } else { f64::NAN },
            std_dev: match self.n_vals {
                0 => f64::NAN,
                1 => 0.0,
                n_vals => (self.diff_2_sum / (n_vals as f64 - 1.0)).sqrt(),
            },
        }
    }
}

/// Mean and spread of an ensemble of curves at one output time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryPoint {
    pub time: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub extrapolated: bool,
}

/// Column-wise reduction of an ensemble on an output grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub mode: Mode,
    pub points: Vec<SummaryPoint>,
}

impl Summary {
    pub fn from_accumulators(
        mode: Mode,
        times: &[f64],
        extrapolated: &[bool],
        acc_vec: &[Accumulator],
    ) -> Self {
        let points = times
            .iter()
            .zip(extrapolated)
            .zip(acc_vec)
            .map(|((&time, &extrapolated), acc)| {
                let report = acc.report();
                SummaryPoint {
                    time,
                    mean: report.mean,
                    std_dev: report.std_dev,
                    extrapolated,
                }
            })
            .collect();
        Self { mode, points }
    }

    pub fn means(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.mean).collect()
    }

    pub fn std_devs(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.std_dev).collect()
    }

    /// Summary without the points evaluated outside the data span.
    pub fn interior(&self) -> Self {
        Self {
            mode: self.mode,
            points: self
                .points
                .iter()
                .filter(|point| !point.extrapolated)
                .copied()
                .collect(),
        }
    }
}

/// Mean of `vals` and its standard error.
pub fn mean_and_sem(vals: &[f64]) -> AccumulatorReport {
    let mut acc = Accumulator::new();
    vals.iter().for_each(|&val| acc.add(val));
    let report = acc.report();
    AccumulatorReport {
        mean: report.mean,
        std_dev: report.std_dev / (vals.len() as f64).sqrt(),
    }
}
