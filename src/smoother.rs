//! Low-pass curve fitting of irregularly sampled records.
//!
//! The fit follows the usual approach for trace-gas records: a quadratic
//! polynomial plus annual harmonics is fitted by least squares, and the
//! residuals are low-pass filtered in the frequency domain. The filtered
//! residuals are added back to the polynomial (trend) or to the polynomial
//! and the harmonics (smooth curve).

use crate::error::AnalysisError;
use crate::model::OutputGrid;
use nalgebra::{DMatrix, DVector, SVD};
use rustfft::{FftPlanner, num_complex::Complex};
use serde::{Deserialize, Serialize};
use std::{
    f64::consts::{LN_2, PI},
    fmt,
};

/// Minimum number of distinct times needed for a fit.
pub const MIN_POINTS: usize = 4;

const N_POLY_TERMS: usize = 3;
const MAX_HARMONICS: usize = 4;
const DAYS_PER_YEAR: f64 = 365.25;

/// Relative cut applied to singular values of the design matrix.
const SV_RTOL: f64 = 1e-12;

/// Which part of the fitted curve is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Polynomial, annual cycle and filtered residuals.
    Smooth,
    /// Polynomial and filtered residuals, without the annual cycle.
    Trend,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Smooth => write!(f, "smooth"),
            Mode::Trend => write!(f, "trend"),
        }
    }
}

/// Fitted curve of a record, evaluable at any time.
///
/// Outside the span of the fitted data the filtered residual is held at its
/// edge value while the polynomial and harmonics extrapolate, so evaluation
/// never yields NaN but loses accuracy with distance from the data.
/// Use [`CurveFit::is_extrapolated`] to flag such times.
#[derive(Debug, Clone)]
pub struct CurveFit {
    time_zero: f64,
    coefs: Vec<f64>,
    span: (f64, f64),
    grid_step: f64,
    filtered: Vec<f64>,
}

impl CurveFit {
    /// Fit `values` observed at `times`.
    ///
    /// `times` need not be sorted. `cutoff_period` is the filter cutoff in days:
    /// variations faster than it are treated as noise.
    ///
    /// # Errors
    /// - [`AnalysisError::InsufficientData`] with fewer than [`MIN_POINTS`] points
    ///   or distinct times.
    /// - [`AnalysisError::DegenerateInput`] if all times or all values are identical.
    /// - [`AnalysisError::InvalidParameter`] for a non-positive cutoff, mismatched
    ///   lengths or non-finite input.
    pub fn new(times: &[f64], values: &[f64], cutoff_period: f64) -> Result<Self, AnalysisError> {
        check_cutoff(cutoff_period)?;
        if times.len() != values.len() {
            return Err(AnalysisError::invalid(
                "values",
                format!(
                    "length must match times ({}), but is {}",
                    times.len(),
                    values.len()
                ),
            ));
        }
        if times.iter().chain(values).any(|x| !x.is_finite()) {
            return Err(AnalysisError::invalid("series", "contains non-finite entries"));
        }

        let n_obs = times.len();
        if n_obs < MIN_POINTS {
            return Err(AnalysisError::InsufficientData {
                required: MIN_POINTS,
                actual: n_obs,
            });
        }

        let mut order: Vec<usize> = (0..n_obs).collect();
        order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));
        let times: Vec<f64> = order.iter().map(|&i| times[i]).collect();
        let values: Vec<f64> = order.iter().map(|&i| values[i]).collect();

        let span = (times[0], times[n_obs - 1]);
        if span.0 == span.1 {
            return Err(AnalysisError::DegenerateInput(
                "all times are identical".to_string(),
            ));
        }
        if values.iter().all(|&val| val == values[0]) {
            return Err(AnalysisError::DegenerateInput(
                "all values are identical".to_string(),
            ));
        }

        let n_distinct = 1 + times.windows(2).filter(|pair| pair[1] > pair[0]).count();
        if n_distinct < MIN_POINTS {
            return Err(AnalysisError::InsufficientData {
                required: MIN_POINTS,
                actual: n_distinct,
            });
        }

        // Never fit more terms than the data can constrain.
        let n_harm = MAX_HARMONICS.min((n_distinct - 1 - N_POLY_TERMS) / 2);
        let time_zero = span.0.floor();
        let coefs = fit_function(&times, &values, time_zero, n_harm)?;

        let mut fit = Self {
            time_zero,
            coefs,
            span,
            grid_step: (span.1 - span.0) / (n_distinct - 1) as f64,
            filtered: Vec::new(),
        };

        let residuals: Vec<f64> = times
            .iter()
            .zip(&values)
            .map(|(&time, &val)| val - fit.function(time))
            .collect();
        let (knot_times, knot_residuals) = average_duplicates(&times, &residuals);

        let samples: Vec<f64> = (0..n_distinct)
            .map(|i| {
                if i + 1 == n_distinct {
                    span.1
                } else {
                    span.0 + i as f64 * fit.grid_step
                }
            })
            .map(|time| interpolate(&knot_times, &knot_residuals, time))
            .collect();
        fit.filtered = low_pass(&samples, fit.grid_step, cutoff_period);

        log::debug!(
            "fitted {} terms ({n_harm} harmonics) to {n_obs} points, filter grid of {n_distinct} samples",
            fit.coefs.len()
        );

        Ok(fit)
    }

    /// Value of the fitted curve at `time` in the given mode.
    pub fn evaluate(&self, time: f64, mode: Mode) -> f64 {
        match mode {
            Mode::Smooth => self.polynomial(time) + self.harmonic(time) + self.filtered_residual(time),
            Mode::Trend => self.polynomial(time) + self.filtered_residual(time),
        }
    }

    pub fn polynomial(&self, time: f64) -> f64 {
        let x = time - self.time_zero;
        (0..N_POLY_TERMS).map(|term| self.coefs[term] * basis_value(x, term)).sum()
    }

    /// Annual cycle of the fit.
    pub fn harmonic(&self, time: f64) -> f64 {
        let x = time - self.time_zero;
        (N_POLY_TERMS..self.coefs.len())
            .map(|term| self.coefs[term] * basis_value(x, term))
            .sum()
    }

    /// Low-pass filtered residual of the polynomial and harmonic fit.
    pub fn filtered_residual(&self, time: f64) -> f64 {
        let n_samples = self.filtered.len();
        if time <= self.span.0 {
            return self.filtered[0];
        }
        if time >= self.span.1 {
            return self.filtered[n_samples - 1];
        }
        let pos = (time - self.span.0) / self.grid_step;
        let i_low = (pos.floor() as usize).min(n_samples - 2);
        let frac = pos - i_low as f64;
        self.filtered[i_low] + frac * (self.filtered[i_low + 1] - self.filtered[i_low])
    }

    /// Whether `time` lies outside the span of the fitted data.
    pub fn is_extrapolated(&self, time: f64) -> bool {
        time < self.span.0 || time > self.span.1
    }

    pub fn span(&self) -> (f64, f64) {
        self.span
    }

    pub fn n_harmonics(&self) -> usize {
        (self.coefs.len() - N_POLY_TERMS) / 2
    }

    fn function(&self, time: f64) -> f64 {
        self.polynomial(time) + self.harmonic(time)
    }
}

/// Curve fitted in a fixed mode.
#[derive(Debug, Clone)]
pub struct Curve {
    fit: CurveFit,
    mode: Mode,
}

impl Curve {
    pub fn value_at(&self, time: f64) -> f64 {
        self.fit.evaluate(time, self.mode)
    }

    /// Evaluate the curve at every grid time.
    pub fn evaluate(&self, grid: &OutputGrid) -> SmoothingResult {
        let points = grid
            .times()
            .iter()
            .map(|&time| CurvePoint {
                time,
                value: self.value_at(time),
                extrapolated: self.fit.is_extrapolated(time),
            })
            .collect();
        SmoothingResult {
            mode: self.mode,
            points,
        }
    }

    pub fn fit(&self) -> &CurveFit {
        &self.fit
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }
}

/// Fit `values` observed at `times` and fix the evaluation mode.
///
/// See [`CurveFit::new`] for the errors.
pub fn smooth(
    times: &[f64],
    values: &[f64],
    cutoff_period: f64,
    mode: Mode,
) -> Result<Curve, AnalysisError> {
    let fit = CurveFit::new(times, values, cutoff_period)?;
    Ok(Curve { fit, mode })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub time: f64,
    pub value: f64,
    pub extrapolated: bool,
}

/// Curve values on an output grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothingResult {
    pub mode: Mode,
    pub points: Vec<CurvePoint>,
}

impl SmoothingResult {
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.value).collect()
    }
}

pub(crate) fn check_cutoff(cutoff_period: f64) -> Result<(), AnalysisError> {
    if !cutoff_period.is_finite() || cutoff_period <= 0.0 {
        return Err(AnalysisError::invalid(
            "cutoff_period",
            format!("must be positive and finite, but is {cutoff_period}"),
        ));
    }
    Ok(())
}

fn basis_value(x: f64, term: usize) -> f64 {
    if term < N_POLY_TERMS {
        return x.powi(term as i32);
    }
    let i_harm = term - N_POLY_TERMS;
    let angle = 2.0 * PI * (i_harm / 2 + 1) as f64 * x;
    if i_harm % 2 == 0 { angle.sin() } else { angle.cos() }
}

fn fit_function(
    times: &[f64],
    values: &[f64],
    time_zero: f64,
    n_harm: usize,
) -> Result<Vec<f64>, AnalysisError> {
    let n_terms = N_POLY_TERMS + 2 * n_harm;
    let design = DMatrix::from_fn(times.len(), n_terms, |i, j| {
        basis_value(times[i] - time_zero, j)
    });
    let rhs = DVector::from_column_slice(values);

    let svd = SVD::new(design, true, true);
    let max_sv = svd.singular_values.max();
    let coefs = svd.solve(&rhs, max_sv * SV_RTOL).map_err(|reason| {
        AnalysisError::DegenerateInput(format!("least-squares fit failed: {reason}"))
    })?;

    Ok(coefs.iter().copied().collect())
}

/// Collapse repeated times (sorted input) into one knot with the mean residual.
fn average_duplicates(times: &[f64], residuals: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut knot_times: Vec<f64> = Vec::with_capacity(times.len());
    let mut knot_residuals: Vec<f64> = Vec::with_capacity(times.len());
    let mut count = 0;
    for (&time, &res) in times.iter().zip(residuals) {
        if knot_times.last() == Some(&time) {
            count += 1;
            let last = knot_residuals.len() - 1;
            knot_residuals[last] += (res - knot_residuals[last]) / count as f64;
        } else {
            count = 1;
            knot_times.push(time);
            knot_residuals.push(res);
        }
    }
    (knot_times, knot_residuals)
}

/// Piecewise-linear interpolation through strictly increasing `xs`, clamped at the ends.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let idx = xs.partition_point(|&knot| knot <= x);
    if idx == 0 {
        return ys[0];
    }
    if idx == xs.len() {
        return ys[xs.len() - 1];
    }
    let frac = (x - xs[idx - 1]) / (xs[idx] - xs[idx - 1]);
    ys[idx - 1] + frac * (ys[idx] - ys[idx - 1])
}

/// Apply `H(f) = exp(-ln2 (f * cutoff)^6)` to evenly spaced samples.
///
/// Samples are zero-padded to a power of two at least twice their length to
/// keep the circular convolution from wrapping around.
fn low_pass(samples: &[f64], step: f64, cutoff_period: f64) -> Vec<f64> {
    let n_samples = samples.len();
    let n_fft = (2 * n_samples).next_power_of_two();

    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .map(|&sample| Complex::new(sample, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)))
        .take(n_fft)
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(n_fft).process(&mut buffer);

    // Frequencies in cycles per year.
    let cutoff = cutoff_period / DAYS_PER_YEAR;
    for (k, coef) in buffer.iter_mut().enumerate() {
        let freq = k.min(n_fft - k) as f64 / (n_fft as f64 * step);
        *coef *= (-LN_2 * (freq * cutoff).powi(6)).exp();
    }

    planner.plan_fft_inverse(n_fft).process(&mut buffer);

    buffer[..n_samples]
        .iter()
        .map(|coef| coef.re / n_fft as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seasonal_record(start: f64, n_months: usize) -> (Vec<f64>, Vec<f64>) {
        let times: Vec<f64> = (0..n_months)
            .map(|i| start + (i as f64 + 0.5) / 12.0)
            .collect();
        let values = times
            .iter()
            .map(|&t| 150.0 - 8.0 * (t - start) + 4.0 * (2.0 * PI * t).sin())
            .collect();
        (times, values)
    }

    fn noisy_record() -> (Vec<f64>, Vec<f64>) {
        let (times, mut values) = seasonal_record(1987.0, 84);
        for (i, val) in values.iter_mut().enumerate() {
            *val += 2.0 * (i as f64 * 12.9898).sin().fract();
        }
        (times, values)
    }

    #[test]
    fn reproduces_exact_trend_and_cycle() {
        let (times, values) = seasonal_record(1987.0, 84);
        let fit = CurveFit::new(&times, &values, 667.0).unwrap();
        assert_eq!(fit.n_harmonics(), 4);

        for (&t, &val) in times.iter().zip(&values) {
            assert!((fit.evaluate(t, Mode::Smooth) - val).abs() < 1e-6);
            let trend = 150.0 - 8.0 * (t - 1987.0);
            assert!((fit.evaluate(t, Mode::Trend) - trend).abs() < 1e-6);
        }
    }

    #[test]
    fn input_order_does_not_matter() {
        let (times, values) = noisy_record();
        let mut rev_times = times.clone();
        let mut rev_values = values.clone();
        rev_times.reverse();
        rev_values.reverse();

        let grid = OutputGrid::linspace(1987.5, 1993.5, 25).unwrap();
        let sorted = smooth(&times, &values, 667.0, Mode::Smooth).unwrap();
        let reversed = smooth(&rev_times, &rev_values, 667.0, Mode::Smooth).unwrap();
        assert_eq!(sorted.evaluate(&grid), reversed.evaluate(&grid));
    }

    #[test]
    fn longer_cutoff_smooths_more() {
        let (times, values) = noisy_record();
        let sharp = CurveFit::new(&times, &values, 10.0).unwrap();
        let broad = CurveFit::new(&times, &values, 2000.0).unwrap();

        let max_abs = |fit: &CurveFit| {
            times
                .iter()
                .map(|&t| fit.filtered_residual(t).abs())
                .fold(0.0, f64::max)
        };
        assert!(max_abs(&broad) < max_abs(&sharp));
    }

    #[test]
    fn minimal_record_fits_without_harmonics() {
        let times = [1990.1, 1990.4, 1990.8, 1991.3];
        let values = [1.0, 3.0, 2.0, 5.0];
        let fit = CurveFit::new(&times, &values, 667.0).unwrap();
        assert_eq!(fit.n_harmonics(), 0);
        for &t in &times {
            assert!(fit.evaluate(t, Mode::Smooth).is_finite());
        }
    }

    #[test]
    fn two_points_are_insufficient() {
        let error = smooth(&[1990.0, 1991.0], &[1.0, 2.0], 667.0, Mode::Smooth).unwrap_err();
        assert_eq!(
            error,
            AnalysisError::InsufficientData {
                required: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn repeated_times_count_once() {
        let times = [1990.0, 1990.0, 1990.5, 1990.5, 1991.0];
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let error = CurveFit::new(&times, &values, 667.0).unwrap_err();
        assert_eq!(
            error,
            AnalysisError::InsufficientData {
                required: 4,
                actual: 3
            }
        );

        let times = [1990.0, 1990.0, 1990.5, 1991.0, 1991.5];
        assert!(CurveFit::new(&times, &values, 667.0).is_ok());
    }

    #[test]
    fn degenerate_inputs_fail() {
        let error = CurveFit::new(&[1990.0; 5], &[1.0, 2.0, 3.0, 4.0, 5.0], 667.0).unwrap_err();
        assert!(matches!(error, AnalysisError::DegenerateInput(_)));

        let times = [1990.0, 1990.5, 1991.0, 1991.5, 1992.0];
        let error = CurveFit::new(&times, &[7.0; 5], 667.0).unwrap_err();
        assert!(matches!(error, AnalysisError::DegenerateInput(_)));
    }

    #[test]
    fn invalid_cutoff_fails() {
        let (times, values) = noisy_record();
        for cutoff in [0.0, -5.0, f64::NAN] {
            let error = CurveFit::new(&times, &values, cutoff).unwrap_err();
            assert!(matches!(error, AnalysisError::InvalidParameter { .. }));
        }
    }

    #[test]
    fn subset_of_grid_gives_same_values() {
        let (times, values) = noisy_record();
        let curve = smooth(&times, &values, 667.0, Mode::Trend).unwrap();

        let superset = OutputGrid::linspace(1987.0, 1994.0, 85).unwrap();
        let subset_times: Vec<f64> = superset.times().iter().copied().step_by(7).collect();
        let subset = OutputGrid::new(subset_times).unwrap();

        let from_superset: Vec<f64> = curve.evaluate(&superset).values().into_iter().step_by(7).collect();
        let direct = curve.evaluate(&subset).values();
        assert_eq!(from_superset.len(), direct.len());
        for (a, b) in from_superset.iter().zip(&direct) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn flags_extrapolated_times() {
        let (times, values) = noisy_record();
        let curve = smooth(&times, &values, 667.0, Mode::Smooth).unwrap();

        let with_outside = curve.evaluate(&OutputGrid::new(vec![1990.0, 1992.0, 2000.0]).unwrap());
        let inside = curve.evaluate(&OutputGrid::new(vec![1990.0, 1992.0]).unwrap());

        let flags: Vec<bool> = with_outside.points.iter().map(|p| p.extrapolated).collect();
        assert_eq!(flags, vec![false, false, true]);
        assert!(with_outside.points[2].value.is_finite());
        assert_eq!(&with_outside.points[..2], &inside.points[..]);
    }

    #[test]
    fn residual_filter_is_finite_at_edges() {
        let (times, values) = noisy_record();
        let fit = CurveFit::new(&times, &values, 667.0).unwrap();
        let (start, end) = fit.span();
        for t in [start - 1.0, start, end, end + 1.0] {
            assert!(fit.filtered_residual(t).is_finite());
        }
        assert_eq!(fit.filtered_residual(end), fit.filtered_residual(end + 1.0));
    }
}
