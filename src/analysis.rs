use crate::engine::{Engine, Ensemble};
use crate::error::AnalysisError;
use crate::model::{OutputGrid, Series, Window};
use crate::monthly::{MonthlyMean, monthly_groups};
use crate::smoother::{MIN_POINTS, Mode};
use crate::stats::{AccumulatorReport, Summary, mean_and_sem};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seed key of the reference record within a comparison.
pub const REFERENCE_KEY: u64 = 0;
/// Seed key of the candidate record within a comparison.
pub const CANDIDATE_KEY: u64 = 1;

/// Both records sliced to a window, with the grid restricted to their common span.
#[derive(Debug, Clone)]
pub struct WindowInputs {
    pub reference: Series,
    pub candidate: Series,
    pub grid: OutputGrid,
}

/// Slice both records to `window` and restrict `grid` to their overlap.
pub fn prepare_window(
    window: &Window,
    reference: &Series,
    candidate: &Series,
    grid: &OutputGrid,
) -> Result<WindowInputs, AnalysisError> {
    let reference = reference.slice(window.start, window.end);
    let candidate = candidate.slice(window.start, window.end);

    let no_data = || AnalysisError::InsufficientData {
        required: MIN_POINTS,
        actual: 0,
    };
    let (ref_start, ref_end) = reference.span().ok_or_else(no_data)?;
    let (cand_start, cand_end) = candidate.span().ok_or_else(no_data)?;

    let grid = grid.restrict(ref_start.max(cand_start), ref_end.min(cand_end))?;

    Ok(WindowInputs {
        reference,
        candidate,
        grid,
    })
}

/// Summaries of both records over one window, aligned on a common grid.
#[derive(Debug, Clone)]
pub struct Comparison {
    pub label: String,
    pub mode: Mode,
    pub reference: Summary,
    pub candidate: Summary,
}

/// One grid time of a comparison, as handed to the paired test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PairedPoint {
    pub time: f64,
    pub reference_mean: f64,
    pub reference_std_dev: f64,
    pub candidate_mean: f64,
    pub candidate_std_dev: f64,
    /// Candidate minus reference.
    pub difference: f64,
    pub difference_std_dev: f64,
    pub extrapolated: bool,
}

impl Comparison {
    pub fn differences(&self) -> Vec<PairedPoint> {
        self.reference
            .points
            .iter()
            .zip(&self.candidate.points)
            .map(|(ref_point, cand_point)| PairedPoint {
                time: ref_point.time,
                reference_mean: ref_point.mean,
                reference_std_dev: ref_point.std_dev,
                candidate_mean: cand_point.mean,
                candidate_std_dev: cand_point.std_dev,
                difference: cand_point.mean - ref_point.mean,
                difference_std_dev: ref_point.std_dev.hypot(cand_point.std_dev),
                extrapolated: ref_point.extrapolated || cand_point.extrapolated,
            })
            .collect()
    }

    /// Mean candidate-minus-reference difference over the interior points and its standard error.
    pub fn mean_offset(&self) -> AccumulatorReport {
        let diffs: Vec<f64> = self
            .differences()
            .iter()
            .filter(|point| !point.extrapolated)
            .map(|point| point.difference)
            .collect();
        mean_and_sem(&diffs)
    }
}

/// Propagate both records of one window through the smoother.
///
/// The records are perturbed with independent seeds derived from `engine`.
pub fn compare_window(
    window: &Window,
    reference: &Series,
    candidate: &Series,
    grid: &OutputGrid,
    engine: &Engine,
    mode: Mode,
) -> Result<Comparison, AnalysisError> {
    let inputs = prepare_window(window, reference, candidate, grid)?;
    log::debug!(
        "window {}: {} reference and {} candidate observations, {} grid times",
        window.label,
        inputs.reference.len(),
        inputs.candidate.len(),
        inputs.grid.len()
    );

    let reference = engine
        .derive(REFERENCE_KEY)
        .propagate(&inputs.reference, &inputs.grid, mode)?;
    let candidate = engine
        .derive(CANDIDATE_KEY)
        .propagate(&inputs.candidate, &inputs.grid, mode)?;

    Ok(Comparison {
        label: window.label.clone(),
        mode,
        reference,
        candidate,
    })
}

/// Both records of one window propagated with every realization kept.
#[derive(Debug, Clone)]
pub struct WindowEnsembles {
    pub comparison: Comparison,
    pub reference: Ensemble,
    pub candidate: Ensemble,
}

/// Same as [`compare_window`], keeping the realizations of both records.
///
/// The summaries are computed from the kept ensembles, so each realization
/// is generated once.
pub fn compare_window_ensembles(
    window: &Window,
    reference: &Series,
    candidate: &Series,
    grid: &OutputGrid,
    engine: &Engine,
    mode: Mode,
) -> Result<WindowEnsembles, AnalysisError> {
    let inputs = prepare_window(window, reference, candidate, grid)?;

    let reference = engine
        .derive(REFERENCE_KEY)
        .generate_ensemble(&inputs.reference, &inputs.grid, mode)?;
    let candidate = engine
        .derive(CANDIDATE_KEY)
        .generate_ensemble(&inputs.candidate, &inputs.grid, mode)?;

    Ok(WindowEnsembles {
        comparison: Comparison {
            label: window.label.clone(),
            mode,
            reference: reference.summarize(),
            candidate: candidate.summarize(),
        },
        reference,
        candidate,
    })
}

/// Compare both records over every window and mode.
///
/// # Errors
/// Fails at the first window that cannot be compared; the error names the window.
pub fn compare_windows(
    windows: &BTreeMap<String, Window>,
    reference: &Series,
    candidate: &Series,
    grid: &OutputGrid,
    engine: &Engine,
    modes: &[Mode],
) -> anyhow::Result<Vec<Comparison>> {
    run_windows(windows, modes, |window, mode| {
        Ok(compare_window(window, reference, candidate, grid, engine, mode)?)
    })
}

/// Run `compare` for every window and mode in label order, logging offsets and progress.
pub fn run_windows<F>(
    windows: &BTreeMap<String, Window>,
    modes: &[Mode],
    mut compare: F,
) -> anyhow::Result<Vec<Comparison>>
where
    F: FnMut(&Window, Mode) -> anyhow::Result<Comparison>,
{
    let n_tasks = windows.len() * modes.len();
    let mut comparisons = Vec::with_capacity(n_tasks);
    for window in windows.values() {
        for &mode in modes {
            let comparison = compare(window, mode)
                .with_context(|| format!("failed to compare window {} ({mode})", window.label))?;

            let offset = comparison.mean_offset();
            log::info!(
                "{} ({mode}): mean offset {:+.3} +- {:.3}",
                window.label,
                offset.mean,
                offset.std_dev
            );
            comparisons.push(comparison);

            let progress = 100.0 * comparisons.len() as f64 / n_tasks as f64;
            log::info!("completed {progress:06.2}%");
        }
    }
    Ok(comparisons)
}

/// Monthly means of both records for the months present in both.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonthlyPair {
    pub year: i32,
    pub month: u32,
    pub time: f64,
    pub reference_value: f64,
    pub reference_uncertainty: f64,
    pub candidate_value: f64,
    pub candidate_uncertainty: f64,
    pub difference: f64,
    pub difference_uncertainty: f64,
}

pub fn pair_monthly(reference: &Series, candidate: &Series) -> Result<Vec<MonthlyPair>, AnalysisError> {
    let cand_by_month: BTreeMap<(i32, u32), MonthlyMean> = monthly_groups(candidate)?
        .into_iter()
        .map(|mean| ((mean.year, mean.month), mean))
        .collect();

    Ok(monthly_groups(reference)?
        .into_iter()
        .filter_map(|ref_mean| {
            let cand_mean = cand_by_month.get(&(ref_mean.year, ref_mean.month))?;
            Some(MonthlyPair {
                year: ref_mean.year,
                month: ref_mean.month,
                time: ref_mean.time,
                reference_value: ref_mean.value,
                reference_uncertainty: ref_mean.uncertainty,
                candidate_value: cand_mean.value,
                candidate_uncertainty: cand_mean.uncertainty,
                difference: cand_mean.value - ref_mean.value,
                difference_uncertainty: ref_mean.uncertainty.hypot(cand_mean.uncertainty),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineParams;
    use std::f64::consts::PI;

    fn record(start: f64, n_months: usize, shift: f64, unc: f64) -> Series {
        let times: Vec<f64> = (0..n_months)
            .map(|i| start + (i as f64 + 0.5) / 12.0)
            .collect();
        let values = times
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                130.0 - 6.0 * (t - 1987.0) + 2.5 * (2.0 * PI * t).sin()
                    + 0.8 * (i as f64 * 2.3).cos()
                    + shift
            })
            .collect();
        Series::new(times, values, vec![unc; n_months]).unwrap()
    }

    fn engine(n_iterations: usize) -> Engine {
        Engine::new(EngineParams {
            cutoff_period: 667.0,
            n_iterations,
            seed: 17,
        })
        .unwrap()
    }

    fn window() -> Window {
        Window {
            label: "1987-1991".to_string(),
            start: 1987.0,
            end: 1991.0,
        }
    }

    #[test]
    fn grid_is_restricted_to_common_span() {
        let reference = record(1986.0, 72, 0.0, 0.5);
        let candidate = record(1988.0, 24, 0.0, 0.5);
        let grid = OutputGrid::linspace(1980.0, 2020.0, 481).unwrap();

        let inputs = prepare_window(&window(), &reference, &candidate, &grid).unwrap();
        let (start, end) = inputs.candidate.span().unwrap();
        assert!(inputs.grid.times().iter().all(|&t| t >= start && t <= end));
        assert!(inputs.reference.times().iter().all(|&t| (1987.0..=1991.0).contains(&t)));
    }

    #[test]
    fn constant_shift_is_recovered_exactly_without_noise() {
        let reference = record(1987.0, 48, 0.0, 0.0);
        let candidate = record(1987.0, 48, 2.0, 0.0);
        let grid = OutputGrid::linspace(1980.0, 2020.0, 481).unwrap();

        let comparison =
            compare_window(&window(), &reference, &candidate, &grid, &engine(3), Mode::Trend).unwrap();
        for point in comparison.differences() {
            assert!((point.difference - 2.0).abs() < 1e-8);
            assert_eq!(point.difference_std_dev, 0.0);
            assert!(!point.extrapolated);
        }
    }

    #[test]
    fn shift_is_recovered_with_noise() {
        let reference = record(1987.0, 48, 0.0, 0.5);
        let candidate = record(1987.0, 48, 2.0, 0.5);
        let grid = OutputGrid::linspace(1980.0, 2020.0, 481).unwrap();

        let comparison =
            compare_window(&window(), &reference, &candidate, &grid, &engine(200), Mode::Smooth).unwrap();
        let offset = comparison.mean_offset();
        assert!((offset.mean - 2.0).abs() < 0.5);
        assert!(comparison.differences().iter().all(|p| p.difference_std_dev > 0.0));
    }

    #[test]
    fn empty_window_fails() {
        let reference = record(1987.0, 48, 0.0, 0.5);
        let candidate = record(2000.0, 48, 0.0, 0.5);
        let grid = OutputGrid::linspace(1980.0, 2020.0, 481).unwrap();

        let error =
            compare_window(&window(), &reference, &candidate, &grid, &engine(3), Mode::Smooth).unwrap_err();
        assert!(matches!(error, AnalysisError::InsufficientData { .. }));
    }

    #[test]
    fn compares_every_window_and_mode() {
        let reference = record(1987.0, 96, 0.0, 0.4);
        let candidate = record(1987.0, 96, 1.0, 0.4);
        let grid = OutputGrid::linspace(1980.0, 2020.0, 481).unwrap();

        let mut windows = BTreeMap::new();
        for (label, start, end) in [("a", 1987.0, 1991.0), ("b", 1991.0, 1995.0)] {
            windows.insert(
                label.to_string(),
                Window {
                    label: label.to_string(),
                    start,
                    end,
                },
            );
        }

        let comparisons = compare_windows(
            &windows,
            &reference,
            &candidate,
            &grid,
            &engine(8),
            &[Mode::Smooth, Mode::Trend],
        )
        .unwrap();
        let keys: Vec<(&str, Mode)> = comparisons
            .iter()
            .map(|c| (c.label.as_str(), c.mode))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a", Mode::Smooth),
                ("a", Mode::Trend),
                ("b", Mode::Smooth),
                ("b", Mode::Trend)
            ]
        );
    }

    #[test]
    fn ensembles_reproduce_the_comparison() {
        let reference = record(1987.0, 48, 0.0, 0.5);
        let candidate = record(1987.0, 48, 2.0, 0.5);
        let grid = OutputGrid::linspace(1980.0, 2020.0, 481).unwrap();
        let engine = engine(70);

        let direct = compare_window(&window(), &reference, &candidate, &grid, &engine, Mode::Smooth).unwrap();
        let kept =
            compare_window_ensembles(&window(), &reference, &candidate, &grid, &engine, Mode::Smooth).unwrap();

        assert_eq!(kept.reference.rows.len(), 70);
        assert_eq!(kept.candidate.rows.len(), 70);
        assert_eq!(kept.comparison.label, direct.label);
        for (a, b) in kept.comparison.differences().iter().zip(direct.differences()) {
            assert_eq!(a.time, b.time);
            assert!((a.difference - b.difference).abs() < 1e-9);
            assert!((a.difference_std_dev - b.difference_std_dev).abs() < 1e-9);
        }
    }

    #[test]
    fn failing_window_is_named() {
        let reference = record(1987.0, 48, 0.0, 0.5);
        let candidate = record(2000.0, 48, 0.0, 0.5);
        let grid = OutputGrid::linspace(1980.0, 2020.0, 481).unwrap();
        let windows = BTreeMap::from([(window().label, window())]);

        let error = compare_windows(&windows, &reference, &candidate, &grid, &engine(3), &[Mode::Trend])
            .unwrap_err();
        assert_eq!(error.to_string(), "failed to compare window 1987-1991 (trend)");
    }

    #[test]
    fn monthly_pairs_keep_common_months() {
        let reference = Series::new(
            vec![1990.01, 1990.03, 1990.1, 1990.2],
            vec![10.0, 12.0, 20.0, 30.0],
            vec![1.0, 1.0, 1.0, 1.0],
        )
        .unwrap();
        let candidate = Series::new(vec![1990.02, 1990.5], vec![13.0, 40.0], vec![0.5, 0.5]).unwrap();

        let pairs = pair_monthly(&reference, &candidate).unwrap();
        assert_eq!(pairs.len(), 1);
        let pair = pairs[0];
        assert_eq!((pair.year, pair.month), (1990, 1));
        assert!((pair.difference - 2.0).abs() < 1e-12);
        let ref_unc = 2.0_f64.sqrt() / 2.0;
        assert!((pair.difference_uncertainty - ref_unc.hypot(0.5)).abs() < 1e-12);
    }
}
