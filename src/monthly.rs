//! Calendar-month aggregation of observation series.

use crate::calendar::{month_midpoint, month_of};
use crate::error::AnalysisError;
use crate::model::Series;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mean of the observations of one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonthlyMean {
    pub year: i32,
    pub month: u32,
    /// Decimal year of the middle of the month.
    pub time: f64,
    pub value: f64,
    /// Propagated instrumental uncertainty of the mean.
    pub uncertainty: f64,
    pub count: usize,
}

#[derive(Default)]
struct MonthGroup {
    value_sum: f64,
    unc_2_sum: f64,
    count: usize,
}

/// Group observations by calendar month, in chronological order.
///
/// The uncertainty of a month is `sqrt(sum(unc^2)) / count`, the error of a
/// mean of independent measurements computed from the reported
/// uncertainties, not from the scatter of the values. Months without
/// observations are absent.
pub fn monthly_groups(series: &Series) -> Result<Vec<MonthlyMean>, AnalysisError> {
    let mut groups: BTreeMap<(i32, u32), MonthGroup> = BTreeMap::new();
    for obs in series.iter() {
        let key = month_of(obs.time).ok_or_else(|| {
            AnalysisError::invalid("times", format!("{} is not a calendar date", obs.time))
        })?;
        let group = groups.entry(key).or_default();
        group.value_sum += obs.value;
        group.unc_2_sum += obs.uncertainty * obs.uncertainty;
        group.count += 1;
    }

    groups
        .into_iter()
        .map(|((year, month), group)| {
            let time = month_midpoint(year, month).ok_or_else(|| {
                AnalysisError::invalid("times", format!("invalid month {year}-{month:02}"))
            })?;
            let count = group.count as f64;
            Ok(MonthlyMean {
                year,
                month,
                time,
                value: group.value_sum / count,
                uncertainty: group.unc_2_sum.sqrt() / count,
                count: group.count,
            })
        })
        .collect()
}

/// Monthly means of a series as a new series at month granularity.
pub fn monthly_means(series: &Series) -> Result<Series, AnalysisError> {
    let mean_vec = monthly_groups(series)?;
    Series::new(
        mean_vec.iter().map(|mean| mean.time).collect(),
        mean_vec.iter().map(|mean| mean.value).collect(),
        mean_vec.iter().map(|mean| mean.uncertainty).collect(),
    )
}
