//! Offset correction and merging of two records into one harmonized series.

use crate::model::Series;
use serde::{Deserialize, Serialize};

/// Offset added to the candidate record over `[start, end)`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Offset {
    pub start: f64,
    pub end: f64,
    pub offset: f64,
    /// One-sigma uncertainty of the offset, added in quadrature.
    pub error: f64,
}

/// Interval `[start, end]` of the reference record left out of the merge.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Exclusion {
    pub start: f64,
    pub end: f64,
}

/// Apply `offsets` to `candidate`.
///
/// Observations covered by no interval are kept as they are.
/// Returns the corrected series and the number of uncovered observations.
pub fn apply_offsets(candidate: &Series, offsets: &[Offset]) -> (Series, usize) {
    let corrected = candidate.map(|mut obs| {
        if let Some(off) = offsets
            .iter()
            .find(|off| obs.time >= off.start && obs.time < off.end)
        {
            obs.value += off.offset;
            obs.uncertainty = obs.uncertainty.hypot(off.error);
        }
        Some(obs)
    });
    let n_uncovered = candidate
        .iter()
        .filter(|obs| {
            !offsets
                .iter()
                .any(|off| obs.time >= off.start && obs.time < off.end)
        })
        .count();
    (corrected, n_uncovered)
}

/// Merge the corrected candidate with the reference minus its excluded intervals.
pub fn harmonize(
    reference: &Series,
    candidate: &Series,
    offsets: &[Offset],
    exclusions: &[Exclusion],
) -> Series {
    let kept_reference = reference.filter(|obs| {
        !exclusions
            .iter()
            .any(|exc| obs.time >= exc.start && obs.time <= exc.end)
    });
    log::info!(
        "kept {} of {} reference observations",
        kept_reference.len(),
        reference.len()
    );

    let (corrected, n_uncovered) = apply_offsets(candidate, offsets);
    if n_uncovered > 0 {
        log::warn!("{n_uncovered} candidate observations are not covered by any offset");
    }

    kept_reference.merge(&corrected)
}
