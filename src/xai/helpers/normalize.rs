use ndarray::prelude::*;

use crate::xai::helpers::min_max;

const NORMALIZE_EPS: f32 = 1e-8;
const SIGNED_EPS: f32 = 1e-8;
const DEGENERATE_THRESHOLD: f32 = 1e-12;

/// Min-max normalise into `[0, 1]`. Empty input is returned unchanged and a
/// constant input maps to zeros.
pub fn normalize_01<D: Dimension>(x: ArrayView<'_, f32, D>) -> Array<f32, D> {
    normalize_01_eps(x, NORMALIZE_EPS)
}

pub fn normalize_01_eps<D: Dimension>(x: ArrayView<'_, f32, D>, eps: f32) -> Array<f32, D> {
    match min_max(x.iter()) {
        None => x.to_owned(),
        Some((lo, hi)) => x.mapv(|v| (v - lo) / (hi - lo + eps)),
    }
}

/// Percentile with linear interpolation between closest ranks, `q` in `[0, 100]`.
pub fn percentile(values: impl IntoIterator<Item = f32>, q: f32) -> Option<f32> {
    let mut sorted: Vec<f32> = values.into_iter().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f32::total_cmp);

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f32;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}

/// Symmetric robust normalisation of a signed map into `[-1, 1]`.
///
/// The threshold is the `p`-th percentile of `|heat|`; values are clipped to
/// `[-thr, thr]` and divided by `thr`. A (near) zero threshold yields zeros.
pub fn clip_and_normalize_signed<D: Dimension>(heat: ArrayView<'_, f32, D>, p: f32) -> Array<f32, D> {
    if heat.is_empty() {
        return heat.to_owned();
    }
    let threshold = percentile(heat.iter().map(|v| v.abs()), p).unwrap_or(0.0);
    if threshold <= DEGENERATE_THRESHOLD {
        return Array::zeros(heat.raw_dim());
    }
    heat.mapv(|v| v.clamp(-threshold, threshold) / (threshold + SIGNED_EPS))
}
