// ========================================================================================
//
//                   Missing-weight correction and final normalization
//
// ========================================================================================
//
// A pair's accumulated distance only covers markers where both individuals were called.
// Every marker carries a missing weight (1 in flat mode, or the expected absolute dosage
// difference among called individuals). After all batches, each distance is rescaled by
// the ratio of the total marker weight to the weight of the markers the pair shares:
//
//     tot / (tot - m_i - m_j + w_ij)
//
// where m_i is the weight of markers missing for i and w_ij the weight of markers missing
// for both, which the intersection pass accumulates into the weight matrix.

use crate::partition::ThreadPartition;
use crate::types::BINARY_BATCH_WIDTH;
use rayon::prelude::*;
use std::ops::Range;

/// Shared weight below this fraction of the total counts as "no shared markers".
const MIN_SHARED_FRACTION: f64 = 1e-12;

/// Mean absolute difference over all ordered pairs of the sorted values:
/// `(2 / n²) · Σ_r r·(n − r)·(s[r] − s[r−1])`. This is the expected distance contributed
/// by one record of the marker.
pub fn quantile_spread(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n < 2 {
        return 0.0;
    }
    let mut spread = 0.0;
    for r in 1..n {
        spread += (r * (n - r)) as f64 * (sorted[r] - sorted[r - 1]);
    }
    spread * 2.0 / (n as f64 * n as f64)
}

/// For every pair in `rows` whose missingness words intersect, adds the missing weights of
/// the shared-missing batch markers into the packed weight rows.
pub fn accumulate_missing_intersections(
    rows: Range<usize>,
    missing_bits: &[u64],
    missing_weights: &[f64; BINARY_BATCH_WIDTH],
    weights: &mut [f64],
) {
    let mut offset = 0;
    for i in rows {
        let out = &mut weights[offset..offset + i];
        offset += i;
        let missing_i = missing_bits[i];
        if missing_i == 0 {
            continue;
        }
        for (cell, &missing_j) in out.iter_mut().zip(&missing_bits[..i]) {
            let mut shared = missing_i & missing_j;
            while shared != 0 {
                *cell += missing_weights[shared.trailing_zeros() as usize];
                shared &= shared - 1;
            }
        }
    }
}

/// Rescales a binary-mode job by each pair's ratio of total to shared-nonmissing marker
/// weight. A zero total leaves every distance untouched; a pair sharing no weight gets NaN.
pub fn normalize_binary(
    partition: &ThreadPartition,
    distances: &mut [f64],
    weights: &[f64],
    missing_totals: &[f64],
    total_missing_weight: f64,
) {
    if total_missing_weight == 0.0 {
        return;
    }
    let floor = total_missing_weight * MIN_SHARED_FRACTION;
    partition
        .split_rows(distances)
        .enumerate()
        .par_bridge()
        .for_each(|(thread_idx, (rows, dist))| {
            let offset = partition.thread_offset(thread_idx);
            let wts = &weights[offset..offset + dist.len()];
            let mut cell = 0;
            for i in rows {
                let base = total_missing_weight - missing_totals[i];
                for j in 0..i {
                    let shared = base - missing_totals[j] + wts[cell];
                    dist[cell] = if shared > floor {
                        dist[cell] * (total_missing_weight / shared)
                    } else {
                        f64::NAN
                    };
                    cell += 1;
                }
            }
        });
}

/// Rescales a continuous-mode job by `marker_total / w_ij`; NaN where `w_ij` is zero.
pub fn normalize_continuous(
    partition: &ThreadPartition,
    distances: &mut [f64],
    weights: &[f64],
    marker_total: f64,
) {
    let floor = marker_total * MIN_SHARED_FRACTION;
    partition
        .split_rows(distances)
        .enumerate()
        .par_bridge()
        .for_each(|(thread_idx, (_, dist))| {
            let offset = partition.thread_offset(thread_idx);
            for (d, &w) in dist.iter_mut().zip(&weights[offset..]) {
                *d = if w > floor {
                    *d * (marker_total / w)
                } else {
                    f64::NAN
                };
            }
        });
}
