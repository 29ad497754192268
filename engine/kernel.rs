// ========================================================================================
//
//                      The kernel: masked Manhattan distance accumulation
//
// ========================================================================================
//
// For every pair (i, j) with j < i in a thread's rows, the kernel adds the masked sum of
// absolute dosage differences over the current batch into the packed lower triangle. It
// knows nothing about files, frequencies or missingness policy: it consumes a batch view
// that the encoder has already laid out, one fixed-width row per individual.
//
// Two interchangeable strategies implement the batched accumulate: a plain scalar loop
// and a `std::simd` version. They agree to within floating-point reassociation.

use crate::types::{BINARY_BATCH_WIDTH, CONTINUOUS_BATCH_WIDTH};
use std::ops::Range;
use std::simd::num::SimdFloat;
use std::simd::Simd;

pub const LANE_COUNT: usize = 4;
pub type SimdVec = Simd<f64, LANE_COUNT>;
pub type SimdMask = Simd<u64, LANE_COUNT>;

/// Which implementation of the inner accumulate to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KernelStrategy {
    Scalar,
    #[default]
    Simd,
}

// ========================================================================================
//                                   Batch views
// ========================================================================================

/// A validated view of a binary-missingness batch: `BINARY_BATCH_WIDTH` dosages and
/// nonmissing masks per individual, plus one missingness word per individual.
pub struct BinaryBatchView<'b> {
    dosages: &'b [f64],
    masks: &'b [u64],
    missing_bits: &'b [u64],
}

impl<'b> BinaryBatchView<'b> {
    pub fn new(
        dosages: &'b [f64],
        masks: &'b [u64],
        missing_bits: &'b [u64],
    ) -> Result<Self, &'static str> {
        let indiv_ct = missing_bits.len();
        if dosages.len() != indiv_ct * BINARY_BATCH_WIDTH || masks.len() != dosages.len() {
            return Err("Mismatched batch data: dosage and mask rows must match the individual count");
        }
        Ok(Self {
            dosages,
            masks,
            missing_bits,
        })
    }

    /// For buffers whose shape is fixed at allocation.
    pub(crate) fn trusted(dosages: &'b [f64], masks: &'b [u64], missing_bits: &'b [u64]) -> Self {
        debug_assert!(Self::new(dosages, masks, missing_bits).is_ok());
        Self {
            dosages,
            masks,
            missing_bits,
        }
    }

    #[inline(always)]
    fn dosage_row(&self, idx: usize) -> &'b [f64] {
        &self.dosages[idx * BINARY_BATCH_WIDTH..(idx + 1) * BINARY_BATCH_WIDTH]
    }

    #[inline(always)]
    fn mask_row(&self, idx: usize) -> &'b [u64] {
        &self.masks[idx * BINARY_BATCH_WIDTH..(idx + 1) * BINARY_BATCH_WIDTH]
    }
}

/// A validated view of a continuous batch: `CONTINUOUS_BATCH_WIDTH` dosages and
/// nonmissing weights per individual.
pub struct ContinuousBatchView<'b> {
    dosages: &'b [f64],
    weights: &'b [f64],
}

impl<'b> ContinuousBatchView<'b> {
    pub fn new(dosages: &'b [f64], weights: &'b [f64]) -> Result<Self, &'static str> {
        if dosages.len() % CONTINUOUS_BATCH_WIDTH != 0 || weights.len() != dosages.len() {
            return Err("Mismatched batch data: dosage and weight rows must have equal width");
        }
        Ok(Self { dosages, weights })
    }

    pub(crate) fn trusted(dosages: &'b [f64], weights: &'b [f64]) -> Self {
        debug_assert!(Self::new(dosages, weights).is_ok());
        Self { dosages, weights }
    }

    #[inline(always)]
    fn row(&self, idx: usize) -> (&'b [f64], &'b [f64]) {
        let span = idx * CONTINUOUS_BATCH_WIDTH..(idx + 1) * CONTINUOUS_BATCH_WIDTH;
        (&self.dosages[span.clone()], &self.weights[span])
    }
}

// ========================================================================================
//                              The batched accumulate
// ========================================================================================

/// One pair's contribution over a batch row.
pub trait BatchedAccumulate {
    /// `Σ |a - b| & a_mask & b_mask`.
    fn masked(a: &[f64], a_mask: &[u64], b: &[f64], b_mask: &[u64]) -> f64;
    /// `Σ |a - b| & b_mask`, used when `a` has no missing records.
    fn one_sided(a: &[f64], b: &[f64], b_mask: &[u64]) -> f64;
    /// `(Σ wa·wb·|a - b|, Σ wa·wb)`.
    fn weighted(a: &[f64], a_wt: &[f64], b: &[f64], b_wt: &[f64]) -> (f64, f64);
}

pub struct ScalarAccumulate;

impl BatchedAccumulate for ScalarAccumulate {
    #[inline]
    fn masked(a: &[f64], a_mask: &[u64], b: &[f64], b_mask: &[u64]) -> f64 {
        let mut acc = 0.0;
        for k in 0..a.len() {
            acc += f64::from_bits((a[k] - b[k]).abs().to_bits() & a_mask[k] & b_mask[k]);
        }
        acc
    }

    #[inline]
    fn one_sided(a: &[f64], b: &[f64], b_mask: &[u64]) -> f64 {
        let mut acc = 0.0;
        for k in 0..a.len() {
            acc += f64::from_bits((a[k] - b[k]).abs().to_bits() & b_mask[k]);
        }
        acc
    }

    #[inline]
    fn weighted(a: &[f64], a_wt: &[f64], b: &[f64], b_wt: &[f64]) -> (f64, f64) {
        let mut dist = 0.0;
        let mut wt = 0.0;
        for k in 0..a.len() {
            let pair_wt = a_wt[k] * b_wt[k];
            dist += pair_wt * (a[k] - b[k]).abs();
            wt += pair_wt;
        }
        (dist, wt)
    }
}

pub struct SimdAccumulate;

/// Loads a full vector from `slice[offset..]`. Rows are a whole number of vectors wide,
/// so the bounds check folds away in the row loops.
#[inline(always)]
fn load<T>(slice: &[T], offset: usize) -> Simd<T, LANE_COUNT>
where
    T: std::simd::SimdElement,
{
    Simd::from_slice(&slice[offset..offset + LANE_COUNT])
}

impl BatchedAccumulate for SimdAccumulate {
    #[inline]
    fn masked(a: &[f64], a_mask: &[u64], b: &[f64], b_mask: &[u64]) -> f64 {
        debug_assert!(a.len() % LANE_COUNT == 0);
        let mut acc = SimdVec::splat(0.0);
        for offset in (0..a.len()).step_by(LANE_COUNT) {
            let diff = (load(a, offset) - load(b, offset)).abs();
            let mask: SimdMask = load(a_mask, offset) & load(b_mask, offset);
            acc += SimdVec::from_bits(diff.to_bits() & mask);
        }
        acc.reduce_sum()
    }

    #[inline]
    fn one_sided(a: &[f64], b: &[f64], b_mask: &[u64]) -> f64 {
        debug_assert!(a.len() % LANE_COUNT == 0);
        let mut acc = SimdVec::splat(0.0);
        for offset in (0..a.len()).step_by(LANE_COUNT) {
            let diff = (load(a, offset) - load(b, offset)).abs();
            acc += SimdVec::from_bits(diff.to_bits() & load(b_mask, offset));
        }
        acc.reduce_sum()
    }

    #[inline]
    fn weighted(a: &[f64], a_wt: &[f64], b: &[f64], b_wt: &[f64]) -> (f64, f64) {
        debug_assert!(a.len() % LANE_COUNT == 0);
        let mut dist = SimdVec::splat(0.0);
        let mut wt = SimdVec::splat(0.0);
        for offset in (0..a.len()).step_by(LANE_COUNT) {
            let pair_wt = load(a_wt, offset) * load(b_wt, offset);
            dist += pair_wt * (load(a, offset) - load(b, offset)).abs();
            wt += pair_wt;
        }
        (dist.reduce_sum(), wt.reduce_sum())
    }
}

// ========================================================================================
//                              Per-thread row loops
// ========================================================================================

/// Adds one binary batch into the packed rows `rows` of `distances`. `distances` starts
/// at the first entry of `rows.start`.
pub fn accumulate_binary(
    strategy: KernelStrategy,
    rows: Range<usize>,
    batch: &BinaryBatchView<'_>,
    distances: &mut [f64],
) {
    match strategy {
        KernelStrategy::Scalar => binary_rows::<ScalarAccumulate>(rows, batch, distances),
        KernelStrategy::Simd => binary_rows::<SimdAccumulate>(rows, batch, distances),
    }
}

fn binary_rows<A: BatchedAccumulate>(
    rows: Range<usize>,
    batch: &BinaryBatchView<'_>,
    distances: &mut [f64],
) {
    let mut offset = 0;
    for i in rows {
        let out = &mut distances[offset..offset + i];
        offset += i;
        let dosage_i = batch.dosage_row(i);
        if batch.missing_bits[i] == 0 {
            for (j, cell) in out.iter_mut().enumerate() {
                *cell += A::one_sided(dosage_i, batch.dosage_row(j), batch.mask_row(j));
            }
        } else {
            let mask_i = batch.mask_row(i);
            for (j, cell) in out.iter_mut().enumerate() {
                *cell += A::masked(dosage_i, mask_i, batch.dosage_row(j), batch.mask_row(j));
            }
        }
    }
}

/// Adds one continuous batch into the packed rows `rows` of both matrices.
pub fn accumulate_continuous(
    strategy: KernelStrategy,
    rows: Range<usize>,
    batch: &ContinuousBatchView<'_>,
    distances: &mut [f64],
    weights: &mut [f64],
) {
    match strategy {
        KernelStrategy::Scalar => {
            continuous_rows::<ScalarAccumulate>(rows, batch, distances, weights)
        }
        KernelStrategy::Simd => continuous_rows::<SimdAccumulate>(rows, batch, distances, weights),
    }
}

fn continuous_rows<A: BatchedAccumulate>(
    rows: Range<usize>,
    batch: &ContinuousBatchView<'_>,
    distances: &mut [f64],
    weights: &mut [f64],
) {
    let mut offset = 0;
    for i in rows {
        let dist_out = &mut distances[offset..offset + i];
        let wt_out = &mut weights[offset..offset + i];
        offset += i;
        let (dosage_i, wt_i) = batch.row(i);
        for (j, (dist, wt)) in dist_out.iter_mut().zip(wt_out.iter_mut()).enumerate() {
            let (dosage_j, wt_j) = batch.row(j);
            let (pair_dist, pair_wt) = A::weighted(dosage_i, wt_i, dosage_j, wt_j);
            *dist += pair_dist;
            *wt += pair_wt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const MISSING: u64 = 0;
    const CALLED: u64 = u64::MAX;

    struct RandomBatch {
        dosages: Vec<f64>,
        masks: Vec<u64>,
        missing_bits: Vec<u64>,
    }

    fn random_batch(indiv_ct: usize, missing_rate: f64, seed: u64) -> RandomBatch {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut batch = RandomBatch {
            dosages: vec![0.0; indiv_ct * BINARY_BATCH_WIDTH],
            masks: vec![CALLED; indiv_ct * BINARY_BATCH_WIDTH],
            missing_bits: vec![0; indiv_ct],
        };
        for idx in 0..indiv_ct {
            for k in 0..BINARY_BATCH_WIDTH {
                let cell = idx * BINARY_BATCH_WIDTH + k;
                if rng.gen_bool(missing_rate) {
                    batch.masks[cell] = MISSING;
                    batch.missing_bits[idx] |= 1 << k;
                } else {
                    batch.dosages[cell] = rng.gen_range(0.0..2.0);
                }
            }
        }
        batch
    }

    fn packed_len(indiv_ct: usize) -> usize {
        indiv_ct * (indiv_ct - 1) / 2
    }

    #[test]
    fn scalar_and_simd_agree_on_binary_batches() {
        for (seed, missing_rate) in [(1, 0.0), (2, 0.1), (3, 0.6)] {
            let indiv_ct = 23;
            let data = random_batch(indiv_ct, missing_rate, seed);
            let view = BinaryBatchView::new(&data.dosages, &data.masks, &data.missing_bits).unwrap();
            let mut scalar = vec![0.0; packed_len(indiv_ct)];
            let mut simd = vec![0.0; packed_len(indiv_ct)];
            accumulate_binary(KernelStrategy::Scalar, 0..indiv_ct, &view, &mut scalar);
            accumulate_binary(KernelStrategy::Simd, 0..indiv_ct, &view, &mut simd);
            for (s, v) in scalar.iter().zip(&simd) {
                assert_relative_eq!(*s, *v, epsilon = 1e-12, max_relative = 1e-12);
            }
        }
    }

    #[test]
    fn binary_kernel_computes_masked_manhattan_distance() {
        let data = random_batch(6, 0.3, 11);
        let view = BinaryBatchView::new(&data.dosages, &data.masks, &data.missing_bits).unwrap();
        let mut out = vec![0.0; packed_len(6)];
        accumulate_binary(KernelStrategy::Simd, 0..6, &view, &mut out);
        let mut cell = 0;
        for i in 0..6 {
            for j in 0..i {
                let expected: f64 = (0..BINARY_BATCH_WIDTH)
                    .filter(|&k| {
                        data.masks[i * BINARY_BATCH_WIDTH + k] != MISSING
                            && data.masks[j * BINARY_BATCH_WIDTH + k] != MISSING
                    })
                    .map(|k| {
                        (data.dosages[i * BINARY_BATCH_WIDTH + k]
                            - data.dosages[j * BINARY_BATCH_WIDTH + k])
                            .abs()
                    })
                    .sum();
                assert_relative_eq!(out[cell], expected, epsilon = 1e-12);
                cell += 1;
            }
        }
    }

    #[test]
    fn row_ranges_write_only_their_own_entries() {
        let data = random_batch(10, 0.2, 5);
        let view = BinaryBatchView::new(&data.dosages, &data.masks, &data.missing_bits).unwrap();
        let mut whole = vec![0.0; packed_len(10)];
        accumulate_binary(KernelStrategy::Scalar, 0..10, &view, &mut whole);

        let split = packed_len(6);
        let mut pieces = vec![0.0; packed_len(10)];
        let (low, high) = pieces.split_at_mut(split);
        accumulate_binary(KernelStrategy::Scalar, 0..6, &view, low);
        accumulate_binary(KernelStrategy::Scalar, 6..10, &view, high);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn identical_rows_are_zero_distance() {
        let dosages = vec![1.25; 2 * BINARY_BATCH_WIDTH];
        let masks = vec![CALLED; 2 * BINARY_BATCH_WIDTH];
        let missing_bits = vec![0; 2];
        let view = BinaryBatchView::new(&dosages, &masks, &missing_bits).unwrap();
        let mut out = vec![0.0; 1];
        accumulate_binary(KernelStrategy::Simd, 0..2, &view, &mut out);
        assert_eq!(out[0], 0.0);
    }

    #[test]
    fn scalar_and_simd_agree_on_continuous_batches() {
        let indiv_ct = 9;
        let mut rng = StdRng::seed_from_u64(42);
        let dosages: Vec<f64> = (0..indiv_ct * CONTINUOUS_BATCH_WIDTH)
            .map(|_| rng.gen_range(0.0..2.0))
            .collect();
        let weights: Vec<f64> = (0..indiv_ct * CONTINUOUS_BATCH_WIDTH)
            .map(|_| rng.gen_range(0.0..1.0))
            .collect();
        let view = ContinuousBatchView::new(&dosages, &weights).unwrap();
        let mut scalar = (vec![0.0; packed_len(indiv_ct)], vec![0.0; packed_len(indiv_ct)]);
        let mut simd = scalar.clone();
        accumulate_continuous(KernelStrategy::Scalar, 0..indiv_ct, &view, &mut scalar.0, &mut scalar.1);
        accumulate_continuous(KernelStrategy::Simd, 0..indiv_ct, &view, &mut simd.0, &mut simd.1);
        for (s, v) in scalar.0.iter().zip(&simd.0).chain(scalar.1.iter().zip(&simd.1)) {
            assert_relative_eq!(*s, *v, epsilon = 1e-12, max_relative = 1e-12);
        }
        assert!(scalar.1.iter().all(|&w| w >= 0.0));
    }

    #[test]
    fn views_reject_mismatched_lengths() {
        assert!(BinaryBatchView::new(&[0.0; 64], &[0; 63], &[0]).is_err());
        assert!(BinaryBatchView::new(&[0.0; 64], &[0; 64], &[0, 0]).is_err());
        assert!(ContinuousBatchView::new(&[0.0; 32], &[0.0; 31]).is_err());
    }
}
