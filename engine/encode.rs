// ========================================================================================
//
//                      Dosage and missingness encoding into batches
//
// ========================================================================================
//
// Each `.gen` line becomes one column of the current batch. Every included individual
// owns a fixed-width row: dosages, and either nonmissing masks plus a missingness word
// (binary mode) or fractional nonmissing weights (continuous mode). Excluded individuals
// are skipped entirely, so batch rows are dense over the included set.

use crate::arena::Scope;
use crate::error::Result;
use crate::io::{ProbabilityBlock, ProbabilityRow};
use crate::kernel::{BinaryBatchView, ContinuousBatchView};
use crate::missing::quantile_spread;
use crate::sample::SampleTable;
use crate::types::{BINARY_BATCH_WIDTH, CONTINUOUS_BATCH_WIDTH};

/// Bit pattern of a called record's mask: every bit set.
pub const NONMISSING_MASK: u64 = u64::MAX;

/// Distance weight of a marker with reference-allele frequency `freq`:
/// `(2·f·(1 − f))^(−exponent)` for `0 < f < 1`, otherwise 1.
#[inline]
pub fn marker_weight(freq: f64, exponent: f64) -> f64 {
    if exponent == 0.0 {
        return 1.0;
    }
    if freq > 0.0 && freq < 1.0 {
        (2.0 * freq * (1.0 - freq)).powf(-exponent)
    } else {
        1.0
    }
}

/// How a missing record is weighted in the final rescale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingWeighting {
    /// Every marker counts once.
    Flat,
    /// A marker counts by the expected absolute dosage difference among called records.
    Quantile,
}

impl MissingWeighting {
    #[inline]
    pub fn from_flat(flat_missing: bool) -> Self {
        if flat_missing { Self::Flat } else { Self::Quantile }
    }
}

// ========================================================================================
//                                  Binary batches
// ========================================================================================

pub struct BinaryBatch<'a> {
    dosages: &'a mut [f64],
    masks: &'a mut [u64],
    missing_bits: &'a mut [u64],
    missing_weights: [f64; BINARY_BATCH_WIDTH],
    filled: usize,
}

impl<'a> BinaryBatch<'a> {
    pub fn new(scope: &Scope<'a>, indiv_ct: usize) -> Result<Self> {
        Ok(Self {
            dosages: scope.alloc_zeroed(indiv_ct * BINARY_BATCH_WIDTH)?,
            masks: scope.alloc_zeroed(indiv_ct * BINARY_BATCH_WIDTH)?,
            missing_bits: scope.alloc_zeroed(indiv_ct)?,
            missing_weights: [0.0; BINARY_BATCH_WIDTH],
            filled: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == BINARY_BATCH_WIDTH
    }

    #[inline]
    pub fn missing_bits(&self) -> &[u64] {
        self.missing_bits
    }

    #[inline]
    pub fn missing_weights(&self) -> &[f64; BINARY_BATCH_WIDTH] {
        &self.missing_weights
    }

    pub fn view(&self) -> BinaryBatchView<'_> {
        BinaryBatchView::trusted(self.dosages, self.masks, self.missing_bits)
    }

    /// Zeroes the unfilled columns of a partial final batch so they contribute nothing.
    pub fn pad(&mut self) {
        if self.is_full() {
            return;
        }
        for (dosages, masks) in self
            .dosages
            .chunks_exact_mut(BINARY_BATCH_WIDTH)
            .zip(self.masks.chunks_exact_mut(BINARY_BATCH_WIDTH))
        {
            dosages[self.filled..].fill(0.0);
            masks[self.filled..].fill(0);
        }
        self.missing_weights[self.filled..].fill(0.0);
    }

    /// Resets per-batch missingness after the kernels have consumed the batch.
    pub fn clear(&mut self) {
        self.missing_bits.fill(0);
        self.missing_weights = [0.0; BINARY_BATCH_WIDTH];
        self.filled = 0;
    }
}

/// Marker-level state that outlives individual batches.
pub struct BinaryEncoder<'a> {
    exponent: f64,
    weighting: MissingWeighting,
    called: &'a mut [f64],
    missing: &'a mut [usize],
    missing_totals: &'a mut [f64],
    total_missing_weight: f64,
}

impl<'a> BinaryEncoder<'a> {
    pub fn new(
        scope: &Scope<'a>,
        indiv_ct: usize,
        exponent: f64,
        weighting: MissingWeighting,
    ) -> Result<Self> {
        Ok(Self {
            exponent,
            weighting,
            called: scope.alloc_zeroed(indiv_ct)?,
            missing: scope.alloc_zeroed(indiv_ct)?,
            missing_totals: scope.alloc_zeroed(indiv_ct)?,
            total_missing_weight: 0.0,
        })
    }

    /// Per-individual sum of the missing weights of its missing markers.
    #[inline]
    pub fn missing_totals(&self) -> &[f64] {
        self.missing_totals
    }

    /// Sum of every encoded marker's missing weight.
    #[inline]
    pub fn total_missing_weight(&self) -> f64 {
        self.total_missing_weight
    }

    /// Writes one marker into the next column of `batch`.
    pub fn encode_marker(
        &mut self,
        batch: &mut BinaryBatch<'_>,
        line: &[u8],
        freq: f64,
        samples: &SampleTable<'_>,
        block: &mut ProbabilityBlock,
    ) -> std::result::Result<(), String> {
        debug_assert!(!batch.is_full());
        let column = batch.filled;
        let bit = 1u64 << column;
        let marker_wt = marker_weight(freq, self.exponent);
        let mut row = ProbabilityRow::new(line, samples.unfiltered_count())?;
        let mut indiv_idx = 0usize;
        let mut called_ct = 0usize;
        let mut missing_ct = 0usize;

        while row.next_block(block)? {
            for lane in 0..block.len {
                if samples.is_excluded(block.first + lane) {
                    continue;
                }
                let (p0, p1, p2) = block.triple(lane);
                let cell = indiv_idx * BINARY_BATCH_WIDTH + column;
                if p0 == 0.0 && p1 == 0.0 && p2 == 0.0 {
                    batch.dosages[cell] = 0.0;
                    batch.masks[cell] = 0;
                    batch.missing_bits[indiv_idx] |= bit;
                    self.missing[missing_ct] = indiv_idx;
                    missing_ct += 1;
                } else {
                    let dosage = (p1 + 2.0 * p2) * marker_wt;
                    batch.dosages[cell] = dosage;
                    batch.masks[cell] = NONMISSING_MASK;
                    self.called[called_ct] = dosage;
                    called_ct += 1;
                }
                indiv_idx += 1;
            }
        }

        let missing_wt = match self.weighting {
            MissingWeighting::Flat => 1.0,
            MissingWeighting::Quantile => {
                let called = &mut self.called[..called_ct];
                called.sort_unstable_by(f64::total_cmp);
                quantile_spread(called)
            }
        };
        batch.missing_weights[column] = missing_wt;
        self.total_missing_weight += missing_wt;
        for &idx in self.missing[..missing_ct].iter() {
            self.missing_totals[idx] += missing_wt;
        }
        batch.filled += 1;
        Ok(())
    }
}

// ========================================================================================
//                                Continuous batches
// ========================================================================================

pub struct ContinuousBatch<'a> {
    dosages: &'a mut [f64],
    weights: &'a mut [f64],
    filled: usize,
}

/// Outcome of encoding one marker in a single pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SinglePassMarker {
    /// Reference-allele frequency derived from the row, or NaN when the row carries no
    /// allele weight at all.
    pub frequency: f64,
    pub weight: f64,
}

impl SinglePassMarker {
    #[inline]
    pub fn is_included(&self) -> bool {
        !self.frequency.is_nan()
    }
}

impl<'a> ContinuousBatch<'a> {
    pub fn new(scope: &Scope<'a>, indiv_ct: usize) -> Result<Self> {
        Ok(Self {
            dosages: scope.alloc_zeroed(indiv_ct * CONTINUOUS_BATCH_WIDTH)?,
            weights: scope.alloc_zeroed(indiv_ct * CONTINUOUS_BATCH_WIDTH)?,
            filled: 0,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.filled
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.filled == CONTINUOUS_BATCH_WIDTH
    }

    pub fn view(&self) -> ContinuousBatchView<'_> {
        ContinuousBatchView::trusted(self.dosages, self.weights)
    }

    pub fn pad(&mut self) {
        if self.is_full() {
            return;
        }
        for (dosages, weights) in self
            .dosages
            .chunks_exact_mut(CONTINUOUS_BATCH_WIDTH)
            .zip(self.weights.chunks_exact_mut(CONTINUOUS_BATCH_WIDTH))
        {
            dosages[self.filled..].fill(0.0);
            weights[self.filled..].fill(0.0);
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.filled = 0;
    }

    /// Encodes one marker without a prescan: the frequency and weight come from the same
    /// row, and the column is scaled by the weight once the row is complete. A marker
    /// with no allele weight is excluded and leaves the batch untouched.
    pub fn encode_marker(
        &mut self,
        line: &[u8],
        exponent: f64,
        samples: &SampleTable<'_>,
        block: &mut ProbabilityBlock,
    ) -> std::result::Result<SinglePassMarker, String> {
        debug_assert!(!self.is_full());
        let column = self.filled;
        let mut row = ProbabilityRow::new(line, samples.unfiltered_count())?;
        let mut indiv_idx = 0usize;
        let mut numer = 0.0;
        let mut denom = 0.0;

        while row.next_block(block)? {
            for lane in 0..block.len {
                if samples.is_excluded(block.first + lane) {
                    continue;
                }
                let (p0, p1, p2) = block.triple(lane);
                let cell = indiv_idx * CONTINUOUS_BATCH_WIDTH + column;
                let dosage = p1 + 2.0 * p2;
                let nonmissing = p0 + p1 + p2;
                self.dosages[cell] = dosage;
                self.weights[cell] = nonmissing;
                numer += dosage;
                denom += 2.0 * nonmissing;
                indiv_idx += 1;
            }
        }

        if denom == 0.0 {
            return Ok(SinglePassMarker {
                frequency: f64::NAN,
                weight: 0.0,
            });
        }
        let frequency = numer / denom;
        let weight = if numer == 0.0 || numer == denom {
            1.0
        } else {
            marker_weight(frequency, exponent)
        };
        if weight != 1.0 {
            for dosages in self.dosages.chunks_exact_mut(CONTINUOUS_BATCH_WIDTH) {
                dosages[column] *= weight;
            }
        }
        self.filled += 1;
        Ok(SinglePassMarker { frequency, weight })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::sample::read_samples;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn samples_text(n: usize) -> Vec<u8> {
        let mut text = String::from("ID_1 ID_2 missing sex pheno\n0 0 0 D P\n");
        for idx in 0..n {
            text.push_str(&format!("f{idx} i{idx} 0 1 1\n"));
        }
        text.into_bytes()
    }

    fn gen_row(triples: &[(f64, f64, f64)]) -> Vec<u8> {
        let mut line = String::from("1 rs 1 A G");
        for (p0, p1, p2) in triples {
            line.push_str(&format!(" {p0} {p1} {p2}"));
        }
        line.into_bytes()
    }

    #[test]
    fn marker_weight_cases() {
        assert_eq!(marker_weight(0.3, 0.0), 1.0);
        assert_eq!(marker_weight(0.0, 1.0), 1.0);
        assert_eq!(marker_weight(1.0, 1.0), 1.0);
        assert_relative_eq!(marker_weight(0.5, 1.0), 2.0);
        assert_relative_eq!(marker_weight(0.1, 0.5), (0.18f64).powf(-0.5));
    }

    #[test]
    fn binary_encoder_writes_dosages_masks_and_missing_weights() {
        let mut arena = Arena::with_capacity(1 << 22).unwrap();
        let mut scope = arena.scope();
        let mut samples = read_samples(&mut scope, Cursor::new(samples_text(4)), None).unwrap();
        samples.exclude(2);
        let mut batch = BinaryBatch::new(&scope, 3).unwrap();
        let mut encoder = BinaryEncoder::new(&scope, 3, 0.0, MissingWeighting::Quantile).unwrap();
        let mut block = ProbabilityBlock::default();

        let row = gen_row(&[(1.0, 0.0, 0.0), (0.0, 0.2, 0.8), (0.0, 0.0, 1.0), (0.0, 0.0, 0.0)]);
        encoder
            .encode_marker(&mut batch, &row, 0.5, &samples, &mut block)
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.dosages[0], 0.0);
        assert_relative_eq!(batch.dosages[BINARY_BATCH_WIDTH], 1.8);
        assert_eq!(batch.masks[BINARY_BATCH_WIDTH], NONMISSING_MASK);
        assert_eq!(batch.masks[2 * BINARY_BATCH_WIDTH], 0);
        assert_eq!(batch.missing_bits(), &[0, 0, 1]);
        // called values 0.0 and 1.8: spread = 2/4 * 1.8
        assert_relative_eq!(batch.missing_weights()[0], 0.9);
        assert_relative_eq!(encoder.missing_totals()[2], 0.9);
        assert_relative_eq!(encoder.total_missing_weight(), 0.9);
        for value in &batch.dosages[..3 * BINARY_BATCH_WIDTH] {
            assert!((0.0..=2.0).contains(value));
        }
    }

    #[test]
    fn flat_weighting_counts_each_marker_once() {
        let mut arena = Arena::with_capacity(1 << 22).unwrap();
        let mut scope = arena.scope();
        let samples = read_samples(&mut scope, Cursor::new(samples_text(2)), None).unwrap();
        let mut batch = BinaryBatch::new(&scope, 2).unwrap();
        let mut encoder = BinaryEncoder::new(&scope, 2, 0.0, MissingWeighting::Flat).unwrap();
        let mut block = ProbabilityBlock::default();
        for _ in 0..3 {
            let row = gen_row(&[(0.0, 0.0, 0.0), (0.0, 1.0, 0.0)]);
            encoder
                .encode_marker(&mut batch, &row, 0.25, &samples, &mut block)
                .unwrap();
        }
        assert_eq!(encoder.total_missing_weight(), 3.0);
        assert_eq!(encoder.missing_totals(), &[3.0, 0.0]);
        assert_eq!(batch.missing_bits()[0], 0b111);
        assert_eq!(&batch.missing_weights()[..4], &[1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn pad_and_clear_reset_batch_state() {
        let mut arena = Arena::with_capacity(1 << 22).unwrap();
        let mut scope = arena.scope();
        let samples = read_samples(&mut scope, Cursor::new(samples_text(2)), None).unwrap();
        let mut batch = BinaryBatch::new(&scope, 2).unwrap();
        batch.dosages.fill(7.0);
        batch.masks.fill(NONMISSING_MASK);
        let mut encoder = BinaryEncoder::new(&scope, 2, 0.0, MissingWeighting::Flat).unwrap();
        let mut block = ProbabilityBlock::default();
        let row = gen_row(&[(0.0, 0.0, 0.0), (0.0, 0.0, 1.0)]);
        encoder
            .encode_marker(&mut batch, &row, 0.5, &samples, &mut block)
            .unwrap();
        batch.pad();
        assert!(batch.dosages[1..BINARY_BATCH_WIDTH].iter().all(|&d| d == 0.0));
        assert!(batch.masks[BINARY_BATCH_WIDTH + 1..].iter().all(|&m| m == 0));
        batch.clear();
        assert!(batch.is_empty());
        assert!(batch.missing_bits().iter().all(|&w| w == 0));
        assert!(batch.missing_weights().iter().all(|&w| w == 0.0));
    }

    #[test]
    fn single_pass_marker_derives_frequency_from_row() {
        let mut arena = Arena::with_capacity(1 << 22).unwrap();
        let mut scope = arena.scope();
        let samples = read_samples(&mut scope, Cursor::new(samples_text(3)), None).unwrap();
        let mut batch = ContinuousBatch::new(&scope, 3).unwrap();
        let mut block = ProbabilityBlock::default();

        let row = gen_row(&[(1.0, 0.0, 0.0), (0.0, 1.0, 0.0), (0.0, 0.0, 0.5)]);
        let marker = batch.encode_marker(&row, 1.0, &samples, &mut block).unwrap();
        // numer = 0 + 1 + 1 = 2; denom = 2 * (1 + 1 + 0.5) = 5
        assert_relative_eq!(marker.frequency, 0.4);
        assert_relative_eq!(marker.weight, (2.0 * 0.4 * 0.6f64).powf(-1.0));
        assert_relative_eq!(batch.dosages[CONTINUOUS_BATCH_WIDTH], marker.weight);
        assert_eq!(batch.weights[2 * CONTINUOUS_BATCH_WIDTH], 0.5);
        assert_eq!(batch.len(), 1);

        let empty = gen_row(&[(0.0, 0.0, 0.0); 3]);
        let excluded = batch.encode_marker(&empty, 1.0, &samples, &mut block).unwrap();
        assert!(!excluded.is_included());
        assert_eq!(batch.len(), 1);

        let monomorphic = gen_row(&[(1.0, 0.0, 0.0); 3]);
        let marker = batch.encode_marker(&monomorphic, 1.0, &samples, &mut block).unwrap();
        assert_eq!(marker.weight, 1.0);
    }
}
