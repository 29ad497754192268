// ========================================================================================
//
//                               Shared types and bitmaps
//
// ========================================================================================

/// Bits per bitmap word. Individuals and batch markers are tracked one bit each.
pub const BITS_PER_WORD: usize = u64::BITS as usize;

/// Markers per batch when missingness is strictly binary. One batch fills exactly one
/// missingness word per individual.
pub const BINARY_BATCH_WIDTH: usize = BITS_PER_WORD;

/// Markers per batch when every record carries a fractional nonmissing weight.
pub const CONTINUOUS_BATCH_WIDTH: usize = BITS_PER_WORD / 2;

/// Number of leading metadata fields on every `.gen` line.
pub const GEN_METADATA_FIELDS: usize = 5;

/// Tolerance used when deciding whether a probability triple sums to one.
pub const PROBABILITY_EPSILON: f64 = 0.000244140625;

/// How missingness is represented in the accumulation kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingnessMode {
    /// Every record is either fully called (triple sums to 1) or missing (all zero).
    Binary,
    /// Every record contributes its probability sum as a nonmissing weight.
    Continuous,
}

/// One slice of a job-split run. `index` is 0-based and strictly less than `total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelJob {
    pub index: usize,
    pub total: usize,
}

impl ParallelJob {
    pub const SINGLE: Self = Self { index: 0, total: 1 };
}

#[inline]
pub fn words_for_bits(bit_ct: usize) -> usize {
    bit_ct.div_ceil(BITS_PER_WORD)
}

#[inline]
pub fn set_bit(words: &mut [u64], idx: usize) {
    words[idx / BITS_PER_WORD] |= 1u64 << (idx % BITS_PER_WORD);
}

#[inline]
pub fn is_set(words: &[u64], idx: usize) -> bool {
    (words[idx / BITS_PER_WORD] >> (idx % BITS_PER_WORD)) & 1 != 0
}

#[inline]
pub fn count_set(words: &[u64]) -> usize {
    words.iter().map(|w| w.count_ones() as usize).sum()
}
