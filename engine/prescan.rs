// ========================================================================================
//
//                           The genotype prescan: one read-only pass
//
// ========================================================================================
//
// Establishes the facts the distance pass depends on before any matrix is allocated: the
// marker count, the reference-allele frequency of every marker, the longest line, and
// whether missingness is strictly binary. The frequency array grows at the top of the
// arena while the arena's unused tail doubles as the line buffer.

use crate::arena::Scope;
use crate::error::{DosageError, GEN_FILE, Result};
use crate::io::{self, LineError, LineReader, ProbabilityBlock, ProbabilityRow};
use crate::progress::{PercentThrottle, ProgressObserver, ProgressStage};
use crate::types::PROBABILITY_EPSILON;
use std::io::Read;
use std::simd::f64x8;

/// What the prescan learned about the genotype file.
#[derive(Debug)]
pub struct GenotypeScan<'a> {
    frequencies: &'a [f64],
    max_line_len: usize,
    is_binary_missingness: bool,
}

impl<'a> GenotypeScan<'a> {
    /// Reference-allele frequency per marker, in file order.
    #[inline]
    pub fn frequencies(&self) -> &'a [f64] {
        self.frequencies
    }

    #[inline]
    pub fn marker_count(&self) -> usize {
        self.frequencies.len()
    }

    /// Longest line observed, plus one byte of slack.
    #[inline]
    pub fn max_line_len(&self) -> usize {
        self.max_line_len
    }

    /// True when every record's probabilities sum to 0 or to 1 (within tolerance).
    #[inline]
    pub fn is_binary_missingness(&self) -> bool {
        self.is_binary_missingness
    }
}

/// Running sums for one marker.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarkerTally {
    pub ref_allele_ct: f64,
    pub allele_wt: f64,
    pub is_binary: bool,
}

impl MarkerTally {
    pub fn new(maf_succ: bool) -> Self {
        let seed = if maf_succ { 1.0 } else { 0.0 };
        Self {
            ref_allele_ct: seed,
            allele_wt: seed,
            is_binary: true,
        }
    }

    #[inline]
    fn add(&mut self, p0: f64, p1: f64, p2: f64) {
        let wt = p0 + (p2 + p1);
        let ref_ct = p1 + 2.0 * p2;
        self.is_binary &= !breaks_binary(wt);
        self.ref_allele_ct += ref_ct;
        self.allele_wt += wt;
    }

    /// Eight individuals at once. Lane results are summed in lane order so the totals
    /// match the one-at-a-time path exactly.
    #[inline]
    fn add_block(&mut self, block: &ProbabilityBlock) {
        let p0 = f64x8::from_array(block.p0);
        let p1 = f64x8::from_array(block.p1);
        let p2 = f64x8::from_array(block.p2);
        let wts = (p0 + (p2 + p1)).to_array();
        let ref_cts = (p1 + f64x8::splat(2.0) * p2).to_array();
        for (wt, ref_ct) in wts.into_iter().zip(ref_cts) {
            self.is_binary &= !breaks_binary(wt);
            self.ref_allele_ct += ref_ct;
            self.allele_wt += wt;
        }
    }

    /// Reference-allele frequency; 0.5 when no allele weight was observed.
    #[inline]
    pub fn frequency(&self) -> f64 {
        if self.allele_wt == 0.0 {
            0.5
        } else {
            (self.ref_allele_ct * 0.5) / self.allele_wt
        }
    }
}

#[inline]
fn breaks_binary(wt: f64) -> bool {
    wt != 0.0 && (wt < 1.0 - PROBABILITY_EPSILON || wt > 1.0 + PROBABILITY_EPSILON)
}

/// Sums one `.gen` line over `indiv_ct` individuals.
pub fn tally_marker(
    line: &[u8],
    indiv_ct: usize,
    maf_succ: bool,
    block: &mut ProbabilityBlock,
) -> std::result::Result<MarkerTally, String> {
    let mut row = ProbabilityRow::new(line, indiv_ct)?;
    let mut tally = MarkerTally::new(maf_succ);
    while row.next_block(block)? {
        if block.is_full() {
            tally.add_block(block);
        } else {
            for lane in 0..block.len {
                let (p0, p1, p2) = block.triple(lane);
                tally.add(p0, p1, p2);
            }
        }
    }
    Ok(tally)
}

/// Reads the whole genotype file once. `indiv_ct` is the unfiltered individual count
/// and `total_bytes` the file length used for percentage progress.
pub fn scan_genotypes<'a, R: Read>(
    scope: &mut Scope<'a>,
    reader: &mut LineReader<R>,
    indiv_ct: usize,
    maf_succ: bool,
    total_bytes: u64,
    progress: &mut dyn ProgressObserver,
) -> Result<GenotypeScan<'a>> {
    let mut frequencies = scope.growable::<f64>();
    let mut block = ProbabilityBlock::default();
    let mut is_binary_missingness = true;
    let mut longest = 0usize;
    let mut line_no = 0usize;
    let mut throttle = PercentThrottle::new(total_bytes);
    progress.on_stage_start(ProgressStage::GenotypeScan, total_bytes);

    loop {
        let tally = {
            let line = match reader.read_line(frequencies.spare_bytes()) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(LineError::TooLong { limit }) => {
                    return Err(DosageError::OutOfMemory {
                        requested: limit + 1,
                        available: limit,
                    });
                }
                Err(LineError::Io(source)) => return Err(DosageError::read(GEN_FILE, source)),
            };
            line_no += 1;
            longest = longest.max(line.len());
            if io::is_blank(line) {
                continue;
            }
            tally_marker(line, indiv_ct, maf_succ, &mut block)
                .map_err(|message| DosageError::format(GEN_FILE, format!("line {line_no}: {message}")))?
        };
        is_binary_missingness &= tally.is_binary;
        frequencies.push(tally.frequency())?;
        throttle.update(progress, ProgressStage::GenotypeScan, reader.bytes_consumed());
    }
    progress.on_stage_finish(ProgressStage::GenotypeScan);

    if frequencies.is_empty() {
        return Err(DosageError::NoMarkersFound);
    }
    let frequencies = frequencies.finish();
    log::info!(
        ".gen scan complete. {} markers and {} individuals present.",
        frequencies.len(),
        indiv_ct
    );
    if !is_binary_missingness {
        log::debug!("Genotype probabilities carry fractional missingness.");
    }
    Ok(GenotypeScan {
        frequencies,
        max_line_len: longest + 1,
        is_binary_missingness,
    })
}
