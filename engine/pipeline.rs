// ========================================================================================
//
//                          The batched distance pipeline
//
// ========================================================================================
//
// The coordinator reads one batch of markers at a time, encodes it, and then hands the
// batch to a fresh set of scoped workers, one per thread partition. Workers only ever
// write their own packed rows, so the join at the end of each kernel is the only
// synchronisation. The distance kernel finishes before the missing-intersection pass
// starts, and both finish before the next line is read.

use crate::arena::{Align, Scope};
use crate::config::{DistanceConfig, ScanMode};
use crate::encode::{BinaryBatch, BinaryEncoder, ContinuousBatch, MissingWeighting, marker_weight};
use crate::error::{DosageError, GEN_FILE, Result};
use crate::io::{self, LineError, LineReader, ProbabilityBlock};
use crate::kernel::{KernelStrategy, accumulate_binary, accumulate_continuous};
use crate::missing::{accumulate_missing_intersections, normalize_binary, normalize_continuous};
use crate::partition::{ThreadPartition, triangle_area};
use crate::prescan::{GenotypeScan, scan_genotypes};
use crate::progress::{PercentThrottle, ProgressObserver, ProgressStage};
use crate::sample::{SampleTable, load_samples};
use crate::types::MissingnessMode;
use std::io::{Read, Seek};
use std::ops::Range;
use std::path::Path;
use std::thread;

/// Packed lower-triangular distances for the rows owned by one job.
pub struct DistanceMatrix<'a> {
    distances: &'a [f64],
    weights: &'a [f64],
    rows: Range<usize>,
    marker_count: usize,
    weight_sum: f64,
    missingness: MissingnessMode,
}

impl<'a> DistanceMatrix<'a> {
    /// Rows `[start, end)` of the full matrix held by this job.
    #[inline]
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    #[inline]
    pub fn marker_count(&self) -> usize {
        self.marker_count
    }

    #[inline]
    pub fn missingness(&self) -> MissingnessMode {
        self.missingness
    }

    /// Multiplier turning an accumulated distance into a per-marker allele distance.
    #[inline]
    pub fn distance_scale(&self) -> f64 {
        0.5 / self.marker_count as f64
    }

    /// Multiplier turning an accumulated distance into an IBS distance in `[0, 1]`.
    #[inline]
    pub fn ibs_scale(&self) -> f64 {
        0.5 / self.weight_sum
    }

    fn offset(&self, i: usize, j: usize) -> Option<usize> {
        let (i, j) = if i > j { (i, j) } else { (j, i) };
        if i == j || !self.rows.contains(&i) {
            return None;
        }
        Some((triangle_area(i) - triangle_area(self.rows.start)) as usize + j)
    }

    /// Distance between included individuals `i` and `j`; `None` when the pair is not
    /// stored by this job. The diagonal is always zero.
    pub fn distance(&self, i: usize, j: usize) -> Option<f64> {
        if i == j {
            return self.rows.contains(&i).then_some(0.0);
        }
        self.offset(i, j).map(|idx| self.distances[idx])
    }

    /// The weight matrix entry for the pair: shared-missing weight in binary mode,
    /// accumulated pairwise nonmissing weight in continuous mode.
    pub fn weight(&self, i: usize, j: usize) -> Option<f64> {
        self.offset(i, j).map(|idx| self.weights[idx])
    }

    /// Distances from `i` to every `j < i`.
    pub fn row(&self, i: usize) -> Option<&'a [f64]> {
        if !self.rows.contains(&i) {
            return None;
        }
        let start = (triangle_area(i) - triangle_area(self.rows.start)) as usize;
        let distances = self.distances;
        Some(&distances[start..start + i])
    }

    /// The whole packed job-local triangle.
    #[inline]
    pub fn packed(&self) -> &'a [f64] {
        self.distances
    }
}

/// Result of a distance run over an already loaded sample table.
pub struct Distances<'a> {
    /// Reference-allele frequency of every marker line, in file order.
    pub frequencies: &'a [f64],
    pub matrix: DistanceMatrix<'a>,
}

/// Loads the sample table, then computes the distance matrix of the included individuals.
pub fn run<'a>(
    scope: &mut Scope<'a>,
    gen_path: &Path,
    sample_path: &Path,
    config: &DistanceConfig,
    progress: &mut dyn ProgressObserver,
) -> Result<(SampleTable<'a>, Distances<'a>)> {
    config.validate()?;
    progress.on_stage_start(ProgressStage::SampleLoad, 0);
    let samples = load_samples(scope, sample_path, config.missing_codes.as_deref())?;
    progress.on_stage_finish(ProgressStage::SampleLoad);
    log::info!(
        "{} individuals loaded from {}.",
        samples.unfiltered_count(),
        sample_path.display()
    );

    let file = io::open_checked(gen_path)?;
    let total_bytes = io::file_len(&file, gen_path)?;
    let distances = compute_distances(scope, file, total_bytes, &samples, config, progress)?;
    Ok((samples, distances))
}

/// Computes the distance matrix for the included individuals of `samples` from a
/// `.gen` source of `total_bytes` bytes.
pub fn compute_distances<'a, R: Read + Seek>(
    scope: &mut Scope<'a>,
    source: R,
    total_bytes: u64,
    samples: &SampleTable<'_>,
    config: &DistanceConfig,
    progress: &mut dyn ProgressObserver,
) -> Result<Distances<'a>> {
    config.validate()?;
    if config.distance_3d {
        return Err(DosageError::unsupported("3D distance calculation"));
    }
    let indiv_ct = samples.included_count();
    config.check_parallel(indiv_ct)?;
    let partition = ThreadPartition::new(indiv_ct, config.threads, config.job())?;
    if config.threads > 1 {
        log::info!("Using {} threads.", config.threads);
    }
    let mut reader = LineReader::new(source);

    match config.scan_mode {
        ScanMode::Prescan => {
            let scan = scan_genotypes(
                scope,
                &mut reader,
                samples.unfiltered_count(),
                config.maf_succ,
                total_bytes,
                progress,
            )?;
            if !scan.is_binary_missingness() {
                return Err(DosageError::unsupported(
                    "missing probabilities unequal to 0 and 1",
                ));
            }
            reader
                .rewind()
                .map_err(|source| DosageError::read(GEN_FILE, source))?;
            let matrix =
                prescanned_distances(scope, &mut reader, &scan, samples, config, &partition, progress)?;
            Ok(Distances {
                frequencies: scan.frequencies(),
                matrix,
            })
        }
        ScanMode::SinglePass => single_pass_distances(
            scope,
            &mut reader,
            total_bytes,
            samples,
            config,
            &partition,
            progress,
        ),
    }
}

// --- Worker dispatch ---

/// Runs `work` once per item: the first item on the calling thread, every other item on
/// a freshly spawned scoped worker. Returns once all of them have finished.
fn run_on_workers<I, F>(items: I, work: &F) -> Result<()>
where
    I: IntoIterator,
    I::Item: Send,
    F: Fn(I::Item) + Sync,
{
    spawn_workers(items, work, |thread_idx| {
        thread::Builder::new().name(format!("dosedist-worker-{thread_idx}"))
    })
}

/// `run_on_workers` with the builder for each worker supplied by the caller. Workers
/// already running when a spawn fails are joined before the error is returned.
fn spawn_workers<I, F, B>(items: I, work: &F, builder: B) -> Result<()>
where
    I: IntoIterator,
    I::Item: Send,
    F: Fn(I::Item) + Sync,
    B: Fn(usize) -> thread::Builder,
{
    thread::scope(|s| -> Result<()> {
        let mut items = items.into_iter();
        let Some(first) = items.next() else {
            return Ok(());
        };
        for (offset, item) in items.enumerate() {
            let thread_idx = offset + 1;
            builder(thread_idx)
                .spawn_scoped(s, move || work(item))
                .map_err(|source| DosageError::ThreadCreationFailure { thread_idx, source })?;
        }
        work(first);
        Ok(())
    })
}

fn process_binary_batch(
    strategy: KernelStrategy,
    partition: &ThreadPartition,
    batch: &BinaryBatch<'_>,
    distances: &mut [f64],
    weights: &mut [f64],
) -> Result<()> {
    let view = batch.view();
    run_on_workers(partition.split_rows(distances), &|(rows, dist)| {
        accumulate_binary(strategy, rows, &view, dist)
    })?;

    let missing_bits = batch.missing_bits();
    if missing_bits.iter().all(|&word| word == 0) {
        return Ok(());
    }
    let missing_weights = batch.missing_weights();
    run_on_workers(partition.split_rows(weights), &|(rows, wts)| {
        accumulate_missing_intersections(rows, missing_bits, missing_weights, wts)
    })
}

fn process_continuous_batch(
    strategy: KernelStrategy,
    partition: &ThreadPartition,
    batch: &ContinuousBatch<'_>,
    distances: &mut [f64],
    weights: &mut [f64],
) -> Result<()> {
    let view = batch.view();
    let pieces = partition.split_rows(distances).zip(partition.split_rows(weights));
    run_on_workers(pieces, &|((rows, dist), (_, wts))| {
        accumulate_continuous(strategy, rows, &view, dist, wts)
    })
}

fn gen_line_error(line_no: usize) -> impl FnOnce(String) -> DosageError {
    move |message| DosageError::format(GEN_FILE, format!("line {line_no}: {message}"))
}

// --- Prescanned path ---

fn prescanned_distances<'a, R: Read>(
    scope: &mut Scope<'a>,
    reader: &mut LineReader<R>,
    scan: &GenotypeScan<'_>,
    samples: &SampleTable<'_>,
    config: &DistanceConfig,
    partition: &ThreadPartition,
    progress: &mut dyn ProgressObserver,
) -> Result<DistanceMatrix<'a>> {
    let indiv_ct = samples.included_count();
    let frequencies = scan.frequencies();
    let marker_ct = scan.marker_count();
    let distances = scope.alloc_zeroed::<f64>(partition.job_len())?;
    let weights = scope.alloc_zeroed::<f64>(partition.job_len())?;

    {
        let work = scope.child();
        let line_buf = work.alloc_bytes(scan.max_line_len(), Align::Word)?;
        let mut batch = BinaryBatch::new(&work, indiv_ct)?;
        let mut encoder = BinaryEncoder::new(
            &work,
            indiv_ct,
            config.exponent,
            MissingWeighting::from_flat(config.flat_missing),
        )?;
        let mut block = ProbabilityBlock::default();
        let mut marker_idx = 0usize;
        let mut line_no = 0usize;
        progress.on_stage_start(ProgressStage::DistanceAccumulation, marker_ct as u64);

        loop {
            let line = match reader.read_line(line_buf) {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(LineError::TooLong { limit }) => {
                    return Err(DosageError::format(
                        GEN_FILE,
                        format!("line {} is longer than the {limit} bytes seen while scanning", line_no + 1),
                    ));
                }
                Err(LineError::Io(source)) => return Err(DosageError::read(GEN_FILE, source)),
            };
            line_no += 1;
            if io::is_blank(line) {
                continue;
            }
            let Some(&freq) = frequencies.get(marker_idx) else {
                return Err(DosageError::format(GEN_FILE, "file grew after it was scanned"));
            };
            encoder
                .encode_marker(&mut batch, line, freq, samples, &mut block)
                .map_err(gen_line_error(line_no))?;
            marker_idx += 1;
            if batch.is_full() {
                process_binary_batch(config.kernel, partition, &batch, distances, weights)?;
                batch.clear();
                progress.on_stage_advance(ProgressStage::DistanceAccumulation, marker_idx as u64);
            }
        }
        if marker_idx != marker_ct {
            return Err(DosageError::format(GEN_FILE, "file shrank after it was scanned"));
        }
        if !batch.is_empty() {
            batch.pad();
            process_binary_batch(config.kernel, partition, &batch, distances, weights)?;
            batch.clear();
            progress.on_stage_advance(ProgressStage::DistanceAccumulation, marker_idx as u64);
        }
        progress.on_stage_finish(ProgressStage::DistanceAccumulation);

        log::debug!(
            "Total missing weight {} over {marker_ct} markers.",
            encoder.total_missing_weight()
        );
        normalize_binary(
            partition,
            distances,
            weights,
            encoder.missing_totals(),
            encoder.total_missing_weight(),
        );
    }
    log::info!("Distance calculation complete.");

    let weight_sum = frequencies
        .iter()
        .map(|&freq| marker_weight(freq, config.exponent))
        .sum();
    Ok(DistanceMatrix {
        distances,
        weights,
        rows: partition.job_rows(),
        marker_count: marker_ct,
        weight_sum,
        missingness: MissingnessMode::Binary,
    })
}

// --- Single-pass path ---

#[derive(Default)]
struct SinglePassTally {
    included: usize,
    weight_sum: f64,
}

fn single_pass_distances<'a, R: Read>(
    scope: &mut Scope<'a>,
    reader: &mut LineReader<R>,
    total_bytes: u64,
    samples: &SampleTable<'_>,
    config: &DistanceConfig,
    partition: &ThreadPartition,
    progress: &mut dyn ProgressObserver,
) -> Result<Distances<'a>> {
    if !config.flat_missing {
        log::warn!(
            "Frequency-weighted missing handling is not available without a prescan; counting missing markers flatly."
        );
    }
    let indiv_ct = samples.included_count();
    let distances = scope.alloc_zeroed::<f64>(partition.job_len())?;
    let weights = scope.alloc_zeroed::<f64>(partition.job_len())?;
    let mut tally = SinglePassTally::default();
    let mut throttle = PercentThrottle::new(total_bytes);
    progress.on_stage_start(ProgressStage::DistanceAccumulation, total_bytes);

    let frequencies = scope.retain(|work| {
        let mut batch = ContinuousBatch::new(work, indiv_ct)?;
        let mut frequencies = work.growable::<f64>();
        let mut block = ProbabilityBlock::default();
        let mut line_no = 0usize;

        loop {
            let marker = {
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
                if io::is_blank(line) {
                    continue;
                }
                batch
                    .encode_marker(line, config.exponent, samples, &mut block)
                    .map_err(gen_line_error(line_no))?
            };
            frequencies.push(marker.frequency)?;
            if marker.is_included() {
                tally.included += 1;
                tally.weight_sum += marker.weight;
            }
            if batch.is_full() {
                process_continuous_batch(config.kernel, partition, &batch, distances, weights)?;
                batch.clear();
            }
            throttle.update(progress, ProgressStage::DistanceAccumulation, reader.bytes_consumed());
        }
        if !batch.is_empty() {
            batch.pad();
            process_continuous_batch(config.kernel, partition, &batch, distances, weights)?;
            batch.clear();
        }
        Ok(frequencies.finish())
    })?;
    progress.on_stage_finish(ProgressStage::DistanceAccumulation);

    if tally.included == 0 {
        return Err(DosageError::NoMarkersFound);
    }
    log::info!(
        ".gen read complete. {} markers used ({} without allele weight skipped).",
        tally.included,
        frequencies.len() - tally.included
    );
    normalize_continuous(partition, distances, weights, tally.included as f64);

    Ok(Distances {
        frequencies,
        matrix: DistanceMatrix {
            distances,
            weights,
            rows: partition.job_rows(),
            marker_count: tally.included,
            weight_sum: tally.weight_sum,
            missingness: MissingnessMode::Continuous,
        },
    })
}
