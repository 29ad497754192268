// ========================================================================================
//
//                       THE COMMAND-LINE DRIVER: DOSEDIST
//
// ========================================================================================
//
// Parses arguments into a `DistanceConfig`, reserves the workspace arena, runs the
// distance pipeline and writes the requested matrices next to the output prefix.
// Everything numerical lives in the library; this file only wires it together.

use clap::{Parser, ValueEnum};
use dosedist::arena::Arena;
use dosedist::config::{DistanceConfig, ScanMode, default_workspace_bytes};
use dosedist::kernel::KernelStrategy;
use dosedist::progress::{ProgressObserver, ProgressStage};
use dosedist::types::ParallelJob;
use dosedist::write::{self, MatrixKind};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MatrixArg {
    /// Mean allelic distance per marker.
    Dist,
    /// Identity-by-state similarity.
    Ibs,
    /// One minus identity-by-state.
    OneMinusIbs,
}

impl From<MatrixArg> for MatrixKind {
    fn from(arg: MatrixArg) -> Self {
        match arg {
            MatrixArg::Dist => MatrixKind::Distance,
            MatrixArg::Ibs => MatrixKind::Ibs,
            MatrixArg::OneMinusIbs => MatrixKind::OneMinusIbs,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(
    name = "dosedist",
    version,
    about = "Dosage-aware pairwise genetic distances from Oxford .gen/.sample files."
)]
struct Args {
    /// Oxford .gen genotype probability file.
    #[clap(long = "gen")]
    gen_file: PathBuf,

    /// Oxford .sample file listing the individuals of the .gen file.
    #[clap(long)]
    sample: PathBuf,

    /// Output prefix; matrices are written to <out>.dist, <out>.mibs and <out>.mdist.
    #[clap(long, default_value = "dosedist")]
    out: PathBuf,

    /// Matrices to write.
    #[clap(long, value_enum, num_args = 1.., default_values_t = [MatrixArg::Dist])]
    matrix: Vec<MatrixArg>,

    /// Worker threads per batch (defaults to the number of logical CPUs).
    #[clap(long)]
    threads: Option<usize>,

    /// Compute only part <INDEX> (1-based) of <TOTAL> equal shares of the matrix.
    #[clap(long, num_args = 2, value_names = ["INDEX", "TOTAL"])]
    parallel: Option<Vec<usize>>,

    /// Weight markers by (2 f (1 - f))^-exponent.
    #[clap(long, default_value_t = 0.0)]
    exponent: f64,

    /// Count missing markers once each instead of by their expected distance.
    #[clap(long)]
    flat_missing: bool,

    /// Add a pseudo-observation to every allele frequency.
    #[clap(long)]
    maf_succ: bool,

    /// Comma-separated phenotype values treated as missing.
    #[clap(long, default_value = "NA")]
    missing_code: String,

    /// Skip the frequency prescan and read the .gen file once.
    #[clap(long)]
    single_pass: bool,

    /// Use the portable scalar kernel instead of the vectorized one.
    #[clap(long)]
    scalar_kernel: bool,

    /// Three-dimensional genotype distance.
    #[clap(long = "3d")]
    distance_3d: bool,

    /// Workspace size in MiB (defaults to half of physical memory).
    #[clap(long)]
    memory: Option<usize>,

    /// Gzip the matrices.
    #[clap(long)]
    gz: bool,

    /// Log level (error, warn, info, debug, trace).
    #[clap(long, default_value = "info")]
    log_level: String,
}

// ========================================================================================
//                               PROGRESS RENDERING
// ========================================================================================

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// One progress bar per stage, replaced when the next stage starts.
#[derive(Default)]
struct TerminalProgress {
    bar: Option<ProgressBar>,
}

impl ProgressObserver for TerminalProgress {
    fn on_stage_start(&mut self, stage: ProgressStage, total_units: u64) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        if total_units > 0 {
            self.bar = Some(create_progress_bar(total_units, stage.describe()));
        }
    }

    fn on_stage_advance(&mut self, _: ProgressStage, processed_units: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(processed_units);
        }
    }

    fn on_stage_finish(&mut self, stage: ProgressStage) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}

// ========================================================================================
//                                   ORCHESTRATION
// ========================================================================================

fn build_config(args: &Args) -> Result<DistanceConfig, String> {
    let mut config = DistanceConfig {
        exponent: args.exponent,
        flat_missing: args.flat_missing,
        maf_succ: args.maf_succ,
        distance_3d: args.distance_3d,
        missing_codes: Some(args.missing_code.clone()),
        scan_mode: if args.single_pass {
            ScanMode::SinglePass
        } else {
            ScanMode::Prescan
        },
        kernel: if args.scalar_kernel {
            KernelStrategy::Scalar
        } else {
            KernelStrategy::Simd
        },
        ..Default::default()
    };
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(values) = &args.parallel {
        match values.as_slice() {
            &[index, total] if index >= 1 => {
                config.parallel = Some(ParallelJob {
                    index: index - 1,
                    total,
                });
            }
            _ => return Err("--parallel expects a 1-based index and a total".to_string()),
        }
    }
    Ok(config)
}

/// Each requested matrix once, in a fixed order.
fn requested_kinds(args: &[MatrixArg]) -> Vec<MatrixKind> {
    let mut kinds: Vec<MatrixKind> = args.iter().map(|&arg| arg.into()).collect();
    kinds.sort_unstable();
    kinds.dedup();
    kinds
}

fn execute(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(args)?;
    config.validate()?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build_global()?;

    let workspace = match args.memory {
        Some(mib) => mib
            .checked_mul(1 << 20)
            .ok_or("--memory is too large")?,
        None => default_workspace_bytes(),
    };
    let mut arena = Arena::with_capacity(workspace)?;
    log::info!("Reserved {} MiB of workspace.", arena.capacity() >> 20);
    let mut scope = arena.scope();

    let mut progress = TerminalProgress::default();
    let (samples, distances) =
        dosedist::run(&mut scope, &args.gen_file, &args.sample, &config, &mut progress)?;

    for kind in requested_kinds(&args.matrix) {
        let ids = write::write_ids(&args.out, kind, &samples)?;
        let matrix = write::write_matrix(&args.out, &distances.matrix, kind, args.gz, config.job())?;
        eprintln!("> Wrote {} and {}.", matrix.display(), ids.display());
    }
    Ok(())
}

fn main() {
    let start_time = Instant::now();
    let args = Args::parse();

    let log_level = args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    if let Err(e) = execute(&args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
    eprintln!("> Finished in {:.2?}.", start_time.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_matrix_requests_are_written_once() {
        let kinds = requested_kinds(&[
            MatrixArg::Dist,
            MatrixArg::Ibs,
            MatrixArg::Dist,
            MatrixArg::OneMinusIbs,
            MatrixArg::Ibs,
        ]);
        assert_eq!(
            kinds,
            vec![MatrixKind::Distance, MatrixKind::Ibs, MatrixKind::OneMinusIbs]
        );
    }

    #[test]
    fn parallel_index_is_converted_to_zero_based() {
        let args = Args::parse_from([
            "dosedist", "--gen", "in.gen", "--sample", "in.sample", "--parallel", "2", "3",
        ]);
        let config = build_config(&args).expect("valid arguments");
        assert_eq!(config.parallel, Some(ParallelJob { index: 1, total: 3 }));

        let args = Args::parse_from([
            "dosedist", "--gen", "in.gen", "--sample", "in.sample", "--parallel", "0", "3",
        ]);
        assert!(build_config(&args).is_err());
    }
}
