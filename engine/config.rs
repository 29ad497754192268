// ========================================================================================
//
//                               Run configuration
//
// ========================================================================================
//
// Everything a distance run is parameterised by, with its defaults and the checks that
// can be made before any input is opened.

use crate::error::{DosageError, Result};
use crate::kernel::KernelStrategy;
use crate::sample::validate_missing_codes;
use crate::types::ParallelJob;
use sysinfo::System;

/// Smallest workspace reserved when sizing from physical memory.
pub const MIN_WORKSPACE_BYTES: usize = 64 << 20;

/// How the genotype file is traversed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScanMode {
    /// Read once for frequencies, then again for distances.
    #[default]
    Prescan,
    /// Derive frequencies and weights per marker while accumulating distances.
    SinglePass,
}

/// Parameters of one distance run.
#[derive(Clone, Debug)]
pub struct DistanceConfig {
    pub threads: usize,
    pub parallel: Option<ParallelJob>,
    /// Marker weight exponent; 0 disables frequency weighting.
    pub exponent: f64,
    /// Count every missing marker once instead of by its expected contribution.
    pub flat_missing: bool,
    /// Add one pseudo-observation to each allele frequency.
    pub maf_succ: bool,
    pub distance_3d: bool,
    /// Comma-separated phenotype values treated as missing.
    pub missing_codes: Option<String>,
    pub scan_mode: ScanMode,
    pub kernel: KernelStrategy,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get().max(1),
            parallel: None,
            exponent: 0.0,
            flat_missing: false,
            maf_succ: false,
            distance_3d: false,
            missing_codes: Some("NA".to_string()),
            scan_mode: ScanMode::default(),
            kernel: KernelStrategy::default(),
        }
    }
}

impl DistanceConfig {
    #[inline]
    pub fn job(&self) -> ParallelJob {
        self.parallel.unwrap_or(ParallelJob::SINGLE)
    }

    /// Checks everything that does not depend on the input files.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(DosageError::invalid("thread count must be at least 1"));
        }
        if !self.exponent.is_finite() {
            return Err(DosageError::invalid(format!(
                "distance exponent must be finite (got {})",
                self.exponent
            )));
        }
        if let Some(job) = self.parallel {
            if job.total == 0 || job.index >= job.total {
                return Err(DosageError::invalid(format!(
                    "parallel job {} of {} is out of range",
                    job.index + 1,
                    job.total
                )));
            }
        }
        if let Some(codes) = &self.missing_codes {
            validate_missing_codes(codes)?;
        }
        Ok(())
    }

    /// A job split can never exceed one job per two individuals.
    pub fn check_parallel(&self, indiv_ct: usize) -> Result<()> {
        let total = self.job().total;
        if total > 1 && total > indiv_ct / 2 {
            return Err(DosageError::invalid(format!(
                "too many parallel jobs (maximum {} for {indiv_ct} individuals)",
                indiv_ct / 2
            )));
        }
        Ok(())
    }
}

/// Half of physical memory, never less than `MIN_WORKSPACE_BYTES`.
pub fn default_workspace_bytes() -> usize {
    let mut system = System::new();
    system.refresh_memory();
    let half = usize::try_from(system.total_memory() / 2).unwrap_or(usize::MAX);
    half.max(MIN_WORKSPACE_BYTES)
}
