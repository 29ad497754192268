use std::fmt;

/// Stages reported while computing a distance matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgressStage {
    SampleLoad,
    GenotypeScan,
    DistanceAccumulation,
}

impl ProgressStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::SampleLoad => ".sample load",
            Self::GenotypeScan => ".gen scan",
            Self::DistanceAccumulation => "distance calculation",
        }
    }
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for incremental progress. Units are stage specific: bytes for scans,
/// markers for the prescanned distance pass. Observers cannot fail the computation.
pub trait ProgressObserver {
    fn on_stage_start(&mut self, stage: ProgressStage, total_units: u64) {
        let _ = (stage, total_units);
    }
    fn on_stage_advance(&mut self, stage: ProgressStage, processed_units: u64) {
        let _ = (stage, processed_units);
    }
    fn on_stage_finish(&mut self, stage: ProgressStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopProgress;

impl ProgressObserver for NoopProgress {}

/// Forwards byte counts only when the whole-percent value changes.
pub(crate) struct PercentThrottle {
    total: u64,
    last_percent: u64,
}

impl PercentThrottle {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            last_percent: 0,
        }
    }

    pub(crate) fn update(
        &mut self,
        observer: &mut dyn ProgressObserver,
        stage: ProgressStage,
        processed: u64,
    ) {
        if self.total == 0 {
            return;
        }
        let percent = processed.saturating_mul(100) / self.total;
        if percent > self.last_percent {
            self.last_percent = percent;
            observer.on_stage_advance(stage, processed);
        }
    }
}
