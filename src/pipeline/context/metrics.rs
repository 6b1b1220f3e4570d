use std::time::Duration;

use indexmap::IndexMap;

use crate::pipeline::orchestration::stage::PipelineStage;

/// Wall-clock timings collected during one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunMetrics {
    stage_durations: IndexMap<PipelineStage, Duration>,
    total: Duration,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_stage_duration(&mut self, stage: PipelineStage, duration: Duration) {
        self.stage_durations.insert(stage, duration);
    }

    pub fn record_total(&mut self, duration: Duration) {
        self.total = duration;
    }

    pub fn stage_duration(&self, stage: PipelineStage) -> Option<Duration> {
        self.stage_durations.get(&stage).copied()
    }

    /// Stages that ran, in execution order.
    pub fn stages(&self) -> impl Iterator<Item = (PipelineStage, Duration)> + '_ {
        self.stage_durations.iter().map(|(stage, d)| (*stage, *d))
    }

    pub fn total(&self) -> Duration {
        self.total
    }
}
