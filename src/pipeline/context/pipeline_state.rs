use std::fmt;

use indexmap::IndexMap;
use uuid::Uuid;

use crate::common::{Frame, VideoRef};
use crate::error::StageDiagnostic;
use crate::pipeline::context::metrics::RunMetrics;
use crate::pipeline::domain::{Detection, ReportPaths, RetrievalHit, RiskAssessment, ScoringPath};
use crate::pipeline::orchestration::stage::{PipelinePhase, PipelineStage};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every stage ran
    Completed,
    /// Nothing detected; retrieval, assessment, report and alert were skipped
    NoViolations,
    /// A fatal error or panic in `stage`
    Aborted { stage: PipelineStage },
    /// Abandoned at a stage boundary
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => f.write_str("completed"),
            RunOutcome::NoViolations => f.write_str("no violations, no report generated"),
            RunOutcome::Aborted { stage } => write!(f, "aborted in {}", stage),
            RunOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Everything a run produced, including partial output of an aborted run.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub run_id: Uuid,
    pub video: VideoRef,
    /// `Done` or `Aborted`
    pub phase: PipelinePhase,
    /// Last non-terminal phase reached before the run ended
    pub last_completed: PipelinePhase,
    pub outcome: RunOutcome,
    pub frames: Vec<Frame>,
    pub detections: Vec<Detection>,
    pub retrieved: IndexMap<String, Vec<RetrievalHit>>,
    pub assessment: Option<RiskAssessment>,
    pub scoring_path: Option<ScoringPath>,
    pub report_paths: Option<ReportPaths>,
    pub alert_sent: bool,
    pub errors: Vec<StageDiagnostic>,
    pub metrics: RunMetrics,
}

impl PipelineState {
    pub(super) fn empty(
        run_id: Uuid,
        video: VideoRef,
        phase: PipelinePhase,
        last_completed: PipelinePhase,
        outcome: RunOutcome,
    ) -> Self {
        Self {
            run_id,
            video,
            phase,
            last_completed,
            outcome,
            frames: Vec::new(),
            detections: Vec::new(),
            retrieved: IndexMap::new(),
            assessment: None,
            scoring_path: None,
            report_paths: None,
            alert_sent: false,
            errors: Vec::new(),
            metrics: RunMetrics::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.phase == PipelinePhase::Aborted
    }

    /// Whether some stage had to degrade or absorb a failure.
    pub fn is_degraded(&self) -> bool {
        !self.errors.is_empty()
    }
}
