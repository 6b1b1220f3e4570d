use indexmap::IndexMap;

use crate::common::Frame;
use crate::pipeline::context::pipeline_state::PipelineState;
use crate::pipeline::domain::{Detection, ReportPaths, RetrievalHit, RiskAssessment, ScoringPath};
use crate::pipeline::orchestration::stage::PipelinePhase;
use crate::pipeline::services::AssessmentRequest;

// Markers to track how far a run has progressed. Each one owns the output
// of every stage completed so far, so a stage can only read what exists.
pub struct VideoReady;

pub struct FramesExtracted {
    pub(super) frames: Vec<Frame>,
}

pub struct DetectionsReady {
    pub(super) prior: FramesExtracted,
    pub(super) detections: Vec<Detection>,
}

pub struct RetrievalReady {
    pub(super) prior: DetectionsReady,
    pub(super) retrieved: IndexMap<String, Vec<RetrievalHit>>,
}

pub struct AssessmentReady {
    pub(super) prior: RetrievalReady,
    pub(super) request: AssessmentRequest,
    pub(super) assessment: RiskAssessment,
    pub(super) scoring_path: ScoringPath,
}

pub struct ReportReady {
    pub(super) prior: AssessmentReady,
    pub(super) report_paths: Option<ReportPaths>,
}

pub trait ProcessingState: Send + 'static {
    fn phase() -> PipelinePhase;

    fn state_name() -> &'static str {
        Self::phase().as_str()
    }

    /// Moves everything computed so far into the run result.
    fn surface(self, state: &mut PipelineState);
}

impl ProcessingState for VideoReady {
    fn phase() -> PipelinePhase {
        PipelinePhase::VideoReady
    }

    fn surface(self, _state: &mut PipelineState) {}
}

impl ProcessingState for FramesExtracted {
    fn phase() -> PipelinePhase {
        PipelinePhase::FramesExtracted
    }

    fn surface(self, state: &mut PipelineState) {
        state.frames = self.frames;
    }
}

impl ProcessingState for DetectionsReady {
    fn phase() -> PipelinePhase {
        PipelinePhase::DetectionsReady
    }

    fn surface(self, state: &mut PipelineState) {
        self.prior.surface(state);
        state.detections = self.detections;
    }
}

impl ProcessingState for RetrievalReady {
    fn phase() -> PipelinePhase {
        PipelinePhase::RetrievalReady
    }

    fn surface(self, state: &mut PipelineState) {
        self.prior.surface(state);
        state.retrieved = self.retrieved;
    }
}

impl ProcessingState for AssessmentReady {
    fn phase() -> PipelinePhase {
        PipelinePhase::AssessmentReady
    }

    fn surface(self, state: &mut PipelineState) {
        self.prior.surface(state);
        state.assessment = Some(self.assessment);
        state.scoring_path = Some(self.scoring_path);
    }
}

impl ProcessingState for ReportReady {
    fn phase() -> PipelinePhase {
        PipelinePhase::ReportReady
    }

    fn surface(self, state: &mut PipelineState) {
        self.prior.surface(state);
        state.report_paths = self.report_paths;
    }
}
