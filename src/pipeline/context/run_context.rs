use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tracing::warn;
use uuid::Uuid;

use crate::common::{Frame, VideoRef};
use crate::error::{PipelineError, StageDiagnostic};
use crate::pipeline::context::metrics::RunMetrics;
use crate::pipeline::context::pipeline_state::{PipelineState, RunOutcome};
use crate::pipeline::context::state::{
    AssessmentReady, DetectionsReady, FramesExtracted, ProcessingState, ReportReady,
    RetrievalReady, VideoReady,
};
use crate::pipeline::domain::{Detection, ReportPaths, RetrievalHit, RiskAssessment};
use crate::pipeline::orchestration::stage::{PipelinePhase, PipelineStage};
use crate::pipeline::services::{Assessed, AssessmentRequest};

// RunContext with compile-time tracking of the run's phase
pub struct RunContext<S> {
    run_id: Uuid,
    video: VideoRef,
    diagnostics: Vec<StageDiagnostic>,
    metrics: RunMetrics,
    started: Instant,
    state: S,
}

impl<S> RunContext<S> {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn video(&self) -> &VideoRef {
        &self.video
    }

    pub fn diagnostics(&self) -> &[StageDiagnostic] {
        &self.diagnostics
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Records an absorbed error against `stage`.
    pub fn record(&mut self, stage: PipelineStage, error: PipelineError) {
        debug_assert!(!error.is_fatal(), "fatal errors abort the run");
        warn!("[{}] {}", stage, error);
        self.diagnostics.push(StageDiagnostic::new(stage, error));
    }

    pub fn record_all(&mut self, stage: PipelineStage, errors: impl IntoIterator<Item = PipelineError>) {
        for error in errors {
            self.record(stage, error);
        }
    }

    pub fn record_duration(&mut self, stage: PipelineStage, duration: Duration) {
        self.metrics.record_stage_duration(stage, duration);
    }

    fn map_state<T>(self, next: impl FnOnce(S) -> T) -> RunContext<T> {
        RunContext {
            run_id: self.run_id,
            video: self.video,
            diagnostics: self.diagnostics,
            metrics: self.metrics,
            started: self.started,
            state: next(self.state),
        }
    }
}

impl<S: ProcessingState> RunContext<S> {
    pub fn phase(&self) -> PipelinePhase {
        S::phase()
    }

    /// Ends the run in `Aborted`, keeping everything computed so far.
    pub fn abort(mut self, stage: PipelineStage, error: PipelineError) -> PipelineState {
        self.diagnostics.push(StageDiagnostic::new(stage, error));
        self.conclude(PipelinePhase::Aborted, RunOutcome::Aborted { stage })
    }

    pub fn cancel(self) -> PipelineState {
        self.conclude(PipelinePhase::Aborted, RunOutcome::Cancelled)
    }

    fn conclude(mut self, phase: PipelinePhase, outcome: RunOutcome) -> PipelineState {
        self.metrics.record_total(self.started.elapsed());
        let mut result = PipelineState::empty(self.run_id, self.video, phase, S::phase(), outcome);
        self.state.surface(&mut result);
        result.errors = self.diagnostics;
        result.metrics = self.metrics;
        result
    }
}

impl RunContext<VideoReady> {
    pub fn new(video: VideoRef) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            video,
            diagnostics: Vec::new(),
            metrics: RunMetrics::new(),
            started: Instant::now(),
            state: VideoReady,
        }
    }

    pub fn into_frames_extracted(self, frames: Vec<Frame>) -> RunContext<FramesExtracted> {
        self.map_state(|_| FramesExtracted { frames })
    }
}

impl RunContext<FramesExtracted> {
    pub fn frames(&self) -> &[Frame] {
        &self.state.frames
    }

    pub fn into_detections_ready(self, detections: Vec<Detection>) -> RunContext<DetectionsReady> {
        self.map_state(|prior| DetectionsReady { prior, detections })
    }
}

impl RunContext<DetectionsReady> {
    pub fn detections(&self) -> &[Detection] {
        &self.state.detections
    }

    /// Clean site: the run is done without any side effects.
    pub fn finish_clean(self) -> PipelineState {
        self.conclude(PipelinePhase::Done, RunOutcome::NoViolations)
    }

    pub fn into_retrieval_ready(
        self,
        retrieved: IndexMap<String, Vec<RetrievalHit>>,
    ) -> RunContext<RetrievalReady> {
        self.map_state(|prior| RetrievalReady { prior, retrieved })
    }
}

impl RunContext<RetrievalReady> {
    pub fn detections(&self) -> &[Detection] {
        &self.state.prior.detections
    }

    pub fn retrieved(&self) -> &IndexMap<String, Vec<RetrievalHit>> {
        &self.state.retrieved
    }

    pub fn into_assessment_ready(
        mut self,
        request: AssessmentRequest,
        assessed: Assessed,
    ) -> RunContext<AssessmentReady> {
        if let Some(degraded) = assessed.degraded {
            self.record(PipelineStage::Assessment, degraded);
        }
        self.map_state(|prior| AssessmentReady {
            prior,
            request,
            assessment: assessed.assessment,
            scoring_path: assessed.path,
        })
    }
}

impl RunContext<AssessmentReady> {
    pub fn request(&self) -> &AssessmentRequest {
        &self.state.request
    }

    pub fn assessment(&self) -> &RiskAssessment {
        &self.state.assessment
    }

    pub fn into_report_ready(self, report_paths: Option<ReportPaths>) -> RunContext<ReportReady> {
        self.map_state(|prior| ReportReady {
            prior,
            report_paths,
        })
    }
}

impl RunContext<ReportReady> {
    pub fn request(&self) -> &AssessmentRequest {
        &self.state.prior.request
    }

    pub fn assessment(&self) -> &RiskAssessment {
        &self.state.prior.assessment
    }

    pub fn report_paths(&self) -> Option<&ReportPaths> {
        self.state.report_paths.as_ref()
    }

    pub fn finish(self, alert_sent: bool) -> PipelineState {
        let mut result = self.conclude(PipelinePhase::Done, RunOutcome::Completed);
        result.alert_sent = alert_sent;
        result
    }
}
