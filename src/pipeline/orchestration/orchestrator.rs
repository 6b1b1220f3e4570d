use std::any::Any;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::common::{Frame, VideoRef};
use crate::config::{Configuration, RetrievalConfig};
use crate::error::{AppError, CollaboratorError, PipelineError};
use crate::pipeline::collaborators::{
    DocumentRenderer, FallbackDetector, FrameSource, NotificationChannel, PrimaryDetector,
    ReasoningService, StructuredPrompt, VectorIndex,
};
use crate::pipeline::context::{PipelineState, ProcessingState, RunContext};
use crate::pipeline::domain::{
    AlertMessage, Detection, LabelCatalog, RegulationExcerpt, ReportPaths, RetrievalHit,
    RiskAssessment,
};
use crate::pipeline::orchestration::stage::PipelineStage;
use crate::pipeline::services::{
    AlertDispatcher, Assessed, AssessmentRequest, DetectionNormalizer, FrameDetections,
    FrameDetector, GuardedCall, HybridRetriever, LabelQuery, LabelRetrieval, LegQuery,
    ReasoningScorer, RenderJob, ReportComposer, RiskEngine, RrfFusion, RuleBasedScorer,
};

/// Video → detections → regulations → risk → report → alert.
///
/// One `SafetyPipeline` may serve many concurrent runs; collaborator calls
/// of all those runs share the same worker-pool limits.
pub struct SafetyPipeline {
    catalog: Arc<LabelCatalog>,
    retrieval: RetrievalConfig,
    pool_size: usize,
    frames: GuardedCall<VideoRef, Vec<Frame>>,
    detector: FrameDetector,
    retriever: HybridRetriever,
    risk: RiskEngine,
    reports: ReportComposer,
    alerts: AlertDispatcher,
}

impl SafetyPipeline {
    pub fn builder(configuration: Configuration) -> SafetyPipelineBuilder {
        SafetyPipelineBuilder::new(configuration)
    }

    pub async fn run(&self, video: VideoRef) -> PipelineState {
        self.run_with_cancellation(video, CancellationToken::new())
            .await
    }

    /// Runs every stage in order. `cancel` is honoured at stage boundaries
    /// up to, but not after, the start of alert dispatch.
    #[instrument(skip_all, fields(video = %video))]
    pub async fn run_with_cancellation(
        &self,
        video: VideoRef,
        cancel: CancellationToken,
    ) -> PipelineState {
        let mut ctx = RunContext::new(video);
        let run_id = ctx.run_id();
        info!(%run_id, "Starting safety analysis of {}", ctx.video());

        // VideoReady → FramesExtracted
        if cancel.is_cancelled() {
            return cancelled(ctx);
        }
        let (result, elapsed) = run_stage(
            PipelineStage::FrameExtraction,
            self.extract_frames(run_id, ctx.video()),
        )
        .await;
        ctx.record_duration(PipelineStage::FrameExtraction, elapsed);
        let frames = match result.and_then(|extracted| extracted) {
            Ok(frames) => frames,
            Err(e) => return aborted(ctx, PipelineStage::FrameExtraction, e),
        };
        let mut ctx = ctx.into_frames_extracted(frames);

        // FramesExtracted → DetectionsReady
        if cancel.is_cancelled() {
            return cancelled(ctx);
        }
        let (result, elapsed) =
            run_stage(PipelineStage::Detection, self.detect(run_id, ctx.frames())).await;
        ctx.record_duration(PipelineStage::Detection, elapsed);
        let per_frame = match result {
            Ok(per_frame) => per_frame,
            Err(e) => return aborted(ctx, PipelineStage::Detection, e),
        };
        let mut detections = Vec::new();
        for frame in per_frame {
            ctx.record_all(PipelineStage::Detection, frame.errors);
            detections.extend(frame.detections);
        }
        let mut ctx = ctx.into_detections_ready(detections);

        if ctx.detections().is_empty() {
            info!(%run_id, "No detections, no report generated");
            return ctx.finish_clean();
        }

        // DetectionsReady → RetrievalReady
        if cancel.is_cancelled() {
            return cancelled(ctx);
        }
        let (result, elapsed) =
            run_stage(PipelineStage::Retrieval, self.retrieve(run_id, ctx.detections())).await;
        ctx.record_duration(PipelineStage::Retrieval, elapsed);
        let retrieval = match result {
            Ok(retrieval) => retrieval,
            Err(e) => return aborted(ctx, PipelineStage::Retrieval, e),
        };
        ctx.record_all(PipelineStage::Retrieval, retrieval.errors);
        let mut ctx = ctx.into_retrieval_ready(retrieval.retrieved);

        // RetrievalReady → AssessmentReady
        if cancel.is_cancelled() {
            return cancelled(ctx);
        }
        let request = AssessmentRequest::new(
            ctx.detections().to_vec(),
            excerpt_union(ctx.retrieved()),
            &self.catalog,
        );
        let (result, elapsed) =
            run_stage(PipelineStage::Assessment, self.assess(run_id, &request)).await;
        ctx.record_duration(PipelineStage::Assessment, elapsed);
        let assessed = match result {
            Ok(assessed) => assessed,
            Err(e) => return aborted(ctx, PipelineStage::Assessment, e),
        };
        let mut ctx = ctx.into_assessment_ready(request, assessed);

        // AssessmentReady → ReportReady; a failed report never blocks the alert
        if cancel.is_cancelled() {
            return cancelled(ctx);
        }
        let (result, elapsed) = run_stage(
            PipelineStage::Report,
            self.report(run_id, ctx.video(), ctx.request(), ctx.assessment()),
        )
        .await;
        ctx.record_duration(PipelineStage::Report, elapsed);
        let report_paths = match result {
            Ok(Ok(paths)) => Some(paths),
            Ok(Err(e)) => {
                ctx.record(PipelineStage::Report, e);
                None
            }
            Err(e) => return aborted(ctx, PipelineStage::Report, e),
        };
        let mut ctx = ctx.into_report_ready(report_paths);

        // ReportReady → Done
        if cancel.is_cancelled() {
            return cancelled(ctx);
        }
        let has_violation = ctx
            .request()
            .detections
            .iter()
            .any(|d| self.catalog.is_violation(&d.label));
        if !has_violation {
            info!(%run_id, "No violations among detections, no alert sent");
            return ctx.finish(false);
        }

        // Past this point the run can no longer be cancelled
        let message = AlertDispatcher::message(
            ctx.assessment(),
            &ctx.request().equipment_present,
            ctx.report_paths(),
        );
        let (result, elapsed) = run_stage(PipelineStage::Alert, self.alert(run_id, message)).await;
        ctx.record_duration(PipelineStage::Alert, elapsed);
        let alert_sent = match result {
            Ok(Ok(sent)) => sent,
            Ok(Err(e)) => {
                ctx.record(PipelineStage::Alert, e);
                false
            }
            Err(e) => return aborted(ctx, PipelineStage::Alert, e),
        };

        let state = ctx.finish(alert_sent);
        info!(
            %run_id,
            "Run finished in {:?}: {} detections, {} diagnostics, alert sent: {}",
            state.metrics.total(),
            state.detections.len(),
            state.errors.len(),
            state.alert_sent
        );
        state
    }

    #[instrument(skip(self, video), fields(stage = "FrameExtraction"))]
    async fn extract_frames(
        &self,
        run_id: Uuid,
        video: &VideoRef,
    ) -> Result<Vec<Frame>, PipelineError> {
        let frames = self
            .frames
            .call(video.clone())
            .await
            .map_err(|e| match e {
                CollaboratorError::InvalidResponse { reason, .. } => {
                    PipelineError::NoFramesExtracted(format!("{}: {}", video, reason))
                }
                other => PipelineError::ExtractionFailure(other.to_string()),
            })?;
        if frames.is_empty() {
            return Err(PipelineError::NoFramesExtracted(video.to_string()));
        }
        info!("Extracted {} frames", frames.len());
        Ok(frames)
    }

    /// Per-frame detection, merged in frame order whatever the completion order.
    #[instrument(skip(self, frames), fields(stage = "Detection", frames = frames.len()))]
    async fn detect(&self, run_id: Uuid, frames: &[Frame]) -> Vec<FrameDetections> {
        let mut per_frame: Vec<FrameDetections> = stream::iter(frames)
            .map(|frame| self.detector.detect(frame))
            .buffer_unordered(self.pool_size)
            .collect()
            .await;
        per_frame.sort_by_key(|frame| frame.frame_index);

        let total: usize = per_frame.iter().map(|f| f.detections.len()).sum();
        info!("{} detections across {} frames", total, per_frame.len());
        per_frame
    }

    #[instrument(skip(self, detections), fields(stage = "Retrieval"))]
    async fn retrieve(&self, run_id: Uuid, detections: &[Detection]) -> LabelRetrieval {
        let labels: BTreeSet<&str> = detections.iter().map(|d| d.label.as_str()).collect();
        let queries = labels
            .into_iter()
            .map(|label| LabelQuery {
                label: label.to_string(),
                query: self.retrieval.query_for(&self.catalog, label),
                top_k: self
                    .retrieval
                    .budget
                    .top_k_for(self.catalog.category(label)),
            })
            .collect();
        self.retriever.retrieve_labels(queries, self.pool_size).await
    }

    #[instrument(skip(self, request), fields(stage = "Assessment"))]
    async fn assess(&self, run_id: Uuid, request: &AssessmentRequest) -> Assessed {
        self.risk.assess(request).await
    }

    #[instrument(skip(self, video, request, assessment), fields(stage = "Report"))]
    async fn report(
        &self,
        run_id: Uuid,
        video: &VideoRef,
        request: &AssessmentRequest,
        assessment: &RiskAssessment,
    ) -> Result<ReportPaths, PipelineError> {
        self.reports.produce(video, request, assessment).await
    }

    #[instrument(skip(self, message), fields(stage = "Alert"))]
    async fn alert(&self, run_id: Uuid, message: AlertMessage) -> Result<bool, PipelineError> {
        self.alerts.dispatch(message).await
    }
}

/// Times a stage and turns a panic inside it into `StagePanicked`.
async fn run_stage<T, F>(stage: PipelineStage, work: F) -> (Result<T, PipelineError>, Duration)
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let result = AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .map_err(|panic| PipelineError::StagePanicked {
            stage,
            message: panic_message(panic.as_ref()),
        });
    (result, started.elapsed())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn aborted<S: ProcessingState>(
    ctx: RunContext<S>,
    stage: PipelineStage,
    error: PipelineError,
) -> PipelineState {
    error!(
        run_id = %ctx.run_id(),
        "Run aborted in {} after {}: {}",
        stage,
        S::state_name(),
        error
    );
    ctx.abort(stage, error)
}

fn cancelled<S: ProcessingState>(ctx: RunContext<S>) -> PipelineState {
    info!(run_id = %ctx.run_id(), "Run cancelled after {}", S::state_name());
    ctx.cancel()
}

/// Excerpts of every label, ordered by label then rank, each document once.
fn excerpt_union(retrieved: &IndexMap<String, Vec<RetrievalHit>>) -> Vec<RegulationExcerpt> {
    let mut seen = BTreeSet::new();
    retrieved
        .values()
        .flatten()
        .filter(|hit| seen.insert(hit.document_id.clone()))
        .map(|hit| RegulationExcerpt {
            document_id: hit.document_id.clone(),
            text: hit.text.clone(),
        })
        .collect()
}

pub struct SafetyPipelineBuilder {
    configuration: Configuration,
    frame_source: Option<Arc<dyn FrameSource>>,
    primary: Option<Arc<dyn PrimaryDetector>>,
    fallback: Option<Arc<dyn FallbackDetector>>,
    index: Option<Arc<dyn VectorIndex>>,
    reasoning: Option<Arc<dyn ReasoningService>>,
    renderer: Option<Arc<dyn DocumentRenderer>>,
    notifier: Option<Arc<dyn NotificationChannel>>,
}

impl SafetyPipelineBuilder {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            frame_source: None,
            primary: None,
            fallback: None,
            index: None,
            reasoning: None,
            renderer: None,
            notifier: None,
        }
    }

    // Sets the reports directory, this will override the configuration.
    pub fn reports_dir(mut self, reports_dir: impl Into<PathBuf>) -> Self {
        self.configuration.reports_dir = reports_dir.into();
        self
    }

    // Adjusts the worker pool size, this will override the configuration.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.configuration.workers.pool_size = pool_size;
        self
    }

    pub fn frame_source(mut self, frame_source: Arc<dyn FrameSource>) -> Self {
        self.frame_source = Some(frame_source);
        self
    }

    pub fn primary_detector(mut self, detector: Arc<dyn PrimaryDetector>) -> Self {
        self.primary = Some(detector);
        self
    }

    pub fn fallback_detector(mut self, detector: Arc<dyn FallbackDetector>) -> Self {
        self.fallback = Some(detector);
        self
    }

    pub fn vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn reasoning(mut self, reasoning: Arc<dyn ReasoningService>) -> Self {
        self.reasoning = Some(reasoning);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    // Optional: without a channel alerts are skipped silently.
    pub fn notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<SafetyPipeline, AppError> {
        let configuration = self.configuration;
        configuration.validate().map_err(AppError::InvalidConfig)?;

        let frame_source = self
            .frame_source
            .ok_or(AppError::MissingCollaborator("frame source"))?;
        let primary = self
            .primary
            .ok_or(AppError::MissingCollaborator("primary detector"))?;
        let fallback = self
            .fallback
            .ok_or(AppError::MissingCollaborator("fallback detector"))?;
        let index = self
            .index
            .ok_or(AppError::MissingCollaborator("vector index"))?;
        let reasoning = self
            .reasoning
            .ok_or(AppError::MissingCollaborator("reasoning service"))?;
        let renderer = self
            .renderer
            .ok_or(AppError::MissingCollaborator("document renderer"))?;

        let pool_size = configuration.workers.pool_size.max(1);
        let calls = &configuration.calls;
        let catalog = Arc::new(configuration.label_catalog());

        let fps = configuration.extraction.fps;
        let max_frames = configuration.extraction.max_frames;
        let frames = GuardedCall::new(
            "frame source",
            calls.frame_source,
            pool_size,
            move |video: VideoRef| {
                let frame_source = frame_source.clone();
                async move { frame_source.extract_frames(&video, fps, max_frames).await }
            },
        );

        let primary_call = GuardedCall::new(
            "primary detector",
            calls.primary_detector,
            pool_size,
            move |frame: Frame| {
                let primary = primary.clone();
                async move { primary.detect(&frame).await }
            },
        );
        let fallback_call = GuardedCall::new(
            "fallback detector",
            calls.fallback_detector,
            pool_size,
            move |frame: Frame| {
                let fallback = fallback.clone();
                async move { fallback.detect_freeform(&frame).await }
            },
        );
        let detector = FrameDetector::new(
            DetectionNormalizer::new(configuration.detection.confidence_threshold, catalog.clone()),
            primary_call,
            fallback_call,
        );

        let dense_index = index.clone();
        let dense = GuardedCall::new(
            "dense index",
            calls.vector_index,
            pool_size,
            move |query: LegQuery| {
                let index = dense_index.clone();
                async move { index.dense_query(&query.text, query.k).await }
            },
        );
        let sparse = GuardedCall::new(
            "sparse index",
            calls.vector_index,
            pool_size,
            move |query: LegQuery| {
                let index = index.clone();
                async move { index.sparse_query(&query.text, query.k).await }
            },
        );
        let retriever = HybridRetriever::new(
            dense,
            sparse,
            RrfFusion::new(configuration.retrieval.rrf_k),
            configuration.retrieval.prefetch_multiplier,
        );

        // Scoring and narrative share one pool
        let reasoning_call = GuardedCall::new(
            "reasoning service",
            calls.reasoning,
            pool_size,
            move |prompt: StructuredPrompt| {
                let reasoning = reasoning.clone();
                async move { reasoning.complete(&prompt).await }
            },
        );
        let risk = RiskEngine::new(
            ReasoningScorer::new(
                reasoning_call.clone(),
                catalog.clone(),
                configuration.risk.breakpoints.clone(),
            ),
            RuleBasedScorer::new(
                catalog.clone(),
                configuration.risk.breakpoints.clone(),
                configuration.risk.default_violation_weight,
                configuration.risk.equipment_modifier,
            ),
        );

        let render_call = GuardedCall::new(
            "document renderer",
            calls.renderer,
            pool_size,
            move |job: RenderJob| {
                let renderer = renderer.clone();
                async move { renderer.render(&job.sections, &job.assessment).await }
            },
        );
        let reports = ReportComposer::new(
            reasoning_call,
            render_call,
            catalog.clone(),
            configuration.reports_dir.clone(),
        );

        let notifier_policy = calls.notifier;
        let alerts = AlertDispatcher::new(self.notifier.map(|notifier| {
            GuardedCall::new(
                "notification channel",
                notifier_policy,
                pool_size,
                move |message: AlertMessage| {
                    let notifier = notifier.clone();
                    async move { notifier.publish(&message).await }
                },
            )
        }));

        Ok(SafetyPipeline {
            catalog,
            retrieval: configuration.retrieval.clone(),
            pool_size,
            frames,
            detector,
            retriever,
            risk,
            reports,
            alerts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageDiagnostic;
    use crate::pipeline::collaborators::PromptTask;
    use crate::pipeline::context::RunOutcome;
    use crate::pipeline::domain::{AlertLevel, DetectionSource, RawDetection, ScoringPath};
    use crate::pipeline::orchestration::stage::PipelinePhase;
    use crate::pipeline::services::testing::{
        frame, FakeFrameSource, FakeIndex, FakeNotifier, FakeReasoning, FakeRenderer,
        ScriptedFallback, ScriptedPrimary,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        frames: Arc<FakeFrameSource>,
        primary: Arc<ScriptedPrimary>,
        fallback: Arc<ScriptedFallback>,
        index: Arc<FakeIndex>,
        reasoning: Arc<FakeReasoning>,
        renderer: Arc<FakeRenderer>,
        notifier: Option<Arc<FakeNotifier>>,
        reports_dir: PathBuf,
    }

    impl Harness {
        fn new(primary: ScriptedPrimary) -> Self {
            Self {
                frames: Arc::new(FakeFrameSource::frames(3)),
                primary: Arc::new(primary),
                fallback: Arc::new(ScriptedFallback::text("[]")),
                index: Arc::new(FakeIndex::with_documents(10)),
                reasoning: Arc::new(FakeReasoning::json(json!({
                    "risk_score": 70,
                    "alert_level": "HIGH",
                    "violations": [
                        {"type": "NO-Hardhat", "severity": "HIGH", "reasoning": "work under a raised bucket"}
                    ]
                }))),
                renderer: Arc::new(FakeRenderer::ok()),
                notifier: Some(Arc::new(FakeNotifier::ok())),
                reports_dir: std::env::temp_dir()
                    .join(format!("sitesafe-orchestrator-{}", Uuid::new_v4())),
            }
        }

        fn frames(mut self, frames: FakeFrameSource) -> Self {
            self.frames = Arc::new(frames);
            self
        }

        fn fallback(mut self, fallback: ScriptedFallback) -> Self {
            self.fallback = Arc::new(fallback);
            self
        }

        fn index(mut self, index: FakeIndex) -> Self {
            self.index = Arc::new(index);
            self
        }

        fn reasoning(mut self, reasoning: FakeReasoning) -> Self {
            self.reasoning = Arc::new(reasoning);
            self
        }

        fn renderer(mut self, renderer: FakeRenderer) -> Self {
            self.renderer = Arc::new(renderer);
            self
        }

        fn notifier(mut self, notifier: Option<FakeNotifier>) -> Self {
            self.notifier = notifier.map(Arc::new);
            self
        }

        fn builder(&self) -> SafetyPipelineBuilder {
            let builder = SafetyPipeline::builder(Configuration::default())
                .reports_dir(self.reports_dir.clone())
                .pool_size(2)
                .frame_source(self.frames.clone())
                .primary_detector(self.primary.clone())
                .fallback_detector(self.fallback.clone())
                .vector_index(self.index.clone())
                .reasoning(self.reasoning.clone())
                .renderer(self.renderer.clone());
            match &self.notifier {
                Some(notifier) => builder.notifier(notifier.clone()),
                None => builder,
            }
        }

        async fn run(&self) -> PipelineState {
            self.builder().build().unwrap().run(video()).await
        }

        fn notifier_attempts(&self) -> usize {
            self.notifier.as_ref().map(|n| n.attempts()).unwrap_or(0)
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.reports_dir);
        }
    }

    fn violations() -> ScriptedPrimary {
        ScriptedPrimary::always(vec![
            RawDetection::new("NO-Hardhat", 0.8),
            RawDetection::new("NO-Hardhat", 0.5),
            RawDetection::new("Excavator", 0.7),
            RawDetection::new("Person", 0.9),
        ])
    }

    fn video() -> VideoRef {
        VideoRef::new("site_cam_1.mp4")
    }

    fn errors_in(state: &PipelineState, stage: PipelineStage) -> Vec<&PipelineError> {
        state
            .errors
            .iter()
            .filter(|d| d.stage == stage)
            .map(|d| &d.error)
            .collect()
    }

    #[tokio::test]
    async fn clean_site_finishes_without_side_effects() {
        let harness = Harness::new(ScriptedPrimary::always(vec![]));
        let state = harness.run().await;

        assert_eq!(state.phase, PipelinePhase::Done);
        assert_eq!(state.outcome, RunOutcome::NoViolations);
        assert_eq!(state.frames.len(), 3);
        assert!(state.detections.is_empty());
        assert!(harness.index.requested_k().is_empty());
        assert!(harness.reasoning.tasks().is_empty());
        assert_eq!(harness.renderer.calls(), 0);
        assert_eq!(harness.notifier_attempts(), 0);
        assert!(state.metrics.stage_duration(PipelineStage::Retrieval).is_none());
    }

    #[tokio::test]
    async fn violations_run_through_every_stage() {
        let harness = Harness::new(violations());
        let state = harness.run().await;

        assert_eq!(state.phase, PipelinePhase::Done);
        assert_eq!(state.outcome, RunOutcome::Completed);
        assert!(state.errors.is_empty(), "{:?}", state.errors);

        // one deduplicated detection per label and frame, merged in frame order
        assert_eq!(state.detections.len(), 9);
        assert!(state
            .detections
            .windows(2)
            .all(|pair| pair[0].frame_index <= pair[1].frame_index));
        assert!(state
            .detections
            .iter()
            .filter(|d| d.label == "NO-Hardhat")
            .all(|d| d.confidence == 0.8 && d.source == DetectionSource::PrimaryDetector));
        assert_eq!(harness.fallback.calls().load(Ordering::SeqCst), 0);

        assert_eq!(
            state.retrieved.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["Excavator", "NO-Hardhat", "Person"]
        );
        assert_eq!(state.retrieved["NO-Hardhat"].len(), 5);
        assert_eq!(state.retrieved["Excavator"].len(), 3);
        assert_eq!(state.retrieved["Person"].len(), 1);

        let assessment = state.assessment.as_ref().unwrap();
        assert_eq!(assessment.score, 70);
        assert_eq!(assessment.level, AlertLevel::High);
        assert_eq!(state.scoring_path, Some(ScoringPath::Reasoning));
        assert_eq!(
            harness.reasoning.tasks(),
            vec![PromptTask::RiskAssessment, PromptTask::ReportNarrative]
        );

        let paths = state.report_paths.as_ref().unwrap();
        assert!(paths.docx.ends_with("site_cam_1_report.docx"));
        assert!(harness.reports_dir.is_dir());

        assert!(state.alert_sent);
        let sent = harness.notifier.as_ref().unwrap().sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[HIGH] Construction Safety Alert - Risk Score: 70");

        for stage in PipelineStage::ALL {
            assert!(state.metrics.stage_duration(stage).is_some(), "{} not timed", stage);
        }
    }

    #[tokio::test]
    async fn failed_reasoning_falls_back_to_rule_based_scoring() {
        let harness = Harness::new(violations()).reasoning(FakeReasoning::failing());
        let state = harness.run().await;

        assert_eq!(state.outcome, RunOutcome::Completed);
        assert_eq!(state.scoring_path, Some(ScoringPath::RuleBased));
        let assessment = state.assessment.as_ref().unwrap();
        // NO-Hardhat weight plus the machinery modifier
        assert_eq!(assessment.score, 50);
        assert_eq!(assessment.level, AlertLevel::High);
        assert!(matches!(
            errors_in(&state, PipelineStage::Assessment).as_slice(),
            [PipelineError::AssessmentMalformed(_)]
        ));
        assert!(state.alert_sent);
    }

    #[tokio::test]
    async fn abort_during_retrieval_keeps_detections() {
        let harness = Harness::new(violations()).index(FakeIndex::with_documents(5).panicking());
        let state = harness.run().await;

        assert_eq!(state.phase, PipelinePhase::Aborted);
        assert_eq!(
            state.outcome,
            RunOutcome::Aborted {
                stage: PipelineStage::Retrieval
            }
        );
        assert_eq!(state.last_completed, PipelinePhase::DetectionsReady);
        assert_eq!(state.frames.len(), 3);
        assert_eq!(state.detections.len(), 9);
        assert!(state.retrieved.is_empty());
        assert!(state.assessment.is_none());
        assert!(matches!(
            state.errors.last().map(|d| &d.error),
            Some(PipelineError::StagePanicked {
                stage: PipelineStage::Retrieval,
                ..
            })
        ));
        assert_eq!(harness.renderer.calls(), 0);
        assert_eq!(harness.notifier_attempts(), 0);
    }

    #[tokio::test]
    async fn extraction_failures_abort_the_run() {
        let harness = Harness::new(violations()).frames(FakeFrameSource::failing());
        let state = harness.run().await;
        assert_eq!(
            state.outcome,
            RunOutcome::Aborted {
                stage: PipelineStage::FrameExtraction
            }
        );
        assert!(matches!(
            state.errors.as_slice(),
            [StageDiagnostic {
                error: PipelineError::ExtractionFailure(_),
                ..
            }]
        ));
        assert_eq!(harness.primary.calls().load(Ordering::SeqCst), 0);

        let harness = Harness::new(violations()).frames(FakeFrameSource::unreadable());
        let state = harness.run().await;
        assert_eq!(state.phase, PipelinePhase::Aborted);
        assert!(matches!(
            errors_in(&state, PipelineStage::FrameExtraction).as_slice(),
            [PipelineError::NoFramesExtracted(reason)] if reason.starts_with("site_cam_1.mp4")
        ));

        let harness = Harness::new(violations()).frames(FakeFrameSource::frames(0));
        let state = harness.run().await;
        assert_eq!(state.phase, PipelinePhase::Aborted);
        assert_eq!(state.last_completed, PipelinePhase::VideoReady);
        assert!(matches!(
            errors_in(&state, PipelineStage::FrameExtraction).as_slice(),
            [PipelineError::NoFramesExtracted(_)]
        ));
    }

    #[tokio::test]
    async fn report_failure_does_not_block_the_alert() {
        let harness = Harness::new(violations()).renderer(FakeRenderer::failing());
        let state = harness.run().await;

        assert_eq!(state.outcome, RunOutcome::Completed);
        assert!(state.report_paths.is_none());
        assert!(state.alert_sent);
        assert!(matches!(
            errors_in(&state, PipelineStage::Report).as_slice(),
            [PipelineError::ReportRenderFailure(_)]
        ));
        let sent = harness.notifier.as_ref().unwrap().sent();
        assert!(!sent[0].body.contains("Report:"));
    }

    #[tokio::test]
    async fn missing_notification_channel_is_silent() {
        let harness = Harness::new(violations()).notifier(None);
        let state = harness.run().await;
        assert_eq!(state.outcome, RunOutcome::Completed);
        assert!(!state.alert_sent);
        assert!(state.errors.is_empty());
    }

    #[tokio::test]
    async fn notification_failure_is_recorded_once() {
        let harness = Harness::new(violations()).notifier(Some(FakeNotifier::failing()));
        let state = harness.run().await;
        assert_eq!(state.phase, PipelinePhase::Done);
        assert!(!state.alert_sent);
        assert!(matches!(
            errors_in(&state, PipelineStage::Alert).as_slice(),
            [PipelineError::NotificationFailure(_)]
        ));
        assert_eq!(harness.notifier_attempts(), 1);
    }

    #[tokio::test]
    async fn detections_without_violations_are_reported_but_not_alerted() {
        let harness = Harness::new(ScriptedPrimary::always(vec![
            RawDetection::new("Person", 0.9),
            RawDetection::new("Ladder", 0.6),
        ]));
        let state = harness.run().await;
        assert_eq!(state.outcome, RunOutcome::Completed);
        assert!(state.report_paths.is_some());
        assert!(!state.alert_sent);
        assert_eq!(harness.notifier_attempts(), 0);
        assert!(state.metrics.stage_duration(PipelineStage::Alert).is_none());
    }

    #[tokio::test]
    async fn fallback_detector_covers_a_failing_primary() {
        let harness = Harness::new(ScriptedPrimary::failing())
            .fallback(ScriptedFallback::text(r#"[{"label": "NO-Mask", "confidence": 0.75}]"#));
        let state = harness.run().await;

        assert_eq!(state.detections.len(), 3);
        assert!(state
            .detections
            .iter()
            .all(|d| d.source == DetectionSource::FallbackDetector));
        assert_eq!(errors_in(&state, PipelineStage::Detection).len(), 3);
        // one retry per frame
        assert_eq!(harness.primary.calls().load(Ordering::SeqCst), 6);
        assert!(state.alert_sent);
    }

    #[tokio::test]
    async fn unparseable_fallback_output_leaves_a_clean_but_degraded_run() {
        let harness = Harness::new(ScriptedPrimary::always(vec![]))
            .fallback(ScriptedFallback::text("I can see several workers."));
        let state = harness.run().await;
        assert_eq!(state.outcome, RunOutcome::NoViolations);
        assert!(state.is_degraded());
        assert!(errors_in(&state, PipelineStage::Detection)
            .iter()
            .all(|e| matches!(e, PipelineError::DetectionParseFailure { .. })));
    }

    #[tokio::test]
    async fn pre_cancelled_run_does_nothing() {
        let harness = Harness::new(violations());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let state = harness
            .builder()
            .build()
            .unwrap()
            .run_with_cancellation(video(), cancel)
            .await;
        assert_eq!(state.outcome, RunOutcome::Cancelled);
        assert_eq!(state.last_completed, PipelinePhase::VideoReady);
        assert_eq!(harness.frames.calls(), 0);
    }

    struct CancellingSource {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl FrameSource for CancellingSource {
        async fn extract_frames(
            &self,
            _video: &VideoRef,
            _fps: u32,
            _max_frames: usize,
        ) -> Result<Vec<Frame>, CollaboratorError> {
            self.cancel.cancel();
            Ok(vec![frame(0), frame(1)])
        }
    }

    #[tokio::test]
    async fn cancellation_takes_effect_at_the_next_stage_boundary() {
        let harness = Harness::new(violations());
        let cancel = CancellationToken::new();
        let pipeline = harness
            .builder()
            .frame_source(Arc::new(CancellingSource {
                cancel: cancel.clone(),
            }))
            .build()
            .unwrap();

        let state = pipeline.run_with_cancellation(video(), cancel).await;
        assert_eq!(state.outcome, RunOutcome::Cancelled);
        assert_eq!(state.phase, PipelinePhase::Aborted);
        assert_eq!(state.last_completed, PipelinePhase::FramesExtracted);
        assert_eq!(state.frames.len(), 2);
        assert_eq!(harness.primary.calls().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn build_requires_every_mandatory_collaborator() {
        let result = SafetyPipeline::builder(Configuration::default())
            .frame_source(Arc::new(FakeFrameSource::frames(1)))
            .build();
        assert!(matches!(
            result,
            Err(AppError::MissingCollaborator("primary detector"))
        ));
    }

    #[test]
    fn excerpts_are_unique_and_ordered_by_label_then_rank() {
        let hit = |id: &str, rank: u32| RetrievalHit {
            document_id: id.to_string(),
            text: format!("text {}", id),
            dense_rank: Some(rank),
            sparse_rank: None,
            fused_score: 1.0 / (60.0 + rank as f64),
        };
        let mut retrieved = IndexMap::new();
        retrieved.insert("Excavator".to_string(), vec![hit("a", 1), hit("b", 2)]);
        retrieved.insert("NO-Hardhat".to_string(), vec![hit("b", 1), hit("c", 2)]);

        let ids: Vec<_> = excerpt_union(&retrieved)
            .into_iter()
            .map(|e| e.document_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
