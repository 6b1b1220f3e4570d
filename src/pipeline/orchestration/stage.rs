use std::fmt;

use serde::Serialize;

/// A unit of work in the safety pipeline. Stages always run in `priority` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineStage {
    /// Pull frames out of the submitted video
    FrameExtraction,
    /// Run the primary/fallback detectors over every frame
    Detection,
    /// Hybrid regulation retrieval per detected label
    Retrieval,
    /// Risk scoring
    Assessment,
    /// Report composition and rendering
    Report,
    /// Alert dispatch
    Alert,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 6] = [
        PipelineStage::FrameExtraction,
        PipelineStage::Detection,
        PipelineStage::Retrieval,
        PipelineStage::Assessment,
        PipelineStage::Report,
        PipelineStage::Alert,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::FrameExtraction => "FrameExtraction",
            PipelineStage::Detection => "Detection",
            PipelineStage::Retrieval => "Retrieval",
            PipelineStage::Assessment => "Assessment",
            PipelineStage::Report => "Report",
            PipelineStage::Alert => "Alert",
        }
    }

    /// Get the execution order priority (lower executes first)
    pub fn priority(&self) -> u8 {
        match self {
            PipelineStage::FrameExtraction => 1,
            PipelineStage::Detection => 2,
            PipelineStage::Retrieval => 3,
            PipelineStage::Assessment => 4,
            PipelineStage::Report => 5,
            PipelineStage::Alert => 6,
        }
    }
}

impl PartialOrd for PipelineStage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PipelineStage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority().cmp(&other.priority())
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run state machine. Transitions are linear in declaration order; `Done`
/// and `Aborted` are terminal and either may be reached early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelinePhase {
    VideoReady,
    FramesExtracted,
    DetectionsReady,
    RetrievalReady,
    AssessmentReady,
    ReportReady,
    Done,
    Aborted,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::VideoReady => "VideoReady",
            PipelinePhase::FramesExtracted => "FramesExtracted",
            PipelinePhase::DetectionsReady => "DetectionsReady",
            PipelinePhase::RetrievalReady => "RetrievalReady",
            PipelinePhase::AssessmentReady => "AssessmentReady",
            PipelinePhase::ReportReady => "ReportReady",
            PipelinePhase::Done => "Done",
            PipelinePhase::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelinePhase::Done | PipelinePhase::Aborted)
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
