use std::time::Duration;

use thiserror::Error;

use crate::pipeline::orchestration::stage::PipelineStage;

// Main Application Error Type

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Pipeline Error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Pipeline is missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}

// Errors raised inside a pipeline run. Only extraction failures and panics
// abort a run, everything else is recorded as a diagnostic and absorbed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Frame extraction failed: {0}")]
    ExtractionFailure(String),
    #[error("No frames could be extracted from {0}")]
    NoFramesExtracted(String),
    #[error("Detector unavailable for frame {frame_index}: {reason}")]
    DetectorUnavailable { frame_index: u32, reason: String },
    #[error("Could not parse fallback detector output for frame {frame_index}: {reason}")]
    DetectionParseFailure { frame_index: u32, reason: String },
    #[error("Retrieval for '{label}' degraded to a single ranking: {reason}")]
    RankingDegraded { label: String, reason: String },
    #[error("Retrieval unavailable for '{label}': {reason}")]
    RetrievalUnavailable { label: String, reason: String },
    #[error("Risk assessment malformed, rule-based scorer used: {0}")]
    AssessmentMalformed(String),
    #[error("Report rendering failed: {0}")]
    ReportRenderFailure(String),
    #[error("Notification failed: {0}")]
    NotificationFailure(String),
    #[error("Stage {stage} panicked: {message}")]
    StagePanicked {
        stage: PipelineStage,
        message: String,
    },
}

impl PipelineError {
    /// Whether this error ends the run in the `Aborted` state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::ExtractionFailure(_)
                | PipelineError::NoFramesExtracted(_)
                | PipelineError::StagePanicked { .. }
        )
    }
}

// Failure of a single call to an external collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("{collaborator} call failed: {reason}")]
    Failed {
        collaborator: &'static str,
        reason: String,
    },
    #[error("{collaborator} call timed out after {after:?}")]
    Timeout {
        collaborator: &'static str,
        after: Duration,
    },
    #[error("{collaborator} returned invalid data: {reason}")]
    InvalidResponse {
        collaborator: &'static str,
        reason: String,
    },
}

impl CollaboratorError {
    pub fn failed(collaborator: &'static str, reason: impl Into<String>) -> Self {
        CollaboratorError::Failed {
            collaborator,
            reason: reason.into(),
        }
    }

    pub fn invalid(collaborator: &'static str, reason: impl Into<String>) -> Self {
        CollaboratorError::InvalidResponse {
            collaborator,
            reason: reason.into(),
        }
    }
}

/// A recorded, non-fatal (or the final fatal) error tagged with the stage it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDiagnostic {
    pub stage: PipelineStage,
    pub error: PipelineError,
}

impl StageDiagnostic {
    pub fn new(stage: PipelineStage, error: PipelineError) -> Self {
        Self { stage, error }
    }
}

impl std::fmt::Display for StageDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.stage, self.error)
    }
}
