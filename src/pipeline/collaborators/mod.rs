//! Contracts for the external services the pipeline drives.
//!
//! Implementations must be safe to share between concurrently running
//! pipelines; the pipeline holds them as `Arc<dyn _>` and wraps every call
//! with a timeout, a bounded worker pool and at most one retry.

pub mod ffmpeg;

use async_trait::async_trait;
use serde::Serialize;

use crate::common::{Frame, VideoRef};
use crate::error::CollaboratorError;
use crate::pipeline::domain::{
    AlertMessage, IndexedDocument, RawDetection, ReportPaths, ReportSections, RiskAssessment,
};

pub use ffmpeg::FfmpegFrameSource;

#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Ordered frames sampled at `fps`, at most `max_frames` of them.
    /// `InvalidResponse` means the video itself could not be read.
    async fn extract_frames(
        &self,
        video: &VideoRef,
        fps: u32,
        max_frames: usize,
    ) -> Result<Vec<Frame>, CollaboratorError>;
}

/// Fast bounding-box detector. An empty result is valid.
#[async_trait]
pub trait PrimaryDetector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, CollaboratorError>;
}

/// Slower vision-language detector returning unvalidated structured text.
#[async_trait]
pub trait FallbackDetector: Send + Sync {
    async fn detect_freeform(&self, frame: &Frame) -> Result<String, CollaboratorError>;
}

/// Hybrid vector index with independent dense and sparse entry points,
/// both returning documents most relevant first.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn dense_query(
        &self,
        text: &str,
        k: usize,
    ) -> Result<Vec<IndexedDocument>, CollaboratorError>;

    async fn sparse_query(
        &self,
        text: &str,
        k: usize,
    ) -> Result<Vec<IndexedDocument>, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTask {
    RiskAssessment,
    ReportNarrative,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredPrompt {
    pub task: PromptTask,
    pub instructions: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(
        &self,
        prompt: &StructuredPrompt,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        sections: &ReportSections,
        assessment: &RiskAssessment,
    ) -> Result<ReportPaths, CollaboratorError>;
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn publish(&self, message: &AlertMessage) -> Result<(), CollaboratorError>;
}
