//! In-memory collaborators for tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::RgbImage;

use super::retriever::LegQuery;
use crate::common::{Frame, VideoRef};
use crate::error::CollaboratorError;
use crate::pipeline::collaborators::{
    DocumentRenderer, FallbackDetector, FrameSource, NotificationChannel, PrimaryDetector,
    PromptTask, ReasoningService, StructuredPrompt, VectorIndex,
};
use crate::pipeline::domain::{
    AlertMessage, IndexedDocument, RawDetection, ReportPaths, ReportSections, RiskAssessment,
};

pub fn frame(index: u32) -> Frame {
    Frame::new(index, index as f64, RgbImage::new(4, 4))
}

pub struct FakeFrameSource {
    frames: Result<usize, CollaboratorError>,
    calls: AtomicUsize,
}

impl FakeFrameSource {
    pub fn frames(count: usize) -> Self {
        Self {
            frames: Ok(count),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            frames: Err(CollaboratorError::failed("frame source", "unreadable video")),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreadable() -> Self {
        Self {
            frames: Err(CollaboratorError::invalid("frame source", "moov atom not found")),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for FakeFrameSource {
    async fn extract_frames(
        &self,
        _video: &VideoRef,
        _fps: u32,
        max_frames: usize,
    ) -> Result<Vec<Frame>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let count = self.frames.clone()?;
        Ok((0..count.min(max_frames) as u32).map(frame).collect())
    }
}

/// Primary detector answering from a per-frame script.
pub struct ScriptedPrimary {
    default: Result<Vec<RawDetection>, CollaboratorError>,
    per_frame: HashMap<u32, Vec<RawDetection>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedPrimary {
    pub fn always(detections: Vec<RawDetection>) -> Self {
        Self {
            default: Ok(detections),
            per_frame: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            default: Err(CollaboratorError::failed("primary detector", "model offline")),
            per_frame: HashMap::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on_frame(mut self, index: u32, detections: Vec<RawDetection>) -> Self {
        self.per_frame.insert(index, detections);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn respond(&self, frame: &Frame) -> Result<Vec<RawDetection>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.per_frame.get(&frame.index()) {
            Some(detections) => Ok(detections.clone()),
            None => self.default.clone(),
        }
    }
}

#[async_trait]
impl PrimaryDetector for ScriptedPrimary {
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, CollaboratorError> {
        self.respond(frame)
    }
}

pub struct ScriptedFallback {
    output: Result<String, CollaboratorError>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedFallback {
    pub fn text(output: &str) -> Self {
        Self {
            output: Ok(output.to_string()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            output: Err(CollaboratorError::failed("fallback detector", "quota exceeded")),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    pub fn respond(&self, _frame: &Frame) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.output.clone()
    }
}

#[async_trait]
impl FallbackDetector for ScriptedFallback {
    async fn detect_freeform(&self, frame: &Frame) -> Result<String, CollaboratorError> {
        self.respond(frame)
    }
}

/// Index over `reg-0..reg-n`. The dense leg ranks them in order, the sparse
/// leg in reverse.
pub struct FakeIndex {
    documents: Vec<IndexedDocument>,
    dense_fails: bool,
    sparse_fails: bool,
    panics: bool,
    requested: Mutex<Vec<usize>>,
}

impl FakeIndex {
    pub fn with_documents(count: usize) -> Self {
        Self {
            documents: (0..count)
                .map(|i| IndexedDocument::new(format!("reg-{}", i), format!("regulation text {}", i)))
                .collect(),
            dense_fails: false,
            sparse_fails: false,
            panics: false,
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_dense(mut self) -> Self {
        self.dense_fails = true;
        self
    }

    pub fn failing_sparse(mut self) -> Self {
        self.sparse_fails = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn requested_k(&self) -> Vec<usize> {
        self.requested.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, k: usize) {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(k);
        }
        if self.panics {
            panic!("vector index exploded");
        }
    }

    pub fn dense(&self, query: &LegQuery) -> Result<Vec<IndexedDocument>, CollaboratorError> {
        self.record(query.k);
        if self.dense_fails {
            return Err(CollaboratorError::failed("dense index", "connection reset"));
        }
        Ok(self.documents.iter().take(query.k).cloned().collect())
    }

    pub fn sparse(&self, query: &LegQuery) -> Result<Vec<IndexedDocument>, CollaboratorError> {
        self.record(query.k);
        if self.sparse_fails {
            return Err(CollaboratorError::failed("sparse index", "connection reset"));
        }
        Ok(self.documents.iter().rev().take(query.k).cloned().collect())
    }
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn dense_query(&self, text: &str, k: usize) -> Result<Vec<IndexedDocument>, CollaboratorError> {
        self.dense(&LegQuery {
            text: text.to_string(),
            k,
        })
    }

    async fn sparse_query(&self, text: &str, k: usize) -> Result<Vec<IndexedDocument>, CollaboratorError> {
        self.sparse(&LegQuery {
            text: text.to_string(),
            k,
        })
    }
}

pub struct FakeReasoning {
    response: Result<serde_json::Value, CollaboratorError>,
    prompts: Mutex<Vec<PromptTask>>,
}

impl FakeReasoning {
    pub fn json(response: serde_json::Value) -> Self {
        Self {
            response: Ok(response),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            response: Err(CollaboratorError::failed("reasoning", "service unavailable")),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Tasks of every prompt received, in arrival order.
    pub fn tasks(&self) -> Vec<PromptTask> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn respond(&self, prompt: &StructuredPrompt) -> Result<serde_json::Value, CollaboratorError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.task);
        }
        self.response.clone()
    }
}

#[async_trait]
impl ReasoningService for FakeReasoning {
    async fn complete(&self, prompt: &StructuredPrompt) -> Result<serde_json::Value, CollaboratorError> {
        self.respond(prompt)
    }
}

pub struct FakeRenderer {
    fails: bool,
    calls: AtomicUsize,
}

impl FakeRenderer {
    pub fn ok() -> Self {
        Self {
            fails: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fails: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn respond(&self, sections: &ReportSections) -> Result<ReportPaths, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(CollaboratorError::failed("renderer", "template missing"));
        }
        let stem: &PathBuf = &sections.artifact_stem;
        Ok(ReportPaths {
            docx: stem.with_extension("docx"),
            pdf: stem.with_extension("pdf"),
        })
    }
}

#[async_trait]
impl DocumentRenderer for FakeRenderer {
    async fn render(
        &self,
        sections: &ReportSections,
        _assessment: &RiskAssessment,
    ) -> Result<ReportPaths, CollaboratorError> {
        self.respond(sections)
    }
}

pub struct FakeNotifier {
    fails: bool,
    attempts: AtomicUsize,
    sent: Mutex<Vec<AlertMessage>>,
}

impl FakeNotifier {
    pub fn ok() -> Self {
        Self {
            fails: false,
            attempts: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fails: true,
            ..Self::ok()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<AlertMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn respond(&self, message: &AlertMessage) -> Result<(), CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(CollaboratorError::failed("notifier", "topic not found"));
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for FakeNotifier {
    async fn publish(&self, message: &AlertMessage) -> Result<(), CollaboratorError> {
        self.respond(message)
    }
}
