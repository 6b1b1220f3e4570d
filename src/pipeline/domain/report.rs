use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Rendered report artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportPaths {
    pub docx: PathBuf,
    pub pdf: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegulationExcerpt {
    pub document_id: String,
    pub text: String,
}

/// Renderer-agnostic report content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSections {
    pub title: String,
    pub video_id: String,
    pub generated_at: DateTime<Utc>,
    pub executive_summary: String,
    pub violations: Vec<String>,
    pub regulations: Vec<RegulationExcerpt>,
    pub recommended_actions: Vec<String>,
    /// Free-form body written by the reasoning service, or the summary when it is unavailable.
    pub narrative: String,
    /// Artifact path without extension; renderers append `.docx` / `.pdf`.
    pub artifact_stem: PathBuf,
}

/// A message handed to the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertMessage {
    pub subject: String,
    pub body: String,
}
