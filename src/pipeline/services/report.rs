use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::guard::GuardedCall;
use super::risk_engine::AssessmentRequest;
use crate::common::VideoRef;
use crate::error::PipelineError;
use crate::pipeline::collaborators::{PromptTask, StructuredPrompt};
use crate::pipeline::domain::{LabelCatalog, ReportPaths, ReportSections, RiskAssessment};

const REPORT_TITLE: &str = "Construction Site Safety Report";

const NARRATIVE_INSTRUCTIONS: &str = "You are a construction site safety expert writing an \
incident report. Using the safety data provided, write a clear professional report with the \
sections Executive Summary, Violations Found, Applicable Regulations and Recommended Actions. \
Return JSON of the form {\"narrative\": <report text>}.";

/// Input handed to the document renderer.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub sections: ReportSections,
    pub assessment: RiskAssessment,
}

pub struct ReportComposer {
    narrative: GuardedCall<StructuredPrompt, serde_json::Value>,
    renderer: GuardedCall<RenderJob, ReportPaths>,
    catalog: Arc<LabelCatalog>,
    reports_dir: PathBuf,
}

impl ReportComposer {
    pub fn new(
        narrative: GuardedCall<StructuredPrompt, serde_json::Value>,
        renderer: GuardedCall<RenderJob, ReportPaths>,
        catalog: Arc<LabelCatalog>,
        reports_dir: PathBuf,
    ) -> Self {
        Self {
            narrative,
            renderer,
            catalog,
            reports_dir,
        }
    }

    pub fn summary(video_id: &str, assessment: &RiskAssessment) -> String {
        format!(
            "Safety analysis for {} detected {} violation(s) with risk score {}/100.",
            video_id,
            assessment.per_violation.len(),
            assessment.score
        )
    }

    /// Builds the report content. The narrative falls back to the summary
    /// when the reasoning service cannot write one.
    pub async fn compose(
        &self,
        video: &VideoRef,
        request: &AssessmentRequest,
        assessment: &RiskAssessment,
    ) -> ReportSections {
        let video_id = video.id();
        let executive_summary = Self::summary(&video_id, assessment);

        let violations: Vec<String> = assessment
            .per_violation
            .iter()
            .map(|v| format!("{} ({}): {}", v.label, v.severity, v.rationale))
            .collect();

        let mut recommended_actions: Vec<String> = Vec::new();
        for finding in &assessment.per_violation {
            if let Some(remediation) = self
                .catalog
                .get(&finding.label)
                .and_then(|entry| entry.remediation.clone())
            {
                if !recommended_actions.contains(&remediation) {
                    recommended_actions.push(remediation);
                }
            }
        }
        if !request.equipment_present.is_empty() {
            recommended_actions.push(format!(
                "Keep workers clear of operating machinery ({}) and establish exclusion zones.",
                request.equipment_present.join(", ")
            ));
        }

        let prompt = StructuredPrompt {
            task: PromptTask::ReportNarrative,
            instructions: NARRATIVE_INSTRUCTIONS.to_string(),
            payload: json!({
                "video_id": video_id,
                "risk_score": assessment.score,
                "alert_level": assessment.level,
                "violations": assessment.per_violation,
                "regulations": request.excerpts,
            }),
        };
        let narrative = match self.narrative.call(prompt).await {
            Ok(value) => match narrative_text(value) {
                Some(text) => text,
                None => {
                    warn!("Reasoning service returned no usable narrative, using summary");
                    executive_summary.clone()
                }
            },
            Err(e) => {
                warn!("Narrative generation failed, using summary: {}", e);
                executive_summary.clone()
            }
        };

        ReportSections {
            title: REPORT_TITLE.to_string(),
            artifact_stem: self.reports_dir.join(format!("{}_report", video_id)),
            video_id,
            generated_at: Utc::now(),
            executive_summary,
            violations,
            regulations: request.excerpts.clone(),
            recommended_actions,
            narrative,
        }
    }

    /// Composes and renders the report under the reports directory.
    #[instrument(skip_all, fields(video = %video))]
    pub async fn produce(
        &self,
        video: &VideoRef,
        request: &AssessmentRequest,
        assessment: &RiskAssessment,
    ) -> Result<ReportPaths, PipelineError> {
        let sections = self.compose(video, request, assessment).await;

        tokio::fs::create_dir_all(&self.reports_dir)
            .await
            .map_err(|e| {
                PipelineError::ReportRenderFailure(format!(
                    "cannot create {}: {}",
                    self.reports_dir.display(),
                    e
                ))
            })?;

        let paths = self
            .renderer
            .call(RenderJob {
                sections,
                assessment: assessment.clone(),
            })
            .await
            .map_err(|e| PipelineError::ReportRenderFailure(e.to_string()))?;

        info!("Report saved to {}", paths.docx.display());
        Ok(paths)
    }
}

fn narrative_text(value: serde_json::Value) -> Option<String> {
    let text = match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Object(mut fields) => match fields.remove("narrative") {
            Some(serde_json::Value::String(text)) => text,
            _ => return None,
        },
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}
