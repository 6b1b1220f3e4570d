use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::fallback::{Capability, FallbackChain, Tier};
use super::guard::GuardedCall;
use crate::error::{CollaboratorError, PipelineError};
use crate::pipeline::collaborators::{PromptTask, StructuredPrompt};
use crate::pipeline::domain::{
    AlertBreakpoints, AlertLevel, Detection, LabelCatalog, LabelCategory, RegulationExcerpt,
    RiskAssessment, ScoringPath, ViolationFinding,
};

const MAX_SCORE: u32 = 100;
const EXCERPT_CHARS: usize = 300;

const ASSESSMENT_INSTRUCTIONS: &str = "You are a construction site safety expert. \
Given the detected violations, equipment context and relevant regulations, return only JSON: \
{\"risk_score\": <integer 0-100>, \"alert_level\": \"LOW\"|\"MEDIUM\"|\"HIGH\"|\"CRITICAL\", \
\"violations\": [{\"type\": <label>, \"severity\": <level>, \"reasoning\": <one sentence>}]}. \
Scoring guide: PPE violation without equipment 30-50, with heavy machinery 60-80, \
several violations with machinery and people nearby 80-100.";

/// Everything the scorers look at for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentRequest {
    pub detections: Vec<Detection>,
    /// Distinct machinery labels, sorted
    pub equipment_present: Vec<String>,
    pub worker_count: usize,
    pub excerpts: Vec<RegulationExcerpt>,
}

impl AssessmentRequest {
    pub fn new(
        detections: Vec<Detection>,
        excerpts: Vec<RegulationExcerpt>,
        catalog: &LabelCatalog,
    ) -> Self {
        let mut equipment_present: Vec<String> = detections
            .iter()
            .filter(|d| catalog.category(&d.label) == Some(LabelCategory::Machinery))
            .map(|d| d.label.clone())
            .collect();
        equipment_present.sort();
        equipment_present.dedup();

        let worker_count = detections
            .iter()
            .filter(|d| catalog.category(&d.label) == Some(LabelCategory::Person))
            .count();

        Self {
            detections,
            equipment_present,
            worker_count,
            excerpts,
        }
    }

    /// Highest confidence per violation label, ordered by label.
    fn violations(&self, catalog: &LabelCatalog) -> BTreeMap<&str, f32> {
        let mut violations = BTreeMap::new();
        for detection in self.detections.iter().filter(|d| catalog.is_violation(&d.label)) {
            let best = violations.entry(detection.label.as_str()).or_insert(0.0f32);
            *best = best.max(detection.confidence);
        }
        violations
    }

    /// Detection count and highest confidence per label, ordered by label.
    fn detection_summary(&self) -> BTreeMap<&str, (usize, f32)> {
        let mut summary = BTreeMap::new();
        for detection in &self.detections {
            let (count, best) = summary
                .entry(detection.label.as_str())
                .or_insert((0usize, 0.0f32));
            *count += 1;
            *best = best.max(detection.confidence);
        }
        summary
    }
}

#[derive(Deserialize)]
struct ScoredResponse {
    risk_score: i64,
    alert_level: String,
    violations: Vec<ScoredViolation>,
}

#[derive(Deserialize)]
struct ScoredViolation {
    #[serde(rename = "type")]
    label: String,
    severity: String,
    reasoning: String,
}

/// Scores through the reasoning service and validates what comes back.
pub struct ReasoningScorer {
    call: GuardedCall<StructuredPrompt, serde_json::Value>,
    catalog: Arc<LabelCatalog>,
    breakpoints: AlertBreakpoints,
}

impl ReasoningScorer {
    pub fn new(
        call: GuardedCall<StructuredPrompt, serde_json::Value>,
        catalog: Arc<LabelCatalog>,
        breakpoints: AlertBreakpoints,
    ) -> Self {
        Self {
            call,
            catalog,
            breakpoints,
        }
    }

    fn prompt(&self, request: &AssessmentRequest) -> StructuredPrompt {
        let violations: Vec<_> = request
            .violations(&self.catalog)
            .into_iter()
            .map(|(label, confidence)| json!({ "label": label, "confidence": confidence }))
            .collect();
        let detections: Vec<_> = request
            .detection_summary()
            .into_iter()
            .map(|(label, (count, confidence))| {
                json!({ "label": label, "count": count, "max_confidence": confidence })
            })
            .collect();
        let regulations: Vec<_> = request
            .excerpts
            .iter()
            .map(|e| {
                json!({
                    "document_id": e.document_id,
                    "text": e.text.chars().take(EXCERPT_CHARS).collect::<String>(),
                })
            })
            .collect();

        StructuredPrompt {
            task: PromptTask::RiskAssessment,
            instructions: ASSESSMENT_INSTRUCTIONS.to_string(),
            payload: json!({
                "violations": violations,
                "detections": detections,
                "heavy_equipment": request.equipment_present,
                "people_nearby": request.worker_count,
                "relevant_regulations": regulations,
            }),
        }
    }

    /// Rejects anything missing a field, scored out of range or naming an unknown level.
    pub fn parse_response(&self, value: serde_json::Value) -> Result<RiskAssessment, String> {
        let response: ScoredResponse =
            serde_json::from_value(value).map_err(|e| format!("unexpected shape: {}", e))?;

        let score = u8::try_from(response.risk_score)
            .ok()
            .filter(|s| u32::from(*s) <= MAX_SCORE)
            .ok_or_else(|| format!("risk score {} outside 0..=100", response.risk_score))?;
        let claimed = response.alert_level.parse::<AlertLevel>()?;

        // The level always follows the breakpoint table, whatever the model claims
        let level = self.breakpoints.level_for(score);
        if claimed != level {
            warn!(
                "Reasoning service labelled score {} as {}, using {}",
                score, claimed, level
            );
        }

        let per_violation = response
            .violations
            .into_iter()
            .map(|v| {
                Ok(ViolationFinding {
                    severity: v.severity.parse()?,
                    label: v.label,
                    rationale: v.reasoning,
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        Ok(RiskAssessment {
            score,
            level,
            per_violation,
        })
    }
}

#[async_trait]
impl Capability<AssessmentRequest> for ReasoningScorer {
    type Output = RiskAssessment;

    fn name(&self) -> &'static str {
        "reasoning scorer"
    }

    async fn invoke(&self, request: &AssessmentRequest) -> Result<RiskAssessment, CollaboratorError> {
        let value = self.call.call(self.prompt(request)).await?;
        self.parse_response(value)
            .map_err(|reason| CollaboratorError::invalid(self.name(), reason))
    }
}

/// Deterministic scorer used when the reasoning service cannot be trusted.
#[derive(Debug, Clone)]
pub struct RuleBasedScorer {
    catalog: Arc<LabelCatalog>,
    breakpoints: AlertBreakpoints,
    default_weight: u32,
    equipment_modifier: u32,
}

impl RuleBasedScorer {
    pub fn new(
        catalog: Arc<LabelCatalog>,
        breakpoints: AlertBreakpoints,
        default_weight: u32,
        equipment_modifier: u32,
    ) -> Self {
        Self {
            catalog,
            breakpoints,
            default_weight,
            equipment_modifier,
        }
    }

    fn weight(&self, label: &str) -> u32 {
        self.catalog
            .get(label)
            .and_then(|entry| entry.severity_weight)
            .unwrap_or(self.default_weight)
    }

    /// Sum of weights over distinct violation labels, plus the equipment
    /// modifier when machinery is present, capped at 100.
    pub fn score(&self, request: &AssessmentRequest) -> RiskAssessment {
        let violations = request.violations(&self.catalog);
        let near_machinery = !violations.is_empty() && !request.equipment_present.is_empty();

        let mut total: u32 = violations
            .keys()
            .map(|label| self.weight(label))
            .fold(0, u32::saturating_add);
        if near_machinery {
            total = total.saturating_add(self.equipment_modifier);
        }
        let score = total.min(MAX_SCORE) as u8;

        let per_violation = violations
            .keys()
            .map(|label| {
                let weight = self.weight(label);
                let mut rationale = format!("{} detected (severity weight {})", label, weight);
                if near_machinery {
                    rationale.push_str(&format!(
                        " near operating machinery: {}",
                        request.equipment_present.join(", ")
                    ));
                }
                ViolationFinding {
                    label: label.to_string(),
                    severity: self.breakpoints.level_for(weight.min(MAX_SCORE) as u8),
                    rationale,
                }
            })
            .collect();

        RiskAssessment {
            score,
            level: self.breakpoints.level_for(score),
            per_violation,
        }
    }
}

#[async_trait]
impl Capability<AssessmentRequest> for RuleBasedScorer {
    type Output = RiskAssessment;

    fn name(&self) -> &'static str {
        "rule-based scorer"
    }

    async fn invoke(&self, request: &AssessmentRequest) -> Result<RiskAssessment, CollaboratorError> {
        Ok(self.score(request))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessed {
    pub assessment: RiskAssessment,
    pub path: ScoringPath,
    /// Why the reasoning path was abandoned
    pub degraded: Option<PipelineError>,
}

pub struct RiskEngine {
    chain: FallbackChain<ReasoningScorer, RuleBasedScorer>,
}

impl RiskEngine {
    pub fn new(reasoning: ReasoningScorer, rules: RuleBasedScorer) -> Self {
        Self {
            chain: FallbackChain::new(reasoning, rules),
        }
    }

    /// Always yields a valid assessment.
    #[instrument(skip_all, fields(detections = request.detections.len()))]
    pub async fn assess(&self, request: &AssessmentRequest) -> Assessed {
        let outcome = self.chain.run(request).await;
        let degraded = outcome
            .primary_error
            .map(|e| PipelineError::AssessmentMalformed(e.to_string()));

        let (assessment, path) = match (outcome.served_by, outcome.result) {
            (Tier::Primary, Ok(assessment)) => (assessment, ScoringPath::Reasoning),
            (_, Ok(assessment)) => (assessment, ScoringPath::RuleBased),
            (_, Err(_)) => (self.chain.fallback().score(request), ScoringPath::RuleBased),
        };

        info!(
            "Risk score {} ({}) via {:?}",
            assessment.score, assessment.level, path
        );
        Assessed {
            assessment,
            path,
            degraded,
        }
    }
}
