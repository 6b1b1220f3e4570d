use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::fallback::{Capability, FallbackChain};
use super::guard::GuardedCall;
use crate::common::Frame;
use crate::error::{CollaboratorError, PipelineError};
use crate::pipeline::domain::{Detection, DetectionSource, LabelCatalog, RawDetection};

/// Reduces both detectors' output to one uniform, thresholded, de-duplicated set per frame.
#[derive(Debug, Clone)]
pub struct DetectionNormalizer {
    threshold: f32,
    catalog: Arc<LabelCatalog>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FreeformPayload {
    List(Vec<RawDetection>),
    Wrapped { detections: Vec<RawDetection> },
}

impl DetectionNormalizer {
    pub fn new(threshold: f32, catalog: Arc<LabelCatalog>) -> Self {
        Self { threshold, catalog }
    }

    /// Admits detections at or above the threshold whose label is in the
    /// vocabulary, keeping the most confident one per label.
    pub fn normalize(
        &self,
        frame_index: u32,
        raw: &[RawDetection],
        source: DetectionSource,
    ) -> Vec<Detection> {
        let mut admitted: IndexMap<&str, Detection> = IndexMap::new();

        for candidate in raw {
            let confidence = candidate.confidence;
            if !(confidence.is_finite() && (0.0..=1.0).contains(&confidence)) {
                debug!(
                    "Dropping '{}' on frame {}: confidence {} out of range",
                    candidate.label, frame_index, confidence
                );
                continue;
            }
            if confidence < self.threshold {
                continue;
            }
            let Some(label) = self.catalog.canonical(&candidate.label) else {
                debug!(
                    "Dropping '{}' on frame {}: not in vocabulary",
                    candidate.label, frame_index
                );
                continue;
            };

            match admitted.get_mut(label) {
                Some(existing) if existing.confidence >= confidence => {}
                Some(existing) => existing.confidence = confidence,
                None => {
                    admitted.insert(
                        label,
                        Detection {
                            label: label.to_string(),
                            confidence,
                            source,
                            frame_index,
                        },
                    );
                }
            }
        }

        admitted.into_values().collect()
    }

    /// Parses fallback detector text, tolerating a markdown code fence around the JSON.
    pub fn parse_freeform(text: &str) -> Result<Vec<RawDetection>, String> {
        let body = strip_code_fence(text);
        let payload: FreeformPayload =
            serde_json::from_str(body).map_err(|e| format!("not valid detection JSON: {}", e))?;
        let raw = match payload {
            FreeformPayload::List(raw) => raw,
            FreeformPayload::Wrapped { detections } => detections,
        };

        if let Some(bad) = raw
            .iter()
            .find(|d| !(d.confidence.is_finite() && (0.0..=1.0).contains(&d.confidence)))
        {
            return Err(format!(
                "confidence {} for '{}' is outside [0, 1]",
                bad.confidence, bad.label
            ));
        }
        Ok(raw)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = match rest.find("```") {
        Some(end) => &rest[..end],
        None => rest,
    };
    let inner = inner.trim_start();
    inner.strip_prefix("json").unwrap_or(inner).trim()
}

/// Normalized output of one detector for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFrame {
    /// Results the detector produced before thresholding
    pub raw_count: usize,
    pub detections: Vec<Detection>,
}

struct PrimaryLeg {
    call: GuardedCall<Frame, Vec<RawDetection>>,
    normalizer: DetectionNormalizer,
}

#[async_trait]
impl Capability<Frame> for PrimaryLeg {
    type Output = NormalizedFrame;

    fn name(&self) -> &'static str {
        "primary detector"
    }

    async fn invoke(&self, frame: &Frame) -> Result<NormalizedFrame, CollaboratorError> {
        let raw = self.call.call(frame.clone()).await?;
        Ok(NormalizedFrame {
            raw_count: raw.len(),
            detections: self
                .normalizer
                .normalize(frame.index(), &raw, DetectionSource::PrimaryDetector),
        })
    }

    // Any primary result, even one entirely below threshold, keeps the fallback out.
    fn is_actionable(&self, output: &NormalizedFrame) -> bool {
        output.raw_count > 0
    }
}

struct FallbackLeg {
    call: GuardedCall<Frame, String>,
    normalizer: DetectionNormalizer,
}

#[async_trait]
impl Capability<Frame> for FallbackLeg {
    type Output = NormalizedFrame;

    fn name(&self) -> &'static str {
        "fallback detector"
    }

    async fn invoke(&self, frame: &Frame) -> Result<NormalizedFrame, CollaboratorError> {
        let text = self.call.call(frame.clone()).await?;
        let raw = DetectionNormalizer::parse_freeform(&text)
            .map_err(|reason| CollaboratorError::invalid(self.name(), reason))?;
        Ok(NormalizedFrame {
            raw_count: raw.len(),
            detections: self
                .normalizer
                .normalize(frame.index(), &raw, DetectionSource::FallbackDetector),
        })
    }
}

/// Per-frame detections plus the absorbed errors behind them.
#[derive(Debug, Default)]
pub struct FrameDetections {
    pub frame_index: u32,
    pub detections: Vec<Detection>,
    pub errors: Vec<PipelineError>,
}

/// Runs the primary detector and, only when it has nothing, the fallback.
pub struct FrameDetector {
    chain: FallbackChain<PrimaryLeg, FallbackLeg>,
}

impl FrameDetector {
    pub fn new(
        normalizer: DetectionNormalizer,
        primary: GuardedCall<Frame, Vec<RawDetection>>,
        fallback: GuardedCall<Frame, String>,
    ) -> Self {
        Self {
            chain: FallbackChain::new(
                PrimaryLeg {
                    call: primary,
                    normalizer: normalizer.clone(),
                },
                FallbackLeg {
                    call: fallback,
                    normalizer,
                },
            ),
        }
    }

    #[instrument(skip(self, frame), fields(frame = frame.index()))]
    pub async fn detect(&self, frame: &Frame) -> FrameDetections {
        let frame_index = frame.index();
        let outcome = self.chain.run(frame).await;

        let mut errors = Vec::new();
        if let Some(e) = outcome.primary_error {
            errors.push(PipelineError::DetectorUnavailable {
                frame_index,
                reason: e.to_string(),
            });
        }

        let detections = match outcome.result {
            Ok(normalized) => normalized.detections,
            Err(CollaboratorError::InvalidResponse { reason, .. }) => {
                errors.push(PipelineError::DetectionParseFailure {
                    frame_index,
                    reason,
                });
                Vec::new()
            }
            Err(e) => {
                errors.push(PipelineError::DetectorUnavailable {
                    frame_index,
                    reason: e.to_string(),
                });
                Vec::new()
            }
        };

        debug!("Frame {} yielded {} detections", frame_index, detections.len());
        FrameDetections {
            frame_index,
            detections,
            errors,
        }
    }
}
