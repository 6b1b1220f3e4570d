pub mod alert;
pub mod fallback;
pub mod fusion;
pub mod guard;
pub mod normalizer;
pub mod report;
pub mod retriever;
pub mod risk_engine;

#[cfg(test)]
pub(crate) mod testing;

pub use alert::AlertDispatcher;
pub use fallback::{join_tolerant, Capability, ChainOutcome, FallbackChain, Tier, Tolerant};
pub use fusion::{RrfFusion, DEFAULT_RRF_K};
pub use guard::{GuardedCall, RetryOnceLayer};
pub use normalizer::{DetectionNormalizer, FrameDetections, FrameDetector};
pub use report::{RenderJob, ReportComposer};
pub use retriever::{HybridRetriever, LabelQuery, LabelRetrieval, LegQuery, Retrieval};
pub use risk_engine::{Assessed, AssessmentRequest, ReasoningScorer, RiskEngine, RuleBasedScorer};
