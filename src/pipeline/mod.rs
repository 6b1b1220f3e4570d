pub mod collaborators;
pub mod context;
pub mod domain;
pub mod orchestration;
pub mod services;

pub use context::{PipelineState, RunOutcome};
pub use orchestration::{PipelinePhase, PipelineStage, SafetyPipeline, SafetyPipelineBuilder};
