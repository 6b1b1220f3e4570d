pub mod orchestrator;
pub mod stage;

pub use orchestrator::{SafetyPipeline, SafetyPipelineBuilder};
pub use stage::{PipelinePhase, PipelineStage};
