pub mod common;
pub mod config;
pub mod error;
pub mod pipeline;

pub use config::Configuration;
pub use error::{AppError, CollaboratorError, PipelineError};

pub use pipeline::{PipelineState, RunOutcome, SafetyPipeline, SafetyPipelineBuilder};
