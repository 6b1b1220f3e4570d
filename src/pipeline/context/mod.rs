pub mod metrics;
pub mod pipeline_state;
pub mod run_context;
pub mod state;

pub use metrics::RunMetrics;
pub use pipeline_state::{PipelineState, RunOutcome};
pub use run_context::RunContext;
pub use state::ProcessingState;
