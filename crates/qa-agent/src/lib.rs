pub mod budget;
pub mod events;
pub mod generator;
pub mod grader;
pub mod guardrails;
pub mod intent;
pub mod pipeline;
pub mod prompts;
pub mod rewriter;
pub mod session;
pub mod telemetry;

pub use events::EventSink;
pub use generator::{GenerationOutcome, Generator};
pub use grader::{GradeOutcome, Grader, CONFIDENCE_THRESHOLD};
pub use guardrails::{validate_input, validate_output, InputValidation, OutputValidation};
pub use pipeline::AgentPipeline;
pub use rewriter::{RewriteOutcome, Rewriter};
pub use session::{
    CheckpointBackend, MemoryCheckpoint, RedisCheckpoint, SessionStore,
};

pub use qa_error::{QaError, Result};
