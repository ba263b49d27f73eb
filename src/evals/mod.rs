// Evaluation pipeline: scheduling on trace completion, LLM/rule execution,
// score emission.

pub mod llm;
pub mod runner;
pub mod scheduler;

pub use llm::{DisabledLlmClient, HttpLlmClient, LlmClient};
pub use runner::EvaluationRunHandler;
pub use scheduler::{
    sample_fraction, should_sample, EvaluationRunPayload, TraceCompleteHandler,
    TraceCompletePayload,
};
