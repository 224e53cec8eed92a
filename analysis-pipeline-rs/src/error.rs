// analysis-pipeline-rs/src/error.rs
// Pipeline-level error taxonomy. Only submit-time conditions are surfaced as
// errors; everything after admission becomes a terminal AnalysisResult value.

use llm_client::LlmError;

/// Errors surfaced across the submit boundary.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Worker pool and queue are saturated; the request was not created.
    #[error("analysis queue is full, try again later")]
    Overloaded,

    /// The orchestrator has been shut down and accepts no new work.
    #[error("analysis pipeline is shut down")]
    ShutDown,

    /// Invalid configuration detected at startup.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failure causes recorded inside a terminal `AnalysisResult`. These never
/// cross the submit/result boundary as errors; callers always receive a value.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisFailure {
    #[error(transparent)]
    Llm(#[from] LlmError),

    /// The model reply did not follow the required finding structure.
    /// Retrying the same reply is pointless; a fresh submission re-prompts.
    #[error("model reply could not be parsed: {0}")]
    ParseFailure(String),
}
