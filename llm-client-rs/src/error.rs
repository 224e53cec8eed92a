// llm-client-rs/src/error.rs
// Failure taxonomy for LLM backend calls.

use std::time::Duration;

/// Errors produced by a single LLM request, classified so the retry policy
/// can distinguish transient backend trouble from request-level problems.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    /// The attempt did not complete within the configured per-attempt timeout.
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not be reached (refused, reset, DNS, etc.).
    #[error("LLM backend unreachable: {0}")]
    ConnectionRefused(String),

    /// The backend answered with a non-success HTTP status.
    #[error("LLM backend returned HTTP {status}: {detail}")]
    HttpError { status: u16, detail: String },

    /// The backend answered 2xx but the body did not carry a completion in
    /// any recognized shape.
    #[error("malformed LLM response: {0}")]
    MalformedResponse(String),

    /// The caller cancelled the request while it was in flight.
    #[error("LLM request cancelled")]
    Cancelled,
}

impl LlmError {
    /// Transient errors may succeed on retry; everything else indicates a
    /// request- or contract-level problem and is never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::ConnectionRefused(_) => true,
            LlmError::HttpError { status, .. } => *status >= 500,
            LlmError::MalformedResponse(_) | LlmError::Cancelled => false,
        }
    }

    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::HttpError { status, .. } => Some(*status),
            _ => None,
        }
    }
}
