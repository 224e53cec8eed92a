//! llm-client-rs
//!
//! HTTP client for chat-completion LLM backends, built for callers that must
//! not block on a flaky model server: transient failures (timeouts, refused
//! connections, 5xx) are retried with exponential backoff and jitter, 4xx and
//! contract violations fail fast, and an in-flight request can be cancelled
//! cooperatively at any point.
//!
//! The pipeline consumes the client through the [`LlmBackend`] trait so the
//! transport stays swappable.

mod cancel;
mod client;
mod error;
mod retry;

pub use cancel::{cancel_pair, CancelSignal, CancelToken};
pub use client::{ChatMessage, LlmBackend, LlmClient, LlmSettings, ModelReply, Prompt};
pub use error::LlmError;
pub use retry::{RetryDecision, RetryPolicy};
