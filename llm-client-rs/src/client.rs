// llm-client-rs/src/client.rs
//
// HTTP client for LLM backends speaking the chat-completion wire shape:
// POST {model, messages:[{role, content}], stream} and either a single JSON
// reply or a sequence of incremental JSON chunks. Retries transient failures
// per the configured RetryPolicy, always resending the identical prompt, and
// aborts promptly when the caller's CancelToken fires.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;
use crate::error::LlmError;
use crate::retry::{RetryDecision, RetryPolicy};

/// One chat turn on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

/// A rendered prompt: fixed system turn plus the per-transaction user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }

    /// Total payload size the budget enforcement works against.
    pub fn byte_len(&self) -> usize {
        self.system.len() + self.user.len()
    }

    fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage {
                role: "system".to_string(),
                content: self.system.clone(),
            },
            ChatMessage {
                role: "user".to_string(),
                content: self.user.clone(),
            },
        ]
    }
}

/// The model's terminal reply text, after any streaming has been drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub text: String,
}

/// Connection settings for one backend.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Base URL of the backend, or a full chat/generate endpoint; the tags
    /// endpoint is derived from it either way.
    pub endpoint_url: String,
    pub model: String,
    /// Per-attempt budget covering the whole request, stream included.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Ask the backend for incremental chunks instead of one JSON object.
    pub stream: bool,
    pub retry: RetryPolicy,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:11434/".to_string(),
            model: "llama3:70b".to_string(),
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(60),
            stream: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// The send contract the pipeline depends on. The HTTP client below is the
/// shipped implementation; a shared LLM-access component or a test double can
/// stand in behind the same trait.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn send(&self, prompt: &Prompt, cancel: CancelToken) -> Result<ModelReply, LlmError>;

    fn is_configured(&self) -> bool {
        true
    }

    /// Human-readable description of what is missing when unconfigured.
    fn comms_issue(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    chat: String,
    tags: String,
}

/// Derives chat and tags endpoints from a configured URL without duplicating
/// path segments when the user already supplied a full endpoint.
fn derive_endpoints(base_url: &str) -> Endpoints {
    let base = if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{}/", base_url)
    };

    for marker in ["/api/chat", "/api/generate"] {
        if let Some(idx) = base.find(marker) {
            let root = &base[..idx];
            return Endpoints {
                chat: format!("{}{}", root, marker),
                tags: format!("{}/api/tags", root),
            };
        }
    }
    if let Some(idx) = base.find("/api/tags") {
        let root = &base[..idx];
        return Endpoints {
            chat: format!("{}/api/chat", root),
            tags: format!("{}/api/tags", root),
        };
    }
    Endpoints {
        chat: format!("{}api/chat", base),
        tags: format!("{}api/tags", base),
    }
}

/// Pulls the completion text out of a non-streaming reply body. Accepts the
/// Ollama chat shape, the Ollama generate shape and the OpenAI-compatible
/// shape, in that order.
fn extract_completion(value: &serde_json::Value) -> Option<String> {
    if let Some(text) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        return Some(text.to_string());
    }
    if let Some(text) = value.get("response").and_then(|r| r.as_str()) {
        return Some(text.to_string());
    }
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
}

/// Pulls the incremental text out of one streaming chunk.
fn extract_chunk_text(value: &serde_json::Value) -> Option<String> {
    if let Some(text) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        return Some(text.to_string());
    }
    if let Some(text) = value.get("response").and_then(|r| r.as_str()) {
        return Some(text.to_string());
    }
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
}

fn truncate_detail(detail: String) -> String {
    const MAX_DETAIL: usize = 512;
    if detail.len() <= MAX_DETAIL {
        return detail;
    }
    let mut end = MAX_DETAIL;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &detail[..end])
}

/// HTTP LLM client.
#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    settings: LlmSettings,
    endpoints: Endpoints,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(|e| LlmError::ConnectionRefused(format!("client setup failed: {}", e)))?;
        let endpoints = derive_endpoints(&settings.endpoint_url);
        debug!(
            chat = %endpoints.chat,
            tags = %endpoints.tags,
            model = %settings.model,
            "LLM client initialized"
        );
        Ok(Self {
            http,
            settings,
            endpoints,
        })
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Sends the prompt, retrying transient failures per the policy. Every
    /// retry reuses the same request body; a fired CancelToken aborts the
    /// in-flight connection and surfaces `Cancelled` without further retries.
    pub async fn send_prompt(
        &self,
        prompt: &Prompt,
        mut cancel: CancelToken,
    ) -> Result<ModelReply, LlmError> {
        let messages = prompt.messages();
        let body = ChatRequest {
            model: &self.settings.model,
            messages: &messages,
            stream: self.settings.stream,
        };

        let mut retries_used: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                outcome = self.attempt(&body) => outcome,
            };

            let err = match outcome {
                Ok(reply) => {
                    debug!(
                        attempts = retries_used + 1,
                        reply_bytes = reply.text.len(),
                        "LLM request succeeded"
                    );
                    return Ok(reply);
                }
                Err(err) => err,
            };

            match self.settings.retry.decide(&err, retries_used) {
                RetryDecision::Retry(delay) => {
                    retries_used += 1;
                    warn!(
                        attempt = retries_used,
                        delay_ms = delay.as_millis() as u64,
                        %err,
                        "transient LLM failure, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::GiveUp => {
                    error!(attempts = retries_used + 1, %err, "LLM request failed");
                    return Err(err);
                }
            }
        }
    }

    /// One attempt under the per-attempt timeout.
    async fn attempt(&self, body: &ChatRequest<'_>) -> Result<ModelReply, LlmError> {
        match tokio::time::timeout(self.settings.request_timeout, self.execute(body)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.settings.request_timeout)),
        }
    }

    async fn execute(&self, body: &ChatRequest<'_>) -> Result<ModelReply, LlmError> {
        let response = self
            .http
            .post(&self.endpoints.chat)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::HttpError {
                status: status.as_u16(),
                detail: truncate_detail(detail),
            });
        }

        if self.settings.stream {
            self.collect_stream(response).await
        } else {
            let value: serde_json::Value = response
                .json()
                .await
                .map_err(|e| LlmError::MalformedResponse(format!("invalid JSON body: {}", e)))?;
            extract_completion(&value)
                .map(|text| ModelReply { text })
                .ok_or_else(|| {
                    LlmError::MalformedResponse("no completion field in reply".to_string())
                })
        }
    }

    /// Drains a streaming reply: one JSON chunk per line, optional SSE
    /// `data:` prefixes tolerated, terminated by `done: true` or `[DONE]`.
    async fn collect_stream(&self, response: reqwest::Response) -> Result<ModelReply, LlmError> {
        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut text = String::new();
        let mut chunks = 0usize;
        let mut done = false;

        'outer: while let Some(next) = stream.next().await {
            let bytes = next
                .map_err(|e| LlmError::ConnectionRefused(format!("stream interrupted: {}", e)))?;
            pending.extend_from_slice(&bytes);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = pending.drain(..=pos).collect();
                let owned = String::from_utf8_lossy(&line_bytes).trim().to_string();
                let line = owned.strip_prefix("data:").map(str::trim).unwrap_or(&owned);
                if line.is_empty() {
                    continue;
                }
                if line == "[DONE]" {
                    done = true;
                    break 'outer;
                }
                let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                    LlmError::MalformedResponse(format!("invalid stream chunk: {}", e))
                })?;
                if let Some(part) = extract_chunk_text(&value) {
                    text.push_str(&part);
                    chunks += 1;
                }
                if value.get("done").and_then(|d| d.as_bool()).unwrap_or(false) {
                    done = true;
                    break 'outer;
                }
            }
        }

        if !done && chunks == 0 {
            return Err(LlmError::MalformedResponse(
                "stream ended without any completion chunks".to_string(),
            ));
        }
        debug!(chunks, "streaming reply drained");
        Ok(ModelReply { text })
    }

    /// Queries the backend's model-listing endpoint.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let response = self
            .http
            .get(&self.endpoints.tags)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::HttpError {
                status: status.as_u16(),
                detail: truncate_detail(detail),
            });
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(format!("invalid JSON body: {}", e)))?;

        // Ollama: {"models":[{"name":...}]}; OpenAI-compatible: {"data":[{"id":...}]}
        let mut names = Vec::new();
        if let Some(models) = value.get("models").and_then(|m| m.as_array()) {
            for model in models {
                if let Some(name) = model.get("name").and_then(|n| n.as_str()) {
                    names.push(name.to_string());
                }
            }
        } else if let Some(data) = value.get("data").and_then(|d| d.as_array()) {
            for model in data {
                if let Some(id) = model.get("id").and_then(|i| i.as_str()) {
                    names.push(id.to_string());
                }
            }
        }
        Ok(names)
    }

    fn map_transport_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(self.settings.request_timeout)
        } else {
            // Connect failures, resets and DNS trouble are all network-class
            // and transient from the retry policy's point of view.
            LlmError::ConnectionRefused(err.to_string())
        }
    }
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn send(&self, prompt: &Prompt, cancel: CancelToken) -> Result<ModelReply, LlmError> {
        self.send_prompt(prompt, cancel).await
    }

    fn is_configured(&self) -> bool {
        !self.settings.model.trim().is_empty()
            && reqwest::Url::parse(&self.endpoints.chat)
                .map(|u| matches!(u.scheme(), "http" | "https"))
                .unwrap_or(false)
    }

    fn comms_issue(&self) -> Option<String> {
        if self.settings.model.trim().is_empty() {
            return Some("no model name configured".to_string());
        }
        match reqwest::Url::parse(&self.endpoints.chat) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => None,
            Ok(url) => Some(format!("unsupported endpoint scheme '{}'", url.scheme())),
            Err(e) => Some(format!(
                "invalid endpoint URL '{}': {}",
                self.settings.endpoint_url, e
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_derived_from_bare_base_url() {
        let eps = derive_endpoints("http://localhost:11434");
        assert_eq!(eps.chat, "http://localhost:11434/api/chat");
        assert_eq!(eps.tags, "http://localhost:11434/api/tags");

        let eps = derive_endpoints("http://localhost:11434/");
        assert_eq!(eps.chat, "http://localhost:11434/api/chat");
        assert_eq!(eps.tags, "http://localhost:11434/api/tags");
    }

    #[test]
    fn endpoints_derived_from_full_endpoint() {
        let eps = derive_endpoints("http://host:11434/api/chat");
        assert_eq!(eps.chat, "http://host:11434/api/chat");
        assert_eq!(eps.tags, "http://host:11434/api/tags");

        let eps = derive_endpoints("http://host:11434/api/generate/");
        assert_eq!(eps.chat, "http://host:11434/api/generate");
        assert_eq!(eps.tags, "http://host:11434/api/tags");

        let eps = derive_endpoints("http://host:11434/api/tags");
        assert_eq!(eps.chat, "http://host:11434/api/chat");
        assert_eq!(eps.tags, "http://host:11434/api/tags");
    }

    #[test]
    fn completion_extracted_from_known_shapes() {
        let ollama_chat: serde_json::Value =
            serde_json::json!({"message": {"role": "assistant", "content": "hi"}, "done": true});
        assert_eq!(extract_completion(&ollama_chat).as_deref(), Some("hi"));

        let ollama_generate: serde_json::Value = serde_json::json!({"response": "hello"});
        assert_eq!(extract_completion(&ollama_generate).as_deref(), Some("hello"));

        let openai: serde_json::Value =
            serde_json::json!({"choices": [{"message": {"content": "hey"}}]});
        assert_eq!(extract_completion(&openai).as_deref(), Some("hey"));

        let unknown: serde_json::Value = serde_json::json!({"result": "nope"});
        assert_eq!(extract_completion(&unknown), None);
    }

    #[test]
    fn chunk_text_extracted_from_stream_shapes() {
        let ollama: serde_json::Value =
            serde_json::json!({"message": {"content": "par"}, "done": false});
        assert_eq!(extract_chunk_text(&ollama).as_deref(), Some("par"));

        let openai: serde_json::Value =
            serde_json::json!({"choices": [{"delta": {"content": "tial"}}]});
        assert_eq!(extract_chunk_text(&openai).as_deref(), Some("tial"));
    }

    #[test]
    fn prompt_renders_two_turns() {
        let prompt = Prompt::new("be terse", "analyze this");
        let messages = prompt.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");
        assert_eq!(prompt.byte_len(), "be terse".len() + "analyze this".len());
    }

    #[test]
    fn unconfigured_client_reports_issue() {
        let client = LlmClient::new(LlmSettings {
            endpoint_url: "not a url".to_string(),
            ..LlmSettings::default()
        })
        .expect("client should build");
        assert!(!client.is_configured());
        assert!(client.comms_issue().is_some());

        let ok = LlmClient::new(LlmSettings::default()).expect("client should build");
        assert!(ok.is_configured());
        assert!(ok.comms_issue().is_none());
    }

    #[test]
    fn long_error_detail_is_truncated() {
        let detail = "x".repeat(2048);
        let truncated = truncate_detail(detail);
        assert!(truncated.len() <= 512 + 3);
        assert!(truncated.ends_with("..."));
    }
}
