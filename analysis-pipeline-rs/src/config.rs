// analysis-pipeline-rs/src/config.rs
//
// Pipeline configuration, injected at startup. The pipeline itself never
// reads ambient configuration; `from_env` exists for composition roots that
// configure through environment variables.
//
// Environment variables (all optional):
// - ANALYST_ENDPOINT_URL: LLM backend base URL or full chat endpoint
// - ANALYST_MODEL: model name
// - ANALYST_REQUEST_TIMEOUT_SECS / ANALYST_CONNECT_TIMEOUT_SECS
// - ANALYST_STREAM: request incremental chunks (true/false)
// - ANALYST_WORKERS: worker pool size
// - ANALYST_QUEUE_DEPTH: bounded queue depth beyond the workers
// - ANALYST_MAX_RETRIES: transient-failure retry bound
// - ANALYST_MAX_BODY_BYTES: per-side normalization budget
// - ANALYST_MAX_PROMPT_BYTES: hard prompt ceiling
// - ANALYST_CACHE_CAPACITY: fingerprint cache entries
// - ANALYST_SESSION_INSIGHTS: session memory depth

use std::env;
use std::str::FromStr;
use std::time::Duration;

use llm_client::{LlmSettings, RetryPolicy};

use crate::error::AnalysisError;

#[derive(Debug, Clone)]
pub struct AnalystConfig {
    pub endpoint_url: String,
    pub model: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub stream: bool,
    /// Worker pool size, matched to the backend's sustainable concurrency.
    pub workers: usize,
    /// Queued submissions beyond the busy workers before `Overloaded`.
    pub queue_depth: usize,
    pub max_retries: u32,
    /// Per-side body budget for normalization.
    pub max_body_bytes: usize,
    /// Hard ceiling on the rendered prompt.
    pub max_prompt_bytes: usize,
    pub cache_capacity: usize,
    pub session_insights: usize,
}

impl Default for AnalystConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:11434/".to_string(),
            model: "llama3:70b".to_string(),
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(60),
            stream: false,
            workers: 2,
            queue_depth: 16,
            max_retries: 3,
            max_body_bytes: 8 * 1024,
            max_prompt_bytes: 128 * 1024,
            cache_capacity: 128,
            session_insights: 5,
        }
    }
}

impl AnalystConfig {
    /// Builds a config from `ANALYST_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint_url: env::var("ANALYST_ENDPOINT_URL").unwrap_or(defaults.endpoint_url),
            model: env::var("ANALYST_MODEL").unwrap_or(defaults.model),
            request_timeout: Duration::from_secs(get_env_var(
                "ANALYST_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
            connect_timeout: Duration::from_secs(get_env_var(
                "ANALYST_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout.as_secs(),
            )),
            stream: get_env_var("ANALYST_STREAM", defaults.stream),
            workers: get_env_var("ANALYST_WORKERS", defaults.workers),
            queue_depth: get_env_var("ANALYST_QUEUE_DEPTH", defaults.queue_depth),
            max_retries: get_env_var("ANALYST_MAX_RETRIES", defaults.max_retries),
            max_body_bytes: get_env_var("ANALYST_MAX_BODY_BYTES", defaults.max_body_bytes),
            max_prompt_bytes: get_env_var("ANALYST_MAX_PROMPT_BYTES", defaults.max_prompt_bytes),
            cache_capacity: get_env_var("ANALYST_CACHE_CAPACITY", defaults.cache_capacity),
            session_insights: get_env_var("ANALYST_SESSION_INSIGHTS", defaults.session_insights),
        }
    }

    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.workers == 0 {
            return Err(AnalysisError::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.queue_depth == 0 {
            return Err(AnalysisError::InvalidConfig(
                "queue_depth must be at least 1".to_string(),
            ));
        }
        if self.cache_capacity == 0 {
            return Err(AnalysisError::InvalidConfig(
                "cache_capacity must be at least 1".to_string(),
            ));
        }
        if self.endpoint_url.trim().is_empty() {
            return Err(AnalysisError::InvalidConfig(
                "endpoint_url must not be empty".to_string(),
            ));
        }
        if self.max_prompt_bytes < 4096 {
            return Err(AnalysisError::InvalidConfig(
                "max_prompt_bytes must leave room for the instruction contract".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection settings for the HTTP LLM client.
    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            endpoint_url: self.endpoint_url.clone(),
            model: self.model.clone(),
            request_timeout: self.request_timeout,
            connect_timeout: self.connect_timeout,
            stream: self.stream,
            retry: RetryPolicy::with_max_retries(self.max_retries),
        }
    }
}

fn get_env_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AnalystConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_body_bytes, 8 * 1024);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn zero_workers_rejected() {
        let config = AnalystConfig {
            workers: 0,
            ..AnalystConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(AnalysisError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tiny_prompt_budget_rejected() {
        let config = AnalystConfig {
            max_prompt_bytes: 100,
            ..AnalystConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn llm_settings_carry_over() {
        let config = AnalystConfig {
            model: "mistral:7b".to_string(),
            max_retries: 5,
            stream: true,
            ..AnalystConfig::default()
        };
        let settings = config.llm_settings();
        assert_eq!(settings.model, "mistral:7b");
        assert_eq!(settings.retry.max_retries, 5);
        assert!(settings.stream);
    }
}
