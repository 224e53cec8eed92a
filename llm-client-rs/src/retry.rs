// llm-client-rs/src/retry.rs
//
// Retry policy for LLM backend calls: exponential backoff with full jitter.
// The policy is plain data - (error, attempt) in, decision out - so it can be
// unit tested without real network timing.

use std::time::Duration;

use rand::Rng;

use crate::error::LlmError;

/// What the send loop should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given delay, then retry with the same prompt.
    Retry(Duration),
    /// Surface the error to the caller.
    GiveUp,
}

/// Retry policy configuration.
///
/// `attempt` is zero-based throughout: the first retry (after the initial
/// attempt failed) is attempt 0.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay for the exponential curve.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Jitter factor (0.0 - 1.0) applied around the capped delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// A policy with a fixed retry bound and default timing.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Decides whether a failed attempt should be retried.
    ///
    /// Only transient errors are retried, and never past `max_retries`.
    /// Cancellation is terminal regardless of the attempt count.
    pub fn decide(&self, error: &LlmError, attempt: u32) -> RetryDecision {
        if !error.is_transient() || attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    /// Backoff delay for the given attempt, with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.raw_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return capped;
        }
        let capped_ms = capped.as_millis() as f64;
        let jitter_range = capped_ms * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_millis((capped_ms + jitter).max(0.0) as u64)
    }

    /// Deterministic exponential delay without jitter: base * 2^attempt,
    /// capped at `max_delay`.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exp = base_ms * 2.0_f64.powi(attempt.min(32) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status: u16) -> LlmError {
        LlmError::HttpError {
            status,
            detail: "test".to_string(),
        }
    }

    #[test]
    fn transient_errors_retry_until_bound() {
        let policy = RetryPolicy::with_max_retries(3);
        let err = server_error(503);

        assert!(matches!(policy.decide(&err, 0), RetryDecision::Retry(_)));
        assert!(matches!(policy.decide(&err, 2), RetryDecision::Retry(_)));
        assert_eq!(policy.decide(&err, 3), RetryDecision::GiveUp);
    }

    #[test]
    fn client_errors_never_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(&server_error(400), 0), RetryDecision::GiveUp);
        assert_eq!(policy.decide(&server_error(404), 0), RetryDecision::GiveUp);
        assert_eq!(
            policy.decide(&LlmError::MalformedResponse("x".to_string()), 0),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn cancellation_never_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(&LlmError::Cancelled, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn raw_delay_doubles_then_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1500),
            jitter_factor: 0.0,
        };
        assert_eq!(policy.raw_delay(0), Duration::from_millis(100));
        assert_eq!(policy.raw_delay(1), Duration::from_millis(200));
        assert_eq!(policy.raw_delay(2), Duration::from_millis(400));
        assert_eq!(policy.raw_delay(3), Duration::from_millis(800));
        assert_eq!(policy.raw_delay(4), Duration::from_millis(1500));
        assert_eq!(policy.raw_delay(10), Duration::from_millis(1500));
    }

    #[test]
    fn jittered_delay_stays_within_band() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        };
        for _ in 0..100 {
            let delay = policy.delay_for(0).as_millis();
            assert!((800..=1200).contains(&delay), "delay {} out of band", delay);
        }
    }

    #[test]
    fn never_policy_gives_up_immediately() {
        let policy = RetryPolicy::never();
        assert_eq!(
            policy.decide(&server_error(500), 0),
            RetryDecision::GiveUp
        );
    }
}
