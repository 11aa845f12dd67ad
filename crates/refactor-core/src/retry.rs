//! Bounded retry with exponential backoff for collaborator calls.
//!
//! Every attempt is bounded by `call_timeout`. Only
//! [`BotError::TransientExternal`] is retried; everything else returns
//! immediately. After the last attempt the transient error is surfaced and
//! the caller abandons the cycle.

use std::future::Future;
use std::time::Duration;

use crate::domain::{BotError, Result};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            call_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Read overrides from `REFACTOR_BOT_RETRY_ATTEMPTS`,
    /// `REFACTOR_BOT_RETRY_BACKOFF_MS` and `REFACTOR_BOT_CALL_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let mut policy = Self::default();
        if let Some(v) = env_parse::<u32>("REFACTOR_BOT_RETRY_ATTEMPTS") {
            policy.max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("REFACTOR_BOT_RETRY_BACKOFF_MS") {
            policy.initial_backoff_ms = v;
        }
        if let Some(v) = env_parse::<u64>("REFACTOR_BOT_CALL_TIMEOUT_SECS") {
            policy.call_timeout = Duration::from_secs(v.max(1));
        }
        policy
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retryable,
    NonRetryable,
}

/// 429, 408 and 5xx are worth repeating; other statuses are final.
pub fn retry_decision_for_status(status: reqwest::StatusCode) -> RetryDecision {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RetryDecision::Retryable
    } else {
        RetryDecision::NonRetryable
    }
}

/// Map a non-success HTTP status into the error taxonomy.
pub fn status_error(service: &str, status: reqwest::StatusCode, body: &str) -> BotError {
    let message = body.chars().take(500).collect::<String>();
    match retry_decision_for_status(status) {
        RetryDecision::Retryable => BotError::transient(service, format!("status {status}: {message}")),
        RetryDecision::NonRetryable => BotError::External {
            service: service.to_string(),
            status: status.as_u16(),
            message,
        },
    }
}

/// Map a transport error. Timeouts and connection failures are transient.
pub fn transport_error(service: &str, err: reqwest::Error) -> BotError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BotError::transient(service, err.to_string())
    } else {
        BotError::External {
            service: service.to_string(),
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: err.to_string(),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(BotError::transient(
                operation,
                format!("timed out after {}s", policy.call_timeout.as_secs()),
            )),
        };

        match outcome {
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                obs::emit_retry_attempt(operation, attempt, attempts, delay, &err);
                METRICS.inc_retries();
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
