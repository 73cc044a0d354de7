//! Bounded exponential-backoff retries around single HTTP calls.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, ScrapeError};
use crate::rate_limit::RateLimiter;
use crate::source::SourceType;

/// Outcome of one failed attempt, classified for the retry loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptError {
    /// Network error, timeout, HTTP 429 or 5xx. Worth retrying.
    Transient(String),
    /// Any other failure. Retrying would not help.
    Permanent(String),
}

impl AttemptError {
    pub fn from_status(status: StatusCode) -> Self {
        let msg = format!("HTTP {}", status);
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            AttemptError::Transient(msg)
        } else {
            AttemptError::Permanent(msg)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AttemptError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            AttemptError::Transient(m) | AttemptError::Permanent(m) => m,
        }
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return AttemptError::from_status(status);
        }
        if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
            AttemptError::Transient(e.to_string())
        } else {
            AttemptError::Permanent(e.to_string())
        }
    }
}

impl From<ScrapeError> for AttemptError {
    fn from(e: ScrapeError) -> Self {
        AttemptError::Permanent(e.to_string())
    }
}

impl From<serde_json::Error> for AttemptError {
    fn from(e: serde_json::Error) -> Self {
        AttemptError::Permanent(format!("Undecodable response body: {}", e))
    }
}

/// Reads a response body as text, classifying non-success statuses.
pub async fn read_text(resp: reqwest::Response) -> std::result::Result<String, AttemptError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(AttemptError::from_status(status));
    }
    Ok(resp.text().await?)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts()  -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_multiplier()    -> f64 { 2.0 }
fn default_max_delay_ms()  -> u64 { 60_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
    /// `limiter` is acquired before every attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        source_type: SourceType,
        limiter: &RateLimiter,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            limiter.acquire().await;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(source = %source_type, attempt, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        source = %source_type,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = err.message(),
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(ScrapeError::FetchFailed {
                        source_type,
                        attempts: attempt,
                        last_error: err.message().to_string(),
                    });
                }
            }
        }
    }
}

/// Pacing plus retry policy for one source.
#[derive(Debug)]
pub struct Throttle {
    source_type: SourceType,
    limiter: RateLimiter,
    policy: RetryPolicy,
}

impl Throttle {
    pub fn new(source_type: SourceType, limiter: RateLimiter, policy: RetryPolicy) -> Self {
        Self { source_type, limiter, policy }
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, AttemptError>>,
    {
        self.policy.execute(self.source_type, &self.limiter, op).await
    }
}
