//! Bounded retry with exponential backoff for cross-tier HTTP calls.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Attempt budget and backoff for calls that cross a tier boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Timeout of each individual attempt.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
            timeout_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_initial_backoff(mut self, backoff_ms: u64) -> Self {
        self.initial_backoff_ms = backoff_ms;
        self
    }

    pub fn with_max_backoff(mut self, backoff_ms: u64) -> Self {
        self.max_backoff_ms = backoff_ms;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let delay = delay.min(self.max_backoff_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// Gateway-class statuses are worth another attempt.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        )
    }

    /// Send the request built by `build` until it yields a non-retryable
    /// response or the attempt budget runs out.
    ///
    /// Returns the last response (which may carry a retryable status when
    /// the budget is exhausted) or the last transport error.
    pub async fn send(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, reqwest::Error> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let last = attempt + 1 >= attempts;
            match build().timeout(self.timeout()).send().await {
                Ok(response) if !last && Self::is_retryable_status(response.status()) => {
                    debug!(status = %response.status(), attempt, "retryable status, backing off");
                }
                Ok(response) => return Ok(response),
                Err(e) if !last && (e.is_connect() || e.is_timeout()) => {
                    debug!(error = %e, attempt, "transport error, backing off");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.backoff(attempt)).await;
            attempt += 1;
        }
    }
}
