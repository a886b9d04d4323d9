//! Exponential backoff for transient upload failures.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;

/// Retry configuration for exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Consecutive transient failures tolerated before giving up.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Add up to 10% random delay on top of the computed backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(32),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_secs_f64();
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = (base * exp).min(self.max_backoff.as_secs_f64());

        let delay = if self.jitter && delay > 0.0 {
            delay + rand::thread_rng().gen_range(0.0..=delay * 0.1)
        } else {
            delay
        };

        Duration::from_secs_f64(delay)
    }
}

/// Statuses worth retrying: request timeout, rate limiting and server errors.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}
