use std::time::Duration;

use reqwest::StatusCode;

/// Exponential backoff policy.
///
/// - initial_delay: base delay for attempt 0
/// - multiplier: factor by which delay grows each attempt (> 1.0)
/// - max_delay: cap for the computed delay
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub const fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let pow = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        Duration::try_from_secs_f64(self.initial_delay.as_secs_f64() * pow)
            .map(|scaled| scaled.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

/// Bounded retry for transient destination failures. `max_retries` counts the
/// retries after the first attempt, so a request is sent at most `max_retries + 1` times.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffPolicy::new(Duration::ZERO, 1.0, Duration::ZERO),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff.next_delay(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            BackoffPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(30)),
        )
    }
}

// Gateway and availability errors only. A plain 4xx means the payload is bad and
// resending it will not help.
pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}
