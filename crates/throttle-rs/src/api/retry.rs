//! Retry policy for prompt calls.
//!
//! The default is a fixed delay between a bounded number of attempts. An
//! exponential multiplier and deterministic jitter can be switched on for
//! callers sharing a rate-limited provider with other processes.
//!
//! The string classifiers below understand the error text produced by
//! [`OpenRouterClient`](crate::api::completion::OpenRouterClient): 429, 5xx
//! and network failures are transient; 400/401/403/404/422 are permanent.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first (0 behaves like 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor per retry. `1.0` gives a fixed delay.
    pub multiplier: f64,
    /// Scale delays down by a deterministic per-attempt factor.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Fixed-delay policy with the given attempt count and delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            ..Default::default()
        }
    }

    /// Exponential backoff starting at `initial_delay`, doubling per retry.
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier: 2.0,
            jitter: true,
            ..Default::default()
        }
    }

    /// Effective attempt count (never zero).
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to sleep after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if !self.jitter {
            return Duration::from_secs_f64(capped);
        }
        let factor = match attempt % 4 {
            0 => 0.75,
            1 => 0.90,
            2 => 0.60,
            _ => 0.85,
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// Whether an error string indicates a transient (retryable) failure.
pub fn is_transient_error(error: &str) -> bool {
    if ["429", "500", "502", "503", "504"]
        .iter()
        .any(|s| error.contains(&format!("HTTP {s}")))
    {
        return true;
    }

    let lower = error.to_lowercase();
    [
        "request failed:",
        "connection reset",
        "connection refused",
        "timed out",
        "timeout",
        "broken pipe",
        "network",
        "rate limit",
    ]
    .iter()
    .any(|p| lower.contains(p))
}

/// Whether an error string indicates a permanent (non-retryable) failure.
pub fn is_permanent_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    ["HTTP 400", "HTTP 401", "HTTP 403", "HTTP 404", "HTTP 422"]
        .iter()
        .any(|p| error.contains(p))
        || ["invalid request", "bad request", "unauthorized"]
            .iter()
            .any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_five_fixed_one_second_attempts() {
        let config = RetryConfig::default();
        assert_eq!(config.attempts(), 5);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(1));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryConfig::fixed(0, Duration::ZERO).attempts(), 1);
    }

    #[test]
    fn exponential_delay_grows_until_capped() {
        let config = RetryConfig {
            jitter: false,
            max_delay: Duration::from_secs(4),
            ..RetryConfig::exponential(10, Duration::from_millis(500))
        };
        assert!(config.delay_for_attempt(1) > config.delay_for_attempt(0));
        assert!(config.delay_for_attempt(2) > config.delay_for_attempt(1));
        assert_eq!(config.delay_for_attempt(9), Duration::from_secs(4));
    }

    #[test]
    fn jitter_never_lengthens_delay() {
        let jittered = RetryConfig::exponential(3, Duration::from_millis(500));
        let plain = RetryConfig {
            jitter: false,
            ..jittered.clone()
        };
        for attempt in 0..4 {
            assert!(jittered.delay_for_attempt(attempt) <= plain.delay_for_attempt(attempt));
        }
    }

    #[test]
    fn transient_errors_detected() {
        assert!(is_transient_error("OpenRouter API HTTP 429 Too Many Requests: slow"));
        assert!(is_transient_error("OpenRouter API HTTP 503 Service Unavailable"));
        assert!(is_transient_error("request failed: connection reset"));
        assert!(!is_transient_error("OpenRouter API HTTP 400 Bad Request: nope"));
    }

    #[test]
    fn permanent_errors_detected() {
        assert!(is_permanent_error("OpenRouter API HTTP 401 Unauthorized"));
        assert!(is_permanent_error("Invalid request: unknown model"));
        assert!(!is_permanent_error("request failed: timed out"));
    }
}
