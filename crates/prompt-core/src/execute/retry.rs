use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::execute::provider::CompletionError;

/// Backoff window in seconds, sampled uniformly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl BackoffRange {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    pub fn sample(&self) -> Duration {
        if self.max_secs <= self.min_secs {
            return Duration::from_secs_f64(self.min_secs.max(0.0));
        }
        let secs = rand::thread_rng().gen_range(self.min_secs..=self.max_secs);
        Duration::from_secs_f64(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Timeouts, connection failures and unavailable service
    pub transient: BackoffRange,
    /// The account-level hard rate limit
    pub hard_rate_limit: BackoffRange,
    /// Any other rate limit
    pub soft_rate_limit: BackoffRange,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            transient: BackoffRange::new(2.0, 5.0),
            hard_rate_limit: BackoffRange::new(30.0, 60.0),
            soft_rate_limit: BackoffRange::new(5.0, 15.0),
        }
    }
}

impl RetryPolicy {
    /// Same attempts, no waiting between them.
    pub fn immediate(max_attempts: u32) -> Self {
        let none = BackoffRange::new(0.0, 0.0);
        Self {
            max_attempts,
            transient: none,
            hard_rate_limit: none,
            soft_rate_limit: none,
        }
    }

    /// Backoff before retrying after `error`, or `None` if it is not retryable.
    pub fn backoff_for(&self, error: &CompletionError) -> Option<Duration> {
        match error {
            CompletionError::RateLimited { hard: true, .. } => Some(self.hard_rate_limit.sample()),
            CompletionError::RateLimited { hard: false, .. } => Some(self.soft_rate_limit.sample()),
            e if e.is_transient() => Some(self.transient.sample()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_windows_match_error_class() {
        let policy = RetryPolicy::default();

        let hard = policy
            .backoff_for(&CompletionError::RateLimited {
                hard: true,
                message: "tokens per min".into(),
            })
            .expect("retryable");
        assert!(hard >= Duration::from_secs(30) && hard <= Duration::from_secs(60));

        let soft = policy
            .backoff_for(&CompletionError::RateLimited {
                hard: false,
                message: "slow down".into(),
            })
            .expect("retryable");
        assert!(soft >= Duration::from_secs(5) && soft <= Duration::from_secs(15));

        let transient = policy
            .backoff_for(&CompletionError::Connection("reset".into()))
            .expect("retryable");
        assert!(transient >= Duration::from_secs(2) && transient <= Duration::from_secs(5));
    }

    #[test]
    fn invalid_requests_are_not_retried() {
        let policy = RetryPolicy::default();
        assert!(policy
            .backoff_for(&CompletionError::InvalidRequest {
                too_large: true,
                message: "maximum context length".into(),
            })
            .is_none());
    }

    #[test]
    fn immediate_policy_has_zero_backoff() {
        let policy = RetryPolicy::immediate(2);
        assert_eq!(
            policy.backoff_for(&CompletionError::Timeout(Duration::from_secs(1))),
            Some(Duration::ZERO)
        );
    }
}
