//! Deadline hierarchy for one request.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Nested time limits: one call, all calls of a request, the whole service
/// invocation. Must satisfy `single_call <= all_calls <= whole_service`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Deadlines {
    pub single_call_secs: u64,
    pub all_calls_secs: u64,
    pub whole_service_secs: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            single_call_secs: 6 * 60,
            all_calls_secs: 12 * 60,
            whole_service_secs: 13 * 60 + 30,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Deadlines must satisfy 0 < single_call ({single}s) <= all_calls ({all}s) <= whole_service ({whole}s)")]
pub struct DeadlineError {
    pub single: u64,
    pub all: u64,
    pub whole: u64,
}

impl Deadlines {
    pub fn new(single_call: Duration, all_calls: Duration, whole_service: Duration) -> Result<Self, DeadlineError> {
        let deadlines = Self {
            single_call_secs: single_call.as_secs(),
            all_calls_secs: all_calls.as_secs(),
            whole_service_secs: whole_service.as_secs(),
        };
        deadlines.validate()?;
        Ok(deadlines)
    }

    pub fn validate(&self) -> Result<(), DeadlineError> {
        let ok = self.single_call_secs > 0
            && self.single_call_secs <= self.all_calls_secs
            && self.all_calls_secs <= self.whole_service_secs;
        if ok {
            Ok(())
        } else {
            Err(DeadlineError {
                single: self.single_call_secs,
                all: self.all_calls_secs,
                whole: self.whole_service_secs,
            })
        }
    }

    pub fn single_call(&self) -> Duration {
        Duration::from_secs(self.single_call_secs)
    }

    pub fn all_calls(&self) -> Duration {
        Duration::from_secs(self.all_calls_secs)
    }

    pub fn whole_service(&self) -> Duration {
        Duration::from_secs(self.whole_service_secs)
    }

    /// Once this much time has passed, waiting for the bucket could push a
    /// call past the all-calls deadline.
    pub fn bypass_after(&self) -> Duration {
        self.all_calls().saturating_sub(self.single_call())
    }
}

/// Clock started when a request begins dispatching calls.
#[derive(Debug, Clone, Copy)]
pub struct DeadlineClock {
    started: Instant,
    deadlines: Deadlines,
}

impl DeadlineClock {
    pub fn start(deadlines: Deadlines) -> Self {
        Self {
            started: Instant::now(),
            deadlines,
        }
    }

    pub fn deadlines(&self) -> &Deadlines {
        &self.deadlines
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Timeout for the next attempt, or `None` once the all-calls deadline passed.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        let remaining = self.deadlines.all_calls().checked_sub(self.elapsed())?;
        let timeout = remaining.min(self.deadlines.single_call());
        (!timeout.is_zero()).then_some(timeout)
    }

    /// Whether a retry after `backoff` still finishes inside the service deadline.
    pub fn can_retry_after(&self, backoff: Duration) -> bool {
        self.elapsed() + backoff < self.deadlines.whole_service()
    }

    /// Whether the throttler should be skipped for new work.
    pub fn past_bypass_point(&self) -> bool {
        self.elapsed() > self.deadlines.bypass_after()
    }
}
