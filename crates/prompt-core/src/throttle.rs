//! Shared token bucket for the concurrent calls of one request.
//!
//! Calls take their planned token usage from the bucket before dispatch and
//! return it when they finish. A call that cannot be covered waits for a
//! refill notification or for an estimate of how long the shortfall takes to
//! process, whichever comes first.

use rand::Rng;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::execute::deadlines::{DeadlineClock, Deadlines};

/// Default bucket capacity in tokens per minute.
pub const DEFAULT_TOKENS_PER_MINUTE: u32 = 40_000;

const INPUT_WEIGHT: f64 = 1.3;
const OUTPUT_WEIGHT: f64 = 0.7;
/// Weighted token thresholds and the processing seconds for each band; the
/// last time applies beyond the last threshold.
const TOKEN_BANDS: [f64; 4] = [500.0, 3_000.0, 5_000.0, 8_000.0];
const BAND_SECONDS: [f64; 5] = [25.0, 45.0, 90.0, 150.0, 180.0];
const JITTER: f64 = 0.05;

/// Outcome of asking the bucket for tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// The bucket covered the request and was debited by `tokens`
    Granted { tokens: u32 },
    /// Not enough tokens; retry after at most this long
    Wait(Duration),
    /// Run now without debiting; waiting would miss the all-calls deadline
    Bypass,
}

#[derive(Debug)]
struct Bucket {
    available: u32,
    capacity: u32,
}

#[derive(Debug)]
pub struct Throttler {
    bucket: Mutex<Bucket>,
    refilled: Notify,
    deadlines: Deadlines,
}

impl Throttler {
    pub fn new(tokens_per_minute: u32, deadlines: Deadlines) -> Self {
        let capacity = tokens_per_minute.max(1);
        Self {
            bucket: Mutex::new(Bucket {
                available: capacity,
                capacity,
            }),
            refilled: Notify::new(),
            deadlines,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.lock().capacity
    }

    pub fn available(&self) -> u32 {
        self.lock().available
    }

    /// Refill rate in tokens per second.
    pub fn tokens_per_second(&self) -> f64 {
        self.capacity() as f64 / 60.0
    }

    /// Try to take `tokens_needed` from the bucket.
    ///
    /// A request larger than the whole bucket is capped at the capacity.
    pub fn acquire(&self, tokens_needed: u32, elapsed: Duration, input_tokens: u32) -> Admission {
        let mut bucket = self.lock();

        if elapsed > self.deadlines.bypass_after() {
            tracing::warn!(
                "Throttler: {} tokens needed, {} available, all-calls deadline too close, bypassing",
                tokens_needed,
                bucket.available
            );
            return Admission::Bypass;
        }

        let needed = tokens_needed.min(bucket.capacity);
        if bucket.available >= needed {
            bucket.available -= needed;
            tracing::debug!(
                "Throttler: granted {} tokens, {} left",
                needed,
                bucket.available
            );
            return Admission::Granted { tokens: needed };
        }

        let short = needed - bucket.available;
        let wait = jittered_estimate(short, input_tokens.min(short));
        tracing::debug!(
            "Throttler: {} tokens short, waiting up to {:.1}s",
            short,
            wait.as_secs_f64()
        );
        Admission::Wait(wait)
    }

    /// Return tokens to the bucket (clamped to capacity) and wake waiters.
    pub fn refill(&self, tokens: u32) {
        {
            let mut bucket = self.lock();
            bucket.available = bucket.available.saturating_add(tokens).min(bucket.capacity);
            tracing::debug!(
                "Throttler: refilled {} tokens, {} available",
                tokens,
                bucket.available
            );
        }
        self.refilled.notify_waiters();
    }

    /// Wait until a refill happens or `limit` elapses.
    pub async fn wait_for_refill(&self, limit: Duration) {
        let _ = tokio::time::timeout(limit, self.refilled.notified()).await;
    }

    /// Loop on `acquire` until the call is granted or bypasses the bucket.
    ///
    /// No single wait runs past the bypass point, so a starved call is
    /// released there rather than after its full processing estimate.
    pub async fn admit(&self, tokens_needed: u32, input_tokens: u32, clock: &DeadlineClock) -> Admission {
        loop {
            match self.acquire(tokens_needed, clock.elapsed(), input_tokens) {
                Admission::Wait(limit) => {
                    let until_bypass = self.deadlines.bypass_after().saturating_sub(clock.elapsed());
                    if until_bypass.is_zero() {
                        tracing::warn!(
                            "Throttler: {} tokens still short at the bypass point, bypassing",
                            tokens_needed
                        );
                        return Admission::Bypass;
                    }
                    self.wait_for_refill(limit.min(until_bypass)).await
                }
                admitted => return admitted,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Seconds needed to process `tokens`, weighting input above output.
pub fn processing_estimate(tokens: u32, input_tokens: u32) -> Duration {
    let input = input_tokens.min(tokens) as f64;
    let output = tokens.saturating_sub(input_tokens) as f64;
    let weighted = (input * INPUT_WEIGHT + output * OUTPUT_WEIGHT).floor();

    let seconds = TOKEN_BANDS
        .iter()
        .zip(BAND_SECONDS.iter())
        .find(|(limit, _)| weighted <= **limit)
        .map(|(limit, seconds)| weighted / limit * seconds)
        .unwrap_or(BAND_SECONDS[BAND_SECONDS.len() - 1]);

    Duration::from_secs_f64(seconds)
}

fn jittered_estimate(tokens: u32, input_tokens: u32) -> Duration {
    let factor = rand::thread_rng().gen_range((1.0 - JITTER)..=(1.0 + JITTER));
    processing_estimate(tokens, input_tokens).mul_f64(factor)
}
