//! Runs completion calls under the retry policy and deadline hierarchy.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::execute::deadlines::DeadlineClock;
use crate::execute::provider::{
    Completion, CompletionError, CompletionParams, CompletionProvider, FinishReason,
};
use crate::execute::retry::RetryPolicy;
use crate::message::Message;
use crate::sinks::{metric, AccountRef, MetricsSink};
use crate::throttle::{Admission, Throttler};

/// Lifecycle of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Pending,
    Running,
    Succeeded,
    RetryableFailure,
    FatalFailure,
}

/// Why a completion cannot be used as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteReason {
    Length,
    ContentFilter,
    MissingFinishReason,
    TimedOut,
    Failed(String),
    Other(String),
}

/// A call that ended without a usable completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incomplete {
    pub reason: IncompleteReason,
    /// Whatever the model returned before stopping
    pub partial: Option<Completion>,
    /// Input plus output tokens the call was planned to use
    pub planned_tokens: u32,
}

/// Per-call result consumed by reassembly.
pub type ChunkOutcome = Result<Completion, Incomplete>;

/// One call to make.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub index: usize,
    pub messages: Vec<Message>,
    pub params: CompletionParams,
    pub input_tokens: u32,
}

impl WorkItem {
    pub fn planned_tokens(&self) -> u32 {
        self.input_tokens
            .saturating_add(self.params.max_tokens.unwrap_or(0))
    }
}

/// Turns a terminal timeout into a synthetic incomplete result.
pub trait TimeoutHook: Send + Sync {
    fn on_timeout(&self, item: &WorkItem, error: &CompletionError) -> Option<Incomplete>;
}

/// Reports every terminal timeout as an incomplete chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncompleteOnTimeout;

impl TimeoutHook for IncompleteOnTimeout {
    fn on_timeout(&self, item: &WorkItem, _error: &CompletionError) -> Option<Incomplete> {
        Some(Incomplete {
            reason: IncompleteReason::TimedOut,
            partial: None,
            planned_tokens: item.planned_tokens(),
        })
    }
}

/// Where rate-limit signals are recorded.
#[derive(Clone)]
pub struct MetricsContext {
    pub sink: Arc<dyn MetricsSink>,
    pub account: AccountRef,
    pub correlation_id: String,
}

pub struct Orchestrator {
    provider: Arc<dyn CompletionProvider>,
    retry: RetryPolicy,
    max_workers: usize,
    timeout_hook: Option<Arc<dyn TimeoutHook>>,
    metrics: Option<MetricsContext>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            max_workers: 4,
            timeout_hook: None,
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn with_timeout_hook(mut self, hook: Arc<dyn TimeoutHook>) -> Self {
        self.timeout_hook = Some(hook);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// One direct call, no throttling.
    pub async fn run_single(
        &self,
        item: WorkItem,
        clock: &DeadlineClock,
    ) -> Result<ChunkOutcome, CompletionError> {
        self.execute_item(&item, clock, None).await
    }

    /// Run all items concurrently through `throttler`, returning outcomes in
    /// index order.
    ///
    /// A non-retryable error fails the whole run. Items that exhaust their
    /// retries become incomplete, unless every item failed, in which case the
    /// first error is returned.
    pub async fn run_chunked(
        &self,
        items: Vec<WorkItem>,
        throttler: &Throttler,
        clock: &DeadlineClock,
    ) -> Result<Vec<ChunkOutcome>, CompletionError> {
        let total = items.len();
        tracing::info!(
            "Dispatching {} chunks with up to {} workers",
            total,
            self.max_workers
        );

        let mut results: Vec<(usize, u32, Result<ChunkOutcome, CompletionError>)> =
            stream::iter(items.iter())
                .map(|item| async move {
                    let result = self.execute_item(item, clock, Some(throttler)).await;
                    (item.index, item.planned_tokens(), result)
                })
                .buffer_unordered(self.max_workers)
                .collect()
                .await;
        results.sort_by_key(|(index, ..)| *index);

        if let Some(fatal) = results.iter().find_map(|(_, _, r)| match r {
            Err(e) if !e.is_transient() => Some(e.clone()),
            _ => None,
        }) {
            return Err(fatal);
        }

        let failed = results.iter().filter(|(_, _, r)| r.is_err()).count();
        if failed == total && total > 0 {
            if let Some((_, _, Err(first))) = results.into_iter().next() {
                return Err(first);
            }
            return Ok(Vec::new());
        }

        Ok(results
            .into_iter()
            .map(|(_, planned_tokens, result)| match result {
                Ok(outcome) => outcome,
                Err(error) => Err(Incomplete {
                    reason: IncompleteReason::Failed(error.to_string()),
                    partial: None,
                    planned_tokens,
                }),
            })
            .collect())
    }

    async fn execute_item(
        &self,
        item: &WorkItem,
        clock: &DeadlineClock,
        throttler: Option<&Throttler>,
    ) -> Result<ChunkOutcome, CompletionError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        log_state(item, WorkState::Pending, attempt);

        loop {
            attempt += 1;

            let granted = match throttler {
                Some(throttler) => {
                    match throttler
                        .admit(item.planned_tokens(), item.input_tokens, clock)
                        .await
                    {
                        Admission::Granted { tokens } => tokens,
                        _ => 0,
                    }
                }
                None => 0,
            };

            // measured after admission, the bucket wait counts against the deadlines
            let Some(timeout) = clock.attempt_timeout() else {
                if let Some(throttler) = throttler.filter(|_| granted > 0) {
                    throttler.refill(granted);
                }
                return self.terminal(item, CompletionError::Timeout(Duration::ZERO));
            };

            log_state(item, WorkState::Running, attempt);
            let result = match tokio::time::timeout(
                timeout,
                self.provider.complete(&item.messages, &item.params, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CompletionError::Timeout(timeout)),
            };

            if let Some(throttler) = throttler.filter(|_| granted > 0) {
                throttler.refill(granted);
            }

            let error = match result {
                Ok(completion) => {
                    log_state(item, WorkState::Succeeded, attempt);
                    return Ok(classify(completion, item.planned_tokens()));
                }
                Err(error) => error,
            };

            if let CompletionError::RateLimited { hard, .. } = &error {
                self.record_rate_limit(*hard).await;
            }

            let backoff = match self.retry.backoff_for(&error) {
                Some(backoff) if attempt < max_attempts && clock.can_retry_after(backoff) => backoff,
                _ => return self.terminal(item, error),
            };

            log_state(item, WorkState::RetryableFailure, attempt);
            tracing::warn!(
                "Chunk {} attempt {}/{} failed: {}; retrying in {:.1}s",
                item.index,
                attempt,
                max_attempts,
                error,
                backoff.as_secs_f64()
            );
            tokio::time::sleep(backoff).await;
        }
    }

    fn terminal(
        &self,
        item: &WorkItem,
        error: CompletionError,
    ) -> Result<ChunkOutcome, CompletionError> {
        log_state(item, WorkState::FatalFailure, 0);
        if let (CompletionError::Timeout(_), Some(hook)) = (&error, &self.timeout_hook) {
            if let Some(incomplete) = hook.on_timeout(item, &error) {
                tracing::warn!("Chunk {} timed out, reporting as incomplete", item.index);
                return Ok(Err(incomplete));
            }
        }
        tracing::error!("Chunk {} failed: {}", item.index, error);
        Err(error)
    }

    async fn record_rate_limit(&self, hard: bool) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let name = if hard {
            metric::RATE_LIMITED_HARD
        } else {
            metric::RATE_LIMITED
        };
        if let Err(e) = metrics
            .sink
            .record_metric(&metrics.account, &metrics.correlation_id, name, 1.0, "Count")
            .await
        {
            tracing::warn!("Failed to record rate-limit metric: {}", e);
        }
    }
}

fn log_state(item: &WorkItem, state: WorkState, attempt: u32) {
    tracing::debug!(chunk = item.index, attempt, state = ?state, "work item");
}

/// Complete iff the model stopped on its own or called the function.
pub fn classify(completion: Completion, planned_tokens: u32) -> ChunkOutcome {
    let reason = match &completion.finish_reason {
        FinishReason::Stop | FinishReason::FunctionCall => None,
        FinishReason::Length => Some(IncompleteReason::Length),
        FinishReason::ContentFilter => Some(IncompleteReason::ContentFilter),
        FinishReason::Missing => Some(IncompleteReason::MissingFinishReason),
        FinishReason::Other(other) => Some(IncompleteReason::Other(other.clone())),
    };
    match reason {
        None => Ok(completion),
        Some(reason) => Err(Incomplete {
            reason,
            partial: Some(completion),
            planned_tokens,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::deadlines::Deadlines;
    use crate::execute::retry::BackoffRange;
    use crate::execute::testing::ScriptedProvider;

    fn item(index: usize) -> WorkItem {
        WorkItem {
            index,
            messages: vec![Message::user(format!("part {}", index))],
            params: CompletionParams::new("gpt-4").with_max_tokens(100),
            input_tokens: 50,
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(CompletionError::Connection("reset".into())),
            Err(CompletionError::ServiceUnavailable("503".into())),
            Ok(Completion::text("done", FinishReason::Stop)),
        ]));
        let orchestrator =
            Orchestrator::new(provider.clone()).with_retry(RetryPolicy::immediate(3));
        let clock = DeadlineClock::start(Deadlines::default());

        let outcome = orchestrator.run_single(item(0), &clock).await.expect("ok");
        assert_eq!(outcome.expect("complete").payload(), "done");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let provider = Arc::new(ScriptedProvider::repeating(Err(CompletionError::Connection(
            "refused".into(),
        ))));
        let orchestrator =
            Orchestrator::new(provider.clone()).with_retry(RetryPolicy::immediate(3));
        let clock = DeadlineClock::start(Deadlines::default());

        let err = orchestrator.run_single(item(0), &clock).await.unwrap_err();
        assert!(matches!(err, CompletionError::Connection(_)));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn invalid_request_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::repeating(Err(
            CompletionError::InvalidRequest {
                too_large: true,
                message: "maximum context length".into(),
            },
        )));
        let orchestrator =
            Orchestrator::new(provider.clone()).with_retry(RetryPolicy::immediate(3));
        let clock = DeadlineClock::start(Deadlines::default());

        assert!(orchestrator.run_single(item(0), &clock).await.is_err());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn timeout_hook_turns_timeout_into_incomplete() {
        let provider = Arc::new(ScriptedProvider::repeating(Err(CompletionError::Timeout(
            Duration::from_secs(1),
        ))));
        let orchestrator = Orchestrator::new(provider)
            .with_retry(RetryPolicy::immediate(2))
            .with_timeout_hook(Arc::new(IncompleteOnTimeout));
        let clock = DeadlineClock::start(Deadlines::default());

        let outcome = orchestrator.run_single(item(0), &clock).await.expect("hooked");
        let incomplete = outcome.unwrap_err();
        assert_eq!(incomplete.reason, IncompleteReason::TimedOut);
        assert_eq!(incomplete.planned_tokens, 150);
    }

    #[tokio::test]
    async fn length_finish_is_incomplete() {
        let provider = Arc::new(ScriptedProvider::repeating(Ok(Completion::text(
            "partial",
            FinishReason::Length,
        ))));
        let orchestrator = Orchestrator::new(provider);
        let clock = DeadlineClock::start(Deadlines::default());

        let outcome = orchestrator.run_single(item(0), &clock).await.expect("ok");
        let incomplete = outcome.unwrap_err();
        assert_eq!(incomplete.reason, IncompleteReason::Length);
        assert!(incomplete.partial.is_some());
    }

    #[tokio::test]
    async fn chunked_results_come_back_in_index_order() {
        let provider = Arc::new(ScriptedProvider::echo());
        let orchestrator = Orchestrator::new(provider).with_max_workers(3);
        let throttler = Throttler::new(100_000, Deadlines::default());
        let clock = DeadlineClock::start(Deadlines::default());

        let outcomes = orchestrator
            .run_chunked((0..6).map(item).collect(), &throttler, &clock)
            .await
            .expect("ok");

        let texts: Vec<_> = outcomes
            .iter()
            .map(|o| o.as_ref().expect("complete").payload().to_string())
            .collect();
        assert_eq!(
            texts,
            (0..6).map(|i| format!("part {}", i)).collect::<Vec<_>>()
        );
        // every granted token came back
        assert_eq!(throttler.available(), 100_000);
    }

    #[tokio::test]
    async fn chunked_failure_of_one_item_is_incomplete() {
        let provider = Arc::new(ScriptedProvider::echo_failing_on("part 1"));
        let orchestrator = Orchestrator::new(provider).with_retry(RetryPolicy::immediate(2));
        let throttler = Throttler::new(100_000, Deadlines::default());
        let clock = DeadlineClock::start(Deadlines::default());

        let outcomes = orchestrator
            .run_chunked((0..3).map(item).collect(), &throttler, &clock)
            .await
            .expect("partial success");

        assert!(outcomes[0].is_ok());
        assert!(matches!(
            outcomes[1],
            Err(Incomplete {
                reason: IncompleteReason::Failed(_),
                ..
            })
        ));
        assert!(outcomes[2].is_ok());
    }

    fn tight_deadlines() -> Deadlines {
        Deadlines::new(
            Duration::from_secs(60),
            Duration::from_secs(100),
            Duration::from_secs(120),
        )
        .expect("valid")
    }

    fn sized_item(index: usize, input_tokens: u32, max_tokens: u32) -> WorkItem {
        WorkItem {
            index,
            messages: vec![Message::user(format!("part {}", index))],
            params: CompletionParams::new("gpt-4").with_max_tokens(max_tokens),
            input_tokens,
        }
    }

    fn fixed_backoff(max_attempts: u32, secs: f64) -> RetryPolicy {
        let backoff = BackoffRange::new(secs, secs);
        RetryPolicy {
            max_attempts,
            transient: backoff,
            hard_rate_limit: backoff,
            soft_rate_limit: backoff,
        }
    }

    #[derive(Default)]
    struct RecordingMetrics {
        names: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl MetricsSink for RecordingMetrics {
        async fn record_metric(
            &self,
            _account: &AccountRef,
            _correlation_id: &str,
            name: &str,
            _value: f64,
            _unit: &str,
        ) -> anyhow::Result<()> {
            self.names.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_call_stays_inside_all_calls_deadline() {
        let provider = Arc::new(ScriptedProvider::hanging());
        let orchestrator = Orchestrator::new(provider.clone()).with_retry(RetryPolicy::immediate(1));
        let throttler = Throttler::new(10_000, tight_deadlines());
        throttler.acquire(10_000, Duration::ZERO, 0);
        let clock = DeadlineClock::start(tight_deadlines());

        let err = orchestrator
            .run_chunked(vec![sized_item(0, 5_000, 5_000)], &throttler, &clock)
            .await
            .unwrap_err();

        assert!(matches!(err, CompletionError::Timeout(_)));
        assert_eq!(provider.calls(), 1);
        // released at the bypass point (40s), then bounded by all_calls
        assert!(clock.elapsed() <= Duration::from_secs(100), "{:?}", clock.elapsed());
        assert!(clock.elapsed() < tight_deadlines().whole_service());
    }

    #[tokio::test(start_paused = true)]
    async fn no_attempt_starts_after_all_calls_deadline() {
        let provider = Arc::new(ScriptedProvider::repeating(Err(CompletionError::Connection(
            "reset".into(),
        ))));
        let deadlines = Deadlines::new(
            Duration::from_secs(2),
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
        .expect("valid");
        let orchestrator = Orchestrator::new(provider.clone())
            .with_retry(fixed_backoff(10, 5.0))
            .with_timeout_hook(Arc::new(IncompleteOnTimeout));
        let clock = DeadlineClock::start(deadlines);

        // attempts at 0s and 5s; at 10s nothing is left of all_calls
        let outcome = orchestrator.run_single(item(0), &clock).await.expect("hooked");
        assert_eq!(outcome.unwrap_err().reason, IncompleteReason::TimedOut);
        assert_eq!(provider.calls(), 2);
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_before_whole_service_deadline() {
        let provider = Arc::new(ScriptedProvider::repeating(Err(CompletionError::Connection(
            "reset".into(),
        ))));
        let deadlines = Deadlines::new(
            Duration::from_secs(2),
            Duration::from_secs(20),
            Duration::from_secs(20),
        )
        .expect("valid");
        let orchestrator = Orchestrator::new(provider.clone()).with_retry(fixed_backoff(10, 5.0));
        let clock = DeadlineClock::start(deadlines);

        // attempts at 0, 5, 10 and 15s; another 5s backoff would reach 20s
        let err = orchestrator.run_single(item(0), &clock).await.unwrap_err();
        assert!(matches!(err, CompletionError::Connection(_)));
        assert_eq!(provider.calls(), 4);
        assert_eq!(clock.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_chunk_runs_when_another_returns_its_tokens() {
        let provider = Arc::new(ScriptedProvider::echo().with_delay(Duration::from_secs(5)));
        let orchestrator = Orchestrator::new(provider.clone()).with_max_workers(2);
        let throttler = Throttler::new(1_000, Deadlines::default());
        let clock = DeadlineClock::start(Deadlines::default());

        let outcomes = orchestrator
            .run_chunked(
                vec![sized_item(0, 400, 400), sized_item(1, 400, 400)],
                &throttler,
                &clock,
            )
            .await
            .expect("ok");

        assert!(outcomes.iter().all(|o| o.is_ok()));
        // chunk 1 is admitted by the refill at 5s, well before its ~10s estimate
        assert_eq!(clock.elapsed(), Duration::from_secs(10));
        assert_eq!(throttler.available(), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn starved_chunk_bypasses_the_bucket_at_the_bypass_point() {
        let orchestrator = Orchestrator::new(Arc::new(ScriptedProvider::echo()));
        let throttler = Throttler::new(1_000, tight_deadlines());
        throttler.acquire(1_000, Duration::ZERO, 0);
        let clock = DeadlineClock::start(tight_deadlines());

        let outcomes = orchestrator
            .run_chunked(vec![sized_item(0, 400, 400)], &throttler, &clock)
            .await
            .expect("ok");

        assert!(outcomes[0].is_ok());
        let bypass_after = tight_deadlines().bypass_after();
        assert!(clock.elapsed() >= bypass_after, "{:?}", clock.elapsed());
        assert!(clock.elapsed() < bypass_after + Duration::from_secs(1));
        // a bypassed call neither takes nor returns tokens
        assert_eq!(throttler.available(), 0);
    }

    #[tokio::test]
    async fn rate_limits_are_recorded_as_metrics() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Err(CompletionError::RateLimited {
                hard: false,
                message: "slow down".into(),
            }),
            Err(CompletionError::RateLimited {
                hard: true,
                message: "tokens per min".into(),
            }),
            Ok(Completion::text("done", FinishReason::Stop)),
        ]));
        let sink = Arc::new(RecordingMetrics::default());
        let orchestrator = Orchestrator::new(provider)
            .with_retry(RetryPolicy::immediate(3))
            .with_metrics(MetricsContext {
                sink: sink.clone(),
                account: AccountRef::new("acct"),
                correlation_id: "c0ffee".into(),
            });
        let clock = DeadlineClock::start(Deadlines::default());

        let outcome = orchestrator.run_single(item(0), &clock).await.expect("ok");
        assert!(outcome.is_ok());
        assert_eq!(
            *sink.names.lock().unwrap(),
            vec![metric::RATE_LIMITED, metric::RATE_LIMITED_HARD]
        );
    }
}
