//! Bounded execution of completion calls.
//!
//! - [`provider`]: the abstract completion contract
//! - [`deadlines`]: single-call, all-calls and whole-service limits
//! - [`retry`]: attempt count and backoff windows per error class
//! - [`orchestrator`]: single and chunked dispatch

pub mod deadlines;
pub mod orchestrator;
pub mod provider;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use deadlines::{DeadlineClock, DeadlineError, Deadlines};
pub use orchestrator::{
    classify, ChunkOutcome, Incomplete, IncompleteOnTimeout, IncompleteReason, MetricsContext,
    Orchestrator, TimeoutHook, WorkItem, WorkState,
};
pub use provider::{
    Completion, CompletionError, CompletionMessage, CompletionParams, CompletionProvider,
    FinishReason, FunctionCall, Sampling,
};
pub use retry::{BackoffRange, RetryPolicy};
