//! Prompt assembly and bounded execution for LLM completion services.
//!
//! Renders a message sequence from templates, fits it into a model's token
//! budget, splits oversized input into chunks, runs the calls under a shared
//! rate limit with retries and deadlines, and merges the results.

pub mod budget;
pub mod chunking;
pub mod config;
pub mod error;
pub mod execute;
pub mod message;
pub mod optimize;
pub mod output;
pub mod processor;
pub mod reassembly;
pub mod render;
pub mod sinks;
pub mod throttle;

pub use budget::{
    BudgetError, BudgetPolicy, Encoding, ModelProfile, ModelProfileRegistry, TokenBudget,
    TokenCounter,
};
pub use chunking::{plan_chunks, ChunkError, ChunkRequest, ChunkSettings, ChunkSpec};
pub use config::EngineConfig;
pub use error::EngineError;
pub use execute::{
    Completion, CompletionError, CompletionParams, CompletionProvider, DeadlineClock, Deadlines,
    FinishReason, FunctionCall, Incomplete, IncompleteOnTimeout, IncompleteReason, Orchestrator,
    RetryPolicy, Sampling, TimeoutHook, WorkItem,
};
pub use message::{Message, Role};
pub use optimize::{optimize, OptimizeReport, OptimizerSettings};
pub use output::{FunctionSchema, ListKind, OutputFormat, OutputSpec, SchemaError};
pub use processor::{CallerData, ChunkableInput, PromptProcessor, PromptProcessorBuilder};
pub use reassembly::{reassemble, AggregateOutcome, AggregateOutput, ReassemblyError, Usage};
pub use render::{
    render_messages, DirectorySource, FormatArgs, ListItem, MemorySource, RenderError,
    TemplateEntry, TemplateKind, TemplateSet, TemplateSource, TemplateStore,
};
pub use sinks::{AccountRef, LogSink, MetricsSink, UsageSink};
pub use throttle::{Admission, Throttler};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
