//! The `process` entry point for one feature.
//!
//! # Key Components
//!
//! - [`PromptProcessor`]: owns a feature's templates, output spec and
//!   chunkable field, and runs requests end to end
//! - [`PromptProcessorBuilder`]: validated construction
//! - [`CallerData`]: per-request caller values

pub mod caller;

use std::sync::Arc;

use crate::budget::{BudgetError, ModelProfileRegistry, TokenBudget, TokenCounter};
use crate::chunking::{plan_chunks, ChunkRequest};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::execute::{
    CompletionParams, CompletionProvider, DeadlineClock, MetricsContext, Orchestrator,
    TimeoutHook, WorkItem,
};
use crate::message::{Message, Role};
use crate::optimize::optimize;
use crate::output::OutputSpec;
use crate::reassembly::{reassemble, AggregateOutcome, Truncation};
use crate::render::{render_messages, FormatArgs, TemplateStore};
use crate::sinks::{metric, AccountRef, LogSink, MetricsSink, UsageSink};
use crate::throttle::Throttler;

pub use caller::{tag, CallerData, CONTROL_KEYS};

/// Model used when the caller names none.
pub const DEFAULT_MODEL: &str = "gpt-4";

/// The one input field that may be split across calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkableInput {
    /// Tag (and caller field) carrying the input
    pub field: String,
    /// Split only on line boundaries
    pub list_shaped: bool,
}

impl ChunkableInput {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            list_shaped: false,
        }
    }

    pub fn list_shaped(mut self) -> Self {
        self.list_shaped = true;
        self
    }
}

pub struct PromptProcessorBuilder {
    name: String,
    templates: TemplateStore,
    provider: Arc<dyn CompletionProvider>,
    config: EngineConfig,
    profiles: Arc<ModelProfileRegistry>,
    output: OutputSpec,
    chunkable: Option<ChunkableInput>,
    default_model: String,
    usage: Arc<dyn UsageSink>,
    metrics: Arc<dyn MetricsSink>,
    timeout_hook: Option<Arc<dyn TimeoutHook>>,
}

impl PromptProcessorBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn profiles(mut self, profiles: Arc<ModelProfileRegistry>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn output(mut self, output: OutputSpec) -> Self {
        self.output = output;
        self
    }

    pub fn chunkable(mut self, chunkable: ChunkableInput) -> Self {
        self.chunkable = Some(chunkable);
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    pub fn metrics_sink(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn timeout_hook(mut self, hook: Arc<dyn TimeoutHook>) -> Self {
        self.timeout_hook = Some(hook);
        self
    }

    /// Validate the feature setup.
    pub fn build(self) -> Result<PromptProcessor> {
        self.config.validate()?;
        self.output.validate()?;

        if let Some(chunkable) = &self.chunkable {
            if !self.templates.snapshot().main().references(&chunkable.field) {
                return Err(EngineError::Configuration(format!(
                    "Main template of '{}' does not reference chunkable field '{}'",
                    self.name, chunkable.field
                )));
            }
        }

        Ok(PromptProcessor {
            name: self.name,
            templates: self.templates,
            provider: self.provider,
            config: self.config,
            profiles: self.profiles,
            output: self.output,
            chunkable: self.chunkable,
            default_model: self.default_model,
            usage: self.usage,
            metrics: self.metrics,
            timeout_hook: self.timeout_hook,
        })
    }
}

/// Runs requests for one feature.
pub struct PromptProcessor {
    name: String,
    templates: TemplateStore,
    provider: Arc<dyn CompletionProvider>,
    config: EngineConfig,
    profiles: Arc<ModelProfileRegistry>,
    output: OutputSpec,
    chunkable: Option<ChunkableInput>,
    default_model: String,
    usage: Arc<dyn UsageSink>,
    metrics: Arc<dyn MetricsSink>,
    timeout_hook: Option<Arc<dyn TimeoutHook>>,
}

/// What was sent, for reporting.
struct Dispatch {
    outcome: AggregateOutcome,
    prompts: Vec<String>,
}

impl PromptProcessor {
    pub fn builder(
        name: impl Into<String>,
        templates: TemplateStore,
        provider: Arc<dyn CompletionProvider>,
    ) -> PromptProcessorBuilder {
        PromptProcessorBuilder {
            name: name.into(),
            templates,
            provider,
            config: EngineConfig::default(),
            profiles: Arc::new(ModelProfileRegistry::new()),
            output: OutputSpec::default(),
            chunkable: None,
            default_model: DEFAULT_MODEL.to_string(),
            usage: Arc::new(LogSink),
            metrics: Arc::new(LogSink),
            timeout_hook: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Run one request and report its usage.
    pub async fn process(
        &self,
        data: &CallerData,
        account: &AccountRef,
        args: FormatArgs,
    ) -> Result<AggregateOutcome> {
        let clock = DeadlineClock::start(self.config.deadlines);
        let correlation_id = format!("{:016x}", rand::random::<u64>());
        tracing::info!(
            feature = %self.name,
            account = %account.id,
            correlation_id = %correlation_id,
            "Processing request"
        );

        if let Err(e) = self.templates.refresh_if_changed().await {
            tracing::warn!("Template refresh failed, keeping current set: {}", e);
        }

        let output = match data.output_format {
            Some(format) => format.apply_to(&self.output),
            None => self.output.clone(),
        };
        let dispatch = self
            .dispatch(data, account, args, &output, &clock, &correlation_id)
            .await?;

        self.report(data, account, &correlation_id, &dispatch).await;
        tracing::info!(
            correlation_id = %correlation_id,
            chunked = dispatch.outcome.chunked,
            incompletions = dispatch.outcome.incompletions,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "Request complete"
        );
        Ok(dispatch.outcome)
    }

    async fn dispatch(
        &self,
        data: &CallerData,
        account: &AccountRef,
        args: FormatArgs,
        output: &OutputSpec,
        clock: &DeadlineClock,
        correlation_id: &str,
    ) -> Result<Dispatch> {
        let templates = self.templates.snapshot();
        let model = data.model.as_deref().unwrap_or(&self.default_model);
        let profile = self.profiles.get_or_default(model);
        let counter = TokenCounter::for_encoding(profile.encoding)?
            .with_safety_margin(self.config.token_safety_margin);

        let mut budget = TokenBudget::new(&profile, &self.config.budget);
        if let Some(schema) = output.function() {
            budget.reserve_function_schema(counter.count(&schema.to_prompt_text()))?;
        }
        tracing::debug!(
            "Budget for {}: total {}, input {}, system {}, schema {}",
            profile.name,
            budget.total_max,
            budget.input_buffer,
            budget.system_buffer,
            budget.function_schema_tokens
        );

        let args = self.build_args(data, args, output)?;
        let mut params = CompletionParams::new(model);
        params.sampling = data.sampling();
        params.function = output.function().cloned();

        let rendered = render_messages(&templates, &args)?;
        let optimized = optimize(rendered, &budget, &counter, &self.config.optimizer);
        let input_tokens = counter
            .count_messages(&optimized.messages)
            .saturating_add(budget.function_schema_tokens);
        let requested = data.requested_max_tokens();

        let orchestrator = self.orchestrator(account, correlation_id);

        let chunkable = match &self.chunkable {
            Some(chunkable) if !budget.fits_input(input_tokens) => chunkable,
            _ => {
                let limit = budget
                    .total_max
                    .saturating_sub(self.config.budget.min_output_tokens);
                if input_tokens > limit {
                    return Err(BudgetError::InputTooLarge {
                        tokens: input_tokens,
                        limit,
                    }
                    .into());
                }

                let truncation = Truncation {
                    truncated: optimized.report.truncated(),
                    discarded_tokens: optimized.report.discarded_tokens(),
                };
                let prompts = main_prompt(&optimized.messages).into_iter().collect();
                let item = WorkItem {
                    index: 0,
                    params: params.with_max_tokens(budget.output_buffer(input_tokens, requested)),
                    messages: optimized.messages,
                    input_tokens,
                };
                tracing::debug!(
                    "Single call: {} input tokens, {} output tokens",
                    input_tokens,
                    item.params.max_tokens.unwrap_or(0)
                );

                let outcome = orchestrator.run_single(item, clock).await?;
                let outcome = reassemble(vec![outcome], output, truncation, false)?;
                return Ok(Dispatch { outcome, prompts });
            }
        };

        let input = args.text(&chunkable.field).unwrap_or_default().to_string();
        tracing::info!(
            "Input of {} tokens exceeds the {} token buffer, chunking '{}'",
            input_tokens,
            budget.input_buffer,
            chunkable.field
        );
        let chunks = plan_chunks(ChunkRequest {
            templates: &templates,
            args: &args,
            field: &chunkable.field,
            input: &input,
            list_shaped: chunkable.list_shaped,
            budget: &budget,
            counter: &counter,
            optimizer: &self.config.optimizer,
            settings: &self.config.chunking,
        })?;

        let truncation = chunks.iter().fold(Truncation::default(), |acc, chunk| Truncation {
            truncated: acc.truncated || chunk.optimize_report.truncated(),
            discarded_tokens: acc
                .discarded_tokens
                .max(chunk.optimize_report.discarded_tokens()),
        });
        let prompts = chunks
            .iter()
            .filter_map(|chunk| main_prompt(&chunk.messages))
            .collect();
        let items = chunks
            .into_iter()
            .map(|chunk| {
                let max_tokens = requested.map_or(chunk.output_cap, |r| r.min(chunk.output_cap));
                WorkItem {
                    index: chunk.index,
                    messages: chunk.messages,
                    params: params.clone().with_max_tokens(max_tokens),
                    input_tokens: chunk.input_tokens,
                }
            })
            .collect();

        let throttler = Throttler::new(
            self.config.throttle.tokens_per_minute,
            self.config.deadlines,
        );
        let outcomes = orchestrator.run_chunked(items, &throttler, clock).await?;
        let outcome = reassemble(outcomes, output, truncation, true)?;
        Ok(Dispatch { outcome, prompts })
    }

    /// Caller args plus feature fields and typed context blocks. Explicit
    /// args win over caller data.
    fn build_args(
        &self,
        data: &CallerData,
        mut args: FormatArgs,
        output: &OutputSpec,
    ) -> Result<FormatArgs> {
        for key in data.extra.keys() {
            if !args.contains(key) {
                if let Some(value) = data.field(key) {
                    args.set_text(key.clone(), value);
                }
            }
        }

        let blocks = [
            (tag::GUIDELINES, &data.guidelines),
            (tag::PROJECT_SUMMARY, &data.project_summary),
            (tag::HISTORY, &data.history),
            (tag::RELATED, &data.related),
            (tag::USER_FOCUS, &data.user_focus),
        ];
        for (tag, value) in blocks {
            if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
                if !args.contains(tag) {
                    args.set_text(tag, value);
                }
            }
        }

        if !data.training.is_empty() && !args.contains(tag::TRAINING) {
            args.set_expansion(tag::TRAINING, Role::User, data.training.clone());
        }
        if !args.contains(tag::OUTPUT_FORMAT) {
            args.set_text(tag::OUTPUT_FORMAT, output.format_instruction());
        }

        if let Some(chunkable) = &self.chunkable {
            let present = args
                .text(&chunkable.field)
                .is_some_and(|text| !text.trim().is_empty());
            if !present {
                return Err(EngineError::CallerInput(format!(
                    "Missing required field '{}'",
                    chunkable.field
                )));
            }
        }

        Ok(args)
    }

    fn orchestrator(&self, account: &AccountRef, correlation_id: &str) -> Orchestrator {
        let mut orchestrator = Orchestrator::new(self.provider.clone())
            .with_retry(self.config.retry.clone())
            .with_max_workers(self.config.max_workers)
            .with_metrics(MetricsContext {
                sink: self.metrics.clone(),
                account: account.clone(),
                correlation_id: correlation_id.to_string(),
            });
        if let Some(hook) = &self.timeout_hook {
            orchestrator = orchestrator.with_timeout_hook(hook.clone());
        }
        orchestrator
    }

    /// Bill and record metrics; failures here never fail the request.
    async fn report(
        &self,
        data: &CallerData,
        account: &AccountRef,
        correlation_id: &str,
        dispatch: &Dispatch,
    ) {
        let prompt_bytes: usize = dispatch.prompts.iter().map(String::len).sum();
        let billed_bytes = (data.collate_user_input().len() + prompt_bytes) as u64;

        match self.usage.report_usage(account, billed_bytes).await {
            Ok(cost) => tracing::debug!("Billed {} bytes, cost {:.5}", billed_bytes, cost),
            Err(e) => {
                tracing::warn!(
                    correlation_id,
                    "Failed to report usage of {} bytes: {}",
                    billed_bytes,
                    e
                );
                if let Err(e) = self
                    .metrics
                    .record_metric(
                        account,
                        correlation_id,
                        metric::BILLING_FAILURE,
                        billed_bytes as f64,
                        "Bytes",
                    )
                    .await
                {
                    tracing::warn!(correlation_id, "Failed to record billing failure: {}", e);
                }
            }
        }

        let outcome = &dispatch.outcome;
        let metrics = [
            (metric::BILLED_BYTES, billed_bytes as f64, "Bytes"),
            (metric::CHUNKS, dispatch.prompts.len() as f64, "Count"),
            (metric::INCOMPLETE_CHUNKS, outcome.incompletions as f64, "Count"),
            (metric::INPUT_TOKENS, outcome.usage.input_tokens as f64, "Count"),
            (metric::OUTPUT_TOKENS, outcome.usage.output_tokens as f64, "Count"),
        ];
        for (name, value, unit) in metrics {
            if let Err(e) = self
                .metrics
                .record_metric(account, correlation_id, name, value, unit)
                .await
            {
                tracing::warn!(correlation_id, "Failed to record metric {}: {}", name, e);
            }
        }
    }
}

fn main_prompt(messages: &[Message]) -> Option<String> {
    messages.last().map(|message| message.content.clone())
}
