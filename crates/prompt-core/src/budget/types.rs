//! Core types for token budget management.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::limits::ModelProfile;

/// Default share of the context window given to input.
const DEFAULT_INPUT_RATIO: f64 = 0.5;
/// Default share of the input buffer given to system/background content.
const DEFAULT_SYSTEM_RATIO: f64 = 0.5;
/// Smallest output allowance requested for a single-shot call.
const DEFAULT_MIN_OUTPUT_TOKENS: u32 = 500;
/// Output allowance as a multiple of the input size for small inputs.
const DEFAULT_OUTPUT_TO_INPUT_RATIO: f64 = 2.0;

/// How a model's context window is partitioned for one feature.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetPolicy {
    /// Fraction of `total_max` reserved for input (messages + function schema)
    pub input_ratio: f64,
    /// Fraction of the input buffer available to system and training content
    pub system_ratio: f64,
    /// Floor for the computed output buffer
    pub min_output_tokens: u32,
    /// Output buffer grows with the input at this rate until the model ceiling
    pub output_to_input_ratio: f64,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            input_ratio: DEFAULT_INPUT_RATIO,
            system_ratio: DEFAULT_SYSTEM_RATIO,
            min_output_tokens: DEFAULT_MIN_OUTPUT_TOKENS,
            output_to_input_ratio: DEFAULT_OUTPUT_TO_INPUT_RATIO,
        }
    }
}

impl BudgetPolicy {
    pub fn with_input_ratio(mut self, ratio: f64) -> Self {
        self.input_ratio = ratio;
        self
    }

    pub fn with_system_ratio(mut self, ratio: f64) -> Self {
        self.system_ratio = ratio;
        self
    }
}

/// Token budget for a single call against one model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBudget {
    /// Maximum context window size for the model (input + output)
    pub total_max: u32,
    /// Tokens available to the whole rendered input, schema included
    pub input_buffer: u32,
    /// Tokens available to system and training content inside the input buffer
    pub system_buffer: u32,
    /// Tokens reserved for the structured-output function schema
    pub function_schema_tokens: u32,
    /// The model's output ceiling
    pub max_output_tokens: u32,
    min_output_tokens: u32,
    output_to_input_ratio: f64,
}

impl TokenBudget {
    /// Partition a model's context window according to the policy.
    pub fn new(profile: &ModelProfile, policy: &BudgetPolicy) -> Self {
        let total_max = profile.max_total_tokens;
        let input_buffer = scale(total_max, policy.input_ratio);
        let system_buffer = scale(input_buffer, policy.system_ratio);

        Self {
            total_max,
            input_buffer,
            system_buffer,
            function_schema_tokens: 0,
            max_output_tokens: profile.max_output_tokens,
            min_output_tokens: policy.min_output_tokens,
            output_to_input_ratio: policy.output_to_input_ratio,
        }
    }

    /// Create a budget with explicit buffers, mainly for tests and callers with
    /// their own sizing rules.
    pub fn with_buffers(total_max: u32, input_buffer: u32, system_buffer: u32) -> Self {
        let input_buffer = input_buffer.min(total_max);
        Self {
            total_max,
            input_buffer,
            system_buffer: system_buffer.min(input_buffer),
            function_schema_tokens: 0,
            max_output_tokens: total_max.saturating_sub(input_buffer).max(1),
            min_output_tokens: DEFAULT_MIN_OUTPUT_TOKENS,
            output_to_input_ratio: DEFAULT_OUTPUT_TO_INPUT_RATIO,
        }
    }

    /// Reserve room for a structured-output function schema.
    ///
    /// The schema must leave at least some of the input buffer for content.
    pub fn reserve_function_schema(&mut self, schema_tokens: u32) -> Result<(), BudgetError> {
        if schema_tokens >= self.input_buffer {
            return Err(BudgetError::FunctionSchemaTooLarge {
                schema_tokens,
                input_buffer: self.input_buffer,
            });
        }
        self.function_schema_tokens = schema_tokens;
        Ok(())
    }

    /// Tokens left in the context window once `input_tokens` are spent.
    pub fn remaining_after(&self, input_tokens: u32) -> u32 {
        self.total_max.saturating_sub(input_tokens)
    }

    /// Output cap for one chunk: whatever remains, capped by the model ceiling.
    pub fn chunk_output_cap(&self, input_tokens: u32) -> u32 {
        self.remaining_after(input_tokens).min(self.max_output_tokens)
    }

    /// Output buffer for a single-shot call.
    ///
    /// A caller-requested `max_tokens` wins when present (still capped); otherwise
    /// the buffer grows with the input from a floor, capped by the remaining
    /// space and the model ceiling.
    pub fn output_buffer(&self, input_tokens: u32, requested: Option<u32>) -> u32 {
        let ceiling = self.chunk_output_cap(input_tokens);
        if let Some(requested) = requested.filter(|r| *r > 0) {
            return requested.min(ceiling);
        }

        let proportional = (input_tokens as f64 * self.output_to_input_ratio).ceil() as u32;
        proportional.max(self.min_output_tokens).min(ceiling)
    }

    /// Whether an input of `input_tokens` (schema included) fits in the input buffer.
    pub fn fits_input(&self, input_tokens: u32) -> bool {
        input_tokens <= self.input_buffer
    }
}

fn scale(value: u32, ratio: f64) -> u32 {
    let ratio = ratio.clamp(0.0, 1.0);
    (value as f64 * ratio).floor() as u32
}

/// Errors that can occur during budget management.
#[derive(Debug, Error)]
pub enum BudgetError {
    /// The structured-output schema leaves no room for content
    #[error("Function schema ({schema_tokens} tokens) does not fit the input buffer ({input_buffer} tokens)")]
    FunctionSchemaTooLarge { schema_tokens: u32, input_buffer: u32 },

    /// Input cannot be made to fit and chunking is unavailable
    #[error("Input ({tokens} tokens) exceeds the available budget ({limit} tokens) and cannot be chunked")]
    InputTooLarge { tokens: u32, limit: u32 },

    /// The encoder for an encoding could not be loaded
    #[error("Failed to load tokenizer '{encoding}': {message}")]
    Tokenizer { encoding: String, message: String },
}
