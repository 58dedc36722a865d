use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::message::Message;
use crate::output::FunctionSchema;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    #[error("Completion timed out after {0:?}")]
    Timeout(Duration),

    /// `hard` marks the account-level tokens-per-minute or quota limit
    #[error("Rate limited: {message}")]
    RateLimited { hard: bool, message: String },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid request: {message}")]
    InvalidRequest { too_large: bool, message: String },

    #[error("Completion error: {0}")]
    Other(String),
}

impl CompletionError {
    /// Timeouts, rate limits, unavailability and connection failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CompletionError::Timeout(_)
                | CompletionError::RateLimited { .. }
                | CompletionError::ServiceUnavailable(_)
                | CompletionError::Connection(_)
        )
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    FunctionCall,
    ContentFilter,
    Missing,
    Other(String),
}

impl FinishReason {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None | Some("") => FinishReason::Missing,
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("function_call") | Some("tool_calls") => FinishReason::FunctionCall,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }

    /// A completion is usable as-is only when the model stopped on its own.
    pub fn is_complete(&self) -> bool {
        matches!(self, FinishReason::Stop | FinishReason::FunctionCall)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments as produced by the model
    pub arguments: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub content: Option<String>,
    pub function_call: Option<FunctionCall>,
}

/// Result of one completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub message: CompletionMessage,
    pub finish_reason: FinishReason,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Completion {
    pub fn text(content: impl Into<String>, finish_reason: FinishReason) -> Self {
        Self {
            message: CompletionMessage {
                content: Some(content.into()),
                function_call: None,
            },
            finish_reason,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn function_call(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            message: CompletionMessage {
                content: None,
                function_call: Some(FunctionCall {
                    name: name.into(),
                    arguments: arguments.into(),
                }),
            },
            finish_reason: FinishReason::FunctionCall,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// Text content, or the function arguments for a function call.
    pub fn payload(&self) -> &str {
        self.message
            .function_call
            .as_ref()
            .map(|call| call.arguments.as_str())
            .or(self.message.content.as_deref())
            .unwrap_or("")
    }
}

/// Sampling control; callers set one or the other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sampling {
    Temperature(f32),
    TopP(f32),
}

/// Per-call parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionParams {
    pub model: String,
    pub sampling: Option<Sampling>,
    pub max_tokens: Option<u32>,
    pub function: Option<FunctionSchema>,
}

impl CompletionParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            sampling: None,
            max_tokens: None,
            function: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// An LLM completion service.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Send `messages` and wait at most `timeout` for the completion.
    async fn complete(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        timeout: Duration,
    ) -> Result<Completion, CompletionError>;
}
