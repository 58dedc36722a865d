//! Unified engine error.

use thiserror::Error;

use crate::budget::BudgetError;
use crate::chunking::ChunkError;
use crate::execute::{CompletionError, DeadlineError};
use crate::output::SchemaError;
use crate::reassembly::ReassemblyError;
use crate::render::RenderError;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Broken feature setup; fatal at construction
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bad caller data, the 4xx equivalent
    #[error("Invalid input: {0}")]
    CallerInput(String),

    /// Input cannot be made to fit the model
    #[error("Input too large: {0}")]
    Capacity(String),

    #[error(transparent)]
    Service(CompletionError),

    /// Every chunk ended incomplete
    #[error("No usable result: all {total} parts ended incomplete")]
    TotalFailure { total: usize },
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Whether the caller may reasonably retry the whole request.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Service(error) => error.is_transient(),
            EngineError::TotalFailure { .. } => true,
            _ => false,
        }
    }

    /// HTTP-style status for an outer service surface.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Configuration(_) => 500,
            EngineError::CallerInput(_) => 400,
            EngineError::Capacity(_) => 413,
            EngineError::Service(CompletionError::RateLimited { .. }) => 429,
            EngineError::Service(CompletionError::Timeout(_)) => 504,
            EngineError::Service(_) | EngineError::TotalFailure { .. } => 503,
        }
    }
}

impl From<CompletionError> for EngineError {
    fn from(error: CompletionError) -> Self {
        match error {
            CompletionError::InvalidRequest {
                too_large: true,
                message,
            } => EngineError::Capacity(message),
            other => EngineError::Service(other),
        }
    }
}

impl From<RenderError> for EngineError {
    fn from(error: RenderError) -> Self {
        match error {
            RenderError::MultipleExpansions { .. } => EngineError::CallerInput(error.to_string()),
            other => EngineError::Configuration(other.to_string()),
        }
    }
}

impl From<BudgetError> for EngineError {
    fn from(error: BudgetError) -> Self {
        match error {
            BudgetError::FunctionSchemaTooLarge { .. } => EngineError::CallerInput(error.to_string()),
            BudgetError::InputTooLarge { .. } => EngineError::Capacity(error.to_string()),
            BudgetError::Tokenizer { .. } => EngineError::Configuration(error.to_string()),
        }
    }
}

impl From<ChunkError> for EngineError {
    fn from(error: ChunkError) -> Self {
        match error {
            ChunkError::Render(render) => render.into(),
            other => EngineError::Capacity(other.to_string()),
        }
    }
}

impl From<SchemaError> for EngineError {
    fn from(error: SchemaError) -> Self {
        EngineError::Configuration(error.to_string())
    }
}

impl From<DeadlineError> for EngineError {
    fn from(error: DeadlineError) -> Self {
        EngineError::Configuration(error.to_string())
    }
}

impl From<ReassemblyError> for EngineError {
    fn from(error: ReassemblyError) -> Self {
        match error {
            ReassemblyError::TotalFailure { total } => EngineError::TotalFailure { total },
        }
    }
}
