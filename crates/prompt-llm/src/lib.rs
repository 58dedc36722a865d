//! HTTP completion provider for OpenAI-compatible endpoints.

pub mod openai;
pub mod protocol;

pub use openai::{OpenAiCompatProvider, DEFAULT_BASE_URL};
