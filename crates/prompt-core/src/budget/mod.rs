//! Token accounting for prompt assembly.
//!
//! # Key Components
//!
//! - [`types`]: `TokenBudget` partitioning and `BudgetPolicy` ratios
//! - [`counter`]: BPE token counting with a safety margin
//! - [`limits`]: Model profile registry (context window, output ceiling, encoding)

pub mod counter;
pub mod limits;
pub mod types;

pub use counter::{BpeTokenizer, TokenCounter, TokenId, Tokenizer, MESSAGE_OVERHEAD};
pub use limits::{Encoding, ModelProfile, ModelProfileRegistry};
pub use types::{BudgetError, BudgetPolicy, TokenBudget};
