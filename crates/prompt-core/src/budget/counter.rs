//! Token counting for budget management.
//!
//! Wraps a BPE encoder selected by the model profile's encoding and adds a
//! fixed safety margin on top of the raw count to absorb encoder drift.

use std::sync::{Arc, OnceLock};

use crate::budget::limits::Encoding;
use crate::budget::types::BudgetError;
use crate::message::Message;

/// Token identifier as produced by the encoder.
pub type TokenId = u32;

/// Default safety margin added to every count (3%).
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.03;
/// Accepted range for the safety margin.
pub const SAFETY_MARGIN_RANGE: (f64, f64) = (0.025, 0.04);
/// Framing tokens added per message (role marker and separators).
pub const MESSAGE_OVERHEAD: u32 = 3;

/// Edge tokens dropped at most on each side by a lossy decode.
const MAX_EDGE_TRIM: usize = 3;

/// Text to token conversion.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Decode exactly, or `None` when the slice does not form valid UTF-8
    /// (for example when it starts or ends inside a multibyte character).
    fn decode_exact(&self, tokens: &[TokenId]) -> Option<String>;
}

/// `tiktoken-rs` backed tokenizer.
#[derive(Clone)]
pub struct BpeTokenizer {
    encoding: Encoding,
    bpe: Arc<tiktoken_rs::CoreBPE>,
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer")
            .field("encoding", &self.encoding)
            .finish()
    }
}

type CachedBpe = OnceLock<Option<Arc<tiktoken_rs::CoreBPE>>>;

static CL100K: CachedBpe = OnceLock::new();
static P50K: CachedBpe = OnceLock::new();
static O200K: CachedBpe = OnceLock::new();

impl BpeTokenizer {
    /// Load (or reuse the cached) encoder for an encoding.
    pub fn for_encoding(encoding: Encoding) -> Result<Self, BudgetError> {
        let (cell, load): (&CachedBpe, fn() -> anyhow::Result<tiktoken_rs::CoreBPE>) =
            match encoding {
                Encoding::Cl100kBase => (&CL100K, tiktoken_rs::cl100k_base),
                Encoding::P50kBase => (&P50K, tiktoken_rs::p50k_base),
                Encoding::O200kBase => (&O200K, tiktoken_rs::o200k_base),
            };

        let cached = cell.get_or_init(|| match load() {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(e) => {
                tracing::error!("Failed to load {} encoder: {}", encoding, e);
                None
            }
        });

        cached
            .as_ref()
            .map(|bpe| Self {
                encoding,
                bpe: bpe.clone(),
            })
            .ok_or_else(|| BudgetError::Tokenizer {
                encoding: encoding.to_string(),
                message: "encoder could not be initialized".to_string(),
            })
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }
}

impl Tokenizer for BpeTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        self.bpe
            .encode_with_special_tokens(text)
            .into_iter()
            .map(|t| t as TokenId)
            .collect()
    }

    fn decode_exact(&self, tokens: &[TokenId]) -> Option<String> {
        if tokens.is_empty() {
            return Some(String::new());
        }
        self.bpe
            .decode(tokens.iter().map(|&t| t as _).collect())
            .ok()
    }
}

/// Model-aware token counter with a safety margin.
#[derive(Clone)]
pub struct TokenCounter {
    tokenizer: Arc<dyn Tokenizer>,
    safety_margin: f64,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("safety_margin", &self.safety_margin)
            .finish()
    }
}

impl TokenCounter {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    /// Counter backed by the BPE encoder for `encoding`.
    pub fn for_encoding(encoding: Encoding) -> Result<Self, BudgetError> {
        Ok(Self::new(Arc::new(BpeTokenizer::for_encoding(encoding)?)))
    }

    /// Set the safety margin, clamped to the accepted range.
    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        let (low, high) = SAFETY_MARGIN_RANGE;
        if !(low..=high).contains(&margin) {
            tracing::warn!(
                "Safety margin {} outside [{}, {}], clamping",
                margin,
                low,
                high
            );
        }
        self.safety_margin = margin.clamp(low, high);
        self
    }

    pub fn safety_margin(&self) -> f64 {
        self.safety_margin
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    /// Raw encoding without the margin.
    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        self.tokenizer.encode(text)
    }

    /// Counted size of `text`, margin included.
    pub fn count(&self, text: &str) -> u32 {
        self.raw_to_counted(self.tokenizer.encode(text).len())
    }

    /// Counted size plus the raw tokens.
    pub fn count_tokens(&self, text: &str) -> (u32, Vec<TokenId>) {
        let tokens = self.tokenizer.encode(text);
        (self.raw_to_counted(tokens.len()), tokens)
    }

    pub fn count_message(&self, message: &Message) -> u32 {
        self.count(&message.content).saturating_add(MESSAGE_OVERHEAD)
    }

    pub fn count_messages(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .map(|m| self.count_message(m))
            .fold(0u32, |acc, n| acc.saturating_add(n))
    }

    /// Apply the safety margin to a raw token count.
    pub fn raw_to_counted(&self, raw: usize) -> u32 {
        if raw == 0 {
            return 0;
        }
        let scaled = raw as f64 * (1.0 + self.safety_margin);
        let nearest = scaled.round();
        // float noise must not push an exact product up by one
        if (scaled - nearest).abs() < 1e-6 {
            nearest as u32
        } else {
            scaled.ceil() as u32
        }
    }

    /// Largest raw token count whose counted size stays within `counted`.
    pub fn counted_to_raw(&self, counted: u32) -> usize {
        let mut raw = (counted as f64 / (1.0 + self.safety_margin)).floor() as usize;
        while raw > 0 && self.raw_to_counted(raw) > counted {
            raw -= 1;
        }
        while self.raw_to_counted(raw + 1) <= counted {
            raw += 1;
        }
        raw
    }

    /// Strict decode; `None` when the slice splits a character.
    pub fn decode_exact(&self, tokens: &[TokenId]) -> Option<String> {
        self.tokenizer.decode_exact(tokens)
    }

    /// Lossy decode that never fails.
    ///
    /// Partial multibyte sequences at either edge are dropped by trimming up to
    /// a few edge tokens until the remainder decodes.
    pub fn decode(&self, tokens: &[TokenId]) -> String {
        if let Some(text) = self.tokenizer.decode_exact(tokens) {
            return text;
        }

        for total_trim in 1..=(MAX_EDGE_TRIM * 2) {
            for head in 0..=total_trim.min(MAX_EDGE_TRIM) {
                let tail = total_trim - head;
                if tail > MAX_EDGE_TRIM || head + tail >= tokens.len() {
                    continue;
                }
                let slice = &tokens[head..tokens.len() - tail];
                if let Some(text) = self.tokenizer.decode_exact(slice) {
                    return text;
                }
            }
        }

        tracing::warn!(
            "Could not decode {} tokens even after trimming edges",
            tokens.len()
        );
        String::new()
    }

    /// Leading span of `text` whose counted size fits in `limit`.
    ///
    /// The decoded prefix is re-measured and shortened until it fits, since
    /// re-encoding a truncated string can differ from the original slice.
    pub fn truncate_to(&self, text: &str, limit: u32) -> String {
        let (count, tokens) = self.count_tokens(text);
        if count <= limit {
            return text.to_string();
        }

        let mut keep = self.counted_to_raw(limit).min(tokens.len());
        while keep > 0 {
            let prefix = self.decode(&tokens[..keep]);
            if self.count(&prefix) <= limit {
                return prefix;
            }
            keep -= 1;
        }
        String::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// One token per `char`; makes budget arithmetic in tests predictable.
    #[derive(Debug, Default)]
    pub struct CharTokenizer;

    impl Tokenizer for CharTokenizer {
        fn encode(&self, text: &str) -> Vec<TokenId> {
            text.chars().map(|c| c as TokenId).collect()
        }

        fn decode_exact(&self, tokens: &[TokenId]) -> Option<String> {
            tokens.iter().map(|&t| char::from_u32(t)).collect()
        }
    }

    pub fn char_counter() -> TokenCounter {
        TokenCounter::new(Arc::new(CharTokenizer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_encoding() {
        let text = "fn main() {\n    println!(\"héllo wörld 🚀\");\n}\n";
        for encoding in Encoding::ALL {
            let counter = TokenCounter::for_encoding(encoding).expect("encoder");
            let (_, tokens) = counter.count_tokens(text);
            assert_eq!(counter.decode(&tokens), text, "encoding {}", encoding);
            assert_eq!(counter.decode_exact(&tokens).as_deref(), Some(text));
        }
    }

    #[test]
    fn count_includes_safety_margin() {
        let counter = TokenCounter::for_encoding(Encoding::Cl100kBase).expect("encoder");
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(20);
        let (count, tokens) = counter.count_tokens(&text);
        assert!(count as usize > tokens.len());
        assert_eq!(count, counter.raw_to_counted(tokens.len()));
    }

    #[test]
    fn empty_text_counts_zero() {
        let counter = TokenCounter::for_encoding(Encoding::Cl100kBase).expect("encoder");
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn lossy_decode_of_split_character_does_not_panic() {
        let counter = TokenCounter::for_encoding(Encoding::Cl100kBase).expect("encoder");
        let text = "ab🚀🚀🚀cd";
        let tokens = counter.encode(text);

        for start in 0..tokens.len() {
            for end in start..=tokens.len() {
                let decoded = counter.decode(&tokens[start..end]);
                assert!(text.contains(&decoded) || decoded.is_empty());
            }
        }
    }

    #[test]
    fn exact_decode_rejects_partial_emoji() {
        let counter = TokenCounter::for_encoding(Encoding::Cl100kBase).expect("encoder");
        let tokens = counter.encode("🚀");
        if tokens.len() > 1 {
            assert!(counter.decode_exact(&tokens[..1]).is_none());
        }
    }

    #[test]
    fn counted_to_raw_inverts_margin() {
        let counter = test_support::char_counter();
        for counted in [0u32, 1, 50, 103, 1_000, 4_096] {
            let raw = counter.counted_to_raw(counted);
            assert!(counter.raw_to_counted(raw) <= counted);
            assert!(counter.raw_to_counted(raw + 1) > counted);
        }
    }

    #[test]
    fn messages_carry_framing_overhead() {
        let counter = test_support::char_counter();
        let messages = vec![Message::system("abcd"), Message::user("")];
        // 4 chars -> ceil(4 * 1.03) = 5, plus overhead on both messages
        assert_eq!(counter.count_messages(&messages), 5 + 2 * MESSAGE_OVERHEAD);
    }

    #[test]
    fn truncate_keeps_leading_span() {
        let counter = test_support::char_counter();
        let text = "x".repeat(500);
        let truncated = counter.truncate_to(&text, 103);
        assert!(counter.count(&truncated) <= 103);
        assert!(text.starts_with(&truncated));
        assert_eq!(truncated.len(), 100);
    }

    #[test]
    fn margin_is_clamped_to_range() {
        let counter = test_support::char_counter().with_safety_margin(0.5);
        assert_eq!(counter.safety_margin(), 0.04);
    }
}
