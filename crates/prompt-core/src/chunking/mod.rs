//! Splits an oversized request into token-safe sub-requests.
//!
//! Only the chunkable input is divided. Every chunk carries the same fixed
//! content (templates, context and schema), is rendered and optimized on its
//! own, and is re-measured against the input buffer before it is accepted.

pub mod splitter;

use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

use crate::budget::{TokenBudget, TokenCounter};
use crate::message::Message;
use crate::optimize::{optimize, OptimizeReport, OptimizerSettings};
use crate::render::{render_messages, FormatArgs, RenderError, TemplateSet};

/// Tuning for the chunker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkSettings {
    /// Share of the free input space left unused per chunk
    pub safety_margin: f64,
    /// A trailing chunk smaller than this share of a full one triggers an equal split
    pub min_remainder_ratio: f64,
    /// Allowed growth of a chunk's measured size over its planned size
    pub max_encoding_deviation: f64,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            safety_margin: 0.15,
            min_remainder_ratio: 0.2,
            max_encoding_deviation: 0.15,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Fixed content ({fixed} tokens) leaves no room in the input buffer ({limit} tokens)")]
    FixedContentTooLarge { fixed: u32, limit: u32 },

    #[error("Chunk {index} measured {actual} tokens, planned {planned}")]
    EncodingDeviation { index: usize, planned: u32, actual: u32 },

    #[error("Chunk {index} needs {tokens} tokens, input buffer is {limit}")]
    ChunkTooLarge { index: usize, tokens: u32, limit: u32 },

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// One sub-request, ready to execute.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    /// Zero-based position
    pub index: usize,
    pub total: usize,
    /// Byte range of this chunk within the chunkable input
    pub source: Range<usize>,
    pub text: String,
    pub messages: Vec<Message>,
    /// All messages plus the function schema
    pub input_tokens: u32,
    pub output_cap: u32,
    pub optimize_report: OptimizeReport,
}

/// Everything the chunker needs for one request.
#[derive(Debug, Clone, Copy)]
pub struct ChunkRequest<'a> {
    pub templates: &'a TemplateSet,
    pub args: &'a FormatArgs,
    /// Tag carrying the chunkable input
    pub field: &'a str,
    pub input: &'a str,
    pub list_shaped: bool,
    pub budget: &'a TokenBudget,
    pub counter: &'a TokenCounter,
    pub optimizer: &'a OptimizerSettings,
    pub settings: &'a ChunkSettings,
}

/// Marker appended to each chunk's main prompt.
pub fn part_marker(part: usize, total: usize) -> String {
    format!("\n\nThis is part {} of {}.", part, total)
}

/// Split `request.input` into chunks that each fit the input buffer.
pub fn plan_chunks(request: ChunkRequest<'_>) -> Result<Vec<ChunkSpec>, ChunkError> {
    let ChunkRequest {
        templates,
        args,
        field,
        input,
        list_shaped,
        budget,
        counter,
        optimizer,
        settings,
    } = request;
    let limit = budget.input_buffer;

    let fixed = fixed_tokens(&request)?;
    if fixed >= limit {
        return Err(ChunkError::FixedContentTooLarge { fixed, limit });
    }

    let free = (limit - fixed) as f64 * (1.0 - settings.safety_margin.clamp(0.0, 0.9));
    let target_raw = counter.counted_to_raw(free.floor() as u32);
    if target_raw == 0 {
        return Err(ChunkError::FixedContentTooLarge { fixed, limit });
    }

    let input_raw = counter.encode(input).len();
    let size = splitter::chunk_size(input_raw, target_raw, settings.min_remainder_ratio);
    let pieces = if list_shaped {
        splitter::split_lines(input, size, counter)
    } else {
        splitter::split_text(input, size, counter)
    };

    let total = pieces.len().max(1);
    tracing::debug!(
        "Chunk plan: {} input tokens, fixed {}, target {} raw per chunk, {} chunks",
        input_raw,
        fixed,
        size,
        total
    );

    let mut chunks = Vec::with_capacity(total);
    for (index, piece) in pieces.into_iter().enumerate() {
        let mut chunk_args = args.clone();
        chunk_args.set_text(field, piece.text.clone());

        let rendered = render_messages(templates, &chunk_args)?;
        let mut optimized = optimize(rendered, budget, counter, optimizer);
        if let Some(main) = optimized.messages.last_mut() {
            main.content.push_str(&part_marker(index + 1, total));
        }

        let input_tokens = counter
            .count_messages(&optimized.messages)
            .saturating_add(budget.function_schema_tokens);
        let planned = fixed.saturating_add(counter.raw_to_counted(piece.raw_tokens));
        let tolerance = 1.0 + settings.max_encoding_deviation;
        if input_tokens as f64 > planned as f64 * tolerance {
            return Err(ChunkError::EncodingDeviation {
                index,
                planned,
                actual: input_tokens,
            });
        }
        if input_tokens > limit {
            return Err(ChunkError::ChunkTooLarge {
                index,
                tokens: input_tokens,
                limit,
            });
        }

        chunks.push(ChunkSpec {
            index,
            total,
            source: piece.range,
            text: piece.text,
            messages: optimized.messages,
            input_tokens,
            output_cap: budget.chunk_output_cap(input_tokens),
            optimize_report: optimized.report,
        });
    }

    Ok(chunks)
}

/// Tokens every chunk spends outside the chunkable input.
fn fixed_tokens(request: &ChunkRequest<'_>) -> Result<u32, ChunkError> {
    let mut args = request.args.clone();
    args.set_text(request.field, "");

    let rendered = render_messages(request.templates, &args)?;
    let optimized = optimize(rendered, request.budget, request.counter, request.optimizer);
    let marker = part_marker(999, 999);

    Ok(request
        .counter
        .count_messages(&optimized.messages)
        .saturating_add(request.counter.count(&marker))
        .saturating_add(request.budget.function_schema_tokens))
}
