//! Token-safe splitting of the chunkable input.

use std::ops::Range;

use crate::budget::{TokenCounter, TokenId};

/// One piece of the input: its byte range and text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub range: Range<usize>,
    pub text: String,
    /// Raw tokens the piece occupied in the whole-input encoding
    pub raw_tokens: usize,
}

/// Raw chunk size for `total` tokens given the target size.
///
/// When the last partial chunk would be smaller than `min_remainder_ratio` of
/// a full one, the input is redistributed into equal chunks instead.
pub fn chunk_size(total: usize, target: usize, min_remainder_ratio: f64) -> usize {
    if target == 0 || total <= target {
        return total.max(1);
    }
    let full = total / target;
    let remainder = total % target;
    if remainder > 0 && (remainder as f64) < target as f64 * min_remainder_ratio {
        let count = full + 1;
        return total.div_ceil(count);
    }
    target
}

/// Split free text so that concatenating the pieces reproduces `text`.
///
/// Each boundary is moved back until the tokens before it decode exactly,
/// which keeps multibyte characters whole.
pub fn split_text(text: &str, size: usize, counter: &TokenCounter) -> Vec<Piece> {
    let tokens = counter.encode(text);
    split_tokens(&tokens, 0, size, counter)
}

fn split_tokens(tokens: &[TokenId], base_offset: usize, size: usize, counter: &TokenCounter) -> Vec<Piece> {
    let size = size.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut offset = base_offset;

    while start < tokens.len() {
        let mut end = (start + size).min(tokens.len());
        let mut decoded = counter.decode_exact(&tokens[start..end]);

        while decoded.is_none() && end > start + 1 {
            end -= 1;
            decoded = counter.decode_exact(&tokens[start..end]);
        }
        // a character wider than the whole chunk: grow instead
        if decoded.is_none() {
            end = (start + size).min(tokens.len());
            while decoded.is_none() && end < tokens.len() {
                end += 1;
                decoded = counter.decode_exact(&tokens[start..end]);
            }
        }

        let text = decoded.unwrap_or_else(|| counter.decode(&tokens[start..end]));
        pieces.push(Piece {
            range: offset..offset + text.len(),
            raw_tokens: end - start,
            text,
        });
        offset = pieces.last().map(|p| p.range.end).unwrap_or(offset);
        start = end;
    }

    pieces
}

/// Pack whole lines greedily; a line larger than `size` is split by tokens.
pub fn split_lines(text: &str, size: usize, counter: &TokenCounter) -> Vec<Piece> {
    let size = size.max(1);
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_start = 0;
    let mut current_tokens = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_tokens = counter.encode(line);

        if line_tokens.len() > size {
            flush(&mut pieces, &mut current, current_start, &mut current_tokens);
            tracing::warn!(
                "List item of {} tokens exceeds chunk size {}, splitting it",
                line_tokens.len(),
                size
            );
            pieces.extend(split_tokens(&line_tokens, offset, size, counter));
            offset += line.len();
            current_start = offset;
            continue;
        }

        if current_tokens + line_tokens.len() > size && !current.is_empty() {
            flush(&mut pieces, &mut current, current_start, &mut current_tokens);
            current_start = offset;
        }

        current.push_str(line);
        current_tokens += line_tokens.len();
        offset += line.len();
    }

    flush(&mut pieces, &mut current, current_start, &mut current_tokens);
    pieces
}

fn flush(pieces: &mut Vec<Piece>, current: &mut String, start: usize, tokens: &mut usize) {
    if current.is_empty() {
        return;
    }
    let text = std::mem::take(current);
    pieces.push(Piece {
        range: start..start + text.len(),
        raw_tokens: *tokens,
        text,
    });
    *tokens = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::counter::test_support::char_counter;
    use crate::budget::{Encoding, TokenCounter};

    fn joined(pieces: &[Piece]) -> String {
        pieces.iter().map(|p| p.text.as_str()).collect()
    }

    #[test]
    fn small_remainder_is_redistributed() {
        // 1_050 tokens at 500 per chunk leaves 50, under 20% of a chunk
        assert_eq!(chunk_size(1_050, 500, 0.2), 350);
        // 1_200 leaves 200, which is kept as its own chunk
        assert_eq!(chunk_size(1_200, 500, 0.2), 500);
        assert_eq!(chunk_size(300, 500, 0.2), 300);
    }

    #[test]
    fn text_pieces_reproduce_input() {
        let counter = TokenCounter::for_encoding(Encoding::Cl100kBase).expect("encoder");
        let text = "Grüße aus Köln 🚀 · ".repeat(200);
        let pieces = split_text(&text, 37, &counter);

        assert!(pieces.len() > 1);
        assert_eq!(joined(&pieces), text);
        for piece in &pieces {
            assert_eq!(&text[piece.range.clone()], piece.text);
        }
    }

    #[test]
    fn lines_are_not_split() {
        let counter = char_counter();
        let text = "alpha\nbeta\ngamma\ndelta\n";
        let pieces = split_lines(text, 12, &counter);

        assert_eq!(joined(&pieces), text);
        for piece in &pieces {
            assert!(piece.text.ends_with('\n'));
            assert!(piece.raw_tokens <= 12);
        }
    }

    #[test]
    fn oversized_line_is_split_by_tokens() {
        let counter = char_counter();
        let long = "x".repeat(30);
        let text = format!("a\n{}\nb\n", long);
        let pieces = split_lines(&text, 10, &counter);

        assert_eq!(joined(&pieces), text);
        assert!(pieces.iter().all(|p| p.raw_tokens <= 10));
        for piece in &pieces {
            assert_eq!(&text[piece.range.clone()], piece.text);
        }
    }
}
