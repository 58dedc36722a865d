//! Merges per-chunk outcomes into one answer with disclosure notices.

pub mod structured;
pub mod text;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::execute::{ChunkOutcome, Completion, Incomplete};
use crate::output::{ListKind, OutputSpec};

/// Merged model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum AggregateOutput {
    Text(String),
    Structured(Map<String, Value>),
}

impl AggregateOutput {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AggregateOutput::Text(text) => Some(text),
            AggregateOutput::Structured(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Final result of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub output: AggregateOutput,
    pub truncated: bool,
    /// Estimated tokens the optimizer cut
    pub discarded_tokens: u32,
    pub chunked: bool,
    pub incompletions: usize,
    pub usage: Usage,
}

/// What the optimizer reported for the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Truncation {
    pub truncated: bool,
    pub discarded_tokens: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("All {total} parts ended incomplete")]
    TotalFailure { total: usize },
}

pub fn truncation_notice(discarded_tokens: u32) -> String {
    format!("**Truncated input, discarded ~{} tokens**", discarded_tokens)
}

pub fn incompleteness_notice(incomplete: usize, total: usize, lost_tokens: u32) -> String {
    format!(
        "**Warning: {} of {} parts did not complete; ~{} tokens of analysis may be missing**",
        incomplete, total, lost_tokens
    )
}

/// Combine outcomes (in chunk order) according to the output spec.
///
/// Fails only when no outcome is usable.
pub fn reassemble(
    outcomes: Vec<ChunkOutcome>,
    spec: &OutputSpec,
    truncation: Truncation,
    chunked: bool,
) -> Result<AggregateOutcome, ReassemblyError> {
    let total = outcomes.len();
    let usage = outcomes.iter().fold(Usage::default(), |acc, outcome| {
        let completion = match outcome {
            Ok(completion) => Some(completion),
            Err(Incomplete { partial, .. }) => partial.as_ref(),
        };
        match completion {
            Some(c) => Usage {
                input_tokens: acc.input_tokens.saturating_add(c.input_tokens),
                output_tokens: acc.output_tokens.saturating_add(c.output_tokens),
            },
            None => acc,
        }
    });

    let mut complete: Vec<Completion> = Vec::new();
    let mut lost_tokens = 0u32;
    for outcome in outcomes {
        match outcome {
            Ok(completion) => complete.push(completion),
            Err(incomplete) => {
                tracing::warn!("Part ended incomplete: {:?}", incomplete.reason);
                lost_tokens = lost_tokens.saturating_add(incomplete.planned_tokens);
            }
        }
    }

    if complete.is_empty() {
        return Err(ReassemblyError::TotalFailure { total });
    }

    let mut incompletions = total - complete.len();

    let output = match spec {
        OutputSpec::Structured(schema) => {
            let mut merged = Map::new();
            let mut usable = 0;
            for completion in &complete {
                match structured::parse_payload(completion.payload(), Some(schema)) {
                    Some(map) => {
                        structured::merge_into(&mut merged, map);
                        usable += 1;
                    }
                    None => incompletions += 1,
                }
            }
            if usable == 0 {
                return Err(ReassemblyError::TotalFailure { total });
            }
            AggregateOutput::Structured(merged)
        }
        OutputSpec::Prose | OutputSpec::List(_) => {
            let mut body = text::join_parts(complete.iter().map(Completion::payload));
            if matches!(spec, OutputSpec::List(ListKind::Numbered | ListKind::Ranked)) {
                body = text::renumber_list(&body);
            }

            let mut notices = Vec::new();
            if truncation.truncated {
                notices.push(truncation_notice(truncation.discarded_tokens));
            }
            if incompletions > 0 {
                notices.push(incompleteness_notice(incompletions, total, lost_tokens));
            }
            notices.push(body);
            AggregateOutput::Text(notices.join("\n\n"))
        }
    };

    Ok(AggregateOutcome {
        output,
        truncated: truncation.truncated,
        discarded_tokens: truncation.discarded_tokens,
        chunked,
        incompletions,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::{FinishReason, IncompleteReason};
    use crate::output::FunctionSchema;
    use serde_json::json;

    fn stop(text: &str) -> ChunkOutcome {
        Ok(Completion::text(text, FinishReason::Stop).with_usage(100, 20))
    }

    fn cut(text: &str) -> ChunkOutcome {
        Err(Incomplete {
            reason: IncompleteReason::Length,
            partial: Some(Completion::text(text, FinishReason::Length).with_usage(100, 50)),
            planned_tokens: 600,
        })
    }

    #[test]
    fn all_incomplete_is_total_failure() {
        let result = reassemble(
            vec![cut("a"), cut("b")],
            &OutputSpec::Prose,
            Truncation::default(),
            true,
        );
        assert_eq!(result.unwrap_err(), ReassemblyError::TotalFailure { total: 2 });
    }

    #[test]
    fn partial_failure_is_disclosed() {
        let outcome = reassemble(
            vec![stop("one"), cut("x"), stop("three"), cut("y")],
            &OutputSpec::Prose,
            Truncation::default(),
            true,
        )
        .expect("partial result");

        assert_eq!(outcome.incompletions, 2);
        let text = outcome.output.as_text().expect("text");
        assert!(text.starts_with(&incompleteness_notice(2, 4, 1_200)));
        assert!(text.ends_with("one\n\nthree"));
        assert_eq!(outcome.usage.input_tokens, 400);
        assert_eq!(outcome.usage.output_tokens, 140);
    }

    #[test]
    fn truncation_notice_comes_first() {
        let outcome = reassemble(
            vec![stop("answer")],
            &OutputSpec::Prose,
            Truncation {
                truncated: true,
                discarded_tokens: 321,
            },
            false,
        )
        .expect("ok");

        assert_eq!(
            outcome.output,
            AggregateOutput::Text(format!("{}\n\nanswer", truncation_notice(321)))
        );
        assert!(outcome.truncated);
        assert!(!outcome.chunked);
    }

    #[test]
    fn numbered_lists_are_renumbered_across_parts() {
        let outcome = reassemble(
            vec![stop("1. a\n2. b"), stop("1. c")],
            &OutputSpec::List(ListKind::Numbered),
            Truncation::default(),
            true,
        )
        .expect("ok");
        assert_eq!(outcome.output.as_text(), Some("1. a\n2. b\n\n3. c"));
    }

    #[test]
    fn structured_payloads_merge_and_skip_malformed() {
        let schema = FunctionSchema::new(
            "report",
            "",
            json!({
                "type": "object",
                "properties": {"issues": {"type": "array"}, "summary": {"type": "string"}},
                "required": ["issues"]
            }),
        );
        let outcomes = vec![
            Ok(Completion::function_call("report", r#"{"issues": ["a"], "summary": "s1"}"#)),
            Ok(Completion::function_call("report", "{broken")),
            Ok(Completion::function_call("report", r#"{"issues": ["b"], "summary": "s2"}"#)),
        ];

        let outcome = reassemble(
            outcomes,
            &OutputSpec::Structured(schema),
            Truncation::default(),
            true,
        )
        .expect("ok");

        assert_eq!(
            outcome.output,
            AggregateOutput::Structured(match json!({"issues": ["a", "b"], "summary": "s2"}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            })
        );
        assert_eq!(outcome.incompletions, 1);
    }
}
