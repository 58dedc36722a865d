//! OpenAI-compatible `/chat/completions` wire format.
//!
//! Builds the non-streaming request body from engine messages and maps the
//! response (or the HTTP failure) back onto the completion contract.

use serde::Deserialize;
use serde_json::{json, Value};

use prompt_core::execute::CompletionMessage;
use prompt_core::{
    Completion, CompletionError, CompletionParams, FinishReason, FunctionCall, Message, Sampling,
};

/// Body fragments that mark the account-level limit rather than a burst.
const HARD_LIMIT_PATTERNS: &[&str] = &[
    "tokens per min",
    "insufficient_quota",
    "exceeded your current quota",
];

/// Body fragments that mark a request larger than the context window.
const CONTEXT_LENGTH_PATTERNS: &[&str] = &["context_length_exceeded", "maximum context length"];

pub fn messages_to_json(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        })
        .collect()
}

pub fn build_body(model: &str, messages: &[Message], params: &CompletionParams) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages_to_json(messages),
        "stream": false,
    });

    if let Some(max_tokens) = params.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }

    match params.sampling {
        Some(Sampling::Temperature(temperature)) => body["temperature"] = json!(temperature),
        Some(Sampling::TopP(top_p)) => body["top_p"] = json!(top_p),
        None => {}
    }

    if let Some(function) = &params.function {
        body["functions"] = json!([{
            "name": function.name,
            "description": function.description,
            "parameters": function.parameters,
        }]);
        body["function_call"] = json!({ "name": function.name });
    }

    body
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
    pub usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    pub content: Option<String>,
    pub function_call: Option<WireFunctionCall>,
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct WireToolCall {
    pub function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
pub struct ResponseUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

/// Convert a decoded response into a completion.
pub fn into_completion(response: ChatResponse) -> Result<Completion, CompletionError> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(CompletionError::Other("Response has no choices".to_string()));
    };

    let ResponseMessage {
        content,
        function_call,
        tool_calls,
    } = choice.message;
    let function_call = function_call
        .or_else(|| tool_calls?.into_iter().next().map(|call| call.function))
        .map(|call| FunctionCall {
            name: call.name,
            arguments: call.arguments,
        });

    let usage = response.usage.unwrap_or(ResponseUsage {
        prompt_tokens: 0,
        completion_tokens: 0,
    });

    Ok(Completion {
        message: CompletionMessage {
            content,
            function_call,
        },
        finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    })
}

/// Classify a non-success HTTP status and its body.
pub fn classify_status(status: u16, body: &str) -> CompletionError {
    let message = format!("HTTP {}: {}", status, body);
    let lower = body.to_lowercase();

    match status {
        429 => CompletionError::RateLimited {
            hard: HARD_LIMIT_PATTERNS.iter().any(|p| lower.contains(p)),
            message,
        },
        408 | 500..=599 => CompletionError::ServiceUnavailable(message),
        400..=499 => CompletionError::InvalidRequest {
            too_large: status == 413 || CONTEXT_LENGTH_PATTERNS.iter().any(|p| lower.contains(p)),
            message,
        },
        _ => CompletionError::Other(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prompt_core::FunctionSchema;

    #[test]
    fn body_carries_sampling_limit_and_function() {
        let mut params = CompletionParams::new("gpt-4").with_max_tokens(256);
        params.sampling = Some(Sampling::TopP(0.5));
        params.function = Some(FunctionSchema::new(
            "report",
            "Report findings",
            json!({"type": "object", "properties": {}}),
        ));

        let body = build_body("gpt-4", &[Message::system("s"), Message::user("u")], &params);

        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["top_p"], 0.5);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "u"}));
        assert_eq!(body["functions"][0]["name"], "report");
        assert_eq!(body["function_call"], json!({"name": "report"}));
    }

    #[test]
    fn rate_limits_split_into_hard_and_soft() {
        let hard = classify_status(
            429,
            r#"{"error": {"message": "Rate limit reached for gpt-4 on tokens per min. Limit: 40000"}}"#,
        );
        assert!(matches!(hard, CompletionError::RateLimited { hard: true, .. }));

        let soft = classify_status(429, r#"{"error": {"message": "Too many requests"}}"#);
        assert!(matches!(soft, CompletionError::RateLimited { hard: false, .. }));
    }

    #[test]
    fn context_length_errors_are_too_large() {
        let err = classify_status(
            400,
            r#"{"error": {"code": "context_length_exceeded", "message": "This model's maximum context length is 8192 tokens"}}"#,
        );
        assert!(matches!(err, CompletionError::InvalidRequest { too_large: true, .. }));

        let err = classify_status(400, r#"{"error": {"message": "bad role"}}"#);
        assert!(matches!(err, CompletionError::InvalidRequest { too_large: false, .. }));
    }

    #[test]
    fn server_errors_are_unavailable() {
        assert!(matches!(
            classify_status(503, "overloaded"),
            CompletionError::ServiceUnavailable(_)
        ));
        assert!(classify_status(502, "").is_transient());
    }

    #[test]
    fn tool_call_is_read_as_function_call() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "report", "arguments": "{\"a\":1}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        }))
        .expect("decode");

        let completion = into_completion(response).expect("completion");
        assert_eq!(completion.finish_reason, FinishReason::FunctionCall);
        assert_eq!(completion.payload(), "{\"a\":1}");
        assert_eq!(completion.input_tokens, 12);
        assert_eq!(completion.output_tokens, 4);
    }
}
