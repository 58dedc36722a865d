use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use prompt_core::{Completion, CompletionError, CompletionParams, CompletionProvider, Message};

use crate::protocol::{build_body, classify_status, into_completion, ChatResponse};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Completion provider for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatProvider {
    client: Client,
    api_key: String,
    base_url: String,
    /// Pinned model; otherwise each call's `params.model` is sent
    model: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: None,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    async fn complete(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        timeout: Duration,
    ) -> Result<Completion, CompletionError> {
        let model = self.model.as_deref().unwrap_or(&params.model);
        let body = build_body(model, messages, params);
        tracing::debug!(
            "POST {}/chat/completions model={} messages={} max_tokens={:?}",
            self.base_url,
            model,
            messages.len(),
            params.max_tokens
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let error = classify_status(status.as_u16(), &text);
            tracing::warn!("Completion request failed: {}", error);
            return Err(error);
        }

        let decoded = response
            .json::<ChatResponse>()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        into_completion(decoded)
    }
}

fn transport_error(error: reqwest::Error, timeout: Duration) -> CompletionError {
    if error.is_timeout() {
        CompletionError::Timeout(timeout)
    } else if error.is_connect() || error.is_request() {
        CompletionError::Connection(error.to_string())
    } else if error.is_decode() {
        CompletionError::Other(format!("Malformed response: {}", error))
    } else {
        CompletionError::Connection(error.to_string())
    }
}
