//! Caller-supplied request data.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::execute::Sampling;
use crate::output::OutputFormat;
use crate::render::ListItem;

/// Keys that steer processing and are not billed as user input.
pub const CONTROL_KEYS: &[&str] = &["model", "temperature", "top_p"];

/// Tags the typed context blocks are bound to.
pub mod tag {
    pub const OUTPUT_FORMAT: &str = "output_format";
    pub const GUIDELINES: &str = "guidelines";
    pub const PROJECT_SUMMARY: &str = "project_summary";
    pub const HISTORY: &str = "history";
    pub const RELATED: &str = "related";
    pub const USER_FOCUS: &str = "user_focus";
    pub const TRAINING: &str = "training";
}

/// Request data for one `process` call.
///
/// Anything not named here lands in `extra`, which is where feature fields
/// such as the chunkable input live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallerData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// 0 means untuned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, alias = "outputFormat", skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidelines: Option<String>,
    #[serde(default, alias = "projectSummary", skip_serializing_if = "Option::is_none")]
    pub project_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<String>,
    #[serde(default, alias = "userFocus", skip_serializing_if = "Option::is_none")]
    pub user_focus: Option<String>,
    /// Example exchanges rendered through the user/assistant templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub training: Vec<ListItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CallerData {
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// `top_p` wins when both are given.
    pub fn sampling(&self) -> Option<Sampling> {
        match (self.top_p, self.temperature) {
            (Some(top_p), _) => Some(Sampling::TopP(top_p)),
            (None, Some(temperature)) => Some(Sampling::Temperature(temperature)),
            (None, None) => None,
        }
    }

    /// Requested output tokens, `None` when untuned.
    pub fn requested_max_tokens(&self) -> Option<u32> {
        self.max_tokens.filter(|tokens| *tokens > 0)
    }

    /// A feature field as text; non-string values are JSON-encoded.
    pub fn field(&self, key: &str) -> Option<String> {
        self.extra.get(key).map(value_text)
    }

    /// Everything the caller sent except control keys, space-joined. Its
    /// byte length is the billable share of the request.
    pub fn collate_user_input(&self) -> String {
        let Ok(Value::Object(map)) = serde_json::to_value(self) else {
            return String::new();
        };
        map.iter()
            .filter(|(key, _)| !CONTROL_KEYS.contains(&key.as_str()))
            .map(|(_, value)| value_text(value))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
