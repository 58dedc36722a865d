//! Requested output shape for a feature.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use thiserror::Error;

/// How list output is laid out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Bulleted,
    Numbered,
    Ranked,
}

/// A function the model is asked to call with structured arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("Function schema name must not be empty")]
    EmptyName,
    #[error("Function schema '{0}' parameters must be an object schema with properties")]
    NotAnObject(String),
    #[error("Function schema '{name}' requires undeclared property '{property}'")]
    UnknownRequired { name: String, property: String },
}

impl FunctionSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    pub fn properties(&self) -> Option<&serde_json::Map<String, Value>> {
        self.parameters.get("properties").and_then(Value::as_object)
    }

    /// Names listed under `required`.
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyName);
        }
        let is_object = self.parameters.get("type").and_then(Value::as_str) == Some("object");
        let Some(properties) = self.properties().filter(|_| is_object) else {
            return Err(SchemaError::NotAnObject(self.name.clone()));
        };
        if let Some(missing) = self.required().into_iter().find(|r| !properties.contains_key(*r)) {
            return Err(SchemaError::UnknownRequired {
                name: self.name.clone(),
                property: missing.to_string(),
            });
        }
        Ok(())
    }

    /// Serialized form sent to the model; used for budget reservation.
    pub fn to_prompt_text(&self) -> String {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
        .to_string()
    }
}

/// Output shape requested from the model.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OutputSpec {
    #[default]
    Prose,
    List(ListKind),
    Structured(FunctionSchema),
}

impl OutputSpec {
    pub fn function(&self) -> Option<&FunctionSchema> {
        match self {
            OutputSpec::Structured(schema) => Some(schema),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        match self {
            OutputSpec::Structured(schema) => schema.validate(),
            _ => Ok(()),
        }
    }

    /// Text bound to the `output_format` tag.
    pub fn format_instruction(&self) -> String {
        match self {
            OutputSpec::Prose => "Respond in clear prose paragraphs.".to_string(),
            OutputSpec::List(ListKind::Bulleted) => {
                "Respond with a bulleted list, one item per line starting with \"- \".".to_string()
            }
            OutputSpec::List(ListKind::Numbered) => {
                "Respond with a numbered list, one item per line starting with \"1. \", \"2. \" and so on."
                    .to_string()
            }
            OutputSpec::List(ListKind::Ranked) => {
                "Respond with a numbered list ranked from most to least important, one item per line."
                    .to_string()
            }
            OutputSpec::Structured(schema) => format!(
                "Respond only by calling the function '{}' with JSON arguments.",
                schema.name
            ),
        }
    }
}

/// Caller-facing output format names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OutputFormat {
    Prose,
    BulletedList,
    NumberedList,
    RankedList,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prose" => Ok(OutputFormat::Prose),
            "bulletedList" | "bulleted" => Ok(OutputFormat::BulletedList),
            "numberedList" | "numbered" => Ok(OutputFormat::NumberedList),
            "rankedList" | "ranked" => Ok(OutputFormat::RankedList),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format '{}'", other)),
        }
    }
}

impl OutputFormat {
    /// Resolve against a feature's spec; a function-call feature stays
    /// structured, otherwise the caller's preference wins.
    pub fn apply_to(self, spec: &OutputSpec) -> OutputSpec {
        match (self, spec) {
            (_, OutputSpec::Structured(_)) => spec.clone(),
            (OutputFormat::Prose, _) => OutputSpec::Prose,
            (OutputFormat::BulletedList, _) => OutputSpec::List(ListKind::Bulleted),
            (OutputFormat::NumberedList, _) => OutputSpec::List(ListKind::Numbered),
            (OutputFormat::RankedList, _) => OutputSpec::List(ListKind::Ranked),
            (OutputFormat::Json, _) => spec.clone(),
        }
    }
}
