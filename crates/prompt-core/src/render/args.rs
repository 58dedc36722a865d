use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::message::Role;

/// One element of an expandable tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ListItem {
    Text(String),
    Exchange {
        prompt: Option<String>,
        response: Option<String>,
    },
}

impl ListItem {
    pub fn exchange(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        ListItem::Exchange {
            prompt: Some(prompt.into()),
            response: Some(response.into()),
        }
    }

    /// Text substituted into a single-role template.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ListItem::Text(text) => Some(text),
            ListItem::Exchange { prompt, .. } => prompt.as_deref(),
        }
    }
}

/// Value bound to a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatValue {
    Text(String),
    /// Expand the referencing template once per item with this role
    Expand { role: Role, items: Vec<ListItem> },
}

/// Tag name to value bindings for one render.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatArgs {
    values: HashMap<String, FormatValue>,
}

impl FormatArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, tag: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_text(tag, value);
        self
    }

    pub fn with_expansion(mut self, tag: impl Into<String>, role: Role, items: Vec<ListItem>) -> Self {
        self.set_expansion(tag, role, items);
        self
    }

    pub fn set_text(&mut self, tag: impl Into<String>, value: impl Into<String>) {
        self.values
            .insert(tag.into(), FormatValue::Text(value.into()));
    }

    pub fn set_expansion(&mut self, tag: impl Into<String>, role: Role, items: Vec<ListItem>) {
        self.values
            .insert(tag.into(), FormatValue::Expand { role, items });
    }

    pub fn get(&self, tag: &str) -> Option<&FormatValue> {
        self.values.get(tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.values.contains_key(tag)
    }

    pub fn remove(&mut self, tag: &str) -> Option<FormatValue> {
        self.values.remove(tag)
    }

    /// Scalar value of a tag, if it is bound to text.
    pub fn text(&self, tag: &str) -> Option<&str> {
        match self.values.get(tag) {
            Some(FormatValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn is_expandable(&self, tag: &str) -> bool {
        matches!(self.values.get(tag), Some(FormatValue::Expand { .. }))
    }
}
