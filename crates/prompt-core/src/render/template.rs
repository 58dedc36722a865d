//! Template parsing and the validated template set.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::render::RenderError;

/// Role a template plays in the rendered conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    Main,
    System,
    User,
    Assistant,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKind::Main => "main",
            TemplateKind::System => "system",
            TemplateKind::User => "user",
            TemplateKind::Assistant => "assistant",
        }
    }
}

impl FromStr for TemplateKind {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "main" => Ok(TemplateKind::Main),
            "system" => Ok(TemplateKind::System),
            "user" => Ok(TemplateKind::User),
            "assistant" => Ok(TemplateKind::Assistant),
            other => Err(RenderError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Tag(String),
}

/// A parsed template with `{tag}` placeholders.
///
/// `{{` and `}}` render as literal braces. A brace pair whose content is not a
/// plain identifier is kept as literal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    id: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(id: impl Into<String>, text: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let rest = &text[pos + 1..];
                    match rest.find('}') {
                        Some(end) if is_tag_name(&rest[..end]) => {
                            if !literal.is_empty() {
                                segments.push(Segment::Literal(std::mem::take(&mut literal)));
                            }
                            segments.push(Segment::Tag(rest[..end].to_string()));
                            // skip the tag name and the closing brace
                            for _ in 0..rest[..end].chars().count() + 1 {
                                chars.next();
                            }
                        }
                        _ => literal.push('{'),
                    }
                }
                other => literal.push(other),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self {
            id: id.into(),
            segments,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tags referenced by the template, in order of first appearance.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Tag(name) = segment {
                if !tags.contains(&name.as_str()) {
                    tags.push(name);
                }
            }
        }
        tags
    }

    pub fn references(&self, tag: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Tag(name) if name == tag))
    }

    /// Render with a resolver; unresolved tags become empty strings.
    pub fn render_with<F>(&self, mut resolve: F) -> String
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Tag(name) => {
                    if let Some(value) = resolve(name) {
                        out.push_str(&value);
                    }
                }
            }
        }
        out
    }
}

fn is_tag_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One raw template as stored: its kind, id and text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TemplateEntry {
    pub kind: TemplateKind,
    pub id: String,
    pub text: String,
}

impl TemplateEntry {
    pub fn new(kind: TemplateKind, id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Non-main position in a template set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    /// A background `system` message
    System(Template),
    /// A `user` template immediately followed by its `assistant` template
    Exchange { user: Template, assistant: Template },
}

/// Validated, ordered template set: zero or more slots, then exactly one main.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSet {
    slots: Vec<Slot>,
    main: Template,
}

impl TemplateSet {
    pub fn from_entries(entries: &[TemplateEntry]) -> Result<Self, RenderError> {
        let mut slots = Vec::new();
        let mut main = None;
        let mut iter = entries.iter().peekable();

        while let Some(entry) = iter.next() {
            if main.is_some() {
                return Err(RenderError::MainNotLast {
                    id: entry.id.clone(),
                });
            }
            match entry.kind {
                TemplateKind::Main => main = Some(Template::parse(&entry.id, &entry.text)),
                TemplateKind::System => {
                    slots.push(Slot::System(Template::parse(&entry.id, &entry.text)))
                }
                TemplateKind::User => match iter.next() {
                    Some(next) if next.kind == TemplateKind::Assistant => {
                        slots.push(Slot::Exchange {
                            user: Template::parse(&entry.id, &entry.text),
                            assistant: Template::parse(&next.id, &next.text),
                        });
                    }
                    _ => {
                        return Err(RenderError::UnpairedExchange {
                            id: entry.id.clone(),
                        })
                    }
                },
                TemplateKind::Assistant => {
                    return Err(RenderError::UnpairedExchange {
                        id: entry.id.clone(),
                    })
                }
            }
        }

        let main = main.ok_or(RenderError::MissingMain)?;
        Ok(Self { slots, main })
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn main(&self) -> &Template {
        &self.main
    }

    /// Whether any template in the set references `tag`.
    pub fn references(&self, tag: &str) -> bool {
        self.main.references(tag)
            || self.slots.iter().any(|slot| match slot {
                Slot::System(t) => t.references(tag),
                Slot::Exchange { user, assistant } => {
                    user.references(tag) || assistant.references(tag)
                }
            })
    }
}
