//! Message rendering from templates.
//!
//! - [`template`]: `{tag}` parsing and the validated `TemplateSet`
//! - [`args`]: `FormatArgs` bindings, including expandable lists
//! - [`renderer`]: template set + args to an ordered message list
//! - [`store`]: `TemplateStore` with explicit change-driven reload

pub mod args;
pub mod renderer;
pub mod store;
pub mod template;

use thiserror::Error;

pub use args::{FormatArgs, FormatValue, ListItem};
pub use renderer::render_messages;
pub use store::{DirectorySource, MemorySource, TemplateSource, TemplateStore};
pub use template::{Slot, Template, TemplateEntry, TemplateKind, TemplateSet};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template set has no main template")]
    MissingMain,

    #[error("Main template must be last, found '{id}' after it")]
    MainNotLast { id: String },

    #[error("Template '{id}' must be a user template immediately followed by an assistant template")]
    UnpairedExchange { id: String },

    #[error("Unknown template kind: {0}")]
    UnknownKind(String),

    #[error("Template '{template}' references more than one expandable tag: {tags:?}")]
    MultipleExpansions { template: String, tags: Vec<String> },

    #[error("Failed to read template '{id}': {message}")]
    Source { id: String, message: String },
}
