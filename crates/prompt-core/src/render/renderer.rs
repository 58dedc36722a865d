//! Renders a template set into an ordered role/content message list.

use crate::message::{Message, Role};
use crate::render::args::{FormatArgs, FormatValue, ListItem};
use crate::render::template::{Slot, Template, TemplateSet};
use crate::render::RenderError;

/// Render `set` with `args`.
///
/// The result always ends with the main prompt as its only trailing `user`
/// message. System templates whose tags are not all bound are skipped, and
/// any message that renders blank is dropped.
pub fn render_messages(set: &TemplateSet, args: &FormatArgs) -> Result<Vec<Message>, RenderError> {
    let mut messages = Vec::new();

    for slot in set.slots() {
        match slot {
            Slot::System(template) => render_system(template, args, &mut messages)?,
            Slot::Exchange { user, assistant } => {
                render_exchange(user, assistant, args, &mut messages)?
            }
        }
    }

    messages.push(render_main(set.main(), args)?);
    Ok(messages)
}

/// The single expandable tag referenced by `templates`, if any.
fn expansion_tag<'a>(
    templates: &[&'a Template],
    args: &FormatArgs,
) -> Result<Option<&'a str>, RenderError> {
    let mut found: Vec<&'a str> = Vec::new();
    for template in templates.iter().copied() {
        for tag in template.tags() {
            if args.is_expandable(tag) && !found.contains(&tag) {
                found.push(tag);
            }
        }
    }

    match found.len() {
        0 => Ok(None),
        1 => Ok(Some(found[0])),
        _ => Err(RenderError::MultipleExpansions {
            template: templates
                .first()
                .map(|t| t.id().to_string())
                .unwrap_or_default(),
            tags: found.iter().map(|t| t.to_string()).collect(),
        }),
    }
}

fn scalar(args: &FormatArgs, tag: &str) -> Option<String> {
    args.text(tag).map(str::to_string)
}

fn render_system(
    template: &Template,
    args: &FormatArgs,
    out: &mut Vec<Message>,
) -> Result<(), RenderError> {
    if let Some(missing) = template.tags().into_iter().find(|tag| !args.contains(tag)) {
        tracing::debug!(
            "Skipping system template '{}': tag '{}' not provided",
            template.id(),
            missing
        );
        return Ok(());
    }

    match expansion_tag(&[template], args)? {
        Some(tag) => {
            let Some(FormatValue::Expand { role, items }) = args.get(tag) else {
                return Ok(());
            };
            for item in items {
                let Some(text) = item.as_text() else {
                    tracing::warn!(
                        "Skipping item without text for template '{}'",
                        template.id()
                    );
                    continue;
                };
                let content = template.render_with(|name| {
                    if name == tag {
                        Some(text.to_string())
                    } else {
                        scalar(args, name)
                    }
                });
                push_unless_blank(out, Message::new(*role, content));
            }
        }
        None => {
            let content = template.render_with(|name| scalar(args, name));
            push_unless_blank(out, Message::system(content));
        }
    }
    Ok(())
}

fn render_exchange(
    user: &Template,
    assistant: &Template,
    args: &FormatArgs,
    out: &mut Vec<Message>,
) -> Result<(), RenderError> {
    match expansion_tag(&[user, assistant], args)? {
        Some(tag) => {
            let Some(FormatValue::Expand { items, .. }) = args.get(tag) else {
                return Ok(());
            };
            for item in items {
                let (prompt, response) = match item {
                    ListItem::Exchange {
                        prompt: Some(prompt),
                        response: Some(response),
                    } => (prompt, response),
                    _ => {
                        tracing::warn!(
                            "Skipping training example for '{}': prompt or response missing",
                            user.id()
                        );
                        continue;
                    }
                };
                let user_text = user.render_with(|name| {
                    if name == tag {
                        Some(prompt.clone())
                    } else {
                        scalar(args, name)
                    }
                });
                let assistant_text = assistant.render_with(|name| {
                    if name == tag {
                        Some(response.clone())
                    } else {
                        scalar(args, name)
                    }
                });
                push_pair(out, user_text, assistant_text);
            }
        }
        None => {
            let user_text = user.render_with(|name| scalar(args, name));
            let assistant_text = assistant.render_with(|name| scalar(args, name));
            push_pair(out, user_text, assistant_text);
        }
    }
    Ok(())
}

fn render_main(template: &Template, args: &FormatArgs) -> Result<Message, RenderError> {
    let tag = expansion_tag(&[template], args)?;
    let content = template.render_with(|name| {
        if Some(name) == tag {
            match args.get(name) {
                Some(FormatValue::Expand { items, .. }) => Some(
                    items
                        .iter()
                        .filter_map(ListItem::as_text)
                        .collect::<Vec<_>>()
                        .join("\n"),
                ),
                _ => None,
            }
        } else {
            scalar(args, name)
        }
    });
    Ok(Message::new(Role::User, content))
}

fn push_unless_blank(out: &mut Vec<Message>, message: Message) {
    if !message.is_blank() {
        out.push(message);
    }
}

fn push_pair(out: &mut Vec<Message>, user: String, assistant: String) {
    if user.trim().is_empty() || assistant.trim().is_empty() {
        return;
    }
    out.push(Message::user(user));
    out.push(Message::assistant(assistant));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ends_with_main_prompt;
    use crate::render::template::{TemplateEntry, TemplateKind};

    fn set(entries: &[(TemplateKind, &str)]) -> TemplateSet {
        let entries: Vec<TemplateEntry> = entries
            .iter()
            .enumerate()
            .map(|(i, (kind, text))| TemplateEntry::new(*kind, format!("t{}", i), *text))
            .collect();
        TemplateSet::from_entries(&entries).expect("valid template set")
    }

    #[test]
    fn system_template_with_missing_tag_is_skipped() {
        let set = set(&[
            (TemplateKind::System, "Guidelines: {guidelines}"),
            (TemplateKind::System, "You are a code reviewer."),
            (TemplateKind::Main, "Review:\n{code}"),
        ]);
        let args = FormatArgs::new().with_text("code", "fn a() {}");

        let messages = render_messages(&set, &args).expect("render");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], Message::system("You are a code reviewer."));
        assert!(ends_with_main_prompt(&messages));
        assert_eq!(messages.iter().filter(|m| m.role == Role::User).count(), 1);
    }

    #[test]
    fn blank_render_is_dropped() {
        let set = set(&[
            (TemplateKind::System, "{summary}"),
            (TemplateKind::Main, "{code}"),
        ]);
        let args = FormatArgs::new().with_text("summary", "   ").with_text("code", "x");
        let messages = render_messages(&set, &args).expect("render");
        assert_eq!(messages, vec![Message::user("x")]);
    }

    #[test]
    fn main_missing_tag_renders_empty() {
        let set = set(&[(TemplateKind::Main, "Explain {code}{focus}")]);
        let args = FormatArgs::new().with_text("code", "x");
        let messages = render_messages(&set, &args).expect("render");
        assert_eq!(messages, vec![Message::user("Explain x")]);
    }

    #[test]
    fn expansion_fans_out_with_role() {
        let set = set(&[
            (TemplateKind::System, "Related file:\n{related}"),
            (TemplateKind::Main, "{code}"),
        ]);
        let args = FormatArgs::new()
            .with_expansion(
                "related",
                Role::System,
                vec![ListItem::Text("a.rs".into()), ListItem::Text("b.rs".into())],
            )
            .with_text("code", "x");

        let messages = render_messages(&set, &args).expect("render");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "Related file:\na.rs");
        assert_eq!(messages[1].content, "Related file:\nb.rs");
        assert_eq!(messages[1].role, Role::System);
    }

    #[test]
    fn exchange_expands_in_pairs_and_skips_incomplete_items() {
        let set = set(&[
            (TemplateKind::User, "Q: {training}"),
            (TemplateKind::Assistant, "A: {training}"),
            (TemplateKind::Main, "{code}"),
        ]);
        let args = FormatArgs::new()
            .with_expansion(
                "training",
                Role::User,
                vec![
                    ListItem::exchange("one", "uno"),
                    ListItem::Exchange {
                        prompt: Some("two".into()),
                        response: None,
                    },
                    ListItem::exchange("three", "tres"),
                ],
            )
            .with_text("code", "x");

        let messages = render_messages(&set, &args).expect("render");
        assert_eq!(
            messages,
            vec![
                Message::user("Q: one"),
                Message::assistant("A: uno"),
                Message::user("Q: three"),
                Message::assistant("A: tres"),
                Message::user("x"),
            ]
        );
    }

    #[test]
    fn expansion_in_main_is_newline_joined() {
        let set = set(&[(TemplateKind::Main, "Files:\n{files}")]);
        let args = FormatArgs::new().with_expansion(
            "files",
            Role::User,
            vec![ListItem::Text("a".into()), ListItem::Text("b".into())],
        );
        let messages = render_messages(&set, &args).expect("render");
        assert_eq!(messages, vec![Message::user("Files:\na\nb")]);
    }

    #[test]
    fn two_expandable_tags_fail_fast() {
        let set = set(&[
            (TemplateKind::System, "{a} {b}"),
            (TemplateKind::Main, "{code}"),
        ]);
        let args = FormatArgs::new()
            .with_expansion("a", Role::System, vec![ListItem::Text("1".into())])
            .with_expansion("b", Role::System, vec![ListItem::Text("2".into())])
            .with_text("code", "x");

        let err = render_messages(&set, &args).unwrap_err();
        assert!(matches!(err, RenderError::MultipleExpansions { .. }));
    }
}
