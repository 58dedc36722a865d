//! Proportional truncation of background content.
//!
//! Fits the messages between the first and the last (the main prompt) into
//! the system buffer. Messages are grouped into system singletons and
//! user+assistant training pairs; each group receives a share of the budget
//! proportional to its size, smallest groups first, and a group over its share
//! keeps its leading tokens.

use serde::{Deserialize, Serialize};

use crate::budget::{TokenBudget, TokenCounter, MESSAGE_OVERHEAD};
use crate::message::{Message, Role};

/// Tuning for the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OptimizerSettings {
    /// Smallest share a group receives while the conversation is short
    pub min_token_quota: u32,
    /// Above this many messages the minimum share no longer applies
    pub quota_waiver_threshold: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            min_token_quota: 250,
            quota_waiver_threshold: 5,
        }
    }
}

/// What the optimizer removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizeReport {
    pub truncated_system_tokens: u32,
    pub truncated_training_tokens: u32,
    pub discarded_messages: usize,
}

impl OptimizeReport {
    pub fn truncated(&self) -> bool {
        self.discarded_tokens() > 0 || self.discarded_messages > 0
    }

    pub fn discarded_tokens(&self) -> u32 {
        self.truncated_system_tokens
            .saturating_add(self.truncated_training_tokens)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    System,
    Training,
}

#[derive(Debug)]
struct Group {
    kind: GroupKind,
    /// Indices into the message list
    members: Vec<usize>,
    sizes: Vec<u32>,
}

impl Group {
    fn size(&self) -> u32 {
        self.sizes.iter().sum()
    }
}

/// Optimized messages plus a report of what was cut.
#[derive(Debug, Clone)]
pub struct Optimized {
    pub messages: Vec<Message>,
    pub report: OptimizeReport,
}

/// Fit `messages` into `budget.system_buffer`.
///
/// The first and last messages are never modified.
pub fn optimize(
    messages: Vec<Message>,
    budget: &TokenBudget,
    counter: &TokenCounter,
    settings: &OptimizerSettings,
) -> Optimized {
    if messages.len() <= 2 {
        return Optimized {
            messages,
            report: OptimizeReport::default(),
        };
    }

    let first_cost = match messages.first() {
        Some(first) if first.role == Role::System => counter.count_message(first),
        _ => 0,
    };
    let available = budget.system_buffer.saturating_sub(first_cost);

    let groups = group_messages(&messages, counter);
    let total: u32 = groups.iter().map(Group::size).sum();

    if total <= available {
        return Optimized {
            messages,
            report: OptimizeReport::default(),
        };
    }

    tracing::debug!(
        "Optimizing {} groups ({} tokens) into {} tokens",
        groups.len(),
        total,
        available
    );

    let mut order: Vec<usize> = (0..groups.len()).collect();
    order.sort_by_key(|&i| groups[i].size());

    let apply_floor = messages.len() <= settings.quota_waiver_threshold;
    let mut remaining_budget = available as u64;
    let mut remaining_size = total as u64;
    let mut contents: Vec<Option<String>> = messages.iter().map(|m| Some(m.content.clone())).collect();
    let mut report = OptimizeReport::default();

    for index in order {
        let group = &groups[index];
        let size = group.size() as u64;
        let mut quota = if remaining_size == 0 {
            0
        } else {
            remaining_budget * size / remaining_size
        };
        if apply_floor {
            quota = quota.max((settings.min_token_quota as u64).min(remaining_budget));
        }
        remaining_size -= size;

        if size <= quota {
            remaining_budget -= size;
            continue;
        }

        let spent = truncate_group(group, quota as u32, &messages, counter, &mut contents);
        remaining_budget = remaining_budget.saturating_sub(spent as u64);

        let cut = (size as u32).saturating_sub(spent);
        match group.kind {
            GroupKind::System => report.truncated_system_tokens += cut,
            GroupKind::Training => report.truncated_training_tokens += cut,
        }
    }

    let mut optimized = Vec::with_capacity(messages.len());
    for (message, content) in messages.into_iter().zip(contents) {
        match content {
            Some(content) => optimized.push(Message::new(message.role, content)),
            None => report.discarded_messages += 1,
        }
    }

    tracing::debug!(
        "Optimizer cut {} system and {} training tokens, dropped {} messages",
        report.truncated_system_tokens,
        report.truncated_training_tokens,
        report.discarded_messages
    );

    Optimized {
        messages: optimized,
        report,
    }
}

fn group_messages(messages: &[Message], counter: &TokenCounter) -> Vec<Group> {
    let last = messages.len() - 1;
    let mut groups = Vec::new();
    let mut i = 1;

    while i < last {
        let message = &messages[i];
        let pairs_with_next = message.role == Role::User
            && i + 1 < last
            && messages[i + 1].role == Role::Assistant;

        if pairs_with_next {
            groups.push(Group {
                kind: GroupKind::Training,
                members: vec![i, i + 1],
                sizes: vec![
                    counter.count_message(message),
                    counter.count_message(&messages[i + 1]),
                ],
            });
            i += 2;
        } else {
            let kind = if message.role == Role::System {
                GroupKind::System
            } else {
                GroupKind::Training
            };
            groups.push(Group {
                kind,
                members: vec![i],
                sizes: vec![counter.count_message(message)],
            });
            i += 1;
        }
    }
    groups
}

/// Truncate a group to `quota`, splitting a pair's share proportionally.
/// Returns the tokens the group still occupies.
fn truncate_group(
    group: &Group,
    quota: u32,
    messages: &[Message],
    counter: &TokenCounter,
    contents: &mut [Option<String>],
) -> u32 {
    let size = group.size().max(1) as u64;
    let mut shares: Vec<u32> = group
        .sizes
        .iter()
        .map(|s| (quota as u64 * *s as u64 / size) as u32)
        .collect();
    // hand the rounding remainder to the last member
    let assigned: u32 = shares.iter().sum();
    if let Some(last) = shares.last_mut() {
        *last += quota.saturating_sub(assigned);
    }

    let mut kept = Vec::with_capacity(group.members.len());
    for (&index, &share) in group.members.iter().zip(&shares) {
        let limit = share.saturating_sub(MESSAGE_OVERHEAD);
        let text = counter.truncate_to(&messages[index].content, limit);
        kept.push(text);
    }

    // a pair survives together or not at all
    if kept.iter().any(|t| t.trim().is_empty()) {
        for &index in &group.members {
            contents[index] = None;
        }
        return 0;
    }

    let mut spent = 0;
    for (&index, text) in group.members.iter().zip(kept) {
        spent += counter.count(&text) + MESSAGE_OVERHEAD;
        contents[index] = Some(text);
    }
    spent
}
