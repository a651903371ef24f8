// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context compaction.
//!
//! Token use is estimated as characters / 4 across all message content. When
//! the estimate crosses the configured fraction of the budget, the oldest
//! contiguous prefix is replaced with a single synthesized assistant summary.
//! The split never separates a tool_use from its tool_result, the most
//! recent user message survives intact, and compaction is a no-op once the
//! estimate is back under the threshold.

use alloy_model::{ContentBlock, Message, MessageContent, Role};
use tracing::debug;

use crate::state::AgentState;

/// Per-message cap on summary lines (in characters).
const SUMMARY_LINE_CHARS: usize = 160;

/// Compact `state.messages` if the estimate has crossed the threshold.
/// Returns true when a compaction happened.
pub fn maybe_compact(state: &mut AgentState) -> bool {
    let settings = &state.config.settings;
    if settings.max_tokens == 0 {
        return false;
    }
    let threshold = (settings.max_tokens as f32 * settings.compaction_threshold) as usize;
    let estimate = state.approx_tokens();
    if estimate < threshold {
        return false;
    }
    let before = estimate;
    let compacted = compact_messages(&mut state.messages, settings.compaction_keep_recent);
    if compacted {
        debug!(
            tokens_before = before,
            tokens_after = state.approx_tokens(),
            "context compacted"
        );
    }
    compacted
}

/// Replace the oldest prefix with a summary, keeping at least `keep_recent`
/// trailing messages plus everything needed to keep tool pairs whole.
pub fn compact_messages(messages: &mut Vec<Message>, keep_recent: usize) -> bool {
    if messages.len() <= keep_recent.max(1) + 1 {
        return false;
    }
    let mut split = messages.len() - keep_recent.max(1);

    // The most recent user message always survives verbatim.
    if let Some(last_user) = messages.iter().rposition(|m| m.role == Role::User) {
        split = split.min(last_user);
    }

    // Walk the split backward until the kept tail no longer begins inside a
    // tool interaction: a tail starting with a tool_result would reference a
    // tool_use that was summarized away, which providers reject.
    while split > 0 && is_tool_linked(&messages[split]) {
        split -= 1;
    }
    if split == 0 {
        return false;
    }

    let summary = summarize(&messages[..split]);
    let tail = messages.split_off(split);
    messages.clear();
    messages.push(summary);
    messages.extend(tail);
    true
}

fn is_tool_linked(m: &Message) -> bool {
    match &m.content {
        MessageContent::Blocks(blocks) => blocks.iter().any(|b| {
            matches!(b, ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. })
        }),
        _ => false,
    }
}

/// Deterministic digest of the summarized prefix: one condensed line per
/// message, each capped so the summary itself stays small.
fn summarize(prefix: &[Message]) -> Message {
    let lines: Vec<String> = prefix
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            format!("{role}: {}", condense(m))
        })
        .collect();
    Message::assistant(format!(
        "[Summary of {} earlier messages]\n{}",
        prefix.len(),
        lines.join("\n")
    ))
}

fn condense(m: &Message) -> String {
    let text = match &m.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.clone(),
                ContentBlock::ToolUse { name, .. } => format!("[tool_use {name}]"),
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    format!("[tool_result {tool_use_id}: {}]", cap(content, 80))
                }
                ContentBlock::Thinking { .. } => "[thinking]".into(),
                ContentBlock::Image { mime_type, .. }
                | ContentBlock::Audio { mime_type, .. }
                | ContentBlock::Video { mime_type, .. } => format!("[{mime_type}]"),
                ContentBlock::Document { uri, .. } => format!("[document {uri}]"),
            })
            .collect::<Vec<_>>()
            .join(" "),
    };
    cap(&text, SUMMARY_LINE_CHARS)
}

fn cap(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
