// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tracing::warn;

use alloy_config::ProviderConfig;

use crate::{
    error::ProviderError,
    types::{Completion, ContentBlock, Message, StopReason, StreamEvent, ToolDef, Usage},
};

/// Text-delta callback invoked for every streamed text chunk.
pub type ChunkFn = dyn Fn(&str) + Send + Sync;
/// Tagged-event callback for consumers that want more than text deltas.
pub type EventFn = dyn Fn(StreamEvent) + Send + Sync;

/// Capability interface every model driver implements.
///
/// Both calls return the same folded [`Completion`]; `stream` additionally
/// delivers deltas through the callbacks while the response is in flight.
/// Drivers never retry — the turn loop owns retry policy.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Driver id for status display and registry lookup.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
    ) -> Result<Completion, ProviderError>;

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
        on_chunk: &ChunkFn,
        on_event: Option<&EventFn>,
    ) -> Result<Completion, ProviderError>;
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// A single normalized event inside a driver's response stream.
///
/// Drivers translate their wire format into this shape; [`fold_events`]
/// assembles the final [`Completion`] from the sequence.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta(String),
    ThinkingDelta(String),
    /// Opaque integrity signature for the current thinking block. Carried so
    /// the assembled Thinking block round-trips verbatim.
    SignatureDelta(String),
    /// Tool-call fragment. `index` routes accumulation when a provider
    /// interleaves parallel calls; id/name arrive once, arguments may arrive
    /// across many deltas.
    ToolUseDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    Done,
}

pub type EventStream =
    Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

struct PendingToolUse {
    id: String,
    name: String,
    args_buf: String,
}

/// Fold a driver event stream into a [`Completion`], forwarding deltas to the
/// optional callbacks as they arrive.
///
/// Thinking deltas go to `on_event` only; text deltas go to `on_chunk` (the
/// turn loop wraps that callback to mirror text onto `on_event` uniformly).
pub(crate) async fn fold_events(
    mut stream: EventStream,
    on_chunk: Option<&ChunkFn>,
    on_event: Option<&EventFn>,
) -> Result<Completion, ProviderError> {
    let mut text = String::new();
    let mut thinking = String::new();
    let mut signature = String::new();
    let mut pending: HashMap<u32, PendingToolUse> = HashMap::new();
    let mut usage = Usage::default();

    while let Some(event) = stream.next().await {
        match event? {
            ProviderEvent::TextDelta(delta) if !delta.is_empty() => {
                if let Some(chunk) = on_chunk {
                    chunk(&delta);
                }
                text.push_str(&delta);
            }
            ProviderEvent::TextDelta(_) => {}
            ProviderEvent::ThinkingDelta(delta) if !delta.is_empty() => {
                if let Some(events) = on_event {
                    events(StreamEvent::ThinkingDelta(delta.clone()));
                }
                thinking.push_str(&delta);
            }
            ProviderEvent::ThinkingDelta(_) => {}
            ProviderEvent::SignatureDelta(sig) => signature.push_str(&sig),
            ProviderEvent::ToolUseDelta { index, id, name, arguments } => {
                let entry = pending.entry(index).or_insert_with(|| PendingToolUse {
                    id: String::new(),
                    name: String::new(),
                    args_buf: String::new(),
                });
                if !id.is_empty() {
                    entry.id = id;
                }
                if !name.is_empty() {
                    entry.name = name;
                }
                entry.args_buf.push_str(&arguments);
            }
            ProviderEvent::Usage(u) => usage = usage.merge(&u),
            ProviderEvent::Done => break,
        }
    }

    let mut blocks: Vec<ContentBlock> = Vec::new();
    if !thinking.is_empty() {
        blocks.push(ContentBlock::Thinking { thinking, signature });
    }
    if !text.is_empty() {
        blocks.push(ContentBlock::Text { text });
    }

    let mut pending_sorted: Vec<(u32, PendingToolUse)> = pending.into_iter().collect();
    pending_sorted.sort_by_key(|(idx, _)| *idx);
    for (_, ptc) in pending_sorted {
        if ptc.name.is_empty() {
            warn!(tool_use_id = %ptc.id, "dropping tool call with empty name from model");
            continue;
        }
        let input = if ptc.args_buf.trim().is_empty() {
            serde_json::Map::new()
        } else {
            match serde_json::from_str::<serde_json::Value>(&ptc.args_buf) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(other) => {
                    return Err(ProviderError::new(format!(
                        "invalid tool-call arguments JSON for {}: expected object, got {other}",
                        ptc.name
                    )));
                }
                Err(e) => {
                    return Err(ProviderError::new(format!(
                        "invalid tool-call arguments JSON for {}: {e}",
                        ptc.name
                    )));
                }
            }
        };
        blocks.push(ContentBlock::ToolUse { id: ptc.id, name: ptc.name, input });
    }

    let stop_reason = if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })) {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    };
    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }

    Ok(Completion {
        stop_reason,
        messages: vec![Message::assistant_blocks(blocks)],
        usage,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
