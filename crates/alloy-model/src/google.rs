// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Google Gemini driver — Generative Language API.
//!
//! Uses `generateContent` / `streamGenerateContent?alt=sse`. The streaming
//! endpoint sends full text snapshots rather than deltas, so this driver
//! emits the suffix beyond the previously seen snapshot length (O(1) per
//! event, no prefix comparison).
//!
//! Gemini matches `functionResponse` parts to `functionCall`s by function
//! name, not by an opaque id, so tool_use ids are synthesized locally and a
//! id → name map is rebuilt when serializing history.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use alloy_config::ProviderConfig;

use crate::{
    error::ProviderError,
    provider::{fold_events, ChunkFn, EventFn, EventStream, Provider, ProviderEvent},
    registry::resolve_api_key,
    sse,
    types::{Completion, ContentBlock, Message, MessageContent, Role, StopReason, ToolDef, Usage},
};

pub struct GoogleProvider {
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    fn build_body(messages: &[Message], tools: &[ToolDef], cfg: &ProviderConfig) -> Value {
        let mut body = json!({
            "contents": build_wire_contents(messages),
            "generationConfig": {
                "maxOutputTokens": cfg.max_tokens.unwrap_or(8192),
            }
        });
        if let Some(t) = cfg.temperature {
            body["generationConfig"]["temperature"] = json!(t);
        }
        if let Some(system) = &cfg.system_prompt {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        if !tools.is_empty() {
            let decls: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
        }
        body
    }

    async fn send(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let key = resolve_api_key(cfg, Some("GEMINI_API_KEY"))
            .ok_or_else(|| ProviderError::new("GEMINI_API_KEY not set"))?;
        let base = cfg
            .base_url
            .as_deref()
            .unwrap_or("https://generativelanguage.googleapis.com");
        let method = if stream { "streamGenerateContent?alt=sse&" } else { "generateContent?" };
        let url = format!(
            "{}/v1beta/models/{}:{}key={}",
            base.trim_end_matches('/'),
            cfg.model,
            method,
            key
        );

        debug!(model = %cfg.model, stream, "sending google gemini request");

        let resp = self
            .client
            .post(&url)
            .json(&Self::build_body(messages, tools, cfg))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::http(status, &text));
        }
        Ok(resp)
    }
}

impl Default for GoogleProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    fn name(&self) -> &str {
        "google"
    }

    fn model_name(&self) -> &str {
        "google"
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
    ) -> Result<Completion, ProviderError> {
        let resp = self.send(messages, tools, cfg, false).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::new(format!("google response decode failed: {e}")))?;
        parse_response_body(&body)
    }

    async fn stream(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
        on_chunk: &ChunkFn,
        on_event: Option<&EventFn>,
    ) -> Result<Completion, ProviderError> {
        let resp = self.send(messages, tools, cfg, true).await?;
        let events: EventStream = Box::pin(
            resp.bytes_stream()
                .scan(SnapshotState::default(), |state, chunk| {
                    let out: Vec<Result<ProviderEvent, ProviderError>> = match chunk {
                        Ok(b) => sse::feed(&mut state.buf, &String::from_utf8_lossy(&b))
                            .iter()
                            .flat_map(|ev| state.parse_data(&ev.data))
                            .collect(),
                        Err(e) => vec![Err(ProviderError::from(e))],
                    };
                    std::future::ready(Some(out))
                })
                .flat_map(futures::stream::iter),
        );
        fold_events(events, Some(on_chunk), on_event).await
    }
}

/// Per-stream state for snapshot-to-delta conversion.
#[derive(Default)]
struct SnapshotState {
    buf: String,
    /// Characters of answer text already emitted.
    text_seen: usize,
    /// Characters of thinking text already emitted.
    thought_seen: usize,
    /// Index assigned to the next functionCall part.
    next_fn_index: u32,
}

impl SnapshotState {
    fn parse_data(&mut self, data: &str) -> Vec<Result<ProviderEvent, ProviderError>> {
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return vec![],
        };
        let mut events = Vec::new();

        if let Some(meta) = v.get("usageMetadata") {
            events.push(Ok(ProviderEvent::Usage(Usage {
                input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
                output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
                cache_read_input_tokens: meta["cachedContentTokenCount"].as_u64().unwrap_or(0),
                ..Usage::default()
            })));
        }

        let candidate = &v["candidates"][0];
        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(fc) = part.get("functionCall") {
                let name = fc["name"].as_str().unwrap_or("").to_string();
                let index = self.next_fn_index;
                self.next_fn_index += 1;
                events.push(Ok(ProviderEvent::ToolUseDelta {
                    index,
                    id: format!("{name}-{index}"),
                    name,
                    arguments: serde_json::to_string(&fc["args"]).unwrap_or_default(),
                }));
                continue;
            }
            if let Some(text) = part["text"].as_str() {
                // Snapshot semantics: each part carries the full text so far;
                // emit only the suffix beyond what has been seen.
                let is_thought = part.get("thought").and_then(|t| t.as_bool()) == Some(true);
                let seen = if is_thought { &mut self.thought_seen } else { &mut self.text_seen };
                if text.len() > *seen {
                    let delta = text[*seen..].to_string();
                    *seen = text.len();
                    events.push(Ok(if is_thought {
                        ProviderEvent::ThinkingDelta(delta)
                    } else {
                        ProviderEvent::TextDelta(delta)
                    }));
                }
            }
        }

        if candidate["finishReason"].as_str().is_some() {
            events.push(Ok(ProviderEvent::Done));
        }
        events
    }
}

/// Decode a non-streaming response body.
fn parse_response_body(v: &Value) -> Result<Completion, ProviderError> {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    let mut fn_index = 0u32;
    for part in v["candidates"][0]["content"]["parts"]
        .as_array()
        .into_iter()
        .flatten()
    {
        if let Some(fc) = part.get("functionCall") {
            let name = fc["name"].as_str().unwrap_or("").to_string();
            let input = fc["args"].as_object().cloned().unwrap_or_default();
            blocks.push(ContentBlock::ToolUse {
                id: format!("{name}-{fn_index}"),
                name,
                input,
            });
            fn_index += 1;
        } else if let Some(text) = part["text"].as_str() {
            if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                blocks.push(ContentBlock::Thinking {
                    thinking: text.to_string(),
                    signature: String::new(),
                });
            } else {
                blocks.push(ContentBlock::text(text));
            }
        }
    }
    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }
    let stop_reason = if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })) {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    };
    let meta = &v["usageMetadata"];
    Ok(Completion {
        stop_reason,
        messages: vec![Message::assistant_blocks(blocks)],
        usage: Usage {
            input_tokens: meta["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: meta["candidatesTokenCount"].as_u64().unwrap_or(0),
            ..Usage::default()
        },
    })
}

/// Convert normalized messages to the Gemini `contents` array.
pub(crate) fn build_wire_contents(messages: &[Message]) -> Vec<Value> {
    // functionResponse must carry the function *name*; rebuild the id → name
    // map from the tool_use blocks earlier in the conversation.
    let mut fn_names: HashMap<String, String> = HashMap::new();
    for m in messages {
        if let MessageContent::Blocks(blocks) = &m.content {
            for b in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = b {
                    fn_names.insert(id.clone(), name.clone());
                }
            }
        }
    }

    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "model",
            };
            let parts: Vec<Value> = match &m.content {
                MessageContent::Text(t) => vec![json!({ "text": t })],
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| block_to_part(b, &fn_names))
                    .collect(),
            };
            json!({ "role": role, "parts": parts })
        })
        .collect()
}

fn block_to_part(block: &ContentBlock, fn_names: &HashMap<String, String>) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({ "text": text })),
        ContentBlock::ToolUse { name, input, .. } => Some(json!({
            "functionCall": { "name": name, "args": input }
        })),
        ContentBlock::ToolResult { tool_use_id, content, .. } => {
            let name = fn_names
                .get(tool_use_id)
                .map(|s| s.as_str())
                .unwrap_or(tool_use_id.as_str());
            Some(json!({
                "functionResponse": {
                    "name": name,
                    "response": { "output": content },
                }
            }))
        }
        // No resubmission slot for reasoning on this wire.
        ContentBlock::Thinking { .. } => None,
        ContentBlock::Image { mime_type, data }
        | ContentBlock::Audio { mime_type, data }
        | ContentBlock::Video { mime_type, data } => Some(json!({
            "inline_data": { "mime_type": mime_type, "data": data }
        })),
        ContentBlock::Document { uri, .. } => {
            Some(json!({ "file_data": { "file_uri": uri } }))
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
