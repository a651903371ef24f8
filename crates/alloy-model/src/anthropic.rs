// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Anthropic Messages API driver.
//!
//! Translates the normalized block model to/from the native wire format:
//! system prompt as a top-level field, tool_use/tool_result content blocks,
//! and extended-thinking blocks whose `thinking` + `signature` round-trip
//! verbatim across turns.

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

pub struct AnthropicProvider {
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    fn build_body(
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": cfg.model,
            "messages": build_wire_messages(messages),
            "max_tokens": cfg.max_tokens.unwrap_or(4096),
            "stream": stream,
        });
        if let Some(t) = cfg.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(system) = &cfg.system_prompt {
            body["system"] = json!(system);
        }
        if !tools.is_empty() {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if let Some(budget) = cfg.thinking_budget_tokens {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
        }
        if let Some(extra) = cfg.driver_options.as_object() {
            for (k, v) in extra {
                body[k] = v.clone();
            }
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
        let key = resolve_api_key(cfg, Some("ANTHROPIC_API_KEY"))
            .ok_or_else(|| ProviderError::new("ANTHROPIC_API_KEY not set"))?;
        let base = cfg
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com");
        let body = Self::build_body(messages, tools, cfg, stream);

        debug!(model = %cfg.model, stream, "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", base.trim_end_matches('/')))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
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

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        "anthropic"
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
            .map_err(|e| ProviderError::new(format!("anthropic response decode failed: {e}")))?;
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
                .scan(String::new(), |buf, chunk| {
                    let out: Vec<Result<ProviderEvent, ProviderError>> = match chunk {
                        Ok(b) => sse::feed(buf, &String::from_utf8_lossy(&b))
                            .iter()
                            .filter_map(parse_stream_event)
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

/// Parse one SSE event into a normalized [`ProviderEvent`].
///
/// Returns `None` for events that carry nothing the fold needs
/// (content_block_stop, ping, text block starts).
pub(crate) fn parse_stream_event(
    ev: &sse::SseEvent,
) -> Option<Result<ProviderEvent, ProviderError>> {
    let v: Value = match serde_json::from_str(&ev.data) {
        Ok(v) => v,
        Err(_) => return None,
    };
    if v["type"].as_str() == Some("error") {
        return Some(Err(ProviderError::new(format!(
            "anthropic stream error: {}",
            v["error"]
        ))));
    }
    parse_event(&v).map(Ok)
}

pub(crate) fn parse_event(v: &Value) -> Option<ProviderEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let usage = v["message"].get("usage")?;
            Some(ProviderEvent::Usage(Usage {
                input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
                cache_read_input_tokens: usage["cache_read_input_tokens"]
                    .as_u64()
                    .unwrap_or(0),
                cache_creation_input_tokens: usage["cache_creation_input_tokens"]
                    .as_u64()
                    .unwrap_or(0),
                ..Usage::default()
            }))
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                Some(ProviderEvent::ToolUseDelta {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                })
            } else {
                None
            }
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => Some(ProviderEvent::TextDelta(
                    delta["text"].as_str().unwrap_or("").to_string(),
                )),
                "input_json_delta" => Some(ProviderEvent::ToolUseDelta {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }),
                "thinking_delta" => Some(ProviderEvent::ThinkingDelta(
                    delta["thinking"].as_str().unwrap_or("").to_string(),
                )),
                "signature_delta" => Some(ProviderEvent::SignatureDelta(
                    delta["signature"].as_str().unwrap_or("").to_string(),
                )),
                _ => None,
            }
        }
        "message_delta" => v.get("usage").map(|usage| {
            ProviderEvent::Usage(Usage {
                output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
                ..Usage::default()
            })
        }),
        "message_stop" => Some(ProviderEvent::Done),
        _ => None,
    }
}

/// Decode a non-streaming response body.
fn parse_response_body(v: &Value) -> Result<Completion, ProviderError> {
    let mut blocks: Vec<ContentBlock> = Vec::new();
    for block in v["content"].as_array().into_iter().flatten() {
        match block["type"].as_str().unwrap_or("") {
            "text" => blocks.push(ContentBlock::text(block["text"].as_str().unwrap_or(""))),
            "tool_use" => {
                let input = block["input"]
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                blocks.push(ContentBlock::ToolUse {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    input,
                });
            }
            "thinking" => blocks.push(ContentBlock::Thinking {
                thinking: block["thinking"].as_str().unwrap_or("").to_string(),
                signature: block["signature"].as_str().unwrap_or("").to_string(),
            }),
            _ => {}
        }
    }
    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }
    let usage = &v["usage"];
    let stop_reason = if v["stop_reason"].as_str() == Some("tool_use") {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    };
    Ok(Completion {
        stop_reason,
        messages: vec![Message::assistant_blocks(blocks)],
        usage: Usage {
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
            cache_read_input_tokens: usage["cache_read_input_tokens"].as_u64().unwrap_or(0),
            cache_creation_input_tokens: usage["cache_creation_input_tokens"]
                .as_u64()
                .unwrap_or(0),
            ..Usage::default()
        },
    })
}

/// Convert normalized messages to the Anthropic wire format.
///
/// Thinking blocks are re-submitted verbatim (text + signature) so the
/// provider can verify integrity. Media blocks without a native mapping are
/// downgraded to a text notice rather than dropped.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content: Value = match &m.content {
                MessageContent::Text(t) => json!(t),
                MessageContent::Blocks(blocks) => {
                    let arr: Vec<Value> = blocks.iter().map(block_to_wire).collect();
                    json!(arr)
                }
            };
            json!({ "role": role, "content": content })
        })
        .collect()
}

fn block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult { tool_use_id, content, is_error } => {
            let mut v = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if is_error.unwrap_or(false) {
                v["is_error"] = json!(true);
            }
            v
        }
        ContentBlock::Thinking { thinking, signature } => json!({
            "type": "thinking",
            "thinking": thinking,
            "signature": signature,
        }),
        ContentBlock::Image { mime_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime_type, "data": data },
        }),
        ContentBlock::Audio { mime_type, .. } | ContentBlock::Video { mime_type, .. } => {
            json!({ "type": "text", "text": format!("[unsupported media attachment: {mime_type}]") })
        }
        ContentBlock::Document { mime_type, uri } => {
            json!({ "type": "text", "text": format!("[document: {uri} ({mime_type})]") })
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
