// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared driver for OpenAI-compatible chat completion APIs.
//!
//! Several providers speak the same `/chat/completions` SSE wire format
//! (OpenAI, OpenRouter, Ollama, LM Studio, …). This module implements it
//! once; the registry configures each driver id with its own base URL and
//! auth style.
//!
//! # Wire mapping
//! - The system prompt becomes a synthetic `system` message at index 0.
//! - All tool_use blocks of one assistant message become one `tool_calls`
//!   array; each tool_result block becomes its own `tool` role message.
//! - Inbound `reasoning_content` / `reasoning` deltas map to thinking deltas.

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

/// How to attach the API key to HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — hosted providers.
    Bearer,
    /// No authentication — local servers (Ollama, LM Studio).
    None,
}

pub struct OpenAiCompatProvider {
    driver_name: &'static str,
    default_base_url: &'static str,
    default_api_key_env: Option<&'static str>,
    auth_style: AuthStyle,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        driver_name: &'static str,
        default_base_url: &'static str,
        default_api_key_env: Option<&'static str>,
        auth_style: AuthStyle,
    ) -> Self {
        Self {
            driver_name,
            default_base_url,
            default_api_key_env,
            auth_style,
            client: reqwest::Client::new(),
        }
    }

    /// The stock OpenAI endpoint.
    pub fn openai() -> Self {
        Self::new("openai", "https://api.openai.com/v1", Some("OPENAI_API_KEY"), AuthStyle::Bearer)
    }

    fn build_body(
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
        stream: bool,
    ) -> Value {
        let mut wire = Vec::new();
        if let Some(system) = &cfg.system_prompt {
            wire.push(json!({ "role": "system", "content": system }));
        }
        wire.extend(build_wire_messages(messages));

        let mut body = json!({
            "model": cfg.model,
            "messages": wire,
            "stream": stream,
            "max_tokens": cfg.max_tokens.unwrap_or(4096),
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(t) = cfg.temperature {
            body["temperature"] = json!(t);
        }
        if !tools.is_empty() {
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
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
        let base = cfg.base_url.as_deref().unwrap_or(self.default_base_url);
        let url = format!("{}/chat/completions", base.trim_end_matches('/'));
        let body = Self::build_body(messages, tools, cfg, stream);

        debug!(driver = %self.driver_name, model = %cfg.model, stream, "sending completion request");

        let mut req = self.client.post(&url).json(&body);
        if self.auth_style == AuthStyle::Bearer {
            let key = resolve_api_key(cfg, self.default_api_key_env).ok_or_else(|| {
                ProviderError::new(format!(
                    "API key not set for {}; provide api_key or api_key_env in config",
                    self.driver_name
                ))
            })?;
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::http(status, &text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        self.driver_name
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolDef],
        cfg: &ProviderConfig,
    ) -> Result<Completion, ProviderError> {
        let resp = self.send(messages, tools, cfg, false).await?;
        let body: Value = resp.json().await.map_err(|e| {
            ProviderError::new(format!("{} response decode failed: {e}", self.driver_name))
        })?;
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
                            .filter_map(|ev| parse_sse_data(&ev.data))
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

/// Parse one SSE data payload: the `[DONE]` sentinel or a JSON chunk.
pub(crate) fn parse_sse_data(data: &str) -> Option<Result<ProviderEvent, ProviderError>> {
    if data == "[DONE]" {
        return Some(Ok(ProviderEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_chunk(&v).map(Ok)
}

pub(crate) fn parse_chunk(v: &Value) -> Option<ProviderEvent> {
    // Usage may arrive in a dedicated chunk with empty `choices`.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let cache_read = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(|t| t.as_u64())
            .unwrap_or(0);
        return Some(ProviderEvent::Usage(Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cache_read_input_tokens: cache_read,
            ..Usage::default()
        }));
    }

    let delta = &v["choices"][0]["delta"];

    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(ProviderEvent::ToolUseDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
        });
    }

    // Chain-of-thought text: `reasoning_content` (llama.cpp, DeepSeek) or
    // `reasoning` (OpenRouter).
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking.filter(|t| !t.is_empty()) {
        return Some(ProviderEvent::ThinkingDelta(t.to_string()));
    }

    delta
        .get("content")
        .and_then(|c| c.as_str())
        .map(|t| ProviderEvent::TextDelta(t.to_string()))
}

/// Decode a non-streaming response body.
fn parse_response_body(v: &Value) -> Result<Completion, ProviderError> {
    let message = &v["choices"][0]["message"];
    let mut blocks: Vec<ContentBlock> = Vec::new();

    if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
        blocks.push(ContentBlock::text(text));
    }
    for tc in message["tool_calls"].as_array().into_iter().flatten() {
        let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
        let raw_args = tc["function"]["arguments"].as_str().unwrap_or("");
        let input = if raw_args.trim().is_empty() {
            serde_json::Map::new()
        } else {
            match serde_json::from_str::<Value>(raw_args) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(ProviderError::new(format!(
                        "invalid tool-call arguments JSON for {name}: expected object, got {other}"
                    )))
                }
                Err(e) => {
                    return Err(ProviderError::new(format!(
                        "invalid tool-call arguments JSON for {name}: {e}"
                    )))
                }
            }
        };
        blocks.push(ContentBlock::ToolUse {
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name,
            input,
        });
    }
    if blocks.is_empty() {
        blocks.push(ContentBlock::text(""));
    }

    let stop_reason = if blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })) {
        StopReason::ToolUse
    } else {
        StopReason::EndTurn
    };
    let usage = &v["usage"];
    Ok(Completion {
        stop_reason,
        messages: vec![Message::assistant_blocks(blocks)],
        usage: Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            ..Usage::default()
        },
    })
}

/// Convert normalized messages to the OpenAI wire format.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match (&m.role, &m.content) {
            (Role::User, MessageContent::Text(t)) => {
                out.push(json!({ "role": "user", "content": t }));
            }
            (Role::Assistant, MessageContent::Text(t)) => {
                out.push(json!({ "role": "assistant", "content": t }));
            }
            (role, MessageContent::Blocks(blocks)) => {
                push_wire_blocks(&mut out, role, blocks);
            }
        }
    }
    out
}

fn push_wire_blocks(out: &mut Vec<Value>, role: &Role, blocks: &[ContentBlock]) {
    let mut text_parts: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                text_parts.push(json!({ "type": "text", "text": text }));
            }
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": Value::Object(input.clone()).to_string(),
                    }
                }));
            }
            ContentBlock::ToolResult { tool_use_id, content, .. } => {
                // Tool results are standalone `tool` role messages on this wire.
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                }));
            }
            // No wire slot for resubmitting reasoning; the API regenerates it.
            ContentBlock::Thinking { .. } => {}
            ContentBlock::Image { mime_type, data } => {
                text_parts.push(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{mime_type};base64,{data}") },
                }));
            }
            ContentBlock::Audio { mime_type, .. } | ContentBlock::Video { mime_type, .. } => {
                text_parts.push(json!({
                    "type": "text",
                    "text": format!("[unsupported media attachment: {mime_type}]"),
                }));
            }
            ContentBlock::Document { mime_type, uri } => {
                text_parts.push(json!({
                    "type": "text",
                    "text": format!("[document: {uri} ({mime_type})]"),
                }));
            }
        }
    }

    let role_str = match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    if !tool_calls.is_empty() {
        let mut msg = json!({ "role": "assistant", "tool_calls": tool_calls });
        if let Some(first_text) = text_parts.iter().find_map(|p| p["text"].as_str()) {
            msg["content"] = json!(first_text);
        }
        out.push(msg);
    } else if !text_parts.is_empty() {
        // Collapse a single text part for cleaner serialization.
        if text_parts.len() == 1 && text_parts[0]["type"] == "text" {
            out.push(json!({ "role": role_str, "content": text_parts[0]["text"] }));
        } else {
            out.push(json!({ "role": role_str, "content": text_parts }));
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
