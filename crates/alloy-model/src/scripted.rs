// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pre-scripted provider for tests.
//!
//! Each call to `complete`/`stream` pops the next [`ScriptStep`] from the
//! front of the queue, so tests can specify exact response sequences —
//! including tool calls, thinking blocks, and errors — without network
//! access. The last request's messages are recorded for inspection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use alloy_config::ProviderConfig;

use crate::{
    error::ProviderError,
    provider::{fold_events, ChunkFn, EventFn, EventStream, Provider, ProviderEvent},
    types::{Completion, JsonMap, Message, ToolDef, Usage},
};

/// One scripted provider response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// A plain text reply.
    Text { text: String, usage: Usage },
    /// One or more tool calls: (id, name, input).
    ToolUse { calls: Vec<(String, String, JsonMap)>, usage: Usage },
    /// A thinking block followed by a text reply.
    Thinking {
        thinking: String,
        signature: String,
        text: String,
        usage: Usage,
    },
    /// A provider error, raised before any delta is emitted.
    Error(String),
}

fn script_usage() -> Usage {
    Usage { input_tokens: 10, output_tokens: 5, ..Usage::default() }
}

/// Script a text reply (reports 10 input / 5 output tokens).
pub fn text_response(text: impl Into<String>) -> ScriptStep {
    ScriptStep::Text { text: text.into(), usage: script_usage() }
}

/// Script tool calls from (id, name, input) triples.
pub fn tool_use(calls: Vec<(&str, &str, serde_json::Value)>) -> ScriptStep {
    ScriptStep::ToolUse {
        calls: calls
            .into_iter()
            .map(|(id, name, input)| {
                let map = input.as_object().cloned().unwrap_or_default();
                (id.to_string(), name.to_string(), map)
            })
            .collect(),
        usage: script_usage(),
    }
}

/// Script a kind-prefixed provider error (e.g. `"HTTP 429: …"`).
pub fn error(message: impl Into<String>) -> ScriptStep {
    ScriptStep::Error(message.into())
}

/// Script a thinking block plus final text.
pub fn thinking_response(
    thinking: impl Into<String>,
    signature: impl Into<String>,
    text: impl Into<String>,
) -> ScriptStep {
    ScriptStep::Thinking {
        thinking: thinking.into(),
        signature: signature.into(),
        text: text.into(),
        usage: script_usage(),
    }
}

pub struct ScriptedProvider {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    /// Artificial latency per call; lets tests exercise busy/cancel paths.
    delay: Option<Duration>,
    /// Messages from the most recent call, for test inspection.
    last_messages: Arc<Mutex<Option<Vec<Message>>>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            delay: None,
            last_messages: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of unconsumed script steps.
    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap().len()
    }

    /// Messages sent with the most recent call.
    pub fn last_messages(&self) -> Option<Vec<Message>> {
        self.last_messages.lock().unwrap().clone()
    }

    fn next_events(&self, messages: &[Message]) -> Result<Vec<ProviderEvent>, ProviderError> {
        *self.last_messages.lock().unwrap() = Some(messages.to_vec());
        let step = self.steps.lock().unwrap().pop_front();
        let step = match step {
            Some(s) => s,
            None => ScriptStep::Text { text: "[script exhausted]".into(), usage: Usage::default() },
        };
        match step {
            ScriptStep::Text { text, usage } => Ok(vec![
                ProviderEvent::TextDelta(text),
                ProviderEvent::Usage(usage),
                ProviderEvent::Done,
            ]),
            ScriptStep::ToolUse { calls, usage } => {
                let mut events: Vec<ProviderEvent> = calls
                    .into_iter()
                    .enumerate()
                    .map(|(i, (id, name, input))| ProviderEvent::ToolUseDelta {
                        index: i as u32,
                        id,
                        name,
                        arguments: serde_json::Value::Object(input).to_string(),
                    })
                    .collect();
                events.push(ProviderEvent::Usage(usage));
                events.push(ProviderEvent::Done);
                Ok(events)
            }
            ScriptStep::Thinking { thinking, signature, text, usage } => Ok(vec![
                ProviderEvent::ThinkingDelta(thinking),
                ProviderEvent::SignatureDelta(signature),
                ProviderEvent::TextDelta(text),
                ProviderEvent::Usage(usage),
                ProviderEvent::Done,
            ]),
            ScriptStep::Error(message) => Err(ProviderError::new(message)),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDef],
        _cfg: &ProviderConfig,
    ) -> Result<Completion, ProviderError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let events = self.next_events(messages)?;
        let s: EventStream = Box::pin(stream::iter(events.into_iter().map(Ok)));
        fold_events(s, None, None).await
    }

    async fn stream(
        &self,
        messages: &[Message],
        _tools: &[ToolDef],
        _cfg: &ProviderConfig,
        on_chunk: &ChunkFn,
        on_event: Option<&EventFn>,
    ) -> Result<Completion, ProviderError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let events = self.next_events(messages)?;
        let s: EventStream = Box::pin(stream::iter(events.into_iter().map(Ok)));
        fold_events(s, Some(on_chunk), on_event).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
