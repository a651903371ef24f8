// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use alloy_config::{AgentSettings, ProviderConfig};
use alloy_model::{ContentBlock, JsonMap, Message, MessageContent, Provider, Usage};
use alloy_tools::ToolRegistry;

use crate::middleware::Middleware;
use crate::pubsub::PubSub;

/// Where the agent loop currently stands.
///
/// Lifecycle: Idle → Running → {Completed | MaxTurns | Error | Halted} → Idle
/// (on reset, or after a finished synchronous call frees the actor for the
/// next request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Idle,
    Running,
    Completed,
    MaxTurns,
    Error,
    Halted,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Idle => "idle",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::MaxTurns => "max_turns",
            Status::Error => "error",
            Status::Halted => "halted",
        };
        write!(f, "{s}")
    }
}

/// A child resource owned by one agent for its working notes. Its lifetime
/// equals the agent's; `stop` is called from the terminate path.
pub trait Scratchpad: Send + Sync {
    fn stop(&self);
}

/// Callback invoked with the exported session during shutdown.
pub type ShutdownFn = Arc<dyn Fn(Session) + Send + Sync>;

/// Runtime assembly for one agent: the provider handle, tools, middleware,
/// and the serializable tunables from `alloy-config`.
#[derive(Clone)]
pub struct AgentConfig {
    pub provider: Arc<dyn Provider>,
    pub provider_config: ProviderConfig,
    pub tools: Arc<ToolRegistry>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub settings: AgentSettings,
    /// Agent-level system prompt; overrides `provider_config.system_prompt`.
    pub system_prompt: Option<String>,
    pub working_dir: Option<PathBuf>,
    /// Arbitrary context forwarded to tools and middleware. `session_id`
    /// here overrides the agent id as the effective session id.
    pub context: JsonMap,
    pub on_shutdown: Option<ShutdownFn>,
    pub pubsub: Option<Arc<PubSub>>,
    /// Topics whose `agent_event` messages drive turns. Read from the
    /// post-session_start-middleware config, since middleware is the
    /// canonical place to rewrite them.
    pub subscribe_topics: Vec<String>,
}

impl AgentConfig {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            provider_config: ProviderConfig::default(),
            tools: Arc::new(ToolRegistry::new()),
            middleware: Vec::new(),
            settings: AgentSettings::default(),
            system_prompt: None,
            working_dir: None,
            context: JsonMap::new(),
            on_shutdown: None,
            pubsub: None,
            subscribe_topics: Vec::new(),
        }
    }

    /// Provider config with the agent-level system prompt applied.
    pub fn effective_provider_config(&self) -> ProviderConfig {
        let mut cfg = self.provider_config.clone();
        if self.system_prompt.is_some() {
            cfg.system_prompt = self.system_prompt.clone();
        }
        cfg
    }
}

/// The conversation state one agent owns. The turn loop mutates a local
/// value and hands the final state back to the agent process.
#[derive(Clone)]
pub struct AgentState {
    pub config: AgentConfig,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub status: Status,
    pub turn: u32,
    pub error: Option<String>,
    pub scratchpad: Option<Arc<dyn Scratchpad>>,
    pub started_at: Instant,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    /// The tool_use block currently gated by `before_tool_call` middleware.
    pub current_tool_use: Option<ContentBlock>,
}

impl AgentState {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            messages: Vec::new(),
            usage: Usage::default(),
            status: Status::Idle,
            turn: 0,
            error: None,
            scratchpad: None,
            started_at: Instant::now(),
            agent_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            current_tool_use: None,
        }
    }

    /// The stable identifier that names this agent's outbox: the
    /// `session_id` context override when present, else the agent id.
    pub fn effective_session_id(&self) -> String {
        self.config
            .context
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.agent_id.clone())
    }

    pub fn outbox_topic(&self) -> String {
        format!("agent:{}:responses", self.effective_session_id())
    }

    /// Approximate token estimate for the whole conversation.
    pub fn approx_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.approx_tokens()).sum()
    }

    /// Text of the last assistant message, for result payloads.
    pub fn last_assistant_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == alloy_model::Role::Assistant)
            .map(|m| m.text())
            .unwrap_or_default()
    }

    /// All tool_use blocks issued across the conversation, in order.
    pub fn tool_calls(&self) -> Vec<ContentBlock> {
        self.messages
            .iter()
            .flat_map(|m| match &m.content {
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                    .cloned()
                    .collect::<Vec<_>>(),
                _ => vec![],
            })
            .collect()
    }

    pub fn to_result(&self, request_id: Option<String>) -> AgentResult {
        AgentResult {
            request_id,
            text: self.last_assistant_text(),
            messages: self.messages.clone(),
            usage: self.usage,
            tool_calls: self.tool_calls(),
            status: self.status,
            turns: self.turn,
            error: self.error.clone(),
        }
    }

    /// Snapshot for persistence and `on_shutdown`.
    pub fn export_session(&self) -> Session {
        let mut metadata = JsonMap::new();
        metadata.insert("status".into(), json!(self.status.to_string()));
        if let Some(e) = &self.error {
            metadata.insert("error".into(), json!(e));
        }
        Session {
            id: self.effective_session_id(),
            messages: self.messages.clone(),
            usage: self.usage,
            metadata,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

/// Exported session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The payload returned by synchronous calls and broadcast on the outbox for
/// asynchronous ones. `error` is `"cancelled"` for cancellations.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub request_id: Option<String>,
    pub text: String,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub tool_calls: Vec<ContentBlock>,
    pub status: Status,
    pub turns: u32,
    pub error: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
