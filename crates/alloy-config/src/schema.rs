// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Provider-specific options for one model endpoint.
///
/// The `provider` field selects the driver; run-time construction happens in
/// `alloy_model::from_config`. Everything else is forwarded to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Driver identifier. Common values: "anthropic" | "openai" | "google" |
    /// "openrouter" | "ollama" | "scripted"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub model: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env so secrets stay out of config files
    pub api_key: Option<String>,
    /// Base URL override. Useful for local servers and gateways; hosted
    /// providers get a correct default from the driver registry.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// System prompt sent with every request. Drivers render this in their
    /// own wire position (top-level `system` field, synthetic system message,
    /// or `systemInstruction`).
    pub system_prompt: Option<String>,
    /// Extended-thinking token budget. When set, reasoning-capable drivers
    /// enable their thinking mode with this budget; others ignore it.
    pub thinking_budget_tokens: Option<u32>,
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".into(),
            model: "claude-3-5-sonnet-latest".into(),
            // api_key_env is intentionally None: key resolution falls through
            // to the driver registry, which knows the canonical env-var name
            // for each provider (ANTHROPIC_API_KEY, OPENAI_API_KEY, …).
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: None,
            system_prompt: None,
            thinking_budget_tokens: None,
            driver_options: serde_json::Value::Null,
        }
    }
}

fn default_max_turns() -> u32 {
    10
}
fn default_token_budget() -> usize {
    100_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1_000
}
fn default_timeout_ms() -> u64 {
    300_000
}
fn default_max_pending() -> usize {
    8
}
fn default_compaction_threshold() -> f32 {
    0.9
}
fn default_compaction_keep_recent() -> usize {
    4
}
fn default_tool_result_token_cap() -> usize {
    4_000
}

/// Tunables for one agent's turn loop and request queue.
///
/// These are the serializable knobs; runtime wiring (provider handle, tool
/// registry, middleware, callbacks) lives in `alloy_core::AgentConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum provider round-trips per request before the loop stops with
    /// status MaxTurns (which callers treat as success).
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Approximate context-token budget. Compaction triggers when the
    /// estimated conversation size crosses `compaction_threshold` of this.
    #[serde(default = "default_token_budget")]
    pub max_tokens: usize,
    /// Retry attempts for transient provider errors within one call.
    /// 0 disables retrying entirely.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff; attempt n sleeps `retry_backoff_ms * 2^(n-1)`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Wall-clock deadline for one request, measured from turn-loop entry.
    /// Checked before every provider attempt and every backoff sleep.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Bound on the async pending-request queue; `send_message` beyond this
    /// rejects with QueueFull.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Fraction of `max_tokens` at which compaction fires.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of trailing non-summary messages compaction always preserves.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Token cap applied to individual tool results (0 = uncapped).
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tokens: default_token_budget(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_ms: default_timeout_ms(),
            max_pending: default_max_pending(),
            compaction_threshold: default_compaction_threshold(),
            compaction_keep_recent: default_compaction_keep_recent(),
            tool_result_token_cap: default_tool_result_token_cap(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
