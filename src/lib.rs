// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Alloy — a model-agnostic harness for LLM agents.
//!
//! An agent process owns its conversation, usage counters, middleware
//! pipeline, and outbox. The turn loop sends conversation state to a
//! provider, dispatches the tool calls it asks for, folds results back in,
//! and repeats until the model finishes, a turn budget is reached, a policy
//! halts it, or an error is unrecoverable.
//!
//! ```no_run
//! use alloy::{from_config, run, AgentConfig, ProviderConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let provider = from_config(&ProviderConfig::default())?;
//! let mut config = AgentConfig::new(provider);
//! config.system_prompt = Some("You are terse.".into());
//! let result = run("summarize the build failure", config).await?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub use alloy_config::{AgentSettings, ProviderConfig};
pub use alloy_core::{
    run_once, spawn, AgentConfig, AgentError, AgentHandle, AgentResult, AgentState, Health,
    Hook, HookOutcome, Middleware, PubSub, PubSubMessage, Scratchpad, Session, Status,
    Streaming,
};
pub use alloy_model::{
    from_config, ContentBlock, Message, MessageContent, Provider, ProviderError, Role,
    StopReason, StreamEvent, ToolDef, Usage,
};
pub use alloy_scheduler::{JobSpec, Scheduler, SchedulerError};
pub use alloy_team::{CallOpts, Team, TeamError};
pub use alloy_tools::{Tool, ToolContext, ToolError, ToolRegistry};

/// A run that ended in `Error` or `Halted`; the final state is attached.
#[derive(Debug, Error)]
#[error("{}", result.error.as_deref().unwrap_or("agent run failed"))]
pub struct RunError {
    pub result: AgentResult,
}

/// One-shot entry point: spawn an agent, run a single request, stop it.
///
/// Note the status convention: `Completed` **and** `MaxTurns` both return
/// `Ok` — hitting the turn budget is a bounded-but-successful run, not a
/// failure. Only `Error` and `Halted` return `Err`, with the full result
/// attached for inspection.
pub async fn run(prompt: &str, config: AgentConfig) -> Result<AgentResult, RunError> {
    let result = run_once(config, prompt).await;
    match result.status {
        Status::Completed | Status::MaxTurns => Ok(result),
        _ => Err(RunError { result }),
    }
}
