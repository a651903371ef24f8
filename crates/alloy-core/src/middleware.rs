// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The middleware pipeline: ordered hooks with halt and block semantics.
//!
//! Middlewares run in declared order and each sees the state as mutated by
//! its predecessors. `Halt` short-circuits the chain and stops the agent
//! loop; `Block` is meaningful only at `BeforeToolCall`, where it rejects a
//! single tool call.

use async_trait::async_trait;

use crate::state::AgentState;

/// The points where middleware is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    SessionStart,
    BeforeCompletion,
    AfterCompletion,
    BeforeToolCall,
    AfterToolExecution,
    OnError,
    SessionEnd,
}

/// What one middleware decided at one hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Continue,
    /// Reject this one tool call. Valid only at [`Hook::BeforeToolCall`];
    /// the rejected call becomes an error tool_result and the loop continues.
    Block(String),
    /// Stop the agent loop immediately.
    Halt(String),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn on_hook(&self, hook: Hook, state: &mut AgentState) -> HookOutcome;
}

/// Result of running the full chain at a hook where `Block` is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookRun {
    Continue,
    Halt(String),
}

/// Decision for one tool call after the `BeforeToolCall` chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolGate {
    Allow,
    Block(String),
    Halt(String),
}

/// Run every middleware at `hook`. On halt, later middlewares are skipped.
///
/// Panics if a middleware returns `Block` here: that is a programming error
/// (`Block` belongs to `BeforeToolCall` only), and the supervised worker
/// converts the panic into an error result rather than leaking the process.
pub async fn run_hook(state: &mut AgentState, hook: Hook) -> HookRun {
    debug_assert!(hook != Hook::BeforeToolCall, "use run_tool_gate for BeforeToolCall");
    let chain = state.config.middleware.clone();
    for m in chain {
        match m.on_hook(hook, state).await {
            HookOutcome::Continue => {}
            HookOutcome::Halt(reason) => return HookRun::Halt(reason),
            HookOutcome::Block(_) => {
                panic!("middleware returned Block outside BeforeToolCall (hook {hook:?})")
            }
        }
    }
    HookRun::Continue
}

/// Run the `BeforeToolCall` chain for the tool_use block currently stored in
/// `state.current_tool_use`.
pub async fn run_tool_gate(state: &mut AgentState) -> ToolGate {
    let chain = state.config.middleware.clone();
    for m in chain {
        match m.on_hook(Hook::BeforeToolCall, state).await {
            HookOutcome::Continue => {}
            HookOutcome::Block(reason) => return ToolGate::Block(reason),
            HookOutcome::Halt(reason) => return ToolGate::Halt(reason),
        }
    }
    ToolGate::Allow
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
