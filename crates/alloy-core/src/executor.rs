// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool executor: policy gating plus parallel dispatch.
//!
//! Takes the tool_use blocks of one assistant message and produces the
//! single user message carrying their tool_result blocks, in declared order
//! regardless of completion order. Every failure path — blocked, unknown
//! tool, timeout, panic — yields an error tool_result that preserves the
//! original tool_use id, because the provider protocol matches results to
//! calls by id.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::warn;

use alloy_model::{ContentBlock, JsonMap, Message};
use alloy_tools::{truncate_output, ToolContext};

use crate::middleware::{run_tool_gate, ToolGate};
use crate::state::AgentState;

/// How one executor pass ended.
#[derive(Debug)]
pub enum ExecutorOutcome {
    /// The user message holding one tool_result per tool_use, in order.
    Completed(Message),
    /// A `before_tool_call` middleware halted the loop.
    Halted(String),
}

enum Slot {
    Blocked(String),
    Running(JoinHandle<Result<String, String>>),
}

/// Execute every tool_use block in `assistant`.
pub async fn execute_tool_calls(state: &mut AgentState, assistant: &Message) -> ExecutorOutcome {
    let calls: Vec<(String, String, JsonMap)> = assistant
        .tool_uses()
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::ToolUse { id, name, input } => {
                Some((id.clone(), name.clone(), input.clone()))
            }
            _ => None,
        })
        .collect();

    // Phase 1: gate each call in declared order. Halting aborts before any
    // dispatch; blocks are recorded and skipped.
    let mut gates: Vec<Option<String>> = Vec::with_capacity(calls.len());
    for (id, name, input) in &calls {
        state.current_tool_use = Some(ContentBlock::tool_use(id, name, input.clone()));
        let gate = run_tool_gate(state).await;
        state.current_tool_use = None;
        match gate {
            ToolGate::Allow => gates.push(None),
            ToolGate::Block(reason) => gates.push(Some(reason)),
            ToolGate::Halt(reason) => return ExecutorOutcome::Halted(reason),
        }
    }

    // Phase 2: dispatch unblocked calls concurrently, each bounded by the
    // remaining agent deadline.
    let deadline =
        state.started_at + Duration::from_millis(state.config.settings.timeout_ms);
    let ctx = ToolContext {
        context: state.config.context.clone(),
        working_dir: state.config.working_dir.clone(),
    };

    let mut slots: Vec<Slot> = Vec::with_capacity(calls.len());
    for ((_, name, input), gate) in calls.iter().zip(&gates) {
        if let Some(reason) = gate {
            slots.push(Slot::Blocked(reason.clone()));
            continue;
        }
        let registry = state.config.tools.clone();
        let name = name.clone();
        let input = input.clone();
        let ctx = ctx.clone();
        let remaining = deadline.saturating_duration_since(Instant::now());
        slots.push(Slot::Running(tokio::spawn(async move {
            let tool = match registry.get(&name) {
                Some(t) => t,
                None => return Err(format!("Unknown tool: {name}")),
            };
            match tokio::time::timeout(remaining, tool.execute(&input, &ctx)).await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(e.0),
                Err(_) => Err(format!(
                    "tool '{name}' timed out after {}ms",
                    remaining.as_millis()
                )),
            }
        })));
    }

    // Phase 3: collect in declared order; completion order does not matter.
    let cap = state.config.settings.tool_result_token_cap;
    let mut blocks: Vec<ContentBlock> = Vec::with_capacity(calls.len());
    for ((id, name, _), slot) in calls.iter().zip(slots) {
        let outcome = match slot {
            Slot::Blocked(reason) => Err(reason),
            Slot::Running(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %name, "tool task failed: {e}");
                    Err(format!("tool '{name}' execution panicked: {e}"))
                }
            },
        };
        let block = match outcome {
            Ok(content) => {
                let category = state.config.tools.output_category(name);
                ContentBlock::tool_result(id, truncate_output(&content, category, cap))
            }
            Err(content) => ContentBlock::tool_error(id, content),
        };
        blocks.push(block);
    }

    ExecutorOutcome::Completed(Message::user_blocks(blocks))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::middleware::{Hook, HookOutcome, Middleware};
    use crate::state::AgentConfig;
    use alloy_model::ScriptedProvider;
    use alloy_tools::{Tool, ToolError, ToolRegistry};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes text"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, input: &JsonMap, _ctx: &ToolContext) -> Result<String, ToolError> {
            Ok(format!(
                "Echo: {}",
                input.get("text").and_then(|v| v.as_str()).unwrap_or("")
            ))
        }
    }

    /// Sleeps for the duration given in its input before echoing.
    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps then replies"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, input: &JsonMap, _ctx: &ToolContext) -> Result<String, ToolError> {
            let ms = input.get("ms").and_then(|v| v.as_u64()).unwrap_or(50);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(format!("slept {ms}"))
        }
    }

    struct PanickyTool;

    #[async_trait]
    impl Tool for PanickyTool {
        fn name(&self) -> &str {
            "panicky"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _input: &JsonMap, _ctx: &ToolContext) -> Result<String, ToolError> {
            panic!("tool exploded");
        }
    }

    fn state_with_tools() -> AgentState {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool);
        registry.register(PanickyTool);
        let mut config = AgentConfig::new(provider);
        config.tools = Arc::new(registry);
        AgentState::new(config)
    }

    fn assistant_calls(calls: Vec<(&str, &str, Value)>) -> Message {
        Message::assistant_blocks(
            calls
                .into_iter()
                .map(|(id, name, input)| {
                    ContentBlock::tool_use(id, name, input.as_object().cloned().unwrap_or_default())
                })
                .collect(),
        )
    }

    fn result_blocks(outcome: ExecutorOutcome) -> Vec<ContentBlock> {
        match outcome {
            ExecutorOutcome::Completed(msg) => match msg.content {
                alloy_model::MessageContent::Blocks(blocks) => blocks,
                _ => panic!("expected blocks"),
            },
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_call_produces_matching_result() {
        let mut state = state_with_tools();
        let msg = assistant_calls(vec![("t1", "echo", json!({ "text": "world" }))]);
        let blocks = result_blocks(execute_tool_calls(&mut state, &msg).await);
        match &blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content, "Echo: world");
                assert!(is_error.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn results_keep_declared_order_despite_completion_order() {
        let mut state = state_with_tools();
        // First call sleeps; second finishes immediately.
        let msg = assistant_calls(vec![
            ("t1", "slow", json!({ "ms": 80 })),
            ("t2", "echo", json!({ "text": "quick" })),
        ]);
        let blocks = result_blocks(execute_tool_calls(&mut state, &msg).await);
        let ids: Vec<&str> = blocks
            .iter()
            .map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_result_with_original_id() {
        let mut state = state_with_tools();
        let msg = assistant_calls(vec![("t9", "missing", json!({}))]);
        let blocks = result_blocks(execute_tool_calls(&mut state, &msg).await);
        match &blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "t9");
                assert_eq!(content, "Unknown tool: missing");
                assert_eq!(*is_error, Some(true));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_tool_preserves_id() {
        let mut state = state_with_tools();
        let msg = assistant_calls(vec![
            ("t1", "panicky", json!({})),
            ("t2", "echo", json!({ "text": "fine" })),
        ]);
        let blocks = result_blocks(execute_tool_calls(&mut state, &msg).await);
        match &blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "t1", "id must come from the tool_use block");
                assert!(content.contains("panicked"));
                assert_eq!(*is_error, Some(true));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The sibling call still completed normally.
        match &blocks[1] {
            ContentBlock::ToolResult { content, is_error, .. } => {
                assert_eq!(content, "Echo: fine");
                assert!(is_error.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_exceeding_deadline_times_out_with_id() {
        let mut state = state_with_tools();
        state.config.settings.timeout_ms = 50;
        state.started_at = Instant::now();
        let msg = assistant_calls(vec![("t1", "slow", json!({ "ms": 5000 }))]);
        let blocks = result_blocks(execute_tool_calls(&mut state, &msg).await);
        match &blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "t1");
                assert!(content.contains("timed out"), "got: {content}");
                assert_eq!(*is_error, Some(true));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    struct BlockEcho;

    #[async_trait]
    impl Middleware for BlockEcho {
        async fn on_hook(&self, hook: Hook, state: &mut AgentState) -> HookOutcome {
            if hook != Hook::BeforeToolCall {
                return HookOutcome::Continue;
            }
            match &state.current_tool_use {
                Some(ContentBlock::ToolUse { name, .. }) if name == "echo" => {
                    HookOutcome::Block("echo is disabled".into())
                }
                _ => HookOutcome::Continue,
            }
        }
    }

    #[tokio::test]
    async fn blocked_call_becomes_error_result_and_others_run() {
        let mut state = state_with_tools();
        state.config.middleware = vec![Arc::new(BlockEcho)];
        let msg = assistant_calls(vec![
            ("t1", "echo", json!({ "text": "nope" })),
            ("t2", "slow", json!({ "ms": 1 })),
        ]);
        let blocks = result_blocks(execute_tool_calls(&mut state, &msg).await);
        match &blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content, "echo is disabled");
                assert_eq!(*is_error, Some(true));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &blocks[1] {
            ContentBlock::ToolResult { is_error, .. } => assert!(is_error.is_none()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    struct HaltAll;

    #[async_trait]
    impl Middleware for HaltAll {
        async fn on_hook(&self, hook: Hook, _state: &mut AgentState) -> HookOutcome {
            if hook == Hook::BeforeToolCall {
                HookOutcome::Halt("policy".into())
            } else {
                HookOutcome::Continue
            }
        }
    }

    #[tokio::test]
    async fn halt_aborts_before_dispatch() {
        let mut state = state_with_tools();
        state.config.middleware = vec![Arc::new(HaltAll)];
        let msg = assistant_calls(vec![("t1", "echo", json!({ "text": "x" }))]);
        match execute_tool_calls(&mut state, &msg).await {
            ExecutorOutcome::Halted(reason) => assert_eq!(reason, "policy"),
            other => panic!("expected halt, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_output_is_truncated() {
        struct BigTool;
        #[async_trait]
        impl Tool for BigTool {
            fn name(&self) -> &str {
                "big"
            }
            fn description(&self) -> &str {
                "returns a lot"
            }
            fn input_schema(&self) -> Value {
                json!({ "type": "object" })
            }
            async fn execute(
                &self,
                _input: &JsonMap,
                _ctx: &ToolContext,
            ) -> Result<String, ToolError> {
                Ok((0..5000).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n"))
            }
        }
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let mut registry = ToolRegistry::new();
        registry.register(BigTool);
        let mut config = AgentConfig::new(provider);
        config.tools = Arc::new(registry);
        config.settings.tool_result_token_cap = 100;
        let mut state = AgentState::new(config);

        let msg = assistant_calls(vec![("t1", "big", json!({}))]);
        let blocks = result_blocks(execute_tool_calls(&mut state, &msg).await);
        match &blocks[0] {
            ContentBlock::ToolResult { content, .. } => {
                assert!(content.len() < 1000);
                assert!(content.contains("omitted"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
