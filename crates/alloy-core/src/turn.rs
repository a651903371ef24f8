// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn loop: one request's provider ↔ tool state machine.
//!
//! start → session_start → iterate* → session_end → final state. The loop
//! never returns an error; every failure becomes a status transition on the
//! state it hands back, and the agent process turns that into a reply or an
//! outbox broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use alloy_model::{Completion, ProviderError, StopReason, StreamEvent};

use crate::compact;
use crate::executor::{execute_tool_calls, ExecutorOutcome};
use crate::middleware::{run_hook, Hook, HookRun};
use crate::state::{AgentState, Status};

pub type ChunkHandler = Arc<dyn Fn(&str) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Streaming callbacks supplied by the caller of `stream_chat`.
#[derive(Clone)]
pub struct Streaming {
    pub on_chunk: ChunkHandler,
    pub on_event: Option<EventHandler>,
}

/// Drive the loop to a terminal status and return the final state.
pub async fn run_loop(mut state: AgentState, streaming: Option<Streaming>) -> AgentState {
    state.status = Status::Running;
    state.error = None;
    state.turn = 0;
    state.started_at = Instant::now();

    match run_hook(&mut state, Hook::SessionStart).await {
        HookRun::Halt(reason) => halt(&mut state, reason),
        HookRun::Continue => iterate(&mut state, &streaming).await,
    }

    // session_end always runs — after completion, halt, or error — and can
    // mutate state, but the terminal status/error it observed is preserved.
    let status = state.status;
    let error = state.error.clone();
    if let HookRun::Halt(reason) = run_hook(&mut state, Hook::SessionEnd).await {
        debug!(%reason, "session_end halted; original status preserved");
    }
    state.status = status;
    state.error = error;
    state
}

fn halt(state: &mut AgentState, reason: String) {
    state.status = Status::Halted;
    state.error = Some(reason);
}

async fn iterate(state: &mut AgentState, streaming: &Option<Streaming>) {
    loop {
        if state.turn >= state.config.settings.max_turns {
            state.status = Status::MaxTurns;
            return;
        }
        compact::maybe_compact(state);
        state.turn += 1;

        if let HookRun::Halt(reason) = run_hook(state, Hook::BeforeCompletion).await {
            return halt(state, reason);
        }

        let completion = match call_with_retry(state, streaming).await {
            Ok(c) => c,
            Err(e) => {
                state.status = Status::Error;
                state.error = Some(e.message);
                // on_error may observe and react, but an error is terminal.
                let _ = run_hook(state, Hook::OnError).await;
                return;
            }
        };

        state.usage = state.usage.merge(&completion.usage);
        state.messages.extend(completion.messages.iter().cloned());

        if let HookRun::Halt(reason) = run_hook(state, Hook::AfterCompletion).await {
            return halt(state, reason);
        }

        if completion.stop_reason != StopReason::ToolUse {
            state.status = Status::Completed;
            return;
        }
        let assistant = match completion.messages.iter().rev().find(|m| m.has_tool_use()) {
            Some(m) => m.clone(),
            None => {
                // stop_reason claimed tool_use but no block arrived; treat as done.
                state.status = Status::Completed;
                return;
            }
        };
        match execute_tool_calls(state, &assistant).await {
            ExecutorOutcome::Halted(reason) => return halt(state, reason),
            ExecutorOutcome::Completed(results) => {
                state.messages.push(results);
                if let HookRun::Halt(reason) = run_hook(state, Hook::AfterToolExecution).await {
                    return halt(state, reason);
                }
            }
        }
    }
}

/// One provider call with retry, backoff, deadline checks, and the streaming
/// emission guard.
async fn call_with_retry(
    state: &mut AgentState,
    streaming: &Option<Streaming>,
) -> Result<Completion, ProviderError> {
    let settings = state.config.settings.clone();
    let provider = Arc::clone(&state.config.provider);
    let cfg = state.config.effective_provider_config();
    let tools = state.config.tools.defs();
    let deadline = state.started_at + Duration::from_millis(settings.timeout_ms);
    // Once any delta reached the consumer, a retry would replay it; the guard
    // downgrades every later error of this call to non-retryable.
    let emitted = Arc::new(AtomicBool::new(false));
    let mut attempt: u32 = 0;

    loop {
        if Instant::now() >= deadline {
            return Err(ProviderError::transport(":timeout", "agent deadline exceeded"));
        }

        let result = match streaming {
            None => provider.complete(&state.messages, &tools, &cfg).await,
            Some(s) => {
                let user_chunk = Arc::clone(&s.on_chunk);
                let mirror = s.on_event.clone();
                let flag = Arc::clone(&emitted);
                let wrapped_chunk = move |t: &str| {
                    flag.store(true, Ordering::SeqCst);
                    user_chunk(t);
                    // text_delta is mirrored onto the event channel for every
                    // provider; providers themselves only emit thinking deltas.
                    if let Some(ev) = &mirror {
                        ev(StreamEvent::TextDelta(t.to_string()));
                    }
                };
                let flag = Arc::clone(&emitted);
                let user_event = s.on_event.clone();
                let wrapped_event = move |e: StreamEvent| {
                    flag.store(true, Ordering::SeqCst);
                    if let Some(ev) = &user_event {
                        ev(e);
                    }
                };
                let pass_event: Option<&alloy_model::EventFn> =
                    if s.on_event.is_some() { Some(&wrapped_event) } else { None };
                provider
                    .stream(&state.messages, &tools, &cfg, &wrapped_chunk, pass_event)
                    .await
            }
        };

        let err = match result {
            Ok(c) => return Ok(c),
            Err(e) => e,
        };
        attempt += 1;

        if emitted.load(Ordering::SeqCst) {
            warn!(error = %err, "stream already emitted deltas; not retrying");
            return Err(err);
        }
        if !err.is_retryable() || settings.max_retries == 0 || attempt >= settings.max_retries {
            return Err(err);
        }
        let backoff = Duration::from_millis(
            settings
                .retry_backoff_ms
                .saturating_mul(1u64 << (attempt - 1).min(16)),
        );
        let now = Instant::now();
        if now >= deadline {
            return Err(err);
        }
        // Deadline-aware: never sleep past the remaining budget.
        let sleep_for = backoff.min(deadline - now);
        warn!(attempt, error = %err, ?sleep_for, "retryable provider error; backing off");
        tokio::time::sleep(sleep_for).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::middleware::{HookOutcome, Middleware};
    use crate::state::AgentConfig;
    use alloy_model::{
        error, text_response, tool_use, ChunkFn, ContentBlock, EventFn, JsonMap, Message,
        MessageContent, Provider, Role, ScriptedProvider, ToolDef, Usage,
    };
    use alloy_tools::{Tool, ToolContext, ToolError, ToolRegistry};

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

    fn agent_state(provider: ScriptedProvider) -> AgentState {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let mut config = AgentConfig::new(Arc::new(provider));
        config.tools = Arc::new(registry);
        config.settings.retry_backoff_ms = 5;
        AgentState::new(config)
    }

    fn with_prompt(mut state: AgentState, prompt: &str) -> AgentState {
        state.messages.push(Message::user(prompt));
        state
    }

    #[tokio::test]
    async fn simple_completion_finishes_in_one_turn() {
        let state = agent_state(ScriptedProvider::new(vec![text_response("Hello!")]));
        let final_state = run_loop(with_prompt(state, "hi"), None).await;
        assert_eq!(final_state.status, Status::Completed);
        assert_eq!(final_state.turn, 1);
        assert_eq!(final_state.last_assistant_text(), "Hello!");
        assert_eq!(final_state.usage.input_tokens, 10);
        assert_eq!(final_state.usage.output_tokens, 5);
    }

    #[tokio::test]
    async fn tool_loop_runs_two_turns_with_paired_ids() {
        let state = agent_state(ScriptedProvider::new(vec![
            tool_use(vec![("t1", "echo", json!({ "text": "world" }))]),
            text_response("Tool said: Echo: world"),
        ]));
        let final_state = run_loop(with_prompt(state, "go"), None).await;
        assert_eq!(final_state.status, Status::Completed);
        assert_eq!(final_state.turn, 2);

        let roles: Vec<Role> = final_state.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

        match &final_state.messages[2].content {
            MessageContent::Blocks(blocks) => match &blocks[0] {
                ContentBlock::ToolResult { tool_use_id, content, .. } => {
                    assert_eq!(tool_use_id, "t1");
                    assert_eq!(content, "Echo: world");
                }
                other => panic!("unexpected: {other:?}"),
            },
            _ => panic!("expected blocks"),
        }
    }

    #[tokio::test]
    async fn max_turns_stops_the_loop() {
        let scripts: Vec<_> = (0..30)
            .map(|i| tool_use(vec![(format!("t{i}").as_str(), "echo", json!({ "text": "x" }))]))
            .collect();
        let mut state = agent_state(ScriptedProvider::new(scripts));
        state.config.settings.max_turns = 3;
        let final_state = run_loop(with_prompt(state, "loop"), None).await;
        assert_eq!(final_state.status, Status::MaxTurns);
        assert_eq!(final_state.turn, 3);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_to_success() {
        let state = agent_state(ScriptedProvider::new(vec![
            error("HTTP 429: rate limited"),
            error("HTTP 429: rate limited"),
            text_response("Done"),
        ]));
        let final_state = run_loop(with_prompt(state, "try"), None).await;
        assert_eq!(final_state.status, Status::Completed);
        assert_eq!(final_state.last_assistant_text(), "Done");
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_without_consuming_script() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            error("HTTP 401: Unauthorized"),
            text_response("Never reached"),
        ]));
        let mut state = agent_state(ScriptedProvider::new(vec![]));
        state.config.provider = Arc::clone(&provider) as Arc<dyn Provider>;
        let final_state = run_loop(with_prompt(state, "auth"), None).await;
        assert_eq!(final_state.status, Status::Error);
        assert!(final_state.error.as_deref().unwrap().contains("401"));
        assert_eq!(provider.remaining(), 1, "second script entry must never be consumed");
    }

    #[tokio::test]
    async fn retries_stop_at_max_retries() {
        let mut state = agent_state(ScriptedProvider::new(vec![
            error("HTTP 503: busy"),
            error("HTTP 503: busy"),
            error("HTTP 503: busy"),
            text_response("never consumed"),
        ]));
        state.config.settings.max_retries = 3;
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(final_state.status, Status::Error);
        assert!(final_state.error.as_deref().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn zero_max_retries_disables_retrying() {
        let mut state = agent_state(ScriptedProvider::new(vec![
            error("HTTP 429: rate limited"),
            text_response("would succeed"),
        ]));
        state.config.settings.max_retries = 0;
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(final_state.status, Status::Error);
    }

    #[tokio::test]
    async fn backoff_is_exponential_in_total_sleep() {
        let mut state = agent_state(ScriptedProvider::new(vec![
            error("HTTP 429: a"),
            error("HTTP 429: b"),
            text_response("ok"),
        ]));
        state.config.settings.retry_backoff_ms = 20;
        let started = Instant::now();
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        // Two retries: 20ms + 40ms ≥ base * (2^2 - 1).
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(final_state.status, Status::Completed);
    }

    #[tokio::test]
    async fn deadline_bounds_retry_sleeps() {
        let mut state = agent_state(ScriptedProvider::new(vec![
            error("HTTP 429: a"),
            error("HTTP 429: b"),
            error("HTTP 429: c"),
        ]));
        state.config.settings.retry_backoff_ms = 10_000;
        state.config.settings.timeout_ms = 50;
        let started = Instant::now();
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(final_state.status, Status::Error);
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "sleep must be clamped to the deadline"
        );
    }

    // ── Middleware interaction ────────────────────────────────────────────────

    struct HaltAt {
        hook: Hook,
        reason: &'static str,
    }

    #[async_trait]
    impl Middleware for HaltAt {
        async fn on_hook(&self, hook: Hook, _state: &mut AgentState) -> HookOutcome {
            if hook == self.hook {
                HookOutcome::Halt(self.reason.into())
            } else {
                HookOutcome::Continue
            }
        }
    }

    #[tokio::test]
    async fn halt_at_before_tool_call_stops_without_consuming_script() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_use(vec![("t1", "echo", json!({ "text": "x" }))]),
            text_response("never"),
        ]));
        let mut state = agent_state(ScriptedProvider::new(vec![]));
        state.config.provider = Arc::clone(&provider) as Arc<dyn Provider>;
        state.config.middleware = vec![Arc::new(HaltAt {
            hook: Hook::BeforeToolCall,
            reason: "policy",
        })];
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(final_state.status, Status::Halted);
        assert!(final_state.error.as_deref().unwrap().contains("policy"));
        assert_eq!(provider.remaining(), 1, "second script entry must never be consumed");
    }

    #[tokio::test]
    async fn session_end_halt_preserves_completed_status() {
        let mut state = agent_state(ScriptedProvider::new(vec![text_response("fine")]));
        state.config.middleware = vec![Arc::new(HaltAt {
            hook: Hook::SessionEnd,
            reason: "too late",
        })];
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(final_state.status, Status::Completed);
        assert!(final_state.error.is_none());
    }

    #[tokio::test]
    async fn session_start_halt_skips_provider_entirely() {
        let provider = ScriptedProvider::new(vec![text_response("never")]);
        let mut state = agent_state(provider);
        state.config.middleware = vec![Arc::new(HaltAt {
            hook: Hook::SessionStart,
            reason: "blocked at the door",
        })];
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(final_state.status, Status::Halted);
        assert_eq!(final_state.turn, 0);
    }

    struct HookRecorder {
        seen: Arc<Mutex<Vec<Hook>>>,
    }

    #[async_trait]
    impl Middleware for HookRecorder {
        async fn on_hook(&self, hook: Hook, _state: &mut AgentState) -> HookOutcome {
            self.seen.lock().unwrap().push(hook);
            HookOutcome::Continue
        }
    }

    #[tokio::test]
    async fn on_error_hook_runs_for_provider_errors() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut state = agent_state(ScriptedProvider::new(vec![error("HTTP 400: bad")]));
        state.config.middleware = vec![Arc::new(HookRecorder { seen: Arc::clone(&seen) })];
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(final_state.status, Status::Error);
        let hooks = seen.lock().unwrap();
        assert!(hooks.contains(&Hook::OnError));
        assert_eq!(*hooks.last().unwrap(), Hook::SessionEnd, "session_end runs after errors");
    }

    #[tokio::test]
    async fn hook_order_for_a_tool_turn() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut state = agent_state(ScriptedProvider::new(vec![
            tool_use(vec![("t1", "echo", json!({ "text": "x" }))]),
            text_response("done"),
        ]));
        state.config.middleware = vec![Arc::new(HookRecorder { seen: Arc::clone(&seen) })];
        run_loop(with_prompt(state, "x"), None).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Hook::SessionStart,
                Hook::BeforeCompletion,
                Hook::AfterCompletion,
                Hook::BeforeToolCall,
                Hook::AfterToolExecution,
                Hook::BeforeCompletion,
                Hook::AfterCompletion,
                Hook::SessionEnd,
            ]
        );
    }

    // ── Streaming ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn streaming_delivers_chunks_and_mirrors_text_delta_events() {
        let state = agent_state(ScriptedProvider::new(vec![text_response("streamed text")]));
        let chunks: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
        let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let c2 = Arc::clone(&chunks);
        let e2 = Arc::clone(&events);
        let streaming = Streaming {
            on_chunk: Arc::new(move |t: &str| c2.lock().unwrap().push_str(t)),
            on_event: Some(Arc::new(move |e: StreamEvent| e2.lock().unwrap().push(e))),
        };
        let final_state = run_loop(with_prompt(state, "x"), Some(streaming)).await;
        assert_eq!(final_state.status, Status::Completed);
        assert_eq!(*chunks.lock().unwrap(), "streamed text");
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta(t) if t == "streamed text")));
    }

    /// Emits one chunk, then fails with a retryable error — forever. The
    /// emission guard must surface the error instead of retrying.
    struct EmitThenFail {
        calls: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl Provider for EmitThenFail {
        fn name(&self) -> &str {
            "emit-then-fail"
        }
        fn model_name(&self) -> &str {
            "emit-then-fail"
        }
        async fn complete(
            &self,
            _messages: &[Message],
            _tools: &[ToolDef],
            _cfg: &alloy_config::ProviderConfig,
        ) -> Result<Completion, ProviderError> {
            Err(ProviderError::new("HTTP 429: should not be called"))
        }
        async fn stream(
            &self,
            _messages: &[Message],
            _tools: &[ToolDef],
            _cfg: &alloy_config::ProviderConfig,
            on_chunk: &ChunkFn,
            _on_event: Option<&EventFn>,
        ) -> Result<Completion, ProviderError> {
            *self.calls.lock().unwrap() += 1;
            on_chunk("partial ");
            Err(ProviderError::new("HTTP 429: mid-stream failure"))
        }
    }

    #[tokio::test]
    async fn no_retry_after_stream_emission() {
        let calls = Arc::new(Mutex::new(0));
        let provider = EmitThenFail { calls: Arc::clone(&calls) };
        let mut config = AgentConfig::new(Arc::new(provider));
        config.settings.retry_backoff_ms = 1;
        let mut state = AgentState::new(config);
        state.messages.push(Message::user("x"));

        let streaming = Streaming {
            on_chunk: Arc::new(|_t: &str| {}),
            on_event: None,
        };
        let final_state = run_loop(state, Some(streaming)).await;
        assert_eq!(final_state.status, Status::Error);
        assert_eq!(*calls.lock().unwrap(), 1, "a retryable error after emission must not retry");
    }

    #[tokio::test]
    async fn usage_accumulates_across_turns() {
        let state = agent_state(ScriptedProvider::new(vec![
            tool_use(vec![("t1", "echo", json!({ "text": "x" }))]),
            text_response("done"),
        ]));
        let final_state = run_loop(with_prompt(state, "x"), None).await;
        // Two scripted turns at 10 in / 5 out each.
        assert_eq!(final_state.usage, Usage {
            input_tokens: 20,
            output_tokens: 10,
            ..Usage::default()
        });
    }
}
