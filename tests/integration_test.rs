// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end scenarios driven through the public API with the scripted
//! provider: no network, deterministic scripts, real turn loop and actor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use alloy::{
    run, spawn, AgentConfig, AgentError, AgentState, ContentBlock, Hook, HookOutcome,
    MessageContent, Middleware, Provider, PubSub, PubSubMessage, Role, Status, StreamEvent,
    Tool, ToolContext, ToolError, ToolRegistry,
};
use alloy_model::{
    error, text_response, thinking_response, tool_use, JsonMap, ScriptStep, ScriptedProvider,
};

/// Opt-in tracing for debugging test runs: `RUST_LOG=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "echoes the text argument"
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(&self, input: &JsonMap, _ctx: &ToolContext) -> Result<String, ToolError> {
        Ok(format!(
            "Echo: {}",
            input.get("text").and_then(|v| v.as_str()).unwrap_or("")
        ))
    }
}

fn agent_config(scripts: Vec<ScriptStep>) -> AgentConfig {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let mut config = AgentConfig::new(Arc::new(ScriptedProvider::new(scripts)));
    config.tools = Arc::new(registry);
    config.settings.retry_backoff_ms = 5;
    config
}

async fn next_response(
    rx: &mut tokio::sync::broadcast::Receiver<PubSubMessage>,
) -> alloy::AgentResult {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting on outbox")
            .expect("outbox closed")
        {
            PubSubMessage::AgentResponse(r) => return r,
            _ => continue,
        }
    }
}

// Scenario 1: simple completion.
#[tokio::test]
async fn simple_completion() {
    init_tracing();
    let result = run("hi", agent_config(vec![text_response("Hello!")]))
        .await
        .unwrap();
    assert_eq!(result.status, Status::Completed);
    assert_eq!(result.turns, 1);
    assert_eq!(result.text, "Hello!");
    assert_eq!(result.usage.input_tokens, 10);
    assert_eq!(result.usage.output_tokens, 5);
    assert_eq!(result.messages.last().unwrap().role, Role::Assistant);
}

// Scenario 2: tool loop.
#[tokio::test]
async fn tool_loop_pairs_results_with_calls() {
    let result = run(
        "use the tool",
        agent_config(vec![
            tool_use(vec![("t1", "echo", json!({ "text": "world" }))]),
            text_response("Tool said: Echo: world"),
        ]),
    )
    .await
    .unwrap();

    assert_eq!(result.turns, 2);
    let roles: Vec<Role> = result.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);

    match &result.messages[2].content {
        MessageContent::Blocks(blocks) => match &blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content, .. } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content, "Echo: world");
            }
            other => panic!("unexpected block: {other:?}"),
        },
        _ => panic!("expected block content"),
    }
    assert_eq!(result.text, "Tool said: Echo: world");
}

// Scenario 3: max turns is a success, not an error.
#[tokio::test]
async fn max_turns_returns_ok() {
    let scripts: Vec<ScriptStep> = (0..30)
        .map(|i| {
            let id = format!("t{i}");
            tool_use(vec![(id.as_str(), "echo", json!({ "text": "again" }))])
        })
        .collect();
    let mut config = agent_config(scripts);
    config.settings.max_turns = 3;

    let result = run("loop forever", config).await.expect("max_turns is ok");
    assert_eq!(result.status, Status::MaxTurns);
    assert_eq!(result.turns, 3);
}

// Scenario 4: transient errors retry to success.
#[tokio::test]
async fn retry_with_success() {
    let result = run(
        "please",
        agent_config(vec![
            error("HTTP 429: rate limited, retry shortly"),
            error("HTTP 429: rate limited, retry shortly"),
            text_response("Done"),
        ]),
    )
    .await
    .unwrap();
    assert_eq!(result.status, Status::Completed);
    assert_eq!(result.text, "Done");
}

// Scenario 5: auth failures are permanent.
#[tokio::test]
async fn non_retryable_auth_error() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        error("HTTP 401: Unauthorized"),
        text_response("Never reached"),
    ]));
    let config = AgentConfig::new(Arc::clone(&provider) as Arc<dyn Provider>);

    let err = run("hello", config).await.unwrap_err();
    assert_eq!(err.result.status, Status::Error);
    assert!(err.result.error.as_deref().unwrap().contains("401"));
    assert_eq!(provider.remaining(), 1, "second script entry never consumed");
}

// Scenario 6: async busy + cancel, with outbox ordering and queue bounds.
#[tokio::test]
async fn async_queue_cancel_and_overflow() {
    init_tracing();
    let pubsub = Arc::new(PubSub::new());
    let provider = ScriptedProvider::new(vec![
        text_response("First done"),
        text_response("Third done"),
    ])
    .with_delay(Duration::from_millis(300));
    let mut config = AgentConfig::new(Arc::new(provider));
    config.pubsub = Some(Arc::clone(&pubsub));
    config.settings.max_pending = 2;

    let agent = spawn(config);
    let mut rx = pubsub.subscribe(agent.outbox_topic());

    let r1 = agent.send_message("first").await.unwrap();
    let r2 = agent.send_message("second").await.unwrap();
    let _r3 = agent.send_message("third").await.unwrap();
    // Queue holds two entries; the next send overflows.
    assert_eq!(agent.send_message("fourth").await, Err(AgentError::QueueFull));

    agent.cancel_request(&r2).await.unwrap();

    let first_event = next_response(&mut rx).await;
    assert_eq!(first_event.request_id.as_deref(), Some(r2.as_str()));
    assert_eq!(first_event.error.as_deref(), Some("cancelled"));

    let second_event = next_response(&mut rx).await;
    assert_eq!(second_event.request_id.as_deref(), Some(r1.as_str()));
    assert_eq!(second_event.text, "First done");

    agent.stop().await;
}

// Scenario 7: middleware halt at before_tool_call.
struct HaltToolCalls;

#[async_trait]
impl Middleware for HaltToolCalls {
    async fn on_hook(&self, hook: Hook, _state: &mut AgentState) -> HookOutcome {
        if hook == Hook::BeforeToolCall {
            HookOutcome::Halt("policy".into())
        } else {
            HookOutcome::Continue
        }
    }
}

#[tokio::test]
async fn middleware_halt_at_before_tool_call() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        tool_use(vec![("t1", "echo", json!({ "text": "x" }))]),
        text_response("never"),
    ]));
    let mut config = agent_config(vec![]);
    config.provider = Arc::clone(&provider) as Arc<dyn Provider>;
    config.middleware = vec![Arc::new(HaltToolCalls)];

    let err = run("go", config).await.unwrap_err();
    assert_eq!(err.result.status, Status::Halted);
    assert!(err.result.error.as_deref().unwrap().contains("policy"));
    assert_eq!(provider.remaining(), 1, "second script entry never consumed");
}

// Streaming: chunks, uniform text_delta events, and thinking deltas.
#[tokio::test]
async fn stream_chat_delivers_deltas_and_events() {
    let agent = spawn(agent_config(vec![thinking_response(
        "consider the question",
        "SigOpaque==",
        "the answer",
    )]));

    let chunks: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let events: Arc<Mutex<Vec<StreamEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let c2 = Arc::clone(&chunks);
    let e2 = Arc::clone(&events);

    let result = agent
        .stream_chat(
            "think about it",
            Arc::new(move |t: &str| c2.lock().unwrap().push_str(t)),
            Some(Arc::new(move |e: StreamEvent| e2.lock().unwrap().push(e))),
        )
        .await
        .unwrap();

    assert_eq!(result.status, Status::Completed);
    assert_eq!(*chunks.lock().unwrap(), "the answer");
    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::ThinkingDelta(t) if t == "consider the question")));
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::TextDelta(t) if t == "the answer")));
    agent.stop().await;
}

// Thinking blocks round-trip verbatim to the provider on the next turn.
#[tokio::test]
async fn thinking_blocks_resubmit_verbatim() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        thinking_response("private reasoning", "Sig123==", "first answer"),
        text_response("second answer"),
    ]));
    let config = AgentConfig::new(Arc::clone(&provider) as Arc<dyn Provider>);
    let agent = spawn(config);

    agent.chat("one").await.unwrap();
    agent.chat("two").await.unwrap();

    // The second call's request must contain the thinking block unchanged.
    let resubmitted = provider.last_messages().unwrap();
    let thinking = resubmitted.iter().find_map(|m| match &m.content {
        MessageContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
            ContentBlock::Thinking { thinking, signature } => {
                Some((thinking.clone(), signature.clone()))
            }
            _ => None,
        }),
        _ => None,
    });
    assert_eq!(
        thinking,
        Some(("private reasoning".to_string(), "Sig123==".to_string()))
    );
    agent.stop().await;
}

// Exactly one outbox response per accepted request id.
#[tokio::test]
async fn every_accepted_request_gets_exactly_one_response() {
    let pubsub = Arc::new(PubSub::new());
    let provider = ScriptedProvider::new(vec![
        text_response("a"),
        text_response("b"),
        text_response("c"),
    ]);
    let mut config = AgentConfig::new(Arc::new(provider));
    config.pubsub = Some(Arc::clone(&pubsub));
    let agent = spawn(config);
    let mut rx = pubsub.subscribe(agent.outbox_topic());

    let mut ids = vec![
        agent.send_message("one").await.unwrap(),
        agent.send_message("two").await.unwrap(),
        agent.send_message("three").await.unwrap(),
    ];
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next_response(&mut rx).await.request_id.unwrap());
    }
    ids.sort();
    seen.sort();
    assert_eq!(ids, seen);
    agent.stop().await;
}
