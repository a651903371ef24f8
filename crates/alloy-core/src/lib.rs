// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod compact;
mod executor;
mod middleware;
mod process;
mod pubsub;
mod state;
mod turn;

pub use compact::{compact_messages, maybe_compact};
pub use executor::{execute_tool_calls, ExecutorOutcome};
pub use middleware::{run_hook, run_tool_gate, Hook, HookOutcome, HookRun, Middleware, ToolGate};
pub use process::{run_once, spawn, AgentError, AgentHandle, Health};
pub use pubsub::{PubSub, PubSubMessage};
pub use state::{
    AgentConfig, AgentResult, AgentState, Scratchpad, Session, ShutdownFn, Status,
};
pub use turn::{run_loop, ChunkHandler, EventHandler, Streaming};
