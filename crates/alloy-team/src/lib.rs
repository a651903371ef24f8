// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Team coordinator: a named registry of child agents with shared context.
//!
//! The coordinator is an actor; `delegate`, `broadcast`, and `handoff` each
//! run on a spawned reply task so the coordinator stays responsive while
//! children work. Children are fault-isolated: a dead child produces an
//! error entry for that child only and is silently removed from the
//! registry — no restart happens at this layer.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use alloy_core::{AgentError, AgentHandle, AgentResult};
use alloy_model::JsonMap;

/// Errors surfaced by team calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TeamError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    /// The coordinator's outer timeout fired.
    #[error("call timed out")]
    Timeout,
    /// The child process exited; it has been removed from the registry.
    #[error("child exited: {0}")]
    ChildExit(String),
    /// The child rejected the call (busy, queue full, …).
    #[error(transparent)]
    Call(AgentError),
    #[error("team stopped")]
    Stopped,
}

/// Options for one coordinated call. `timeout: None` means infinity.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOpts {
    /// Agent-level deadline the caller expects; the coordinator waits this
    /// plus a one-second coordination buffer.
    pub timeout: Option<Duration>,
}

/// Coordinator-side timeout: the agent deadline plus a buffer so agent-level
/// deadlines always fire first. Infinity propagates unchanged; zero
/// propagates as zero.
fn outer_timeout(agent_timeout: Option<Duration>) -> Option<Duration> {
    match agent_timeout {
        None => None,
        Some(t) if t.is_zero() => Some(t),
        Some(t) => Some(t + Duration::from_secs(1)),
    }
}

enum Command {
    AddAgent {
        name: String,
        handle: AgentHandle,
        reply: oneshot::Sender<()>,
    },
    RemoveAgent {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    GetAgent {
        name: String,
        reply: oneshot::Sender<Option<AgentHandle>>,
    },
    PutContext {
        key: String,
        value: serde_json::Value,
        reply: oneshot::Sender<()>,
    },
    GetContext {
        key: String,
        reply: oneshot::Sender<Option<serde_json::Value>>,
    },
    Delegate {
        name: String,
        message: String,
        opts: CallOpts,
        reply: oneshot::Sender<Result<AgentResult, TeamError>>,
    },
    Broadcast {
        message: String,
        opts: CallOpts,
        reply: oneshot::Sender<HashMap<String, Result<AgentResult, TeamError>>>,
    },
    Handoff {
        names: Vec<String>,
        initial_message: String,
        opts: CallOpts,
        reply: oneshot::Sender<Result<Option<AgentResult>, TeamError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    /// A reply task observed this child's process gone.
    ChildDown { name: String },
}

/// Handle to a running team coordinator.
#[derive(Clone)]
pub struct Team {
    tx: mpsc::Sender<Command>,
}

impl Team {
    pub fn spawn() -> Team {
        let (tx, rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            TeamActor {
                agents: HashMap::new(),
                context: JsonMap::new(),
                rx,
                internal_rx,
                internal_tx,
            }
            .run()
            .await;
        });
        Team { tx }
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, TeamError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| TeamError::Stopped)?;
        rx.await.map_err(|_| TeamError::Stopped)
    }

    pub async fn add_agent(
        &self,
        name: impl Into<String>,
        handle: AgentHandle,
    ) -> Result<(), TeamError> {
        let name = name.into();
        self.call(move |reply| Command::AddAgent { name, handle, reply }).await
    }

    /// Returns true when an agent with this name was registered.
    pub async fn remove_agent(&self, name: impl Into<String>) -> Result<bool, TeamError> {
        let name = name.into();
        self.call(move |reply| Command::RemoveAgent { name, reply }).await
    }

    pub async fn get_agent(&self, name: impl Into<String>) -> Result<Option<AgentHandle>, TeamError> {
        let name = name.into();
        self.call(move |reply| Command::GetAgent { name, reply }).await
    }

    pub async fn put_context(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), TeamError> {
        let key = key.into();
        self.call(move |reply| Command::PutContext { key, value, reply }).await
    }

    pub async fn get_context(
        &self,
        key: impl Into<String>,
    ) -> Result<Option<serde_json::Value>, TeamError> {
        let key = key.into();
        self.call(move |reply| Command::GetContext { key, reply }).await
    }

    /// Run `chat` on the named child and return its result.
    pub async fn delegate(
        &self,
        name: impl Into<String>,
        message: impl Into<String>,
        opts: CallOpts,
    ) -> Result<AgentResult, TeamError> {
        let name = name.into();
        let message = message.into();
        self.call(move |reply| Command::Delegate { name, message, opts, reply })
            .await?
    }

    /// Fan the message out to every child in parallel; results are keyed by
    /// child name. A failing child yields its own error entry, never a
    /// coordinator failure.
    pub async fn broadcast(
        &self,
        message: impl Into<String>,
        opts: CallOpts,
    ) -> Result<HashMap<String, Result<AgentResult, TeamError>>, TeamError> {
        let message = message.into();
        self.call(move |reply| Command::Broadcast { message, opts, reply }).await
    }

    /// Chain `chat` calls: each child's text output is the next child's
    /// input. Stops at the first error; an empty list returns `Ok(None)`
    /// without making any call.
    pub async fn handoff(
        &self,
        names: Vec<String>,
        initial_message: impl Into<String>,
        opts: CallOpts,
    ) -> Result<Option<AgentResult>, TeamError> {
        let initial_message = initial_message.into();
        self.call(move |reply| Command::Handoff { names, initial_message, opts, reply })
            .await?
    }

    /// Stop every child agent, then the coordinator.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct TeamActor {
    agents: HashMap<String, AgentHandle>,
    context: JsonMap,
    rx: mpsc::Receiver<Command>,
    internal_rx: mpsc::Receiver<Internal>,
    internal_tx: mpsc::Sender<Internal>,
}

/// One child call with timeout and dead-child detection, used by every
/// coordinated operation.
async fn call_child(
    name: &str,
    handle: &AgentHandle,
    message: String,
    opts: CallOpts,
    internal: &mpsc::Sender<Internal>,
) -> Result<AgentResult, TeamError> {
    let fut = handle.chat(message);
    let outcome = match outer_timeout(opts.timeout) {
        None => fut.await,
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(r) => r,
            Err(_) => return Err(TeamError::Timeout),
        },
    };
    match outcome {
        Ok(result) => Ok(result),
        Err(AgentError::Stopped) => {
            let _ = internal
                .send(Internal::ChildDown { name: name.to_string() })
                .await;
            Err(TeamError::ChildExit("stopped".into()))
        }
        Err(other) => Err(TeamError::Call(other)),
    }
}

impl TeamActor {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;
                Some(internal) = self.internal_rx.recv() => match internal {
                    Internal::ChildDown { name } => {
                        if self.agents.remove(&name).is_some() {
                            warn!(%name, "removed dead child agent");
                        }
                    }
                },
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::AddAgent { name, handle, reply } => {
                debug!(%name, "agent added to team");
                self.agents.insert(name, handle);
                let _ = reply.send(());
            }
            Command::RemoveAgent { name, reply } => {
                let _ = reply.send(self.agents.remove(&name).is_some());
            }
            Command::GetAgent { name, reply } => {
                let _ = reply.send(self.agents.get(&name).cloned());
            }
            Command::PutContext { key, value, reply } => {
                self.context.insert(key, value);
                let _ = reply.send(());
            }
            Command::GetContext { key, reply } => {
                let _ = reply.send(self.context.get(&key).cloned());
            }
            Command::Delegate { name, message, opts, reply } => {
                let handle = match self.agents.get(&name) {
                    Some(h) => h.clone(),
                    None => {
                        let _ = reply.send(Err(TeamError::UnknownAgent(name)));
                        return false;
                    }
                };
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = call_child(&name, &handle, message, opts, &internal).await;
                    let _ = reply.send(result);
                });
            }
            Command::Broadcast { message, opts, reply } => {
                let agents: Vec<(String, AgentHandle)> = self
                    .agents
                    .iter()
                    .map(|(n, h)| (n.clone(), h.clone()))
                    .collect();
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let calls = agents.into_iter().map(|(name, handle)| {
                        let message = message.clone();
                        let internal = internal.clone();
                        async move {
                            let result =
                                call_child(&name, &handle, message, opts, &internal).await;
                            (name, result)
                        }
                    });
                    let results: HashMap<String, Result<AgentResult, TeamError>> =
                        futures::future::join_all(calls).await.into_iter().collect();
                    let _ = reply.send(results);
                });
            }
            Command::Handoff { names, initial_message, opts, reply } => {
                // Snapshot handles up front so a mid-chain registry change
                // cannot reroute the handoff.
                let mut chain: Vec<(String, AgentHandle)> = Vec::with_capacity(names.len());
                for name in names {
                    match self.agents.get(&name) {
                        Some(h) => chain.push((name, h.clone())),
                        None => {
                            let _ = reply.send(Err(TeamError::UnknownAgent(name)));
                            return false;
                        }
                    }
                }
                let internal = self.internal_tx.clone();
                tokio::spawn(async move {
                    let mut input = initial_message;
                    let mut last: Option<AgentResult> = None;
                    for (name, handle) in chain {
                        match call_child(&name, &handle, input, opts, &internal).await {
                            Ok(result) => {
                                input = result.text.clone();
                                last = Some(result);
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                                return;
                            }
                        }
                    }
                    let _ = reply.send(Ok(last));
                });
            }
            Command::Stop { reply } => {
                for (name, handle) in self.agents.drain() {
                    debug!(%name, "stopping child agent");
                    handle.stop().await;
                }
                let _ = reply.send(());
                return true;
            }
        }
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
