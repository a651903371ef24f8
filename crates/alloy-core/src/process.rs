// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The agent process: a supervised actor around one `AgentState`.
//!
//! The actor serializes access to its state through a command mailbox.
//! Synchronous calls (`chat`, `stream_chat`, `reset`, `set_model`) run on
//! the actor itself and reject with `Busy` while an asynchronous worker is
//! active. `send_message` enqueues work onto a single worker slot with a
//! bounded FIFO behind it; results are broadcast on the pubsub outbox topic
//! `agent:<effective_session_id>:responses`.
//!
//! Worker termination is converted into ordinary mailbox messages by a
//! monitor task (the trap-exit emulation): completion, panic, and abort all
//! arrive as messages, so the actor never blocks on a worker and can answer
//! reads and cancellations at any time.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use alloy_config::ProviderConfig;
use alloy_model::{Message, Provider, Usage};

use crate::middleware::{run_hook, Hook};
use crate::pubsub::PubSubMessage;
use crate::state::{AgentConfig, AgentResult, AgentState, Session, Status};
use crate::turn::{self, Streaming};

/// Errors surfaced by the agent process API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// A worker is active; synchronous calls are rejected.
    #[error("busy")]
    Busy,
    /// The pending queue is at `max_pending`.
    #[error("queue_full")]
    QueueFull,
    /// `send_message` requires a configured pubsub handle.
    #[error("no_pubsub")]
    NoPubsub,
    /// No queued or running request carries this id.
    #[error("unknown request: {0}")]
    UnknownRequest(String),
    /// The agent process is gone.
    #[error("agent stopped")]
    Stopped,
}

/// Bounded-time health snapshot.
#[derive(Debug, Clone)]
pub struct Health {
    pub agent_id: String,
    pub status: Status,
    pub turns: u32,
    pub message_count: usize,
    pub usage: Usage,
    pub pending: usize,
    pub running_request_id: Option<String>,
}

enum Command {
    Chat {
        text: String,
        reply: oneshot::Sender<Result<AgentResult, AgentError>>,
    },
    StreamChat {
        text: String,
        streaming: Streaming,
        reply: oneshot::Sender<Result<AgentResult, AgentError>>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<String, AgentError>>,
    },
    CancelRequest {
        request_id: String,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Reset {
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    SetModel {
        provider: Arc<dyn Provider>,
        config: ProviderConfig,
        reply: oneshot::Sender<Result<(), AgentError>>,
    },
    Messages {
        reply: oneshot::Sender<Vec<Message>>,
    },
    GetUsage {
        reply: oneshot::Sender<Usage>,
    },
    GetHealth {
        reply: oneshot::Sender<Health>,
    },
    ExportSession {
        reply: oneshot::Sender<Session>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Messages the actor sends itself: worker lifecycle and subscribed events.
enum Internal {
    WorkerDone {
        request_id: String,
        state: Box<AgentState>,
    },
    WorkerCrashed {
        request_id: String,
        reason: String,
    },
    ExternalEvent {
        message: String,
    },
}

/// Cloneable handle to a running agent process.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    agent_id: String,
    outbox_topic: String,
}

/// Spawn an agent process and return its handle.
pub fn spawn(config: AgentConfig) -> AgentHandle {
    let state = AgentState::new(config);
    let (tx, rx) = mpsc::channel(64);
    let (internal_tx, internal_rx) = mpsc::channel(64);
    let handle = AgentHandle {
        tx,
        agent_id: state.agent_id.clone(),
        outbox_topic: state.outbox_topic(),
    };
    let outbox_topic = state.outbox_topic();
    tokio::spawn(async move {
        let mut actor = AgentActor {
            state,
            rx,
            internal_rx,
            internal_tx,
            pending: VecDeque::new(),
            running: None,
            outbox_topic,
            stop_reply: None,
        };
        actor.init().await;
        actor.run().await;
    });
    handle
}

impl AgentHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The topic asynchronous results are broadcast on.
    pub fn outbox_topic(&self) -> &str {
        &self.outbox_topic
    }

    /// Run one request to completion and return the result. Rejects with
    /// `Busy` while an asynchronous worker is in flight.
    pub async fn chat(&self, text: impl Into<String>) -> Result<AgentResult, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Chat { text: text.into(), reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    /// As [`chat`](Self::chat), streaming deltas through the callbacks.
    pub async fn stream_chat(
        &self,
        text: impl Into<String>,
        on_chunk: turn::ChunkHandler,
        on_event: Option<turn::EventHandler>,
    ) -> Result<AgentResult, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::StreamChat {
                text: text.into(),
                streaming: Streaming { on_chunk, on_event },
                reply,
            })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    /// Enqueue a request; the result arrives on the outbox topic. Returns
    /// the request id immediately.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<String, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SendMessage { text: text.into(), reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    /// Cancel a queued or running request. Exactly one response with this
    /// request id and `error = "cancelled"` is broadcast.
    pub async fn cancel_request(&self, request_id: impl Into<String>) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CancelRequest { request_id: request_id.into(), reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    /// Clear conversation and usage. Busy-rejecting.
    pub async fn reset(&self) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Reset { reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    /// Swap the provider and its config, preserving messages and usage.
    /// Busy-rejecting.
    pub async fn set_model(
        &self,
        provider: Arc<dyn Provider>,
        config: ProviderConfig,
    ) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SetModel { provider, config, reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)?
    }

    pub async fn messages(&self) -> Result<Vec<Message>, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Messages { reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    pub async fn usage(&self) -> Result<Usage, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetUsage { reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    pub async fn health(&self) -> Result<Health, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetHealth { reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    pub async fn export_session(&self) -> Result<Session, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ExportSession { reply })
            .await
            .map_err(|_| AgentError::Stopped)?;
        rx.await.map_err(|_| AgentError::Stopped)
    }

    /// Graceful shutdown: runs `session_end` middleware, releases the
    /// scratchpad, and invokes `on_shutdown` with the exported session.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// One-shot convenience: spawn an agent, run a single chat, stop it.
///
/// Used by the scheduler for periodic runs and by the library's top-level
/// `run` entry point.
pub async fn run_once(config: AgentConfig, prompt: &str) -> AgentResult {
    let agent = spawn(config);
    let result = match agent.chat(prompt).await {
        Ok(r) => r,
        Err(e) => AgentResult {
            request_id: None,
            text: String::new(),
            messages: Vec::new(),
            usage: Usage::default(),
            tool_calls: Vec::new(),
            status: Status::Error,
            turns: 0,
            error: Some(e.to_string()),
        },
    };
    agent.stop().await;
    result
}

struct RunningWorker {
    request_id: String,
    abort: AbortHandle,
}

struct AgentActor {
    state: AgentState,
    rx: mpsc::Receiver<Command>,
    internal_rx: mpsc::Receiver<Internal>,
    internal_tx: mpsc::Sender<Internal>,
    pending: VecDeque<(String, String)>,
    running: Option<RunningWorker>,
    outbox_topic: String,
    /// Deferred `stop` reply; answered only after terminate has run so
    /// callers observe a completed shutdown.
    stop_reply: Option<oneshot::Sender<()>>,
}

impl AgentActor {
    /// Startup: run `session_start` middleware once so subscription topics
    /// are read from the post-middleware config, then attach forwarders for
    /// each subscribed topic.
    async fn init(&mut self) {
        let _ = run_hook(&mut self.state, Hook::SessionStart).await;
        let pubsub = match &self.state.config.pubsub {
            Some(p) => Arc::clone(p),
            None => return,
        };
        for topic in self.state.config.subscribe_topics.clone() {
            let mut rx = pubsub.subscribe(&topic);
            let internal = self.internal_tx.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(PubSubMessage::AgentEvent { message }) => {
                            if internal.send(Internal::ExternalEvent { message }).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%topic, skipped, "subscription lagged; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
        }
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal).await,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    // Every handle dropped: shut down like a normal exit.
                    None => break,
                },
            }
        }
        self.terminate().await;
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Chat { text, reply } => {
                if self.running.is_some() {
                    let _ = reply.send(Err(AgentError::Busy));
                } else {
                    let result = self.run_inline(text, None).await;
                    let _ = reply.send(Ok(result));
                }
            }
            Command::StreamChat { text, streaming, reply } => {
                if self.running.is_some() {
                    let _ = reply.send(Err(AgentError::Busy));
                } else {
                    let result = self.run_inline(text, Some(streaming)).await;
                    let _ = reply.send(Ok(result));
                }
            }
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.accept_async(text));
            }
            Command::CancelRequest { request_id, reply } => {
                let _ = reply.send(self.cancel(request_id));
            }
            Command::Reset { reply } => {
                if self.running.is_some() {
                    let _ = reply.send(Err(AgentError::Busy));
                } else {
                    self.state.messages.clear();
                    self.state.usage = Usage::default();
                    self.state.turn = 0;
                    self.state.error = None;
                    self.state.status = Status::Idle;
                    let _ = reply.send(Ok(()));
                }
            }
            Command::SetModel { provider, config, reply } => {
                if self.running.is_some() {
                    let _ = reply.send(Err(AgentError::Busy));
                } else {
                    self.state.config.provider = provider;
                    self.state.config.provider_config = config;
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Messages { reply } => {
                let _ = reply.send(self.state.messages.clone());
            }
            Command::GetUsage { reply } => {
                let _ = reply.send(self.state.usage);
            }
            Command::GetHealth { reply } => {
                let _ = reply.send(Health {
                    agent_id: self.state.agent_id.clone(),
                    status: self.state.status,
                    turns: self.state.turn,
                    message_count: self.state.messages.len(),
                    usage: self.state.usage,
                    pending: self.pending.len(),
                    running_request_id: self.running.as_ref().map(|w| w.request_id.clone()),
                });
            }
            Command::ExportSession { reply } => {
                let _ = reply.send(self.state.export_session());
            }
            Command::Stop { reply } => {
                self.stop_reply = Some(reply);
                return true;
            }
        }
        false
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::WorkerDone { request_id, state } => {
                match &self.running {
                    Some(w) if w.request_id == request_id => {}
                    _ => {
                        // Completion raced a cancellation; the cancelled
                        // event was already broadcast and wins.
                        debug!(%request_id, "dropping stale worker completion");
                        return;
                    }
                }
                self.running = None;
                self.adopt(&state);
                self.publish(state.to_result(Some(request_id)));
                self.start_next();
            }
            Internal::WorkerCrashed { request_id, reason } => {
                match &self.running {
                    Some(w) if w.request_id == request_id => {}
                    _ => return,
                }
                self.running = None;
                warn!(%request_id, %reason, "worker crashed");
                let mut result = self.state.to_result(Some(request_id));
                result.status = Status::Error;
                result.error = Some(reason);
                self.state.status = Status::Idle;
                self.publish(result);
                self.start_next();
            }
            Internal::ExternalEvent { message } => {
                // Async and event-driven paths are mutually exclusive: a
                // busy agent drops the event.
                if self.running.is_some() {
                    warn!("dropping agent_event while a worker is active");
                    return;
                }
                let result = self.run_inline(message, None).await;
                self.publish(result);
            }
        }
    }

    /// Run a turn on the actor itself (the synchronous path).
    async fn run_inline(&mut self, text: String, streaming: Option<Streaming>) -> AgentResult {
        let mut wstate = self.state.clone();
        wstate.messages.push(Message::user(text));
        let final_state = turn::run_loop(wstate, streaming).await;
        self.adopt(&final_state);
        final_state.to_result(None)
    }

    /// Merge a finished turn's conversation back into the canonical state
    /// and leave the actor idle for the next request.
    fn adopt(&mut self, final_state: &AgentState) {
        self.state.messages = final_state.messages.clone();
        self.state.usage = final_state.usage;
        self.state.turn = final_state.turn;
        self.state.error = final_state.error.clone();
        self.state.status = Status::Idle;
    }

    fn accept_async(&mut self, text: String) -> Result<String, AgentError> {
        if self.state.config.pubsub.is_none() {
            return Err(AgentError::NoPubsub);
        }
        let request_id = Uuid::new_v4().to_string();
        if self.running.is_some() {
            if self.pending.len() >= self.state.config.settings.max_pending {
                return Err(AgentError::QueueFull);
            }
            self.pending.push_back((request_id.clone(), text));
        } else {
            self.spawn_worker(request_id.clone(), text);
        }
        Ok(request_id)
    }

    fn spawn_worker(&mut self, request_id: String, text: String) {
        let mut wstate = self.state.clone();
        wstate.messages.push(Message::user(text));
        let inner = tokio::spawn(turn::run_loop(wstate, None));
        let abort = inner.abort_handle();
        let internal = self.internal_tx.clone();
        let rid = request_id.clone();
        // Monitor task: converts worker termination into a mailbox message.
        tokio::spawn(async move {
            let msg = match inner.await {
                Ok(final_state) => Internal::WorkerDone {
                    request_id: rid,
                    state: Box::new(final_state),
                },
                // Aborted by cancel_request; the cancelled event is emitted
                // by the cancel path itself.
                Err(e) if e.is_cancelled() => return,
                Err(e) => Internal::WorkerCrashed {
                    request_id: rid,
                    reason: format!("worker panicked: {e}"),
                },
            };
            let _ = internal.send(msg).await;
        });
        self.state.status = Status::Running;
        self.running = Some(RunningWorker { request_id, abort });
    }

    fn start_next(&mut self) {
        if self.running.is_none() {
            if let Some((request_id, text)) = self.pending.pop_front() {
                self.spawn_worker(request_id, text);
            }
        }
    }

    fn cancel(&mut self, request_id: String) -> Result<(), AgentError> {
        let is_running = matches!(&self.running, Some(w) if w.request_id == request_id);
        if is_running {
            let w = self.running.take().expect("running checked above");
            w.abort.abort();
            self.state.status = Status::Idle;
            self.publish(self.cancelled_result(&request_id));
            self.start_next();
            return Ok(());
        }
        if let Some(pos) = self.pending.iter().position(|(id, _)| *id == request_id) {
            self.pending.remove(pos);
            self.publish(self.cancelled_result(&request_id));
            return Ok(());
        }
        Err(AgentError::UnknownRequest(request_id))
    }

    fn cancelled_result(&self, request_id: &str) -> AgentResult {
        AgentResult {
            request_id: Some(request_id.to_string()),
            text: String::new(),
            messages: self.state.messages.clone(),
            usage: self.state.usage,
            tool_calls: Vec::new(),
            status: Status::Error,
            turns: self.state.turn,
            error: Some("cancelled".into()),
        }
    }

    fn publish(&self, result: AgentResult) {
        if let Some(pubsub) = &self.state.config.pubsub {
            pubsub.publish(&self.outbox_topic, PubSubMessage::AgentResponse(result));
        }
    }

    /// Guaranteed cleanup. Runs on explicit stop and when every handle is
    /// dropped: release the scratchpad, run `session_end`, export the
    /// post-middleware session, and call `on_shutdown` inside a panic guard
    /// so a throwing callback cannot leak the process.
    async fn terminate(&mut self) {
        if let Some(w) = self.running.take() {
            w.abort.abort();
        }
        if let Some(scratchpad) = self.state.scratchpad.take() {
            scratchpad.stop();
        }
        let _ = run_hook(&mut self.state, Hook::SessionEnd).await;
        let session = self.state.export_session();
        if let Some(on_shutdown) = self.state.config.on_shutdown.clone() {
            if catch_unwind(AssertUnwindSafe(|| on_shutdown(session))).is_err() {
                warn!("on_shutdown callback panicked; ignoring");
            }
        }
        if let Some(reply) = self.stop_reply.take() {
            let _ = reply.send(());
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
