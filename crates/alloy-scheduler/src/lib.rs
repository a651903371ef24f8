// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Periodic agent runs.
//!
//! One actor owns the job table, the pending timers, and the set of running
//! job names. Ticks never overlap: a tick that fires while the previous run
//! is still going is logged and rescheduled. Every job carries a monotonic
//! generation; a run that finishes after its job was removed or replaced is
//! detected by generation mismatch and its result is dropped silently.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use alloy_core::{run_once, AgentConfig, AgentResult};

/// Callback invoked with each completed (non-stale) run's result.
pub type ResultFn = Arc<dyn Fn(AgentResult) + Send + Sync>;

/// A periodic job definition.
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub every: Duration,
    pub prompt: String,
    /// Agent assembly used for each run; every tick gets a fresh agent.
    pub config: AgentConfig,
    pub on_result: ResultFn,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("already running")]
    AlreadyRunning,
    #[error("scheduler stopped")]
    Stopped,
}

enum Command {
    AddJob {
        spec: JobSpec,
        reply: oneshot::Sender<()>,
    },
    RemoveJob {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Trigger {
        name: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    Jobs {
        reply: oneshot::Sender<Vec<String>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

enum Internal {
    Tick { name: String },
    RunDone { name: String, generation: u64, result: AgentResult },
}

#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<Command>,
}

impl Scheduler {
    pub fn spawn() -> Scheduler {
        let (tx, rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            SchedulerActor {
                jobs: HashMap::new(),
                timers: HashMap::new(),
                running: HashSet::new(),
                next_generation: 0,
                rx,
                internal_rx,
                internal_tx,
            }
            .run()
            .await;
        });
        Scheduler { tx }
    }

    /// Register (or replace) a job; its first tick fires after one interval.
    pub async fn add_job(&self, spec: JobSpec) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::AddJob { spec, reply })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Cancel the pending timer and forget the job. A concurrently-running
    /// tick's result will be dropped by the generation check.
    pub async fn remove_job(&self, name: impl Into<String>) -> Result<bool, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::RemoveJob { name: name.into(), reply })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Run the job immediately; rejects while a run is in flight.
    pub async fn trigger(&self, name: impl Into<String>) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Trigger { name: name.into(), reply })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    pub async fn jobs(&self) -> Result<Vec<String>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Jobs { reply })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct JobEntry {
    spec: JobSpec,
    generation: u64,
}

struct SchedulerActor {
    jobs: HashMap<String, JobEntry>,
    timers: HashMap<String, AbortHandle>,
    running: HashSet<String>,
    next_generation: u64,
    rx: mpsc::Receiver<Command>,
    internal_rx: mpsc::Receiver<Internal>,
    internal_tx: mpsc::Sender<Internal>,
}

impl SchedulerActor {
    async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd) {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
    }

    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::AddJob { spec, reply } => {
                self.next_generation += 1;
                let name = spec.name.clone();
                if let Some(timer) = self.timers.remove(&name) {
                    timer.abort();
                }
                self.jobs.insert(
                    name.clone(),
                    JobEntry { spec, generation: self.next_generation },
                );
                self.schedule_tick(&name);
                let _ = reply.send(());
            }
            Command::RemoveJob { name, reply } => {
                if let Some(timer) = self.timers.remove(&name) {
                    timer.abort();
                }
                let _ = reply.send(self.jobs.remove(&name).is_some());
            }
            Command::Trigger { name, reply } => {
                let _ = reply.send(self.start_run(&name));
            }
            Command::Jobs { reply } => {
                let mut names: Vec<String> = self.jobs.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
            Command::Stop { reply } => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Tick { name } => {
                if !self.jobs.contains_key(&name) {
                    return;
                }
                match self.start_run(&name) {
                    Ok(()) => {}
                    Err(SchedulerError::AlreadyRunning) => {
                        debug!(job = %name, "previous run still in flight; skipping tick");
                    }
                    Err(_) => return,
                }
                self.schedule_tick(&name);
            }
            Internal::RunDone { name, generation, result } => {
                self.running.remove(&name);
                match self.jobs.get(&name) {
                    Some(entry) if entry.generation == generation => {
                        (entry.spec.on_result)(result);
                    }
                    _ => {
                        // The job was removed or replaced while this run was
                        // in flight; its result no longer has an owner.
                        debug!(job = %name, generation, "dropping stale job result");
                    }
                }
            }
        }
    }

    fn schedule_tick(&mut self, name: &str) {
        let entry = match self.jobs.get(name) {
            Some(e) => e,
            None => return,
        };
        let every = entry.spec.every;
        let internal = self.internal_tx.clone();
        let name_owned = name.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(every).await;
            let _ = internal.send(Internal::Tick { name: name_owned }).await;
        });
        if let Some(old) = self.timers.insert(name.to_string(), timer.abort_handle()) {
            old.abort();
        }
    }

    fn start_run(&mut self, name: &str) -> Result<(), SchedulerError> {
        let entry = self
            .jobs
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        if self.running.contains(name) {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.running.insert(name.to_string());
        let generation = entry.generation;
        let config = entry.spec.config.clone();
        let prompt = entry.spec.prompt.clone();
        let internal = self.internal_tx.clone();
        let name_owned = name.to_string();
        tokio::spawn(async move {
            let result = run_once(config, &prompt).await;
            if result.error.is_some() {
                warn!(job = %name_owned, error = ?result.error, "scheduled run ended with error");
            }
            let _ = internal
                .send(Internal::RunDone { name: name_owned, generation, result })
                .await;
        });
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
