// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Topic-keyed publish/subscribe fan-out.
//!
//! The outbox for asynchronous agent replies and the transport for
//! event-driven turns. Topics are created on first use; publishing to a
//! topic with no subscribers drops the message (fire-and-forget). Slow
//! subscribers lose oldest messages per `tokio::sync::broadcast` semantics.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::state::AgentResult;

/// Messages travelling over pubsub topics.
#[derive(Debug, Clone)]
pub enum PubSubMessage {
    /// An asynchronous turn result on an agent's outbox topic.
    AgentResponse(AgentResult),
    /// An external event that drives a turn on a subscribed agent.
    AgentEvent { message: String },
}

const TOPIC_CAPACITY: usize = 64;

#[derive(Default)]
pub struct PubSub {
    topics: Mutex<HashMap<String, broadcast::Sender<PubSubMessage>>>,
}

impl PubSub {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<PubSubMessage> {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    pub fn publish(&self, topic: &str, message: PubSubMessage) {
        let sender = self.sender_for(topic);
        if sender.send(message).is_err() {
            debug!(topic, "published to topic with no subscribers");
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<PubSubMessage> {
        self.sender_for(topic).subscribe()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
