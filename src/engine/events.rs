//! In-process pub/sub for pipeline lifecycle events.
//!
//! Every subscriber owns a bounded channel. Publishing never waits: if a
//! subscriber's buffer is full the event is dropped for that subscriber only,
//! so a slow WebSocket client can never stall a phase runner. Consumers that
//! suspect a gap re-read state over REST.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Per-subscriber buffer depth.
pub const SUBSCRIBER_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "phase.started")]
    PhaseStarted,
    #[serde(rename = "phase.completed")]
    PhaseCompleted,
    #[serde(rename = "phase.gate")]
    PhaseGate,
    #[serde(rename = "issue.status_changed")]
    IssueStatusChanged,
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    #[serde(rename = "agent.output")]
    AgentOutput,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "metrics.updated")]
    MetricsUpdated,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "execution.started")]
    ExecutionStarted,
    #[serde(rename = "execution.output")]
    ExecutionOutput,
    #[serde(rename = "execution.message")]
    ExecutionMessage,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.waiting_input")]
    ExecutionWaitingInput,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    pub fn new(kind: EventType, data: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Receiving half handed to a subscriber. Pass `id` back to
/// [`EventBus::unsubscribe`] to close it.
#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(u64, mpsc::Sender<Event>)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subs) = self.subscribers.write() {
            subs.push((id, tx));
        }
        Subscription { id, rx }
    }

    /// Drop the sender for `id`; the subscriber's `recv` then yields `None`.
    pub fn unsubscribe(&self, id: u64) {
        if let Ok(mut subs) = self.subscribers.write() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Stamp the event and fan it out without blocking.
    pub fn publish(&self, mut event: Event) {
        event.timestamp = Utc::now();
        let Ok(subs) = self.subscribers.read() else {
            return;
        };
        for (_, tx) in subs.iter() {
            // Full or closed: drop for this subscriber.
            let _ = tx.try_send(event.clone());
        }
    }

    /// Convenience wrapper for `publish(Event::new(kind, data))`.
    pub fn emit(&self, kind: EventType, data: Value) {
        self.publish(Event::new(kind, data));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}
