//! WebSocket fan-out of engine events.
//!
//! Every loaded run's event bus gets a forwarder task that tags each event
//! with its `run_id` and pushes the JSON onto one broadcast channel. Each
//! socket then drains that channel in its own loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::AppState;
use crate::engine::events::{Event, EventBus};

/// Interval between keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A socket that has not answered a ping within this window is dropped.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const HUB_BUFFER: usize = 256;

struct Forwarder {
    bus: Arc<EventBus>,
    subscription: u64,
    task: JoinHandle<()>,
}

impl Forwarder {
    fn stop(self) {
        self.task.abort();
        self.bus.unsubscribe(self.subscription);
    }
}

pub struct WsHub {
    tx: broadcast::Sender<String>,
    forwarders: Mutex<HashMap<String, Forwarder>>,
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize an event and add a top-level `run_id` unless it is empty.
pub fn tag_event(run_id: &str, event: &Event) -> Option<String> {
    let mut value = serde_json::to_value(event).ok()?;
    if !run_id.is_empty()
        && let Value::Object(obj) = &mut value
    {
        obj.insert("run_id".to_string(), Value::String(run_id.to_string()));
    }
    serde_json::to_string(&value).ok()
}

impl WsHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_BUFFER);
        Self {
            tx,
            forwarders: Mutex::new(HashMap::new()),
        }
    }

    /// Forward `bus` to every socket, replacing any forwarder for `run_id`.
    pub fn add_event_bus(&self, run_id: &str, bus: Arc<EventBus>) {
        let mut sub = bus.subscribe();
        let subscription = sub.id;
        let tx = self.tx.clone();
        let tag = run_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = sub.rx.recv().await {
                if let Some(json) = tag_event(&tag, &event) {
                    // No sockets connected is fine.
                    let _ = tx.send(json);
                }
            }
        });

        let forwarder = Forwarder {
            bus,
            subscription,
            task,
        };
        let previous = self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.to_string(), forwarder);
        if let Some(old) = previous {
            old.stop();
        }
    }

    pub fn remove_event_bus(&self, run_id: &str) {
        let removed = self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        if let Some(f) = removed {
            f.stop();
        }
    }

    pub fn forwarder_count(&self) -> usize {
        self.forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let rx = state.hub.subscribe();
    ws.on_upgrade(move |socket| {
        let (sender, receiver) = socket.split();
        run_socket_loop(sender, receiver, rx)
    })
}

/// Forward hub messages to one socket until it closes, errors, or stops
/// answering pings. Client messages other than pong/close are ignored.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("WebSocket client missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "WebSocket client lagging, events dropped");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
