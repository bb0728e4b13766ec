// =============================================================================
// EventBus — broadcast hub with per-observer-drop backpressure (§4.7)
// =============================================================================
//
// Every meaningful state change (a position opening or closing, an order
// filling, a price update, a health transition) is published here as a
// structured `Event`. Each WebSocket connection subscribes its own receiver;
// a receiver that falls behind sees `RecvError::Lagged` on its next `recv()`
// rather than blocking the publisher or any other observer — that is
// `tokio::sync::broadcast`'s native behavior, and exactly the per-observer-drop
// policy this component is required to implement. The durable JSONL log is a
// separate, independent sink so a slow websocket client never stalls it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// Topic tag for a published event, matching the WebSocket subscription
/// filter clients may pass (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventTopic {
    Snapshot,
    Positions,
    Orders,
    OpenOrders,
    Equity,
    Health,
    Candle,
    Signals,
    Prices,
}

impl std::fmt::Display for EventTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).ok().and_then(|v| v.as_str().map(str::to_string));
        write!(f, "{}", s.unwrap_or_else(|| "unknown".to_string()))
    }
}

/// A single published event: topic, timestamp, and arbitrary structured
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: EventTopic,
    pub ts: i64,
    pub data: serde_json::Value,
}

/// Wraps a raw broadcast receive, marking whether this delivery lost events
/// the observer never saw.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: Event,
    pub lossy: bool,
}

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<Event>,
    log_path: Option<PathBuf>,
    log_lock: Mutex<()>,
}

impl EventBus {
    /// Construct a bus with no durable log (tests, or a run with logging
    /// disabled).
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender, log_path: None, log_lock: Mutex::new(()) }
    }

    /// Construct a bus that also appends every published event as a JSONL
    /// line to `log_path`.
    pub fn with_log(log_path: PathBuf) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender, log_path: Some(log_path), log_lock: Mutex::new(()) }
    }

    /// Subscribe a new observer. Each subscriber gets its own lagging
    /// behavior independent of all others.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers and append it to the
    /// durable log, if configured. Publish never blocks on slow subscribers —
    /// `broadcast::Sender::send` only fails when there are zero receivers,
    /// which is not an error condition here.
    pub async fn publish(self: &Arc<Self>, topic: EventTopic, data: serde_json::Value) {
        let event = Event { topic, ts: Utc::now().timestamp_millis(), data };
        let _ = self.sender.send(event.clone());
        self.append_to_log(&event).await;
    }

    async fn append_to_log(&self, event: &Event) {
        let Some(path) = &self.log_path else { return };
        let line = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to serialize event for durable log");
                return;
            }
        };

        let _guard = self.log_lock.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(error = %e, path = %path.display(), "failed to append event to durable log");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive a subscribed receiver forward one delivery, translating a lag into
/// a `lossy` marker on the next event actually delivered rather than
/// propagating the error to the caller.
pub async fn next_delivery(rx: &mut broadcast::Receiver<Event>) -> Option<Delivery> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(Delivery { event, lossy: false }),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "websocket observer lagged — marking next delivery lossy");
                match rx.recv().await {
                    Ok(event) => return Some(Delivery { event, lossy: true }),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_publish_round_trips() {
        let bus = Arc::new(EventBus::new());
        let mut rx = bus.subscribe();
        bus.publish(EventTopic::Health, serde_json::json!({"ok": true})).await;
        let delivery = next_delivery(&mut rx).await.unwrap();
        assert_eq!(delivery.event.topic, EventTopic::Health);
        assert!(!delivery.lossy);
    }

    #[tokio::test]
    async fn lagging_observer_gets_marked_lossy() {
        let (sender, mut rx) = broadcast::channel::<Event>(2);
        for i in 0..5 {
            let _ = sender.send(Event { topic: EventTopic::Prices, ts: i, data: serde_json::json!(i) });
        }
        let delivery = next_delivery(&mut rx).await.unwrap();
        assert!(delivery.lossy);
    }

    #[tokio::test]
    async fn independent_observers_each_see_full_stream_absent_lag() {
        let bus = Arc::new(EventBus::new());
        let mut rx_a = bus.subscribe();
        let mut rx_b = bus.subscribe();
        bus.publish(EventTopic::Orders, serde_json::json!({"id": 1})).await;
        let a = next_delivery(&mut rx_a).await.unwrap();
        let b = next_delivery(&mut rx_b).await.unwrap();
        assert!(!a.lossy && !b.lossy);
    }
}
