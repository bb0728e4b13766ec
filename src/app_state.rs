// =============================================================================
// AppState — shared handles mounted into the Axum router
// =============================================================================
//
// Everything here is either already internally synchronized (`PositionBook`,
// `EventBus`, `PersistentStore`'s pool) or cheap to clone (`Arc`), so
// `AppState` itself derives `Clone` and is handed to `axum::Router::with_state`
// directly rather than wrapped in an outer `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use std::time::Instant;

use crate::config::RuntimeConfig;
use crate::dispatcher::SignalDispatcher;
use crate::events::EventBus;
use crate::exchange::ExchangeClient;
use crate::market_data::CandleBuffer;
use crate::position_book::PositionBook;
use crate::store::PersistentStore;
use crate::types::DecisionEnvelope;

/// Bounded in-memory ring buffer of `DecisionEnvelope`s, one push per
/// `StrategyRunner` tick regardless of whether it produced a signal.
pub struct DecisionLog {
    buf: Mutex<std::collections::VecDeque<DecisionEnvelope>>,
    capacity: usize,
}

/// Matches the default ring-buffer depth used elsewhere for "recent N" style
/// surfaces (order history, recent signals) — enough for a dashboard without
/// unbounded growth.
pub const DEFAULT_DECISION_LOG_CAPACITY: usize = 500;

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self { buf: Mutex::new(std::collections::VecDeque::with_capacity(capacity)), capacity }
    }

    pub fn push(&self, envelope: DecisionEnvelope) {
        let mut buf = self.buf.lock();
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(envelope);
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> Vec<DecisionEnvelope> {
        let buf = self.buf.lock();
        buf.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(DEFAULT_DECISION_LOG_CAPACITY)
    }
}

/// Fast in-memory "seen recently" guard sitting ahead of the durable
/// `PersistentStore::has_signal` check — lets the webhook handler reject an
/// obvious replay without a database round trip (§6).
#[derive(Default)]
pub struct WebhookDedup {
    seen: Mutex<HashMap<String, Instant>>,
}

impl WebhookDedup {
    /// Whether `alert_id` was recorded within the last `ttl`. Sweeps expired
    /// entries opportunistically so the map doesn't grow unbounded under
    /// sustained traffic. Read-only — callers decide separately whether to
    /// `mark` it, since a `502 send_failed` response must NOT consume the
    /// dedup slot (§6: operator retries must be allowed).
    pub fn seen(&self, alert_id: &str, ttl: std::time::Duration) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now.duration_since(*at) < ttl);
        seen.get(alert_id).is_some_and(|at| now.duration_since(*at) < ttl)
    }

    pub fn mark(&self, alert_id: &str) {
        self.seen.lock().insert(alert_id.to_string(), Instant::now());
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PersistentStore>,
    pub position_book: Arc<PositionBook>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub events: Arc<EventBus>,
    pub dispatcher: Arc<SignalDispatcher>,
    pub candles: Arc<CandleBuffer>,
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub webhook_dedup: Arc<WebhookDedup>,
    pub decisions: Arc<DecisionLog>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<PersistentStore>,
        position_book: Arc<PositionBook>,
        exchange: Arc<dyn ExchangeClient>,
        events: Arc<EventBus>,
        dispatcher: Arc<SignalDispatcher>,
        candles: Arc<CandleBuffer>,
        config: Arc<RwLock<RuntimeConfig>>,
        decisions: Arc<DecisionLog>,
    ) -> Self {
        Self {
            store,
            position_book,
            exchange,
            events,
            dispatcher,
            candles,
            config,
            webhook_dedup: Arc::new(WebhookDedup::default()),
            decisions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DecisionEnvelope, Side};

    fn envelope(id: u64) -> DecisionEnvelope {
        DecisionEnvelope {
            id,
            coin: "BTC".into(),
            side: Some(Side::Long),
            strategy: "test".into(),
            verdict: "no_signal".into(),
            blocking_stage: None,
            reason: None,
            created_at: 0,
        }
    }

    #[test]
    fn decision_log_evicts_oldest_beyond_capacity() {
        let log = DecisionLog::new(2);
        log.push(envelope(1));
        log.push(envelope(2));
        log.push(envelope(3));
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, 3);
        assert_eq!(recent[1].id, 2);
    }

    #[test]
    fn webhook_dedup_flags_repeat_within_ttl() {
        let dedup = WebhookDedup::default();
        let ttl = std::time::Duration::from_secs(60);
        assert!(!dedup.seen("alert-1", ttl));
        dedup.mark("alert-1");
        assert!(dedup.seen("alert-1", ttl));
    }
}
