// =============================================================================
// ReconcileLoop — bidirectional book/store/exchange reconciliation (§4.6)
// =============================================================================
//
// Runs on a fixed interval, one tick at a time (a tick never overlaps the
// next). Compares the in-memory PositionBook against the venue's reported
// positions: a venue position with no book counterpart is hydrated with
// `stopLoss = 0, signalId = -1` (the same sentinel the dispatcher's rollback
// path uses, see Position::hydrated); a book position with no venue
// counterpart is closed locally. Size drift up to 1% is tolerated as noise
// and simply adopts the venue's reported size. Pending orders are synced
// through openOrders -> historicalOrders -> getOrderStatus, in that order,
// stopping at the first source that resolves the order. Every tick ends
// with exactly one `reconcile_ok`/`reconcile_drift` event and one appended
// equity snapshot.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, EventTopic};
use crate::exchange::{ExchangeClient, VenueOrderStatus};
use crate::position_book::PositionBook;
use crate::store::PersistentStore;
use crate::types::{OrderStatus, Position};

/// Relative size drift tolerated between the book and the venue before it is
/// reported as drift rather than silently adopted (§4.6).
const SIZE_DRIFT_TOLERANCE: f64 = 0.01;

pub struct ReconcileLoop {
    position_book: Arc<PositionBook>,
    store: Arc<PersistentStore>,
    exchange: Arc<dyn ExchangeClient>,
    events: Arc<EventBus>,
    interval: std::time::Duration,
}

/// What a single tick found, surfaced mainly for tests and the
/// `reconcile_ok` / `reconcile_drift` event payload.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub hydrated_coins: Vec<String>,
    pub closed_coins: Vec<String>,
    pub drifted_coins: Vec<String>,
    pub orders_synced: u32,
    pub equity: f64,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.hydrated_coins.is_empty() && self.closed_coins.is_empty() && self.drifted_coins.is_empty()
    }
}

impl ReconcileLoop {
    pub fn new(
        position_book: Arc<PositionBook>,
        store: Arc<PersistentStore>,
        exchange: Arc<dyn ExchangeClient>,
        events: Arc<EventBus>,
        interval: std::time::Duration,
    ) -> Self {
        Self { position_book, store, exchange, events, interval }
    }

    /// Run ticks on `interval` until `cancel` fires. Ticks never overlap:
    /// the next tick is scheduled only after the previous one (including
    /// its exchange calls) has fully returned.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("reconcile loop stopping");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }

            match self.tick().await {
                Ok(report) => {
                    if report.is_clean() {
                        debug!(orders_synced = report.orders_synced, "reconcile tick clean");
                    } else {
                        warn!(
                            hydrated = ?report.hydrated_coins,
                            closed = ?report.closed_coins,
                            drifted = ?report.drifted_coins,
                            "reconcile tick found drift"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "reconcile tick failed");
                }
            }
        }
    }

    /// Run a single reconciliation pass. Public so the supervisor can force
    /// an initial reconcile at startup before any StrategyRunner begins
    /// trading.
    pub async fn tick(&self) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let venue_positions = self.exchange.get_positions().await?;
        let book_positions = self.position_book.all();

        // Venue -> book: hydrate anything the venue reports that the book
        // doesn't know about, and reconcile size drift on the rest.
        for vp in &venue_positions {
            match self.position_book.get(&vp.coin) {
                None => {
                    let pos = Position::hydrated(vp.coin.clone(), vp.direction, vp.entry_price, vp.size, vp.leverage, Utc::now().timestamp());
                    self.position_book.open(pos);
                    report.hydrated_coins.push(vp.coin.clone());
                    self.events
                        .publish(EventTopic::Positions, serde_json::json!({"event": "hydrated", "coin": vp.coin, "size": vp.size}))
                        .await;
                }
                Some(local) => {
                    let drift = (local.size - vp.size).abs() / vp.size.max(1e-9);
                    if drift > SIZE_DRIFT_TOLERANCE {
                        report.drifted_coins.push(vp.coin.clone());
                        warn!(coin = %vp.coin, local_size = local.size, venue_size = vp.size, "position size drift exceeds tolerance, adopting venue size");
                        self.position_book.reduce_size(&vp.coin, local.size - vp.size);
                    }

                    // Always refresh currentPrice/unrealizedPnl from the
                    // venue (§4.6 point 2), independent of whether drift was
                    // within tolerance. The venue reports `unrealized_pnl`
                    // already sign-adjusted for direction (positive means
                    // profit whichever side it is), so inverting it back to
                    // a price needs the same sign `PositionBook::update_price`
                    // applies: `currentPrice = entryPrice +/- unrealizedPnl/size`,
                    // `+` for long, `-` for short — which reproduces the
                    // venue's figure exactly once `update_price` recomputes it.
                    if vp.size > 0.0 {
                        let sign = if vp.direction.is_long() { 1.0 } else { -1.0 };
                        let current_price = vp.entry_price + sign * vp.unrealized_pnl / vp.size;
                        self.position_book.update_price(&vp.coin, current_price);
                    }
                }
            }
        }

        // Book -> venue: anything the book thinks is open that the venue no
        // longer reports is closed locally.
        for local in &book_positions {
            if !venue_positions.iter().any(|vp| vp.coin == local.coin) {
                self.position_book.close(&local.coin);
                report.closed_coins.push(local.coin.clone());
                self.events
                    .publish(EventTopic::Positions, serde_json::json!({"event": "auto_closed", "coin": local.coin}))
                    .await;
            }
        }

        report.orders_synced = self.sync_pending_orders().await?;

        let equity = self.exchange.get_account_equity().await?;
        report.equity = equity;
        self.store
            .insert_equity_snapshot(Utc::now().timestamp(), equity, self.position_book.count() as u32)
            .await?;
        self.events
            .publish(EventTopic::Equity, serde_json::json!({"equity": equity, "open_positions": self.position_book.count()}))
            .await;

        if report.is_clean() {
            self.events.publish(EventTopic::Health, serde_json::json!({"event": "reconcile_ok"})).await;
        } else {
            self.events
                .publish(
                    EventTopic::Health,
                    serde_json::json!({
                        "event": "reconcile_drift",
                        "hydrated": report.hydrated_coins,
                        "closed": report.closed_coins,
                        "drifted": report.drifted_coins,
                    }),
                )
                .await;
        }

        Ok(report)
    }

    /// Resolve every locally-pending order through openOrders, falling back
    /// to historicalOrders, falling back to a direct getOrderStatus call —
    /// stopping at the first source that answers for a given order.
    async fn sync_pending_orders(&self) -> anyhow::Result<u32> {
        let pending = self.store.get_pending_orders().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let open_orders = self.exchange.get_open_orders().await.unwrap_or_default();
        let mut synced = 0u32;

        for order in pending {
            let Some(exchange_id) = order.exchange_order_id.clone() else { continue };

            if open_orders.iter().any(|o| o.order_id == exchange_id) {
                continue; // still open, nothing to sync
            }

            let historical = self.exchange.get_historical_orders(&order.coin).await.unwrap_or_default();
            let status = if let Some(found) = historical.iter().find(|o| o.order_id == exchange_id) {
                Some(found.status)
            } else {
                match self.exchange.get_order_status(&order.coin, &exchange_id).await {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(coin = %order.coin, order_id = %exchange_id, error = %e, "could not resolve pending order status");
                        None
                    }
                }
            };

            if let Some(status) = status {
                let mapped = match status {
                    VenueOrderStatus::Open => continue,
                    VenueOrderStatus::Filled => OrderStatus::Filled,
                    VenueOrderStatus::Cancelled => OrderStatus::Cancelled,
                    VenueOrderStatus::Rejected => OrderStatus::Rejected,
                };
                self.store.update_order_status(order.id, mapped).await?;
                synced += 1;
            }
        }

        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::error::ExchangeError;
    use crate::exchange::{AccountState, ExchangeOrder, ExchangePosition, FillResult};
    use crate::types::Side;

    struct FakeExchange {
        positions: Mutex<Vec<ExchangePosition>>,
        open_orders: Mutex<Vec<ExchangeOrder>>,
        historical_orders: Mutex<Vec<ExchangeOrder>>,
        equity: f64,
    }

    impl FakeExchange {
        fn new() -> Self {
            Self { positions: Mutex::new(Vec::new()), open_orders: Mutex::new(Vec::new()), historical_orders: Mutex::new(Vec::new()), equity: 10_000.0 }
        }
    }

    #[async_trait]
    impl ExchangeClient for FakeExchange {
        async fn connect(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn get_sz_decimals(&self, _coin: &str) -> Result<u32, ExchangeError> {
            Ok(3)
        }
        async fn set_leverage(&self, _coin: &str, _leverage: u32, _is_cross: bool) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn place_entry_order(&self, _coin: &str, _is_buy: bool, size: f64, reference_price: f64, _slippage_bps: u32) -> Result<FillResult, ExchangeError> {
            Ok(FillResult { order_id: "e".into(), filled_size: size, avg_price: reference_price })
        }
        async fn place_stop_order(&self, _coin: &str, _is_buy: bool, size: f64, trigger_price: f64, _reduce_only: bool) -> Result<FillResult, ExchangeError> {
            Ok(FillResult { order_id: "s".into(), filled_size: size, avg_price: trigger_price })
        }
        async fn place_limit_order(&self, _coin: &str, _is_buy: bool, size: f64, price: f64, _reduce_only: bool) -> Result<FillResult, ExchangeError> {
            Ok(FillResult { order_id: "l".into(), filled_size: size, avg_price: price })
        }
        async fn place_market_order(&self, _coin: &str, _is_buy: bool, size: f64) -> Result<FillResult, ExchangeError> {
            Ok(FillResult { order_id: "m".into(), filled_size: size, avg_price: 0.0 })
        }
        async fn cancel_order(&self, _coin: &str, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(self.positions.lock().clone())
        }
        async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            Ok(self.open_orders.lock().clone())
        }
        async fn get_historical_orders(&self, _coin: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            Ok(self.historical_orders.lock().clone())
        }
        async fn get_order_status(&self, _coin: &str, _order_id: &str) -> Result<VenueOrderStatus, ExchangeError> {
            Ok(VenueOrderStatus::Filled)
        }
        async fn get_account_equity(&self) -> Result<f64, ExchangeError> {
            Ok(self.equity)
        }
        async fn get_account_state(&self) -> Result<AccountState, ExchangeError> {
            Ok(AccountState { equity: self.equity, free_collateral: self.equity })
        }
        async fn get_mid_price(&self, _coin: &str) -> Result<f64, ExchangeError> {
            Ok(100.0)
        }
    }

    async fn harness() -> (ReconcileLoop, Arc<PositionBook>, Arc<FakeExchange>) {
        let store = Arc::new(PersistentStore::open_in_memory().await.unwrap());
        let position_book = Arc::new(PositionBook::new());
        let events = Arc::new(EventBus::new());
        let exchange = Arc::new(FakeExchange::new());
        let reconcile = ReconcileLoop::new(position_book.clone(), store, exchange.clone(), events, std::time::Duration::from_secs(10));
        (reconcile, position_book, exchange)
    }

    #[tokio::test]
    async fn hydrates_unknown_venue_position() {
        let (reconcile, book, exchange) = harness().await;
        exchange.positions.lock().push(ExchangePosition { coin: "BTC".into(), direction: Side::Long, entry_price: 50_000.0, size: 0.1, leverage: 3, liquidation_px: 40_000.0, unrealized_pnl: 0.0 });

        let report = reconcile.tick().await.unwrap();
        assert_eq!(report.hydrated_coins, vec!["BTC".to_string()]);
        let pos = book.get("BTC").unwrap();
        assert_eq!(pos.signal_id, -1);
        assert_eq!(pos.stop_loss, 0.0);
    }

    #[tokio::test]
    async fn auto_closes_vanished_local_position() {
        let (reconcile, book, _exchange) = harness().await;
        book.open(Position::hydrated("ETH".into(), Side::Long, 2000.0, 1.0, 3, 0));

        let report = reconcile.tick().await.unwrap();
        assert_eq!(report.closed_coins, vec!["ETH".to_string()]);
        assert!(book.is_flat("ETH"));
    }

    #[tokio::test]
    async fn tolerates_size_drift_under_one_percent() {
        let (reconcile, book, exchange) = harness().await;
        book.open(Position::hydrated("BTC".into(), Side::Long, 50_000.0, 1.0005, 3, 0));
        exchange.positions.lock().push(ExchangePosition { coin: "BTC".into(), direction: Side::Long, entry_price: 50_000.0, size: 1.0, leverage: 3, liquidation_px: 40_000.0, unrealized_pnl: 0.0 });

        let report = reconcile.tick().await.unwrap();
        assert!(report.drifted_coins.is_empty());
    }

    #[tokio::test]
    async fn reports_drift_beyond_tolerance() {
        let (reconcile, book, exchange) = harness().await;
        book.open(Position::hydrated("BTC".into(), Side::Long, 50_000.0, 1.5, 3, 0));
        exchange.positions.lock().push(ExchangePosition { coin: "BTC".into(), direction: Side::Long, entry_price: 50_000.0, size: 1.0, leverage: 3, liquidation_px: 40_000.0, unrealized_pnl: 0.0 });

        let report = reconcile.tick().await.unwrap();
        assert_eq!(report.drifted_coins, vec!["BTC".to_string()]);
    }

    #[tokio::test]
    async fn refreshes_short_position_price_with_correct_sign() {
        let (reconcile, book, exchange) = harness().await;
        book.open(Position::hydrated("BTC".into(), Side::Short, 50_000.0, 1.0, 3, 0));
        // Venue price fell to 49_000 on a short entered at 50_000: +1000 profit
        // per unit, reported already sign-adjusted as a positive unrealized_pnl.
        exchange.positions.lock().push(ExchangePosition { coin: "BTC".into(), direction: Side::Short, entry_price: 50_000.0, size: 1.0, leverage: 3, liquidation_px: 60_000.0, unrealized_pnl: 1_000.0 });

        reconcile.tick().await.unwrap();
        let pos = book.get("BTC").unwrap();
        assert!((pos.current_price - 49_000.0).abs() < 1e-9);
        assert!((pos.unrealized_pnl - 1_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn clean_tick_appends_equity_snapshot() {
        let store = Arc::new(PersistentStore::open_in_memory().await.unwrap());
        let position_book = Arc::new(PositionBook::new());
        let events = Arc::new(EventBus::new());
        let exchange = Arc::new(FakeExchange::new());
        let reconcile = ReconcileLoop::new(position_book, store.clone(), exchange, events, std::time::Duration::from_secs(10));

        let report = reconcile.tick().await.unwrap();
        assert!(report.is_clean());
        let equity = store.get_recent_equity(1).await.unwrap();
        assert_eq!(equity.len(), 1);
        assert_eq!(equity[0].1, 10_000.0);
    }
}
