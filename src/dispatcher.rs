// =============================================================================
// SignalDispatcher — turns a Signal into a protected open position (§4.4)
// =============================================================================
//
// Idempotent, single-writer-per-coin pipeline: gate -> serialize -> dedup ->
// size -> risk-check -> leverage -> entry -> stop-loss (critical, with
// rollback) -> take-profits (best-effort) -> hydration-reconcile -> notify.
// Eleven steps total, each one able to short-circuit the rest with an
// explicit rejection or failure outcome.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::{Guardrails, InstrumentConfig, SizingPolicy};
use crate::error::{DispatchOutcome, RejectReason};
use crate::events::{EventBus, EventTopic};
use crate::exchange::ExchangeClient;
use crate::position_book::PositionBook;
use crate::store::{OrderRecordDraft, PersistentStore, SignalRecordDraft};
use crate::types::{AccountMode, OrderIntent, OrderStatus, OrderTag, OrderType, Position, Side, Signal, SignalSource};

/// Everything the dispatcher needs about where a signal came from and which
/// instrument it targets.
pub struct DispatchRequest<'a> {
    pub signal: &'a Signal,
    pub current_price: f64,
    pub source: SignalSource,
    pub alert_id: Option<String>,
    pub coin: &'a str,
    pub instrument: &'a InstrumentConfig,
}

pub struct SignalDispatcher {
    store: Arc<PersistentStore>,
    position_book: Arc<PositionBook>,
    exchange: Arc<dyn ExchangeClient>,
    events: Arc<EventBus>,
    account_mode: AccountMode,
    pending_coins: Mutex<HashSet<String>>,
}

/// RAII guard releasing a coin's serialization slot on every exit path,
/// including early `?`-returns and panics.
struct PendingGuard<'a> {
    coins: &'a Mutex<HashSet<String>>,
    coin: String,
}

impl<'a> Drop for PendingGuard<'a> {
    fn drop(&mut self) {
        self.coins.lock().remove(&self.coin);
    }
}

impl SignalDispatcher {
    pub fn new(
        store: Arc<PersistentStore>,
        position_book: Arc<PositionBook>,
        exchange: Arc<dyn ExchangeClient>,
        events: Arc<EventBus>,
        account_mode: AccountMode,
    ) -> Self {
        Self {
            store,
            position_book,
            exchange,
            events,
            account_mode,
            pending_coins: Mutex::new(HashSet::new()),
        }
    }

    pub async fn dispatch(&self, req: DispatchRequest<'_>) -> DispatchOutcome {
        // Step 1: gating.
        if req.source == SignalSource::Strategy {
            let binding_enabled = req
                .instrument
                .strategies
                .iter()
                .any(|s| s.auto_trading_enabled);
            if !binding_enabled {
                return DispatchOutcome::Rejected { reason: RejectReason::AutoTradingDisabled };
            }
        }

        // Step 2: per-instrument serialization.
        {
            let mut pending = self.pending_coins.lock();
            if !pending.insert(req.coin.to_string()) {
                return DispatchOutcome::Rejected { reason: RejectReason::PositionAlreadyOpenOrPending };
            }
        }
        let _guard = PendingGuard { coins: &self.pending_coins, coin: req.coin.to_string() };

        self.dispatch_locked(req).await
    }

    async fn dispatch_locked(&self, req: DispatchRequest<'_>) -> DispatchOutcome {
        let alert_id = req.alert_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Step 3: idempotency.
        match self.store.has_signal(&alert_id).await {
            Ok(true) => return DispatchOutcome::Rejected { reason: RejectReason::Duplicate },
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, alert_id, "idempotency check failed");
                return DispatchOutcome::CriticalProtectionFailure { error: e.to_string() };
            }
        }

        // Step 4: intent derivation.
        let sz_decimals = match self.exchange.get_sz_decimals(req.coin).await {
            Ok(d) => d,
            Err(e) => return DispatchOutcome::CriticalProtectionFailure { error: e.to_string() },
        };

        let intent = self.derive_intent(req.signal, req.coin, req.current_price, &req.instrument.sizing, sz_decimals);

        if intent.size <= 0.0 {
            self.persist_signal(&alert_id, req, false, Some("size truncated to zero".into())).await;
            return DispatchOutcome::Rejected { reason: RejectReason::SizeZero };
        }

        // Step 5: risk check.
        if let Err(reason) = self.check_guardrails(&intent, req, &req.instrument.guardrails).await {
            self.persist_signal(&alert_id, req, false, Some(reason.to_string())).await;
            return DispatchOutcome::Rejected { reason };
        }
        let signal_id = self.persist_signal(&alert_id, req, true, None).await;

        // Step 6: leverage sync (idempotent by contract).
        if let Err(e) = self
            .exchange
            .set_leverage(req.coin, req.instrument.leverage, req.instrument.margin_type == crate::config::MarginType::Cross)
            .await
        {
            warn!(coin = req.coin, error = %e, "set_leverage failed, continuing with entry");
        }

        // Step 7: entry.
        let is_buy = intent.side.is_long();
        let fill = match self
            .exchange
            .place_entry_order(req.coin, is_buy, intent.size, intent.entry_price, req.instrument.entry_slippage_bps)
            .await
        {
            Ok(f) => f,
            Err(e) => return DispatchOutcome::CriticalProtectionFailure { error: e.to_string() },
        };

        let actual_size = crate::exchange::truncate_to_decimals(fill.filled_size, sz_decimals);
        if actual_size <= 0.0 {
            self.record_order(signal_id, None, req.coin, intent.side, intent.size, intent.entry_price, OrderType::Limit, OrderTag::Entry, OrderStatus::Cancelled).await;
            self.events.publish(EventTopic::Signals, serde_json::json!({"event": "entry_no_fill", "coin": req.coin})).await;
            return DispatchOutcome::Rejected { reason: RejectReason::EntryNotFilled };
        }
        self.record_order(signal_id, Some(fill.order_id.clone()), req.coin, intent.side, actual_size, fill.avg_price, OrderType::Limit, OrderTag::Entry, OrderStatus::Filled).await;

        // Step 8: stop-loss (critical).
        let sl_result = self
            .exchange
            .place_stop_order(req.coin, !is_buy, actual_size, intent.stop_loss, true)
            .await;

        let effective_stop_loss = match sl_result {
            Ok(sl_fill) => {
                self.record_order(signal_id, Some(sl_fill.order_id), req.coin, intent.side.opposite(), actual_size, intent.stop_loss, OrderType::Stop, OrderTag::StopLoss, OrderStatus::Pending).await;
                intent.stop_loss
            }
            Err(sl_err) => {
                warn!(coin = req.coin, error = %sl_err, "stop-loss placement failed, attempting rollback");
                match self.exchange.place_market_order(req.coin, !is_buy, actual_size).await {
                    Ok(rollback_fill) => {
                        info!(coin = req.coin, "entry rolled back after stop-loss failure");
                        self.record_order(signal_id, Some(rollback_fill.order_id), req.coin, intent.side.opposite(), actual_size, rollback_fill.avg_price, OrderType::Market, OrderTag::Exit, OrderStatus::Filled).await;
                        return DispatchOutcome::EntryRolledBack { error: sl_err.to_string() };
                    }
                    Err(rollback_err) => {
                        error!(coin = req.coin, sl_error = %sl_err, rollback_error = %rollback_err, "rollback failed — hydrating unprotected position");
                        let pos = Position::hydrated(req.coin.to_string(), intent.side, fill.avg_price, actual_size, req.instrument.leverage, Utc::now().timestamp());
                        // A concurrent reconcile tick may have hydrated this
                        // coin already; this path must still leave the
                        // position visible, so close any stale entry first.
                        if !self.position_book.is_flat(req.coin) {
                            self.position_book.close(req.coin);
                        }
                        self.position_book.open(pos);
                        self.events.publish(EventTopic::Positions, serde_json::json!({"event": "unprotected_position", "coin": req.coin})).await;
                        return DispatchOutcome::CriticalProtectionFailure { error: sl_err.to_string() };
                    }
                }
            }
        };

        // Step 9: take-profits (best-effort).
        for (i, tp) in intent.take_profits.iter().enumerate() {
            let tp_size = crate::exchange::truncate_to_decimals(actual_size * tp.fraction, sz_decimals);
            if tp_size <= 0.0 {
                continue;
            }
            match self.exchange.place_limit_order(req.coin, !is_buy, tp_size, tp.price, true).await {
                Ok(tp_fill) => {
                    self.record_order(signal_id, Some(tp_fill.order_id), req.coin, intent.side.opposite(), tp_size, tp.price, OrderType::Limit, OrderTag::TakeProfit((i + 1) as u8), OrderStatus::Pending).await;
                }
                Err(e) => {
                    warn!(coin = req.coin, price = tp.price, error = %e, "take-profit placement failed, stop-loss still protects position");
                }
            }
        }

        // Step 10: hydration reconcile — close any stale, reconcile-hydrated
        // entry before installing the authoritative one.
        if !self.position_book.is_flat(req.coin) {
            self.position_book.close(req.coin);
        }
        self.position_book.open(Position {
            coin: req.coin.to_string(),
            direction: intent.side,
            entry_price: fill.avg_price,
            size: actual_size,
            stop_loss: effective_stop_loss,
            take_profits: intent.take_profits.clone(),
            trailing_stop_loss: 0.0,
            liquidation_px: 0.0,
            leverage: req.instrument.leverage,
            current_price: fill.avg_price,
            unrealized_pnl: 0.0,
            opened_at: Utc::now().timestamp(),
            signal_id,
        });

        // Step 11: notify (best-effort).
        self.events
            .publish(EventTopic::Positions, serde_json::json!({"event": "position_opened", "coin": req.coin, "side": intent.side.to_string()}))
            .await;

        DispatchOutcome::Success { position_coin: req.coin.to_string() }
    }

    fn derive_intent(&self, signal: &Signal, coin: &str, current_price: f64, sizing: &SizingPolicy, sz_decimals: u32) -> OrderIntent {
        let entry_price = crate::exchange::truncate_to_decimals(signal.entry_price, sz_decimals);
        let stop_loss = crate::exchange::truncate_to_decimals(signal.stop_loss, sz_decimals);

        let raw_size = match sizing {
            SizingPolicy::Risk { risk_per_trade_usd } => {
                let stop_distance = (entry_price - stop_loss).abs();
                if stop_distance > 0.0 {
                    risk_per_trade_usd / stop_distance
                } else {
                    0.0
                }
            }
            SizingPolicy::Cash { cash_per_trade } => {
                if entry_price > 0.0 {
                    cash_per_trade / entry_price
                } else {
                    0.0
                }
            }
            SizingPolicy::Fixed { fixed_size } => *fixed_size,
        };

        let size = crate::exchange::truncate_to_decimals(raw_size, sz_decimals);
        let notional = size * entry_price;
        let _ = current_price;

        OrderIntent {
            coin: coin.to_string(),
            side: signal.direction,
            size,
            entry_price,
            stop_loss,
            take_profits: signal.take_profits.clone(),
            notional,
            direction: signal.direction,
        }
    }

    async fn check_guardrails(&self, intent: &OrderIntent, req: &DispatchRequest<'_>, guardrails: &Guardrails) -> Result<(), RejectReason> {
        if intent.notional > guardrails.max_notional_usd {
            return Err(RejectReason::RiskRejected(format!(
                "notional {:.2} exceeds max {:.2}",
                intent.notional, guardrails.max_notional_usd
            )));
        }
        if req.instrument.leverage > guardrails.max_leverage {
            return Err(RejectReason::RiskRejected(format!(
                "leverage {} exceeds max {}",
                req.instrument.leverage, guardrails.max_leverage
            )));
        }
        if self.position_book.count() as u32 >= guardrails.max_open_positions && self.position_book.is_flat(req.coin) {
            return Err(RejectReason::RiskRejected(format!(
                "open positions at limit ({})",
                guardrails.max_open_positions
            )));
        }

        let day_start = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp();
        let trades_today = self.store.get_today_trade_count(req.coin, day_start).await.unwrap_or(0);
        if trades_today >= guardrails.max_trades_per_day {
            return Err(RejectReason::RiskRejected(format!(
                "trades today ({trades_today}) at limit ({})",
                guardrails.max_trades_per_day
            )));
        }

        // Daily-loss breaker, checked against the durable realized-PnL feed
        // rather than any in-process counter so it trips for every signal
        // source, not just the candle-driven StrategyRunner loop.
        let daily_pnl = self.store.get_today_realized_pnl(req.coin, day_start).await.unwrap_or(0.0);
        if daily_pnl <= -guardrails.max_daily_loss_usd {
            return Err(RejectReason::RiskRejected(format!(
                "daily loss {daily_pnl:.2} exceeds max {:.2}",
                guardrails.max_daily_loss_usd
            )));
        }

        let drift = (intent.entry_price - req.current_price).abs() / req.current_price.max(1e-9);
        if drift > 0.02 {
            return Err(RejectReason::RiskRejected(format!(
                "entry price drifted {:.2}% from current price",
                drift * 100.0
            )));
        }

        Ok(())
    }

    /// Persists the SignalRecord and returns its assigned id, taken directly
    /// from `insert_signal`'s result rather than re-queried — a re-query
    /// against "recent signals" would silently fall back to `0` once enough
    /// other signals had been inserted for this one to scroll out of the
    /// lookback window, corrupting every order this dispatch records.
    async fn persist_signal(&self, alert_id: &str, req: &DispatchRequest<'_>, passed: bool, reason: Option<String>) -> i64 {
        let draft = SignalRecordDraft {
            alert_id: alert_id.to_string(),
            source: req.source,
            coin: req.coin.to_string(),
            side: req.signal.direction,
            entry_price: req.signal.entry_price,
            stop_loss: req.signal.stop_loss,
            take_profits: req.signal.take_profits.clone(),
            risk_check_passed: passed,
            risk_check_reason: reason,
            created_at: Utc::now().timestamp(),
        };
        match self.store.insert_signal(&draft).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                error!(alert_id, "persist_signal raced a duplicate alert_id after the idempotency check");
                0
            }
            Err(e) => {
                error!(error = %e, alert_id, "failed to persist signal record");
                0
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_order(
        &self,
        signal_id: i64,
        exchange_order_id: Option<String>,
        coin: &str,
        side: Side,
        size: f64,
        price: f64,
        order_type: OrderType,
        tag: OrderTag,
        status: OrderStatus,
    ) {
        let draft = OrderRecordDraft {
            signal_id,
            exchange_order_id,
            coin: coin.to_string(),
            side,
            size,
            price,
            order_type,
            tag,
            status,
            mode: self.account_mode,
            filled_at: if status == OrderStatus::Filled { Some(Utc::now().timestamp()) } else { None },
            created_at: Utc::now().timestamp(),
        };
        if let Err(e) = self.store.insert_order(&draft).await {
            error!(error = %e, coin, "failed to persist order record");
        }
    }
}
