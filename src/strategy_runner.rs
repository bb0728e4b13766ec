// =============================================================================
// StrategyRunner — per-instrument candle-driven loop (§4.5)
// =============================================================================
//
// One runner per configured instrument. Owns all cooldown/trailing-stop
// state itself (`barsSinceExit`, `consecutiveLosses`, `dailyPnl`,
// `tradesToday`, `lastTradeDayUTC`, `lastExitLevel`, `trailingSlOid`,
// `lastCandleAt`) — no lock needed, since by construction only this task's
// own `run` loop ever touches them (§5).

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::app_state::DecisionLog;
use crate::config::InstrumentConfig;
use crate::dispatcher::{DispatchRequest, SignalDispatcher};
use crate::error::DispatchOutcome;
use crate::events::{EventBus, EventTopic};
use crate::exchange::ExchangeClient;
use crate::market_data::{Candle, CandleBuffer, CandleKey};
use crate::position_book::PositionBook;
use crate::store::{OrderRecordDraft, PersistentStore};
use crate::strategy::{HtfBars, Strategy, StrategyContext};
use crate::types::{AccountMode, DecisionEnvelope, OrderStatus, OrderTag, OrderType, Side, SignalSource};

/// Consecutive-loss cooldown cap, fixed per §4.5 ("consecutive losses cap =
/// 2") rather than a configurable guardrail.
const CONSECUTIVE_LOSS_CAP: u32 = 2;

/// How long the poll loop sleeps between checks of the candle buffer.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(1000);

/// Consecutive empty polls (no candle update observed) before `onStaleData`
/// fires (§4.5 observability hooks).
const STALE_POLL_THRESHOLD: u32 = 5;

pub struct StrategyRunner {
    coin: String,
    instrument: InstrumentConfig,
    strategy: AsyncMutex<Box<dyn Strategy>>,
    candles: Arc<CandleBuffer>,
    dispatcher: Arc<SignalDispatcher>,
    position_book: Arc<PositionBook>,
    store: Arc<PersistentStore>,
    exchange: Arc<dyn ExchangeClient>,
    events: Arc<EventBus>,
    account_mode: AccountMode,
    decisions: Arc<DecisionLog>,

    // Runner-owned cooldown/trailing-stop state — touched only from `run`.
    bars_since_exit: u32,
    consecutive_losses: u32,
    daily_pnl: f64,
    trades_today: u32,
    last_trade_day_utc: NaiveDate,
    last_exit_level: Option<f64>,
    trailing_sl_oid: Option<String>,
    last_candle_at: i64,
    signal_counter: u64,
    decision_counter: u64,
    stale_polls: u32,
}

impl StrategyRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coin: String,
        instrument: InstrumentConfig,
        strategy: Box<dyn Strategy>,
        candles: Arc<CandleBuffer>,
        dispatcher: Arc<SignalDispatcher>,
        position_book: Arc<PositionBook>,
        store: Arc<PersistentStore>,
        exchange: Arc<dyn ExchangeClient>,
        events: Arc<EventBus>,
        account_mode: AccountMode,
        decisions: Arc<DecisionLog>,
    ) -> Self {
        Self {
            coin,
            instrument,
            strategy: AsyncMutex::new(strategy),
            candles,
            dispatcher,
            position_book,
            store,
            exchange,
            events,
            account_mode,
            decisions,
            bars_since_exit: 0,
            consecutive_losses: 0,
            daily_pnl: 0.0,
            trades_today: 0,
            last_trade_day_utc: Utc::now().date_naive(),
            last_exit_level: None,
            trailing_sl_oid: None,
            last_candle_at: 0,
            signal_counter: 0,
            decision_counter: 0,
            stale_polls: 0,
        }
    }

    fn key(&self) -> CandleKey {
        CandleKey { symbol: self.coin.clone(), interval: self.binding_interval() }
    }

    fn binding_interval(&self) -> String {
        self.instrument
            .strategies
            .first()
            .map(|b| b.interval.clone())
            .unwrap_or_else(|| "5m".to_string())
    }

    fn warmup_bars(&self) -> usize {
        self.instrument.strategies.first().map(|b| b.warmup_bars).unwrap_or(60)
    }

    fn binding_name(&self) -> String {
        self.instrument.strategies.first().map(|b| b.name.clone()).unwrap_or_else(|| "unknown".to_string())
    }

    /// Appends one `DecisionEnvelope` to the shared ring buffer. Called
    /// exactly once per closed candle, whether or not it produced a signal,
    /// so `GET /decisions` always reflects "what did this runner just see".
    fn record_decision(&mut self, side: Option<Side>, verdict: &str, blocking_stage: Option<&str>, reason: Option<String>) {
        self.decision_counter += 1;
        self.decisions.push(DecisionEnvelope {
            id: self.decision_counter,
            coin: self.coin.clone(),
            side,
            strategy: self.binding_name(),
            verdict: verdict.to_string(),
            blocking_stage: blocking_stage.map(|s| s.to_string()),
            reason,
            created_at: Utc::now().timestamp(),
        });
    }

    /// Pull history from the candle stream; reject if fewer than `ceil(n/2)`
    /// bars arrived. Re-derives trailing-stop state for a cold-started
    /// position so nothing becomes orphaned.
    pub async fn warmup(&mut self) -> anyhow::Result<()> {
        let n = self.warmup_bars();
        let key = self.key();
        let bars = self.candles.get_closed(&key, n);
        let required = n.div_ceil(2);
        if bars.len() < required {
            anyhow::bail!(
                "warmup failed for {}: got {} bars, need at least {} (ceil({}/2))",
                self.coin,
                bars.len(),
                required,
                n
            );
        }

        let htf = HtfBars::default();
        self.strategy.lock().await.init(&bars, &htf);

        if let Some(last) = bars.last() {
            self.last_candle_at = last.open_time;
        }

        if let Some(position) = self.position_book.get(&self.coin) {
            let ctx = StrategyContext { coin: &self.coin, candles: &bars, htf: &htf, position: Some(&position) };
            self.last_exit_level = self.strategy.lock().await.get_exit_level(&ctx);

            if let Ok(pending) = self.store.get_pending_orders().await {
                self.trailing_sl_oid = pending
                    .into_iter()
                    .find(|o| o.coin == self.coin && o.tag == OrderTag::TrailingStop)
                    .and_then(|o| o.exchange_order_id);
            }
        }

        info!(coin = %self.coin, bars = bars.len(), "strategy runner warmed up");
        Ok(())
    }

    /// Drive the per-instrument loop until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let key = self.key();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(coin = %self.coin, "strategy runner stopping");
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let Some(latest) = self.candles.latest(&key) else {
                self.note_stale_poll().await;
                continue;
            };

            if latest.is_closed {
                if latest.open_time <= self.last_candle_at {
                    // Already processed, or out of order — ignored per §5
                    // ordering guarantee.
                    continue;
                }
                self.stale_polls = 0;
                self.process_closed_candle(latest).await;
            } else {
                self.stale_polls = 0;
                self.tick_mark_to_market(latest.close);
            }
        }
    }

    async fn note_stale_poll(&mut self) {
        self.stale_polls += 1;
        if self.stale_polls == STALE_POLL_THRESHOLD {
            warn!(coin = %self.coin, silent_ms = STALE_POLL_THRESHOLD as u64 * POLL_INTERVAL.as_millis() as u64, "no candle data received");
            self.events
                .publish(
                    EventTopic::Health,
                    serde_json::json!({
                        "event": "stale_data",
                        "coin": self.coin,
                        "last_candle_at": self.last_candle_at,
                        "silent_ms": STALE_POLL_THRESHOLD as u64 * POLL_INTERVAL.as_millis() as u64,
                    }),
                )
                .await;
        }
    }

    /// Mark-to-market only — no strategy evaluation (§4.5 `tick`).
    fn tick_mark_to_market(&self, price: f64) {
        if !self.position_book.is_flat(&self.coin) {
            self.position_book.update_price(&self.coin, price);
        }
    }

    async fn process_closed_candle(&mut self, candle: Candle) {
        self.last_candle_at = candle.open_time;
        self.events
            .publish(EventTopic::Candle, serde_json::json!({"coin": self.coin, "t": candle.open_time, "c": candle.close}))
            .await;

        self.roll_day_if_needed();

        if !self.position_book.is_flat(&self.coin) {
            self.position_book.update_price(&self.coin, candle.close);
        }

        let key = self.key();
        let bars = self.candles.get_closed(&key, self.warmup_bars().max(1));
        let htf = HtfBars::default();
        let position = self.position_book.get(&self.coin);
        let ctx = StrategyContext { coin: &self.coin, candles: &bars, htf: &htf, position: position.as_ref() };

        // Exit priority: evaluate before any new entry, and return early on
        // exit to avoid oscillation within the same bar.
        if let Some(pos) = position.clone() {
            let should_exit = self.strategy.lock().await.should_exit(&ctx);
            if should_exit {
                self.execute_strategy_exit(&pos, candle.close).await;
                self.record_decision(Some(pos.direction), "exit", None, None);
                return;
            }

            let level = self.strategy.lock().await.get_exit_level(&ctx);
            if let Some(l) = level {
                self.maybe_update_trailing_stop(&pos, l).await;
            }
            self.record_decision(Some(pos.direction), "hold", None, None);
            return;
        }

        // Flat: entry gate.
        self.bars_since_exit += 1;
        if let Some(stage) = self.blocking_stage() {
            self.record_decision(None, "blocked", Some(stage), None);
            return;
        }

        let signal = self.strategy.lock().await.on_candle(&ctx);
        match signal {
            Some(signal) => {
                self.signal_counter += 1;
                let alert_id = format!("runner-{}-{}", Utc::now().timestamp_millis(), self.signal_counter);
                let side = signal.direction;
                let outcome = self
                    .dispatcher
                    .dispatch(DispatchRequest {
                        signal: &signal,
                        current_price: candle.close,
                        source: SignalSource::Strategy,
                        alert_id: Some(alert_id),
                        coin: &self.coin,
                        instrument: &self.instrument,
                    })
                    .await;
                if outcome.is_success() {
                    self.trades_today += 1;
                    self.bars_since_exit = 0;
                }
                let (verdict, reason) = match &outcome {
                    DispatchOutcome::Success { .. } => ("signal_accepted", None),
                    DispatchOutcome::Rejected { reason } => ("signal_rejected", Some(reason.to_string())),
                    DispatchOutcome::EntryRolledBack { error } => ("signal_rolled_back", Some(error.clone())),
                    DispatchOutcome::CriticalProtectionFailure { error } => ("signal_failed", Some(error.clone())),
                };
                self.record_decision(Some(side), verdict, None, reason);
            }
            None => {
                self.record_decision(None, "no_signal", None, None);
            }
        }
    }

    fn can_trade(&self) -> bool {
        self.blocking_stage().is_none()
    }

    /// Names the first guardrail currently blocking entry, if any, in the
    /// same order `can_trade` checks them.
    fn blocking_stage(&self) -> Option<&'static str> {
        let g = &self.instrument.guardrails;
        if self.bars_since_exit < g.cooldown_bars {
            return Some("cooldown");
        }
        if self.consecutive_losses >= CONSECUTIVE_LOSS_CAP {
            return Some("consecutive_losses");
        }
        if self.daily_pnl <= -g.max_daily_loss_usd {
            return Some("daily_loss");
        }
        if self.trades_today >= g.max_trades_per_day {
            return Some("max_trades_per_day");
        }
        None
    }

    fn roll_day_if_needed(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.last_trade_day_utc {
            self.daily_pnl = 0.0;
            self.trades_today = 0;
            self.consecutive_losses = 0;
            self.last_trade_day_utc = today;
        }
    }

    async fn execute_strategy_exit(&mut self, position: &crate::types::Position, fallback_price: f64) {
        let is_buy = !position.direction.is_long();
        let fill = self.exchange.place_market_order(&self.coin, is_buy, position.size).await;

        let exit_price = match &fill {
            Ok(f) if f.avg_price > 0.0 => f.avg_price,
            _ => fallback_price,
        };
        let exchange_order_id = fill.ok().map(|f| f.order_id);

        let sign = if position.direction.is_long() { 1.0 } else { -1.0 };
        let pnl = (exit_price - position.entry_price) * position.size * sign;
        self.daily_pnl += pnl;
        if pnl < 0.0 {
            self.consecutive_losses += 1;
        } else {
            self.consecutive_losses = 0;
        }

        self.record_order(position.signal_id, exchange_order_id, position.direction.opposite(), position.size, exit_price, OrderTag::Exit, OrderStatus::Filled)
            .await;

        self.position_book.close(&self.coin);
        self.bars_since_exit = 0;
        self.last_exit_level = None;
        self.trailing_sl_oid = None;

        self.events
            .publish(EventTopic::Positions, serde_json::json!({"event": "strategy_exit", "coin": self.coin, "pnl": pnl}))
            .await;
    }

    async fn maybe_update_trailing_stop(&mut self, position: &crate::types::Position, level: f64) {
        let current_stop = if position.trailing_stop_loss > 0.0 { position.trailing_stop_loss } else { position.stop_loss };

        let more_protective = if position.direction.is_long() { level > current_stop } else { level < current_stop };
        if !more_protective {
            return;
        }

        let moved_favorably = match self.last_exit_level {
            None => true,
            Some(last) => {
                if position.direction.is_long() {
                    level > last
                } else {
                    level < last
                }
            }
        };
        if !moved_favorably {
            self.last_exit_level = Some(level);
            return;
        }

        let decimals = self.exchange.get_sz_decimals(&self.coin).await.unwrap_or(5);
        let truncated = crate::exchange::truncate_to_decimals(level, decimals);
        let is_buy = !position.direction.is_long();

        // Place-first-then-cancel: guarantees continuous downside coverage
        // at the cost of momentarily having two stops (§4.5).
        match self.exchange.place_stop_order(&self.coin, is_buy, position.size, truncated, true).await {
            Ok(fill) => {
                if let Some(old_oid) = self.trailing_sl_oid.take() {
                    let _ = self.exchange.cancel_order(&self.coin, &old_oid).await;
                }
                self.record_order(position.signal_id, Some(fill.order_id.clone()), position.direction.opposite(), position.size, truncated, OrderTag::TrailingStop, OrderStatus::Pending)
                    .await;
                self.trailing_sl_oid = Some(fill.order_id);
                self.position_book.update_trailing_stop_loss(&self.coin, truncated);
            }
            Err(e) => {
                warn!(coin = %self.coin, error = %e, "trailing-stop placement failed, keeping previous level");
            }
        }

        self.last_exit_level = Some(level);
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_order(
        &self,
        signal_id: i64,
        exchange_order_id: Option<String>,
        side: Side,
        size: f64,
        price: f64,
        tag: OrderTag,
        status: OrderStatus,
    ) {
        let draft = OrderRecordDraft {
            signal_id,
            exchange_order_id,
            coin: self.coin.clone(),
            side,
            size,
            price,
            order_type: match tag {
                OrderTag::TrailingStop => OrderType::Stop,
                OrderTag::Exit => OrderType::Market,
                _ => OrderType::Limit,
            },
            tag,
            status,
            mode: self.account_mode,
            filled_at: if status == OrderStatus::Filled { Some(Utc::now().timestamp()) } else { None },
            created_at: Utc::now().timestamp(),
        };
        if let Err(e) = self.store.insert_order(&draft).await {
            tracing::error!(error = %e, coin = %self.coin, "failed to persist runner order record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::app_state::DecisionLog;
    use crate::config::{Guardrails, InstrumentConfig, MarginType, SizingPolicy, StrategyBinding, VenueMode};
    use crate::error::ExchangeError;
    use crate::exchange::{AccountState, ExchangeOrder, ExchangePosition, FillResult, VenueOrderStatus};
    use crate::strategy::test_fixtures::ScriptedStrategy;

    struct FakeExchange;

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
            Ok(FillResult { order_id: "entry-1".into(), filled_size: size, avg_price: reference_price })
        }
        async fn place_stop_order(&self, _coin: &str, _is_buy: bool, size: f64, trigger_price: f64, _reduce_only: bool) -> Result<FillResult, ExchangeError> {
            Ok(FillResult { order_id: format!("sl-{trigger_price}"), filled_size: size, avg_price: trigger_price })
        }
        async fn place_limit_order(&self, _coin: &str, _is_buy: bool, size: f64, price: f64, _reduce_only: bool) -> Result<FillResult, ExchangeError> {
            Ok(FillResult { order_id: "tp-1".into(), filled_size: size, avg_price: price })
        }
        async fn place_market_order(&self, _coin: &str, _is_buy: bool, size: f64) -> Result<FillResult, ExchangeError> {
            Ok(FillResult { order_id: "mkt-1".into(), filled_size: size, avg_price: 0.0 })
        }
        async fn cancel_order(&self, _coin: &str, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn get_historical_orders(&self, _coin: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn get_order_status(&self, _coin: &str, _order_id: &str) -> Result<VenueOrderStatus, ExchangeError> {
            Ok(VenueOrderStatus::Filled)
        }
        async fn get_account_equity(&self) -> Result<f64, ExchangeError> {
            Ok(10_000.0)
        }
        async fn get_account_state(&self) -> Result<AccountState, ExchangeError> {
            Ok(AccountState { equity: 10_000.0, free_collateral: 10_000.0 })
        }
        async fn get_mid_price(&self, _coin: &str) -> Result<f64, ExchangeError> {
            Ok(100.0)
        }
    }

    fn instrument() -> InstrumentConfig {
        InstrumentConfig {
            coin: "BTC".into(),
            leverage: 3,
            margin_type: MarginType::Isolated,
            strategies: vec![StrategyBinding { name: "scripted".into(), interval: "5m".into(), warmup_bars: 4, auto_trading_enabled: true }],
            guardrails: Guardrails { cooldown_bars: 0, ..Guardrails::default() },
            sizing: SizingPolicy::Fixed { fixed_size: 0.01 },
            entry_slippage_bps: 10,
            data_source: "binance".into(),
            mode: VenueMode::Testnet,
        }
    }

    fn seed_candles(buf: &CandleBuffer, key: &CandleKey, n: i64) {
        for i in 0..n {
            buf.update(
                key.clone(),
                Candle {
                    open_time: i * 60_000,
                    close_time: i * 60_000 + 59_999,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0,
                    volume: 1.0,
                    quote_volume: 100.0,
                    trades_count: 1,
                    taker_buy_volume: 0.5,
                    taker_buy_quote_volume: 50.0,
                    is_closed: true,
                },
            );
        }
    }

    async fn harness() -> (StrategyRunner, Arc<PositionBook>, Arc<CandleBuffer>, CandleKey) {
        let store = Arc::new(PersistentStore::open_in_memory().await.unwrap());
        let position_book = Arc::new(PositionBook::new());
        let events = Arc::new(EventBus::new());
        let exchange: Arc<dyn ExchangeClient> = Arc::new(FakeExchange);
        let dispatcher = Arc::new(SignalDispatcher::new(store.clone(), position_book.clone(), exchange.clone(), events.clone(), AccountMode::Demo));
        let candles = Arc::new(CandleBuffer::new(200));
        let inst = instrument();
        let key = CandleKey { symbol: inst.coin.clone(), interval: "5m".into() };
        seed_candles(&candles, &key, 4);

        let runner = StrategyRunner::new(
            inst.coin.clone(),
            inst,
            Box::new(ScriptedStrategy::new()),
            candles.clone(),
            dispatcher,
            position_book.clone(),
            store,
            exchange,
            events,
            AccountMode::Demo,
            Arc::new(DecisionLog::new(50)),
        );
        (runner, position_book, candles, key)
    }

    #[tokio::test]
    async fn warmup_rejects_insufficient_bars() {
        let store = Arc::new(PersistentStore::open_in_memory().await.unwrap());
        let position_book = Arc::new(PositionBook::new());
        let events = Arc::new(EventBus::new());
        let exchange: Arc<dyn ExchangeClient> = Arc::new(FakeExchange);
        let dispatcher = Arc::new(SignalDispatcher::new(store.clone(), position_book.clone(), exchange.clone(), events.clone(), AccountMode::Demo));
        let candles = Arc::new(CandleBuffer::new(200));
        let mut inst = instrument();
        inst.strategies[0].warmup_bars = 10;
        let key = CandleKey { symbol: inst.coin.clone(), interval: "5m".into() };
        seed_candles(&candles, &key, 2); // fewer than ceil(10/2) = 5

        let mut runner = StrategyRunner::new(
            inst.coin.clone(),
            inst,
            Box::new(ScriptedStrategy::new()),
            candles,
            dispatcher,
            position_book,
            store,
            exchange,
            events,
            AccountMode::Demo,
            Arc::new(DecisionLog::new(50)),
        );
        assert!(runner.warmup().await.is_err());
    }

    #[tokio::test]
    async fn warmup_succeeds_with_half_the_bars() {
        let (mut runner, _book, _candles, _key) = harness().await;
        assert!(runner.warmup().await.is_ok());
    }

    #[tokio::test]
    async fn entry_signal_on_flat_instrument_opens_position() {
        let (mut runner, book, candles, key) = harness().await;
        runner.warmup().await.unwrap();

        // Replace the boxed strategy with one pre-loaded to emit an entry —
        // `Box<dyn Strategy>` can't be downcast without `Any`, so the test
        // swaps the whole trait object instead.
        let mut scripted = ScriptedStrategy::new();
        scripted.queue_long_entry(100.0, 98.0);
        runner.strategy = tokio::sync::Mutex::new(Box::new(scripted));

        candles.update(
            key.clone(),
            Candle {
                open_time: 4 * 60_000,
                close_time: 4 * 60_000 + 59_999,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
                quote_volume: 100.0,
                trades_count: 1,
                taker_buy_volume: 0.5,
                taker_buy_quote_volume: 50.0,
                is_closed: true,
            },
        );
        let latest = candles.latest(&key).unwrap();
        runner.process_closed_candle(latest).await;

        assert!(!book.is_flat("BTC"));
    }

    #[tokio::test]
    async fn exit_signal_closes_position_and_returns_early() {
        let (mut runner, book, candles, key) = harness().await;
        runner.warmup().await.unwrap();

        book.open(crate::types::Position::hydrated("BTC".into(), Side::Long, 100.0, 0.01, 3, 0));

        let mut scripted = ScriptedStrategy::new();
        scripted.exit_on_next = true;
        runner.strategy = tokio::sync::Mutex::new(Box::new(scripted));

        candles.update(
            key.clone(),
            Candle {
                open_time: 4 * 60_000,
                close_time: 4 * 60_000 + 59_999,
                open: 105.0,
                high: 106.0,
                low: 104.0,
                close: 105.0,
                volume: 1.0,
                quote_volume: 100.0,
                trades_count: 1,
                taker_buy_volume: 0.5,
                taker_buy_quote_volume: 50.0,
                is_closed: true,
            },
        );
        let latest = candles.latest(&key).unwrap();
        runner.process_closed_candle(latest).await;

        assert!(book.is_flat("BTC"));
    }
}
