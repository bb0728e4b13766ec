// =============================================================================
// Shared data model for the perpetual-futures trading core
// =============================================================================

use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn is_long(self) -> bool {
        matches!(self, Side::Long)
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// A single take-profit rung: exit `fraction` of the position at `price`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TakeProfitLevel {
    pub price: f64,
    pub fraction: f64,
}

/// Declarative trade intent emitted by a strategy. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub direction: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    #[serde(default)]
    pub comment: String,
}

/// A Signal after sizing, precision truncation, and risk mapping — the unit the
/// dispatcher actually sends to the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    pub notional: f64,
    pub direction: Side,
}

/// An open position on a single instrument. At most one per coin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    pub direction: Side,
    pub entry_price: f64,
    pub size: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    /// 0.0 means "no trailing stop placed yet".
    pub trailing_stop_loss: f64,
    pub liquidation_px: f64,
    pub leverage: u32,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub opened_at: i64,
    /// References a `SignalRecord.id`; `-1` marks an externally hydrated position
    /// with no known originating signal (see ReconcileLoop §4.6).
    pub signal_id: i64,
}

impl Position {
    pub fn recompute_pnl(&mut self, current_price: f64) {
        self.current_price = current_price;
        let sign = if self.direction.is_long() { 1.0 } else { -1.0 };
        self.unrealized_pnl = (current_price - self.entry_price) * self.size * sign;
    }

    /// Sentinel position for an exchange-side position discovered with no local
    /// record (ReconcileLoop hydration, §4.6).
    pub fn hydrated(coin: String, direction: Side, entry_price: f64, size: f64, leverage: u32, now: i64) -> Self {
        Self {
            coin,
            direction,
            entry_price,
            size,
            stop_loss: 0.0,
            take_profits: Vec::new(),
            trailing_stop_loss: 0.0,
            liquidation_px: 0.0,
            leverage,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            opened_at: now,
            signal_id: -1,
        }
    }
}

/// Order type transmitted to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "market"),
            OrderType::Limit => write!(f, "limit"),
            OrderType::Stop => write!(f, "stop"),
        }
    }
}

/// What role this order plays in a position's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderTag {
    Entry,
    StopLoss,
    TakeProfit(u8),
    TrailingStop,
    /// A strategy-driven exit market order (§4.5 "Exit priority") — not
    /// named explicitly in the wire tag set of §3, added so the order that
    /// closes a position on a strategy signal is as auditable as its SL/TP
    /// siblings.
    Exit,
}

impl std::fmt::Display for OrderTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderTag::Entry => write!(f, "entry"),
            OrderTag::StopLoss => write!(f, "sl"),
            OrderTag::TakeProfit(n) => write!(f, "tp{n}"),
            OrderTag::TrailingStop => write!(f, "trailing-sl"),
            OrderTag::Exit => write!(f, "exit"),
        }
    }
}

/// Lifecycle status of an OrderRecord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Filled => write!(f, "filled"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
            OrderStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Durable record of a single order submitted (or attempted) on the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: i64,
    pub signal_id: i64,
    pub exchange_order_id: Option<String>,
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub order_type: OrderType,
    pub tag: OrderTag,
    pub status: OrderStatus,
    pub mode: AccountMode,
    pub filled_at: Option<i64>,
    pub created_at: i64,
}

/// Durable, immutable-once-written audit record of a signal accepted for
/// processing, created before any order is placed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: i64,
    pub alert_id: String,
    pub source: SignalSource,
    pub coin: String,
    pub side: Side,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profits: Vec<TakeProfitLevel>,
    pub risk_check_passed: bool,
    pub risk_check_reason: Option<String>,
    pub created_at: i64,
}

/// Where a signal originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSource {
    Strategy,
    Api,
    Router,
}

impl std::fmt::Display for SignalSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSource::Strategy => write!(f, "strategy"),
            SignalSource::Api => write!(f, "api"),
            SignalSource::Router => write!(f, "router"),
        }
    }
}

/// Append-only equity sample written every reconcile tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub ts: i64,
    pub equity: f64,
    pub open_positions: u32,
}

/// Audit record of a single `StrategyRunner` tick, written whether or not it
/// produced a signal. Kept in a bounded in-memory ring buffer and surfaced
/// at `GET /decisions` — the dashboard's primary observability surface into
/// "why didn't this bar trade".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    pub id: u64,
    pub coin: String,
    pub side: Option<Side>,
    pub strategy: String,
    pub verdict: String,
    pub blocking_stage: Option<String>,
    pub reason: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_round_trips() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
    }

    #[test]
    fn recompute_pnl_long() {
        let mut pos = Position::hydrated("BTC".into(), Side::Long, 100.0, 2.0, 5, 0);
        pos.recompute_pnl(110.0);
        assert!((pos.unrealized_pnl - 20.0).abs() < 1e-9);
    }

    #[test]
    fn recompute_pnl_short() {
        let mut pos = Position::hydrated("BTC".into(), Side::Short, 100.0, 2.0, 5, 0);
        pos.recompute_pnl(90.0);
        assert!((pos.unrealized_pnl - 20.0).abs() < 1e-9);
    }

    #[test]
    fn hydrated_position_has_sentinel_signal_id() {
        let pos = Position::hydrated("ETH".into(), Side::Long, 2000.0, 1.0, 3, 0);
        assert_eq!(pos.signal_id, -1);
        assert_eq!(pos.stop_loss, 0.0);
        assert!(pos.take_profits.is_empty());
    }
}
