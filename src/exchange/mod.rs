// =============================================================================
// ExchangeClient — polymorphic boundary to the venue (§4.1)
// =============================================================================
//
// Every capability the core needs from a perpetual-futures venue, expressed
// as an object-safe async trait so a fake implementation can stand in for
// tests and the concrete `binance` submodule can carry the signing/HTTP
// mechanics forward from the original spot-market client.

pub mod binance;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::types::Side;

/// Result of a fill attempt: exchange order id, how much actually filled, and
/// at what average price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillResult {
    pub order_id: String,
    pub filled_size: f64,
    pub avg_price: f64,
}

/// A position as reported by the venue (pre-sanitization output already
/// applied — see trait docs below).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub coin: String,
    pub direction: Side,
    pub entry_price: f64,
    pub size: f64,
    pub leverage: u32,
    pub liquidation_px: f64,
    /// Venue-reported unrealized PnL, used by ReconcileLoop to refresh
    /// `currentPrice = entryPrice + unrealizedPnl/size` (§4.6 point 2).
    pub unrealized_pnl: f64,
}

/// Venue-reported order status, normalized to the three terminal states plus
/// `Open` (see §4.6 step 3's status-mapping table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VenueOrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub coin: String,
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub reduce_only: bool,
    pub status: VenueOrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountState {
    pub equity: f64,
    pub free_collateral: f64,
}

/// Polymorphic boundary to the venue. Implementations must perform their own
/// input sanitization (§4.1) — the core never sees malformed venue output
/// (non-finite prices, non-positive sizes, missing leverage fall back to 1,
/// suffixed symbols stripped to canonical form).
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn connect(&self) -> Result<(), ExchangeError>;

    /// Size-precision decimals for `coin`. Defaults to 5 when venue metadata
    /// for the symbol has not been loaded yet.
    async fn get_sz_decimals(&self, coin: &str) -> Result<u32, ExchangeError>;

    /// Idempotent — safe (and expected) to call on every entry even if an
    /// external tool already set the same leverage.
    async fn set_leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> Result<(), ExchangeError>;

    /// Limit-IOC entry at `reference_price * (1 +/- slippage_bps/10_000)`.
    /// Never leaves a resting order: unfilled quantity is cancelled by the
    /// implementation before returning.
    async fn place_entry_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        reference_price: f64,
        slippage_bps: u32,
    ) -> Result<FillResult, ExchangeError>;

    async fn place_stop_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        trigger_price: f64,
        reduce_only: bool,
    ) -> Result<FillResult, ExchangeError>;

    async fn place_limit_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> Result<FillResult, ExchangeError>;

    /// Market order, used by the dispatcher's SL-rollback path (§4.4 step 8a).
    async fn place_market_order(&self, coin: &str, is_buy: bool, size: f64) -> Result<FillResult, ExchangeError>;

    async fn cancel_order(&self, coin: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn get_historical_orders(&self, coin: &str) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    async fn get_order_status(&self, coin: &str, order_id: &str) -> Result<VenueOrderStatus, ExchangeError>;

    /// Perps `accountValue` plus free spot collateral (`max(0, total - hold)`
    /// per balance) — the `hold` portion is already reflected in perp account
    /// value and must not be double-counted.
    async fn get_account_equity(&self) -> Result<f64, ExchangeError>;

    async fn get_account_state(&self) -> Result<AccountState, ExchangeError>;

    async fn get_mid_price(&self, coin: &str) -> Result<f64, ExchangeError>;
}

/// Truncate `value` down to `decimals` fractional digits — the precision
/// contract every placed size/price must satisfy before it is persisted or
/// transmitted (§3 OrderIntent invariant).
pub fn truncate_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}
