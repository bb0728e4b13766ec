// =============================================================================
// PositionBook — coin-keyed in-memory view of open positions (§4.3)
// =============================================================================
//
// At most one position per coin. The book is the in-memory source of truth
// the dispatcher, reconcile loop, and API read-handlers all consult; every
// mutation is logged at `debug` the way the old per-symbol position manager
// logged open/close transitions.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{Position, TakeProfitLevel};

pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self { positions: RwLock::new(HashMap::new()) }
    }

    /// Insert the position for `position.coin`. Fails (returns `false`,
    /// leaving the existing entry untouched) if the instrument is already
    /// occupied — callers must `close` first when an intentional re-open is
    /// needed (§4.3), which is exactly what the dispatcher's step 10
    /// hydration-reconcile and the reconcile loop's auto-close path do.
    pub fn open(&self, position: Position) -> bool {
        let mut guard = self.positions.write();
        if guard.contains_key(&position.coin) {
            return false;
        }
        debug!(coin = %position.coin, direction = %position.direction, size = position.size, "position opened");
        guard.insert(position.coin.clone(), position);
        true
    }

    /// Remove the position for `coin`, if any. Returns the removed position.
    pub fn close(&self, coin: &str) -> Option<Position> {
        let removed = self.positions.write().remove(coin);
        if removed.is_some() {
            debug!(coin, "position closed");
        }
        removed
    }

    pub fn get(&self, coin: &str) -> Option<Position> {
        self.positions.read().get(coin).cloned()
    }

    pub fn is_flat(&self, coin: &str) -> bool {
        !self.positions.read().contains_key(coin)
    }

    pub fn count(&self) -> usize {
        self.positions.read().len()
    }

    pub fn all(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    /// Recompute unrealized PnL for `coin` against `current_price`. No-op if
    /// the coin is flat.
    pub fn update_price(&self, coin: &str, current_price: f64) {
        if let Some(pos) = self.positions.write().get_mut(coin) {
            pos.recompute_pnl(current_price);
        }
    }

    /// Move the trailing stop for `coin` to `level`, only if it tightens the
    /// existing trailing stop (never loosens it back toward entry).
    pub fn update_trailing_stop_loss(&self, coin: &str, level: f64) {
        let mut guard = self.positions.write();
        if let Some(pos) = guard.get_mut(coin) {
            let tightens = if pos.direction.is_long() {
                level > pos.trailing_stop_loss
            } else {
                pos.trailing_stop_loss == 0.0 || level < pos.trailing_stop_loss
            };
            if tightens {
                debug!(coin, old = pos.trailing_stop_loss, new = level, "trailing stop updated");
                pos.trailing_stop_loss = level;
            }
        }
    }

    /// Replace the take-profit ladder for `coin` (used after a TP rung fills
    /// and the remaining rungs need re-sizing against reduced position size).
    pub fn set_take_profits(&self, coin: &str, take_profits: Vec<TakeProfitLevel>) {
        if let Some(pos) = self.positions.write().get_mut(coin) {
            pos.take_profits = take_profits;
        }
    }

    /// Shrink the size for `coin` after a partial take-profit fill.
    pub fn reduce_size(&self, coin: &str, filled: f64) {
        if let Some(pos) = self.positions.write().get_mut(coin) {
            pos.size = (pos.size - filled).max(0.0);
        }
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn sample(coin: &str) -> Position {
        Position::hydrated(coin.to_string(), Side::Long, 100.0, 1.0, 3, 0)
    }

    #[test]
    fn open_and_get_round_trips() {
        let book = PositionBook::new();
        assert!(book.is_flat("BTC"));
        book.open(sample("BTC"));
        assert!(!book.is_flat("BTC"));
        assert_eq!(book.get("BTC").unwrap().coin, "BTC");
    }

    #[test]
    fn close_removes_and_returns() {
        let book = PositionBook::new();
        book.open(sample("BTC"));
        let closed = book.close("BTC");
        assert!(closed.is_some());
        assert!(book.is_flat("BTC"));
        assert!(book.close("BTC").is_none());
    }

    #[test]
    fn trailing_stop_only_tightens_for_long() {
        let book = PositionBook::new();
        book.open(sample("BTC"));
        book.update_trailing_stop_loss("BTC", 101.0);
        assert_eq!(book.get("BTC").unwrap().trailing_stop_loss, 101.0);
        // Looser level should be rejected.
        book.update_trailing_stop_loss("BTC", 99.0);
        assert_eq!(book.get("BTC").unwrap().trailing_stop_loss, 101.0);
        // Tighter level accepted.
        book.update_trailing_stop_loss("BTC", 102.0);
        assert_eq!(book.get("BTC").unwrap().trailing_stop_loss, 102.0);
    }

    #[test]
    fn trailing_stop_only_tightens_for_short() {
        let mut pos = sample("ETH");
        pos.direction = Side::Short;
        pos.entry_price = 2000.0;
        let book = PositionBook::new();
        book.open(pos);
        book.update_trailing_stop_loss("ETH", 1990.0);
        assert_eq!(book.get("ETH").unwrap().trailing_stop_loss, 1990.0);
        book.update_trailing_stop_loss("ETH", 1995.0);
        assert_eq!(book.get("ETH").unwrap().trailing_stop_loss, 1990.0);
        book.update_trailing_stop_loss("ETH", 1985.0);
        assert_eq!(book.get("ETH").unwrap().trailing_stop_loss, 1985.0);
    }

    #[test]
    fn update_price_recomputes_pnl() {
        let book = PositionBook::new();
        book.open(sample("BTC"));
        book.update_price("BTC", 110.0);
        assert!((book.get("BTC").unwrap().unrealized_pnl - 10.0).abs() < 1e-9);
    }

    #[test]
    fn reduce_size_floors_at_zero() {
        let book = PositionBook::new();
        book.open(sample("BTC"));
        book.reduce_size("BTC", 2.0);
        assert_eq!(book.get("BTC").unwrap().size, 0.0);
    }

    #[test]
    fn count_reflects_open_positions() {
        let book = PositionBook::new();
        assert_eq!(book.count(), 0);
        book.open(sample("BTC"));
        book.open(sample("ETH"));
        assert_eq!(book.count(), 2);
    }
}
