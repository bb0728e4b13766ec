// =============================================================================
// Strategy trait — the pluggable boundary StrategyRunner drives (§4.5, §1)
// =============================================================================
//
// Strategy implementations themselves are an external collaborator (§1: "the
// design specifies what the core demands from strategies... not how they are
// implemented"). This module defines only that boundary: the context a
// strategy is evaluated with, and the trait `StrategyRunner` calls into on
// every closed candle. A strategy owns whatever internal state it needs
// (indicator windows, thresholds) across calls — the runner never reaches
// into it.

use crate::market_data::Candle;
use crate::types::{Position, Signal};

/// Closed higher-timeframe bars a strategy asked for during warmup, keyed by
/// interval string (e.g. "1h", "4h"). Empty when a strategy requires none.
#[derive(Debug, Clone, Default)]
pub struct HtfBars {
    pub by_interval: Vec<(String, Vec<Candle>)>,
}

impl HtfBars {
    pub fn get(&self, interval: &str) -> Option<&[Candle]> {
        self.by_interval.iter().find(|(iv, _)| iv == interval).map(|(_, bars)| bars.as_slice())
    }
}

/// Everything a strategy sees when asked to evaluate the latest closed
/// candle: the instrument's own candle history, any higher-timeframe
/// aggregates it requested at `init`, and the current position (if any) on
/// this instrument.
pub struct StrategyContext<'a> {
    pub coin: &'a str,
    /// Closed candles, oldest first, most recent last.
    pub candles: &'a [Candle],
    pub htf: &'a HtfBars,
    pub position: Option<&'a Position>,
}

impl<'a> StrategyContext<'a> {
    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }
}

/// The per-instrument, candle-driven decision boundary StrategyRunner drives
/// (§4.5). A `Strategy` is owned exclusively by one `StrategyRunner` task —
/// `&mut self` is safe without additional synchronization (§5: "owned by a
/// single StrategyRunner task").
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Called once by `StrategyRunner::warmup` with the initial bar history
    /// (and any higher-timeframe aggregates the strategy requires) before any
    /// `on_candle`/`should_exit` call.
    fn init(&mut self, bars: &[Candle], htf: &HtfBars);

    /// Evaluate the latest closed candle for a new entry signal. Only called
    /// when the instrument is flat (§4.5 "Entry gate").
    fn on_candle(&mut self, ctx: &StrategyContext) -> Option<Signal>;

    /// Whether an open position should be closed now (§4.5 "Exit priority").
    fn should_exit(&mut self, ctx: &StrategyContext) -> bool;

    /// An updated stop-loss level for an open position, if the strategy
    /// wants to move it (§4.5 "Trailing-stop tracking"). `None` means "no
    /// opinion this bar" — the runner keeps the existing level.
    fn get_exit_level(&mut self, ctx: &StrategyContext) -> Option<f64>;
}

/// Builds a fresh, stateless-at-construction `Strategy` instance by the name
/// a `StrategyBinding` refers to. Strategy implementations are an external
/// collaborator (§1) — this crate owns only the boundary, so a `Supervisor`
/// is handed a registry rather than importing concrete strategies.
pub type StrategyFactory = Box<dyn Fn() -> Box<dyn Strategy> + Send + Sync>;

#[derive(Default)]
pub struct StrategyRegistry {
    factories: std::collections::HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, factory: StrategyFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// `None` means no strategy is registered under this name — the caller
    /// (Supervisor bootstrap) treats this as a configuration error, not a
    /// silent skip, since a misconfigured binding should fail loudly at
    /// startup rather than leave an instrument un-run.
    pub fn build(&self, name: &str) -> Option<Box<dyn Strategy>> {
        self.factories.get(name).map(|f| f())
    }
}

/// A strategy that never emits a signal, never exits, and never moves a
/// stop. Registered by the binary under the name `"manual"` for instruments
/// that are driven entirely by the operator API and alert webhook (§6)
/// rather than by automated candle-driven decisions — the runner still
/// drives mark-to-market, cooldown bookkeeping, and the exit/trailing-stop
/// machinery for whatever position an external signal opened, it just never
/// originates one itself.
pub struct ManualStrategy;

impl Strategy for ManualStrategy {
    fn name(&self) -> &str {
        "manual"
    }
    fn init(&mut self, _bars: &[Candle], _htf: &HtfBars) {}
    fn on_candle(&mut self, _ctx: &StrategyContext) -> Option<Signal> {
        None
    }
    fn should_exit(&mut self, _ctx: &StrategyContext) -> bool {
        false
    }
    fn get_exit_level(&mut self, _ctx: &StrategyContext) -> Option<f64> {
        None
    }
}

#[cfg(test)]
pub mod test_fixtures {
    //! A minimal, deterministic `Strategy` used only by this crate's own
    //! tests to exercise `StrategyRunner` — not a production strategy.
    use super::*;
    use crate::types::{Side, TakeProfitLevel};

    pub struct ScriptedStrategy {
        pub entries: std::collections::VecDeque<Signal>,
        pub exit_on_next: bool,
        pub exit_level: Option<f64>,
    }

    impl ScriptedStrategy {
        pub fn new() -> Self {
            Self { entries: Default::default(), exit_on_next: false, exit_level: None }
        }

        pub fn queue_long_entry(&mut self, entry: f64, sl: f64) {
            self.entries.push_back(Signal {
                direction: Side::Long,
                entry_price: entry,
                stop_loss: sl,
                take_profits: vec![TakeProfitLevel { price: entry * 1.02, fraction: 0.5 }],
                comment: "scripted".into(),
            });
        }
    }

    impl Strategy for ScriptedStrategy {
        fn name(&self) -> &str {
            "scripted"
        }
        fn init(&mut self, _bars: &[Candle], _htf: &HtfBars) {}
        fn on_candle(&mut self, _ctx: &StrategyContext) -> Option<Signal> {
            self.entries.pop_front()
        }
        fn should_exit(&mut self, _ctx: &StrategyContext) -> bool {
            std::mem::take(&mut self.exit_on_next)
        }
        fn get_exit_level(&mut self, _ctx: &StrategyContext) -> Option<f64> {
            self.exit_level.take()
        }
    }
}

#[cfg(test)]
mod registry_tests {
    use super::test_fixtures::ScriptedStrategy;
    use super::*;

    #[test]
    fn manual_strategy_never_signals_or_exits() {
        let mut manual = ManualStrategy;
        let htf = HtfBars::default();
        manual.init(&[], &htf);
        let ctx = StrategyContext { coin: "BTC", candles: &[], htf: &htf, position: None };
        assert!(manual.on_candle(&ctx).is_none());
        assert!(!manual.should_exit(&ctx));
        assert!(manual.get_exit_level(&ctx).is_none());
    }

    #[test]
    fn build_returns_none_for_unregistered_name() {
        let registry = StrategyRegistry::new();
        assert!(registry.build("scripted").is_none());
    }

    #[test]
    fn build_invokes_factory_each_time() {
        let mut registry = StrategyRegistry::new();
        registry.register("scripted", Box::new(|| Box::new(ScriptedStrategy::new()) as Box<dyn Strategy>));
        assert!(registry.build("scripted").is_some());
        assert!(registry.build("scripted").is_some());
    }
}
