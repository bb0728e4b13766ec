// =============================================================================
// Runtime configuration — hot-reloadable engine + per-instrument settings
// =============================================================================
//
// Every tunable parameter lives here so the engine can be reconfigured without
// a restart. Persistence uses an atomic tmp + rename pattern; a leftover
// `.tmp` from a crashed write is removed the next time the file is opened, and
// any rename failure unlinks the `.tmp` rather than leaving it behind. All
// fields carry `#[serde(default)]` so that loading an older config file never
// fails when new fields are added.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use crate::types::{AccountMode, TradingMode};

fn default_true() -> bool {
    true
}

fn default_leverage() -> u32 {
    3
}

fn default_margin_type() -> MarginType {
    MarginType::Isolated
}

fn default_warmup_bars() -> usize {
    60
}

fn default_cooldown_bars() -> u32 {
    3
}

fn default_max_notional_usd() -> f64 {
    5_000.0
}

fn default_max_leverage() -> u32 {
    10
}

fn default_max_open_positions() -> u32 {
    1
}

fn default_max_daily_loss_usd() -> f64 {
    200.0
}

fn default_max_trades_per_day() -> u32 {
    20
}

fn default_entry_slippage_bps() -> u32 {
    10
}

fn default_reconcile_interval_secs() -> u64 {
    10
}

fn default_dedup_ttl_secs() -> u64 {
    20 * 60
}

fn default_state_dir() -> String {
    "state".to_string()
}

/// Isolated vs. cross margin mode for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Isolated,
    Cross,
}

/// Venue execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueMode {
    Testnet,
    Mainnet,
}

/// Position-sizing policy for a signal that did not specify an explicit size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SizingPolicy {
    Risk { risk_per_trade_usd: f64 },
    Cash { cash_per_trade: f64 },
    Fixed { fixed_size: f64 },
}

impl Default for SizingPolicy {
    fn default() -> Self {
        SizingPolicy::Risk { risk_per_trade_usd: 25.0 }
    }
}

/// Pre-trade guardrails enforced by the SignalDispatcher's risk check (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guardrails {
    #[serde(default = "default_max_notional_usd")]
    pub max_notional_usd: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_max_daily_loss_usd")]
    pub max_daily_loss_usd: f64,
    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,
    #[serde(default = "default_cooldown_bars")]
    pub cooldown_bars: u32,
}

impl Default for Guardrails {
    fn default() -> Self {
        Self {
            max_notional_usd: default_max_notional_usd(),
            max_leverage: default_max_leverage(),
            max_open_positions: default_max_open_positions(),
            max_daily_loss_usd: default_max_daily_loss_usd(),
            max_trades_per_day: default_max_trades_per_day(),
            cooldown_bars: default_cooldown_bars(),
        }
    }
}

/// A single strategy binding for an instrument: which strategy, on what
/// candle interval, with how much warmup, gated by its own auto-trading flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyBinding {
    pub name: String,
    #[serde(default = "default_interval")]
    pub interval: String,
    #[serde(default = "default_warmup_bars")]
    pub warmup_bars: usize,
    #[serde(default = "default_true")]
    pub auto_trading_enabled: bool,
}

fn default_interval() -> String {
    "5m".to_string()
}

/// Per-instrument configuration: leverage, margin mode, strategy bindings,
/// guardrails, sizing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    pub coin: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_margin_type")]
    pub margin_type: MarginType,
    #[serde(default)]
    pub strategies: Vec<StrategyBinding>,
    #[serde(default)]
    pub guardrails: Guardrails,
    #[serde(default)]
    pub sizing: SizingPolicy,
    #[serde(default = "default_entry_slippage_bps")]
    pub entry_slippage_bps: u32,
    #[serde(default)]
    pub data_source: String,
    #[serde(default = "default_venue_mode")]
    pub mode: VenueMode,
}

fn default_venue_mode() -> VenueMode {
    VenueMode::Testnet
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    /// Directory holding the SQLite store, JSONL event log, and per-coin
    /// process lock files.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Instruments this process supervises, one StrategyRunner each.
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,

    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// In-memory fast-path dedup TTL for the webhook's `duplicate` response.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            state_dir: default_state_dir(),
            instruments: Vec::new(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A leftover `<path>.tmp` from a previous crash is removed first — it
    /// always reflects an incomplete write, never a valid alternative.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let tmp_path = tmp_path_for(path);
        if tmp_path.exists() {
            warn!(path = %tmp_path.display(), "removing leftover temp config from a previous crash");
            let _ = std::fs::remove_file(&tmp_path);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = config.instruments.len(),
            trading_mode = %config.trading_mode,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename). On any rename failure the `.tmp` is
    /// unlinked so it never lingers as a false "in-progress" marker.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp_path = tmp_path_for(path);

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        if let Err(e) = std::fs::rename(&tmp_path, path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).with_context(|| format!("failed to rename tmp config to {}", path.display()));
        }

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    pub fn instrument(&self, coin: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.coin == coin)
    }
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    path.with_extension("json.tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.account_mode, AccountMode::Demo);
        assert!(cfg.instruments.is_empty());
        assert_eq!(cfg.reconcile_interval_secs, 10);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert_eq!(cfg.dedup_ttl_secs, 1200);
    }

    #[test]
    fn deserialise_partial_instrument_fills_defaults() {
        let json = r#"{ "coin": "BTC" }"#;
        let inst: InstrumentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(inst.leverage, 3);
        assert_eq!(inst.margin_type, MarginType::Isolated);
        assert_eq!(inst.entry_slippage_bps, 10);
        assert_eq!(inst.guardrails.max_open_positions, 1);
    }

    #[test]
    fn roundtrip_serialisation() {
        let mut cfg = RuntimeConfig::default();
        cfg.instruments.push(InstrumentConfig {
            coin: "BTC".into(),
            leverage: 5,
            margin_type: MarginType::Cross,
            strategies: vec![StrategyBinding {
                name: "ensemble".into(),
                interval: "5m".into(),
                warmup_bars: 30,
                auto_trading_enabled: true,
            }],
            guardrails: Guardrails::default(),
            sizing: SizingPolicy::Cash { cash_per_trade: 100.0 },
            entry_slippage_bps: 15,
            data_source: "binance".into(),
            mode: VenueMode::Mainnet,
        });
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg2.instruments.len(), 1);
        assert_eq!(cfg2.instruments[0].coin, "BTC");
        assert_eq!(cfg2.instruments[0].leverage, 5);
    }

    #[test]
    fn save_then_load_roundtrips_and_cleans_tmp(){
        let dir = std::env::temp_dir().join(format!("perp-core-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let cfg = RuntimeConfig::default();
        cfg.save(&path).unwrap();
        assert!(path.exists());
        assert!(!tmp_path_for(&path).exists());

        // Simulate a crash leaving a stale tmp file behind.
        std::fs::write(tmp_path_for(&path), b"garbage").unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.trading_mode, TradingMode::Paused);
        assert!(!tmp_path_for(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
