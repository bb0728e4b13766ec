// =============================================================================
// perp-core — entry point
// =============================================================================
//
// Loads runtime config, builds the exchange client, hands both to the
// Supervisor (which owns the store, position book, dispatcher, one
// StrategyRunner per instrument, and the ReconcileLoop), mounts the
// HTTP/WebSocket surface over the resulting `AppState`, and blocks on
// Ctrl+C for a coordinated shutdown.

mod api;
mod app_state;
mod binance;
mod config;
mod dispatcher;
mod error;
mod events;
mod exchange;
mod market_data;
mod position_book;
mod reconcile;
mod store;
mod strategy;
mod strategy_runner;
mod supervisor;
mod types;

use std::sync::Arc;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{BoxError, Router};
use tower::ServiceBuilder;
use tower::limit::RateLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{RuntimeConfig, VenueMode};
use crate::exchange::binance::BinancePerpClient;
use crate::exchange::ExchangeClient;
use crate::market_data::candle_buffer::run_kline_stream;
use crate::strategy::{ManualStrategy, Strategy, StrategyRegistry};
use crate::supervisor::Supervisor;

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";
const CONFIG_PATH_ENV: &str = "PERP_CORE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "runtime_config.json";

/// Per-route cap on the alert webhook — generous enough for a burst of
/// TradingView alerts firing on the same bar close, tight enough to stop a
/// misbehaving sender from drowning the dispatcher (§6).
const WEBHOOK_RATE_LIMIT_REQUESTS: u64 = 20;
const WEBHOOK_RATE_LIMIT_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);

async fn webhook_rate_limit_exceeded(err: BoxError) -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        StatusCode::TOO_MANY_REQUESTS,
        axum::Json(serde_json::json!({"error": format!("rate limit exceeded: {err}")})),
    )
}

fn builtin_strategies() -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    // The only strategy this crate ships: instruments bound to it trade
    // exclusively via the operator API and alert webhook (§6), never from
    // automated candle evaluation. Real strategies are an external
    // collaborator (§1) and are registered the same way by an embedder.
    registry.register("manual", Box::new(|| Box::new(ManualStrategy) as Box<dyn Strategy>));
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("perp-core starting up");

    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "failed to load runtime config, starting with defaults (no instruments configured)");
        RuntimeConfig::default()
    });

    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        instruments = config.instruments.len(),
        "runtime config loaded"
    );

    // ── Exchange client ───────────────────────────────────────────────────
    // Venue mode is per-instrument in config, but one process talks to one
    // base URL; mainnet wins only if every configured instrument asks for
    // it, so a single testnet instrument can never accidentally cause
    // mainnet orders for the rest.
    let any_testnet = config.instruments.iter().any(|i| i.mode == VenueMode::Testnet) || config.instruments.is_empty();
    let base_url = if any_testnet { TESTNET_URL } else { MAINNET_URL };

    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    if api_key.is_empty() || api_secret.is_empty() {
        warn!("BINANCE_API_KEY/BINANCE_API_SECRET not set — signed requests will be rejected by the venue");
    }

    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinancePerpClient::new(api_key, api_secret, base_url));
    exchange.connect().await.map_err(|e| anyhow::anyhow!("failed to connect to exchange: {e}"))?;
    info!(base_url, "exchange client ready");

    // ── Supervisor bootstrap ─────────────────────────────────────────────
    let strategies = builtin_strategies();
    let mut supervisor = Supervisor::bootstrap(config.clone(), exchange, &strategies)
        .await
        .map_err(|e| anyhow::anyhow!("supervisor bootstrap failed: {e:#}"))?;

    // ── HTTP / WebSocket surface ─────────────────────────────────────────
    let app_state = supervisor.app_state();

    // ── Market-data ingestion ────────────────────────────────────────────
    // One reconnecting kline stream per (instrument, interval) feeds the
    // shared CandleBuffer that every StrategyRunner polls; the runner itself
    // never touches the network.
    let candles = app_state.candles.clone();
    for instrument in &config.instruments {
        for binding in &instrument.strategies {
            let coin = instrument.coin.clone();
            let interval = binding.interval.clone();
            let buf = candles.clone();
            tokio::spawn(async move {
                loop {
                    if let Err(e) = run_kline_stream(&coin, &interval, &buf).await {
                        error!(coin = %coin, interval = %interval, error = %e, "kline stream error — reconnecting in 5s");
                    }
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            });
        }
    }
    info!(instruments = config.instruments.len(), "market data streams launched");

    supervisor.spawn_reconcile();

    let bind_addr = std::env::var("PERP_CORE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());

    let webhook_rate_limit = ServiceBuilder::new()
        .layer(HandleErrorLayer::new(webhook_rate_limit_exceeded))
        .layer(RateLimitLayer::new(WEBHOOK_RATE_LIMIT_REQUESTS, WEBHOOK_RATE_LIMIT_PERIOD));

    let app = Router::new()
        .route("/webhook/:secret", post(api::webhook::webhook_with_path_secret))
        .route("/webhook", post(api::webhook::webhook_with_body_secret))
        .route_layer(webhook_rate_limit)
        .route("/ws", get(api::ws::ws_handler))
        .merge(api::rest::router())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    let cancel = supervisor.cancellation_token();
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            warn!("shutdown signal received — stopping gracefully");
        }
        _ = cancel.cancelled() => {
            warn!("cancellation requested internally — stopping gracefully");
        }
    }

    cancel.cancel();
    let _ = server_handle.await;
    supervisor.shutdown(&config_path).await;

    info!("perp-core shut down complete");
    Ok(())
}
