// =============================================================================
// Operator + Read API (§6)
// =============================================================================
//
// Mounted on the same `axum::Router` as the webhook and the WebSocket
// upgrade. Operator routes require `AuthBearer`; read routes (health,
// positions, orders, equity, candles, decisions) are public.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::dispatcher::DispatchRequest;
use crate::error::DispatchOutcome;
use crate::events::EventTopic;
use crate::market_data::CandleKey;
use crate::store::OrderRecordDraft;
use crate::types::{OrderStatus, OrderTag, OrderType, Side, Signal, SignalSource, TakeProfitLevel};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/signal", post(post_signal))
        .route("/close/:coin", post(post_close))
        .route("/cancel/:oid", post(post_cancel))
        .route("/auto-trading", post(post_auto_trading))
        .route("/health", get(get_health))
        .route("/positions", get(get_positions))
        .route("/orders", get(get_orders))
        .route("/open-orders", get(get_open_orders))
        .route("/equity", get(get_equity))
        .route("/account", get(get_account))
        .route("/candles", get(get_candles))
        .route("/decisions", get(get_decisions))
}

fn ok_json(body: serde_json::Value) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn err_json(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(serde_json::json!({"error": message.into()}))).into_response()
}

// ---------------------------------------------------------------------------
// Operator API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ManualSignalRequest {
    pub coin: String,
    pub side: Side,
    pub entry: f64,
    pub sl: f64,
    #[serde(default)]
    pub tp1: Option<f64>,
    #[serde(default)]
    pub tp2: Option<f64>,
    #[serde(default)]
    pub tp1_pct: Option<f64>,
}

async fn post_signal(AuthBearer(_): AuthBearer, State(state): State<AppState>, Json(req): Json<ManualSignalRequest>) -> Response {
    let instrument = match state.config.read().instrument(&req.coin) {
        Some(i) => i.clone(),
        None => return err_json(StatusCode::BAD_REQUEST, format!("unknown instrument '{}'", req.coin)),
    };

    let current_price = match state.exchange.get_mid_price(&req.coin).await {
        Ok(p) => p,
        Err(e) => return err_json(StatusCode::BAD_GATEWAY, e.to_string()),
    };

    let mut take_profits = Vec::new();
    if let Some(tp1) = req.tp1 {
        let frac1 = req.tp1_pct.unwrap_or(50.0) / 100.0;
        take_profits.push(TakeProfitLevel { price: tp1, fraction: frac1 });
        if let Some(tp2) = req.tp2 {
            take_profits.push(TakeProfitLevel { price: tp2, fraction: (1.0 - frac1).max(0.0) });
        }
    } else if let Some(tp2) = req.tp2 {
        take_profits.push(TakeProfitLevel { price: tp2, fraction: 1.0 });
    }

    let signal = Signal { direction: req.side, entry_price: req.entry, stop_loss: req.sl, take_profits, comment: "operator".to_string() };
    let alert_id = format!("operator-{}-{}", req.coin, Utc::now().timestamp_millis());

    let outcome = state
        .dispatcher
        .dispatch(DispatchRequest {
            signal: &signal,
            current_price,
            source: SignalSource::Api,
            alert_id: Some(alert_id),
            coin: &req.coin,
            instrument: &instrument,
        })
        .await;

    match outcome {
        DispatchOutcome::Success { position_coin } => ok_json(serde_json::json!({"status": "sent", "coin": position_coin})),
        DispatchOutcome::Rejected { reason } => err_json(StatusCode::UNPROCESSABLE_ENTITY, reason.to_string()),
        DispatchOutcome::EntryRolledBack { error: err } => {
            warn!(coin = %req.coin, error = %err, "operator signal entry rolled back after stop-loss failure");
            err_json(StatusCode::BAD_GATEWAY, err)
        }
        DispatchOutcome::CriticalProtectionFailure { error: err } => {
            error!(coin = %req.coin, error = %err, "operator signal dispatch failed critically");
            err_json(StatusCode::BAD_GATEWAY, err)
        }
    }
}

async fn post_close(AuthBearer(_): AuthBearer, State(state): State<AppState>, Path(coin): Path<String>) -> Response {
    let Some(position) = state.position_book.get(&coin) else {
        return err_json(StatusCode::NOT_FOUND, format!("no open position for {coin}"));
    };

    let is_buy = !position.direction.is_long();
    let fill = match state.exchange.place_market_order(&coin, is_buy, position.size).await {
        Ok(f) => f,
        Err(e) => return err_json(StatusCode::BAD_GATEWAY, e.to_string()),
    };

    let account_mode = state.config.read().account_mode;
    let draft = OrderRecordDraft {
        signal_id: position.signal_id,
        exchange_order_id: Some(fill.order_id.clone()),
        coin: coin.clone(),
        side: position.direction.opposite(),
        size: position.size,
        price: if fill.avg_price > 0.0 { fill.avg_price } else { position.current_price },
        order_type: OrderType::Market,
        tag: OrderTag::Exit,
        status: OrderStatus::Filled,
        mode: account_mode,
        filled_at: Some(Utc::now().timestamp()),
        created_at: Utc::now().timestamp(),
    };
    if let Err(e) = state.store.insert_order(&draft).await {
        error!(coin = %coin, error = %e, "failed to persist operator close order");
    }

    state.position_book.close(&coin);
    state.events.publish(EventTopic::Positions, serde_json::json!({"event": "operator_close", "coin": coin})).await;

    ok_json(serde_json::json!({"status": "closed", "coin": coin}))
}

async fn post_cancel(AuthBearer(_): AuthBearer, State(state): State<AppState>, Path(oid): Path<String>) -> Response {
    let pending = match state.store.get_pending_orders().await {
        Ok(p) => p,
        Err(e) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let Some(order) = pending.into_iter().find(|o| o.exchange_order_id.as_deref() == Some(oid.as_str())) else {
        return err_json(StatusCode::NOT_FOUND, format!("no pending order with id {oid}"));
    };

    if let Err(e) = state.exchange.cancel_order(&order.coin, &oid).await {
        return err_json(StatusCode::BAD_GATEWAY, e.to_string());
    }

    if let Err(e) = state.store.update_order_status(order.id, OrderStatus::Cancelled).await {
        error!(order_id = order.id, error = %e, "failed to mark cancelled order in store");
    }

    state.events.publish(EventTopic::Orders, serde_json::json!({"event": "cancelled", "coin": order.coin, "order_id": oid})).await;
    ok_json(serde_json::json!({"status": "cancelled", "order_id": oid}))
}

#[derive(Debug, Deserialize)]
pub struct AutoTradingRequest {
    pub coin: String,
    pub enabled: bool,
}

async fn post_auto_trading(AuthBearer(_): AuthBearer, State(state): State<AppState>, Json(req): Json<AutoTradingRequest>) -> Response {
    let mut config = state.config.write();
    let Some(instrument) = config.instruments.iter_mut().find(|i| i.coin == req.coin) else {
        return err_json(StatusCode::BAD_REQUEST, format!("unknown instrument '{}'", req.coin));
    };
    for binding in &mut instrument.strategies {
        binding.auto_trading_enabled = req.enabled;
    }
    drop(config);

    warn!(coin = %req.coin, enabled = req.enabled, "auto-trading toggled via operator API");
    state
        .events
        .publish(EventTopic::Health, serde_json::json!({"event": "auto_trading_toggled", "coin": req.coin, "enabled": req.enabled}))
        .await;

    ok_json(serde_json::json!({"status": "ok", "coin": req.coin, "enabled": req.enabled}))
}

// ---------------------------------------------------------------------------
// Read API
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<AppState>) -> Response {
    let config = state.config.read();
    ok_json(serde_json::json!({
        "status": "ok",
        "trading_mode": config.trading_mode,
        "account_mode": config.account_mode,
        "open_positions": state.position_book.count(),
        "instruments": config.instruments.iter().map(|i| &i.coin).collect::<Vec<_>>(),
    }))
}

async fn get_positions(State(state): State<AppState>) -> Response {
    ok_json(serde_json::json!(state.position_book.all()))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn get_orders(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Response {
    match state.store.get_recent_orders(q.limit).await {
        Ok(orders) => ok_json(serde_json::json!(orders)),
        Err(e) => err_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_open_orders(State(state): State<AppState>) -> Response {
    match state.store.get_pending_orders().await {
        Ok(orders) => ok_json(serde_json::json!(orders)),
        Err(e) => err_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_equity(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Response {
    match state.store.get_recent_equity(q.limit).await {
        Ok(rows) => {
            let snapshots: Vec<_> = rows
                .into_iter()
                .map(|(ts, equity, open_positions)| serde_json::json!({"ts": ts, "equity": equity, "open_positions": open_positions}))
                .collect();
            ok_json(serde_json::json!(snapshots))
        }
        Err(e) => err_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_account(State(state): State<AppState>) -> Response {
    match state.exchange.get_account_state().await {
        Ok(account) => ok_json(serde_json::json!(account)),
        Err(e) => err_json(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub coin: String,
    #[serde(default)]
    pub before: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_interval() -> String {
    "5m".to_string()
}

async fn get_candles(State(state): State<AppState>, Query(q): Query<CandlesQuery>) -> Response {
    let key = CandleKey { symbol: q.coin, interval: q.interval };
    // CandleBuffer has no range query, so pull its whole retained window and
    // filter/slice here — bounded by the buffer's own fixed capacity.
    let mut candles = state.candles.get_closed(&key, 10_000);
    if let Some(before) = q.before {
        candles.retain(|c| c.open_time < before);
    }
    let limit = q.limit.max(0) as usize;
    if candles.len() > limit {
        candles = candles.split_off(candles.len() - limit);
    }
    ok_json(serde_json::json!(candles))
}

async fn get_decisions(State(state): State<AppState>, Query(q): Query<LimitQuery>) -> Response {
    let limit = q.limit.max(0) as usize;
    ok_json(serde_json::json!(state.decisions.recent(limit)))
}
