// =============================================================================
// Alert webhook ingress (§6)
// =============================================================================
//
// Accepts a signed TradingView-style alert, turns it into a `Signal`, and
// hands it to the SignalDispatcher with `source = router` — the same
// bypass-auto-trading-gate treatment as the operator API, since both are
// external-operator-initiated rather than strategy-initiated (§4.4 step 1).
//
// A fast in-memory TTL map answers `duplicate`/not before the durable
// `PersistentStore::has_signal` check the dispatcher itself performs, and a
// `502 send_failed` response deliberately skips that TTL map so operators can
// retry a transient failure without waiting it out.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, warn};

use crate::api::auth::validate_webhook_secret;
use crate::app_state::AppState;
use crate::dispatcher::DispatchRequest;
use crate::error::DispatchOutcome;
use crate::types::{Side, Signal, SignalSource, TakeProfitLevel};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
enum WireSide {
    Long,
    Short,
}

impl From<WireSide> for Side {
    fn from(value: WireSide) -> Self {
        match value {
            WireSide::Long => Side::Long,
            WireSide::Short => Side::Short,
        }
    }
}

/// Some fields (`leverage`, `risk_usd`, `notional_usdc`, `margin_usdc`,
/// `bar_ts`) are part of the wire schema but not consulted here — sizing and
/// leverage come from the instrument's own configuration, not the alert, so
/// these exist for schema completeness and future audit logging only.
#[allow(dead_code)]
#[derive(Debug, Deserialize)]
struct WebhookAlert {
    alert_id: String,
    event_type: String,
    asset: String,
    side: WireSide,
    entry: f64,
    sl: f64,
    #[serde(default)]
    tp1: Option<f64>,
    #[serde(default)]
    tp2: Option<f64>,
    #[serde(default)]
    tp1_pct: Option<f64>,
    qty: f64,
    #[serde(default)]
    leverage: Option<u32>,
    #[serde(default)]
    risk_usd: Option<f64>,
    #[serde(default)]
    notional_usdc: Option<f64>,
    #[serde(default)]
    margin_usdc: Option<f64>,
    signal_ts: i64,
    #[serde(default)]
    bar_ts: i64,
    #[serde(default)]
    secret: Option<String>,
}

fn status(code: StatusCode, body: serde_json::Value) -> Response {
    (code, Json(body)).into_response()
}

fn sent() -> Response {
    status(StatusCode::OK, serde_json::json!({"status": "sent"}))
}

fn duplicate() -> Response {
    status(StatusCode::OK, serde_json::json!({"status": "duplicate"}))
}

fn expired() -> Response {
    status(StatusCode::OK, serde_json::json!({"status": "expired"}))
}

fn bad_request(reason: impl Into<String>) -> Response {
    status(StatusCode::BAD_REQUEST, serde_json::json!({"error": reason.into()}))
}

fn forbidden() -> Response {
    status(StatusCode::FORBIDDEN, serde_json::json!({"error": "missing or invalid secret"}))
}

fn send_failed(reason: impl Into<String>) -> Response {
    status(StatusCode::BAD_GATEWAY, serde_json::json!({"status": "send_failed", "error": reason.into()}))
}

fn validate_schema(alert: &WebhookAlert) -> Result<(), String> {
    if alert.alert_id.trim().is_empty() {
        return Err("alert_id must not be empty".into());
    }
    if alert.event_type != "ENTRY" {
        return Err(format!("unsupported event_type '{}'", alert.event_type));
    }
    if alert.entry <= 0.0 {
        return Err("entry must be positive".into());
    }
    if alert.sl <= 0.0 {
        return Err("sl must be positive".into());
    }
    if alert.qty <= 0.0 {
        return Err("qty must be positive".into());
    }
    if let Some(pct) = alert.tp1_pct {
        if !(0.0..=100.0).contains(&pct) {
            return Err("tp1_pct must be between 0 and 100".into());
        }
    }
    Ok(())
}

fn take_profits(alert: &WebhookAlert) -> Vec<TakeProfitLevel> {
    let mut levels = Vec::new();
    if let Some(tp1) = alert.tp1 {
        let frac1 = alert.tp1_pct.unwrap_or(50.0) / 100.0;
        levels.push(TakeProfitLevel { price: tp1, fraction: frac1 });
        if let Some(tp2) = alert.tp2 {
            levels.push(TakeProfitLevel { price: tp2, fraction: (1.0 - frac1).max(0.0) });
        }
    } else if let Some(tp2) = alert.tp2 {
        levels.push(TakeProfitLevel { price: tp2, fraction: 1.0 });
    }
    levels
}

pub async fn webhook_with_path_secret(
    State(state): State<AppState>,
    Path(secret): Path<String>,
    body: Bytes,
) -> Response {
    handle(state, Some(secret), body).await
}

pub async fn webhook_with_body_secret(State(state): State<AppState>, body: Bytes) -> Response {
    handle(state, None, body).await
}

async fn handle(state: AppState, path_secret: Option<String>, body: Bytes) -> Response {
    let alert: WebhookAlert = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(e) => return bad_request(format!("invalid payload: {e}")),
    };

    let secret = path_secret.or_else(|| alert.secret.clone()).unwrap_or_default();
    if secret.is_empty() || !validate_webhook_secret(&secret) {
        warn!(alert_id = %alert.alert_id, "webhook rejected: missing or invalid secret");
        return forbidden();
    }

    if let Err(reason) = validate_schema(&alert) {
        return bad_request(reason);
    }

    let dedup_ttl_secs = state.config.read().dedup_ttl_secs;
    let ttl = std::time::Duration::from_secs(dedup_ttl_secs);

    let now = Utc::now().timestamp();
    if now - alert.signal_ts > dedup_ttl_secs as i64 {
        return expired();
    }

    if state.webhook_dedup.seen(&alert.alert_id, ttl) {
        return duplicate();
    }

    let instrument = match state.config.read().instrument(&alert.asset) {
        Some(i) => i.clone(),
        None => return bad_request(format!("unknown instrument '{}'", alert.asset)),
    };

    let current_price = match state.exchange.get_mid_price(&alert.asset).await {
        Ok(p) => p,
        Err(e) => {
            error!(coin = %alert.asset, error = %e, "webhook could not fetch mid price");
            return send_failed(e.to_string());
        }
    };

    let signal = Signal {
        direction: alert.side.into(),
        entry_price: alert.entry,
        stop_loss: alert.sl,
        take_profits: take_profits(&alert),
        comment: "webhook".to_string(),
    };

    let outcome = state
        .dispatcher
        .dispatch(DispatchRequest {
            signal: &signal,
            current_price,
            source: SignalSource::Router,
            alert_id: Some(alert.alert_id.clone()),
            coin: &alert.asset,
            instrument: &instrument,
        })
        .await;

    match outcome {
        DispatchOutcome::Success { .. } => {
            state.webhook_dedup.mark(&alert.alert_id);
            sent()
        }
        DispatchOutcome::Rejected { reason } => {
            // Structured rejection (duplicate alert already inserted via
            // PersistentStore, risk-rejected, disabled, etc.) is still a
            // successfully-processed request from the webhook's point of
            // view — the dedup slot is consumed so a retry storm of the
            // same rejected alert doesn't keep re-evaluating guardrails.
            state.webhook_dedup.mark(&alert.alert_id);
            warn!(alert_id = %alert.alert_id, reason = %reason, "webhook signal rejected");
            sent()
        }
        DispatchOutcome::EntryRolledBack { error: err } => {
            // Not cached (§6): the entry never survived, so an operator
            // retry of the same alert should be allowed to try again.
            warn!(alert_id = %alert.alert_id, error = %err, "webhook entry rolled back after stop-loss failure");
            send_failed(err)
        }
        DispatchOutcome::CriticalProtectionFailure { error: err } => {
            error!(alert_id = %alert.alert_id, error = %err, "webhook dispatch failed critically");
            send_failed(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_schema_rejects_non_entry_event() {
        let alert = WebhookAlert {
            alert_id: "a1".into(),
            event_type: "EXIT".into(),
            asset: "BTC".into(),
            side: WireSide::Long,
            entry: 100.0,
            sl: 98.0,
            tp1: None,
            tp2: None,
            tp1_pct: None,
            qty: 1.0,
            leverage: None,
            risk_usd: None,
            notional_usdc: None,
            margin_usdc: None,
            signal_ts: 0,
            bar_ts: 0,
            secret: None,
        };
        assert!(validate_schema(&alert).is_err());
    }

    #[test]
    fn take_profits_splits_fraction_between_two_levels() {
        let alert = WebhookAlert {
            alert_id: "a1".into(),
            event_type: "ENTRY".into(),
            asset: "BTC".into(),
            side: WireSide::Long,
            entry: 100.0,
            sl: 98.0,
            tp1: Some(102.0),
            tp2: Some(104.0),
            tp1_pct: Some(40.0),
            qty: 1.0,
            leverage: None,
            risk_usd: None,
            notional_usdc: None,
            margin_usdc: None,
            signal_ts: 0,
            bar_ts: 0,
            secret: None,
        };
        let levels = take_profits(&alert);
        assert_eq!(levels.len(), 2);
        assert!((levels[0].fraction - 0.4).abs() < 1e-9);
        assert!((levels[1].fraction - 0.6).abs() < 1e-9);
    }
}
