// =============================================================================
// Binance USDⓈ-M Futures client — concrete ExchangeClient implementation
// =============================================================================
//
// Carries forward the HMAC-SHA256 signing and reqwest plumbing of the
// original spot-market client, retargeted at the USDⓈ-M futures API
// (`/fapi/*`) so the concrete methods below actually have leverage, margin
// mode, and liquidation price to report.
//
// SECURITY: the secret key is never logged or serialized; `Debug` redacts it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;
use crate::error::ExchangeError;
use crate::exchange::{
    AccountState, ExchangeClient, ExchangeOrder, ExchangePosition, FillResult, VenueOrderStatus,
};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

pub struct BinancePerpClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: RateLimitTracker,
    /// Cached size-precision decimals, refreshed lazily; 5 is the fallback
    /// the trait contract promises when metadata has not loaded yet.
    sz_decimals_fallback: AtomicU32,
}

impl BinancePerpClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.into(),
            client,
            rate_limiter: RateLimitTracker::new(),
            sz_decimals_fallback: AtomicU32::new(5),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Strip the venue's perpetual-contract suffix, if any, so the core only
    /// ever sees canonical symbols (e.g. "BTCUSDT-PERP" -> "BTCUSDT").
    fn canonicalize_symbol(raw: &str) -> String {
        raw.trim_end_matches("-PERP").to_string()
    }

    async fn signed_get(&self, path: &str, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.get(&url).header("X-MBX-APIKEY", &self.api_key)).await
    }

    async fn signed_post(&self, path: &str, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.post(&url).header("X-MBX-APIKEY", &self.api_key)).await
    }

    async fn signed_delete(&self, path: &str, params: &str) -> Result<serde_json::Value, ExchangeError> {
        let qs = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.send(self.client.delete(&url).header("X-MBX-APIKEY", &self.api_key)).await
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value, ExchangeError> {
        let resp = req
            .send()
            .await
            .map_err(|e| ExchangeError::TransientNetwork(e.to_string()))?;

        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::TransientNetwork(format!("failed to parse response: {e}")))?;

        match status {
            StatusCode::OK => Ok(body),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                Err(ExchangeError::RateLimited(body.to_string()))
            }
            s if s.is_server_error() => Err(ExchangeError::TransientNetwork(format!("{s}: {body}"))),
            _ => {
                let msg = body["msg"].as_str().unwrap_or("unknown error");
                if msg.to_lowercase().contains("margin") {
                    Err(ExchangeError::InsufficientMargin(msg.to_string()))
                } else {
                    Err(ExchangeError::InvalidRequest(format!("{status}: {msg}")))
                }
            }
        }
    }

    fn parse_f64(val: &serde_json::Value) -> f64 {
        if let Some(s) = val.as_str() {
            s.parse::<f64>().unwrap_or(0.0)
        } else {
            val.as_f64().unwrap_or(0.0)
        }
    }

    fn map_status(raw: &str) -> VenueOrderStatus {
        match raw.to_uppercase().as_str() {
            "NEW" | "PARTIALLY_FILLED" => VenueOrderStatus::Open,
            "FILLED" => VenueOrderStatus::Filled,
            "CANCELED" | "EXPIRED" => VenueOrderStatus::Cancelled,
            "REJECTED" => VenueOrderStatus::Rejected,
            _ => VenueOrderStatus::Open,
        }
    }
}

#[async_trait]
impl ExchangeClient for BinancePerpClient {
    #[instrument(skip(self), name = "exchange::connect")]
    async fn connect(&self) -> Result<(), ExchangeError> {
        self.signed_get("/fapi/v2/account", "").await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::get_sz_decimals")]
    async fn get_sz_decimals(&self, coin: &str) -> Result<u32, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, coin);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::TransientNetwork(e.to_string()))?;
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::TransientNetwork(e.to_string()))?;

        let decimals = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|s| s["quantityPrecision"].as_u64())
            .map(|d| d as u32);

        Ok(decimals.unwrap_or_else(|| self.sz_decimals_fallback.load(Ordering::Relaxed)))
    }

    #[instrument(skip(self), name = "exchange::set_leverage")]
    async fn set_leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> Result<(), ExchangeError> {
        let margin_type = if is_cross { "CROSSED" } else { "ISOLATED" };
        // Margin-type changes fail with "No need to change" if already set —
        // that is success, not an error, so it is swallowed here.
        let _ = self
            .signed_post("/fapi/v1/marginType", &format!("symbol={coin}&marginType={margin_type}"))
            .await;

        self.signed_post("/fapi/v1/leverage", &format!("symbol={coin}&leverage={leverage}"))
            .await?;
        debug!(coin, leverage, is_cross, "leverage synced");
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::place_entry_order")]
    async fn place_entry_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        reference_price: f64,
        slippage_bps: u32,
    ) -> Result<FillResult, ExchangeError> {
        let slip = slippage_bps as f64 / 10_000.0;
        let limit_price = if is_buy {
            reference_price * (1.0 + slip)
        } else {
            reference_price * (1.0 - slip)
        };
        let side = if is_buy { "BUY" } else { "SELL" };

        let body = self
            .signed_post(
                "/fapi/v1/order",
                &format!(
                    "symbol={coin}&side={side}&type=LIMIT&timeInForce=IOC&quantity={size}&price={limit_price}"
                ),
            )
            .await?;

        let order_id = body["orderId"].to_string();
        let filled_size = Self::parse_f64(&body["executedQty"]);
        let avg_price = Self::parse_f64(&body["avgPrice"]);

        if filled_size <= 0.0 {
            warn!(coin, "entry order IOC expired with zero fill");
        }

        self.rate_limiter.record_order_sent();
        Ok(FillResult { order_id, filled_size, avg_price: if avg_price > 0.0 { avg_price } else { limit_price } })
    }

    #[instrument(skip(self), name = "exchange::place_stop_order")]
    async fn place_stop_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        trigger_price: f64,
        reduce_only: bool,
    ) -> Result<FillResult, ExchangeError> {
        let side = if is_buy { "BUY" } else { "SELL" };
        let body = self
            .signed_post(
                "/fapi/v1/order",
                &format!(
                    "symbol={coin}&side={side}&type=STOP_MARKET&stopPrice={trigger_price}&quantity={size}&reduceOnly={reduce_only}"
                ),
            )
            .await?;

        self.rate_limiter.record_order_sent();
        Ok(FillResult {
            order_id: body["orderId"].to_string(),
            filled_size: 0.0,
            avg_price: trigger_price,
        })
    }

    #[instrument(skip(self), name = "exchange::place_limit_order")]
    async fn place_limit_order(
        &self,
        coin: &str,
        is_buy: bool,
        size: f64,
        price: f64,
        reduce_only: bool,
    ) -> Result<FillResult, ExchangeError> {
        let side = if is_buy { "BUY" } else { "SELL" };
        let body = self
            .signed_post(
                "/fapi/v1/order",
                &format!(
                    "symbol={coin}&side={side}&type=LIMIT&timeInForce=GTC&quantity={size}&price={price}&reduceOnly={reduce_only}"
                ),
            )
            .await?;

        self.rate_limiter.record_order_sent();
        Ok(FillResult { order_id: body["orderId"].to_string(), filled_size: 0.0, avg_price: price })
    }

    #[instrument(skip(self), name = "exchange::place_market_order")]
    async fn place_market_order(&self, coin: &str, is_buy: bool, size: f64) -> Result<FillResult, ExchangeError> {
        let side = if is_buy { "BUY" } else { "SELL" };
        let body = self
            .signed_post("/fapi/v1/order", &format!("symbol={coin}&side={side}&type=MARKET&quantity={size}"))
            .await?;

        self.rate_limiter.record_order_sent();
        Ok(FillResult {
            order_id: body["orderId"].to_string(),
            filled_size: Self::parse_f64(&body["executedQty"]),
            avg_price: Self::parse_f64(&body["avgPrice"]),
        })
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    async fn cancel_order(&self, coin: &str, order_id: &str) -> Result<(), ExchangeError> {
        self.signed_delete("/fapi/v1/order", &format!("symbol={coin}&orderId={order_id}")).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::get_positions")]
    async fn get_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let body = self.signed_get("/fapi/v2/positionRisk", "").await?;
        let raw = body.as_array().cloned().unwrap_or_default();

        let positions = raw
            .into_iter()
            .filter_map(|p| {
                let entry_price = Self::parse_f64(&p["entryPrice"]);
                let amt = Self::parse_f64(&p["positionAmt"]);
                if entry_price <= 0.0 || amt == 0.0 || !entry_price.is_finite() || !amt.is_finite() {
                    return None;
                }
                let leverage = p["leverage"]
                    .as_str()
                    .and_then(|s| s.parse::<u32>().ok())
                    .or_else(|| p["leverage"].as_u64().map(|v| v as u32))
                    .unwrap_or(1);

                Some(ExchangePosition {
                    coin: Self::canonicalize_symbol(p["symbol"].as_str().unwrap_or_default()),
                    direction: if amt > 0.0 { Side::Long } else { Side::Short },
                    entry_price,
                    size: amt.abs(),
                    leverage,
                    liquidation_px: Self::parse_f64(&p["liquidationPrice"]),
                    unrealized_pnl: Self::parse_f64(&p["unRealizedProfit"]),
                })
            })
            .collect();

        Ok(positions)
    }

    #[instrument(skip(self), name = "exchange::get_open_orders")]
    async fn get_open_orders(&self) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let body = self.signed_get("/fapi/v1/openOrders", "").await?;
        Ok(parse_orders(body))
    }

    #[instrument(skip(self), name = "exchange::get_historical_orders")]
    async fn get_historical_orders(&self, coin: &str) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let body = self.signed_get("/fapi/v1/allOrders", &format!("symbol={coin}&limit=200")).await?;
        Ok(parse_orders(body))
    }

    #[instrument(skip(self), name = "exchange::get_order_status")]
    async fn get_order_status(&self, coin: &str, order_id: &str) -> Result<VenueOrderStatus, ExchangeError> {
        let body = self.signed_get("/fapi/v1/order", &format!("symbol={coin}&orderId={order_id}")).await?;
        // Absent status on the response defaults to `open`, per the
        // sanitization contract for historical-order lookups (§4.1).
        let status = body["status"].as_str().unwrap_or("NEW");
        Ok(Self::map_status(status))
    }

    #[instrument(skip(self), name = "exchange::get_account_equity")]
    async fn get_account_equity(&self) -> Result<f64, ExchangeError> {
        let state = self.get_account_state().await?;
        Ok(state.equity)
    }

    #[instrument(skip(self), name = "exchange::get_account_state")]
    async fn get_account_state(&self) -> Result<AccountState, ExchangeError> {
        let body = self.signed_get("/fapi/v2/account", "").await?;
        let perp_equity = Self::parse_f64(&body["totalWalletBalance"]);

        let mut free_spot = 0.0;
        if let Some(assets) = body["assets"].as_array() {
            for a in assets {
                let total = Self::parse_f64(&a["walletBalance"]);
                let hold = Self::parse_f64(&a["initialMargin"]);
                free_spot += (total - hold).max(0.0);
            }
        }

        Ok(AccountState { equity: perp_equity, free_collateral: free_spot })
    }

    #[instrument(skip(self), name = "exchange::get_mid_price")]
    async fn get_mid_price(&self, coin: &str) -> Result<f64, ExchangeError> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, coin);
        let resp = self.client.get(&url).send().await.map_err(|e| ExchangeError::TransientNetwork(e.to_string()))?;
        let body: serde_json::Value = resp.json().await.map_err(|e| ExchangeError::TransientNetwork(e.to_string()))?;
        Ok(Self::parse_f64(&body["price"]))
    }
}

fn parse_orders(body: serde_json::Value) -> Vec<ExchangeOrder> {
    body.as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|o| ExchangeOrder {
            order_id: o["orderId"].to_string(),
            coin: BinancePerpClient::canonicalize_symbol(o["symbol"].as_str().unwrap_or_default()),
            side: if o["side"].as_str() == Some("BUY") { Side::Long } else { Side::Short },
            size: BinancePerpClient::parse_f64(&o["origQty"]),
            price: BinancePerpClient::parse_f64(&o["price"]),
            reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
            status: BinancePerpClient::map_status(o["status"].as_str().unwrap_or("NEW")),
        })
        .collect()
}

impl std::fmt::Debug for BinancePerpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinancePerpClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_perp_suffix() {
        assert_eq!(BinancePerpClient::canonicalize_symbol("BTCUSDT-PERP"), "BTCUSDT");
        assert_eq!(BinancePerpClient::canonicalize_symbol("ETHUSDT"), "ETHUSDT");
    }

    #[test]
    fn map_status_covers_terminal_states() {
        assert_eq!(BinancePerpClient::map_status("FILLED"), VenueOrderStatus::Filled);
        assert_eq!(BinancePerpClient::map_status("CANCELED"), VenueOrderStatus::Cancelled);
        assert_eq!(BinancePerpClient::map_status("REJECTED"), VenueOrderStatus::Rejected);
        assert_eq!(BinancePerpClient::map_status("NEW"), VenueOrderStatus::Open);
        assert_eq!(BinancePerpClient::map_status("PARTIALLY_FILLED"), VenueOrderStatus::Open);
    }

    #[test]
    fn parse_f64_accepts_string_or_number() {
        assert_eq!(BinancePerpClient::parse_f64(&serde_json::json!("12.5")), 12.5);
        assert_eq!(BinancePerpClient::parse_f64(&serde_json::json!(12.5)), 12.5);
        assert_eq!(BinancePerpClient::parse_f64(&serde_json::json!("not-a-number")), 0.0);
    }
}
