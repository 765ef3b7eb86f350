//! Bitget USDT-futures REST client
//!
//! Signed v2 mix API client. Requests carry ACCESS-KEY / ACCESS-SIGN /
//! ACCESS-TIMESTAMP / ACCESS-PASSPHRASE headers; the signature is
//! base64(hmac_sha256(secret, timestamp + method + path + body)).

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ExchangeClient, ExchangeError, ExchangeResult, OpenOrder, OrderAck, Position};
use crate::types::{Candle, Side};

type HmacSha256 = Hmac<Sha256>;

/// Production REST endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.bitget.com";

const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";

/// Error codes Bitget uses for a balance too small to fill the order
const INSUFFICIENT_FUNDS_CODES: &[&str] = &["40754", "43012"];

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    code: String,
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    symbol: String,
    hold_side: String,
    total: String,
    open_price_avg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    order_id: String,
    side: String,
    #[serde(default)]
    trigger_price: Option<String>,
    #[serde(default)]
    reduce_only: Option<String>,
    /// "normal_plan" for fixed stops, "track_plan" for trailing stops;
    /// absent on plain orders
    #[serde(default)]
    plan_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrderList {
    #[serde(default)]
    entrusted_list: Option<Vec<RawOrder>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAccount {
    margin_coin: String,
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAck {
    order_id: String,
}

/// Signed Bitget client
pub struct BitgetClient {
    client: Client,
    base_url: String,
    api_key: String,
    secret: String,
    passphrase: String,
}

impl BitgetClient {
    /// Create a client from environment variables
    ///
    /// Expects `BITGET_API_KEY`, `BITGET_SECRET` and `BITGET_PASSPHRASE`;
    /// `BITGET_BASE_URL` optionally overrides the endpoint.
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;
        let api_key =
            std::env::var("BITGET_API_KEY").context("BITGET_API_KEY environment variable not set")?;
        let secret =
            std::env::var("BITGET_SECRET").context("BITGET_SECRET environment variable not set")?;
        let passphrase = std::env::var("BITGET_PASSPHRASE")
            .context("BITGET_PASSPHRASE environment variable not set")?;
        let base_url =
            std::env::var("BITGET_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(api_key, secret, passphrase, base_url))
    }

    /// Unsigned client for public market-data endpoints only. The
    /// candle endpoint ignores authentication headers, so empty
    /// credentials are acceptable here.
    pub fn public() -> anyhow::Result<Self> {
        let base_url =
            std::env::var("BITGET_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(
            String::new(),
            String::new(),
            String::new(),
            base_url,
        ))
    }

    pub fn new(api_key: String, secret: String, passphrase: String, base_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url,
            api_key,
            secret,
            passphrase,
        }
    }

    fn sign(&self, timestamp: &str, method: &str, path_and_query: &str, body: &str) -> String {
        let prehash = format!("{timestamp}{method}{path_and_query}{body}");
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(prehash.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        body: Option<&Value>,
    ) -> ExchangeResult<T> {
        let timestamp = Utc::now().timestamp_millis().to_string();
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();
        let signature = self.sign(&timestamp, method.as_str(), path_and_query, &body_str);

        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path_and_query))
            .header("ACCESS-KEY", &self.api_key)
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");
        if !body_str.is_empty() {
            request = request.body(body_str);
        }

        let response = request.send().await?;
        let payload: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Response(format!("decode failed: {e}")))?;

        if payload.code != "00000" {
            if INSUFFICIENT_FUNDS_CODES.contains(&payload.code.as_str())
                || payload.msg.to_lowercase().contains("insufficient")
            {
                return Err(ExchangeError::InsufficientFunds);
            }
            return Err(ExchangeError::Api {
                code: payload.code,
                message: payload.msg,
            });
        }

        payload
            .data
            .ok_or_else(|| ExchangeError::Response("missing data field".to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path_and_query: &str) -> ExchangeResult<T> {
        self.request(reqwest::Method::GET, path_and_query, None).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> ExchangeResult<T> {
        self.request(reqwest::Method::POST, path, Some(&body)).await
    }

    fn parse_f64(raw: &str, field: &str) -> ExchangeResult<f64> {
        raw.parse::<f64>()
            .map_err(|_| ExchangeError::Response(format!("bad {field}: {raw:?}")))
    }
}

/// Map a bot timeframe ("1h", "15m", "1d") to a Bitget granularity token.
pub fn granularity(timeframe: &str) -> String {
    match timeframe {
        "1m" | "3m" | "5m" | "15m" | "30m" => timeframe.to_string(),
        other => other.to_uppercase(),
    }
}

#[async_trait]
impl ExchangeClient for BitgetClient {
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let path = format!(
            "/api/v2/mix/market/candles?symbol={symbol}&productType={PRODUCT_TYPE}&granularity={}&limit={}",
            granularity(timeframe),
            limit.min(1000),
        );
        // Each row: [ts_ms, open, high, low, close, base_volume, quote_volume]
        let rows: Vec<Vec<String>> = self.get(&path).await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            if row.len() < 6 {
                return Err(ExchangeError::Response(format!(
                    "candle row with {} fields",
                    row.len()
                )));
            }
            let ts_ms: i64 = row[0]
                .parse()
                .map_err(|_| ExchangeError::Response(format!("bad timestamp: {:?}", row[0])))?;
            let timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(ts_ms)
                .ok_or_else(|| ExchangeError::Response(format!("timestamp out of range: {ts_ms}")))?;
            candles.push(Candle {
                timestamp,
                open: Self::parse_f64(&row[1], "open")?,
                high: Self::parse_f64(&row[2], "high")?,
                low: Self::parse_f64(&row[3], "low")?,
                close: Self::parse_f64(&row[4], "close")?,
                volume: Self::parse_f64(&row[5], "volume")?,
            });
        }
        candles.sort_by_key(|c| c.timestamp);
        debug!(count = candles.len(), symbol, timeframe, "fetched candles");
        Ok(candles)
    }

    async fn fetch_position(&self, symbol: &str) -> ExchangeResult<Option<Position>> {
        let path = format!(
            "/api/v2/mix/position/single-position?symbol={symbol}&productType={PRODUCT_TYPE}&marginCoin={MARGIN_COIN}"
        );
        let raw: Vec<RawPosition> = self.get(&path).await?;

        for pos in raw {
            if pos.symbol != symbol {
                continue;
            }
            let contracts = Self::parse_f64(&pos.total, "total")?;
            if contracts <= 0.0 {
                continue;
            }
            let side: Side = pos
                .hold_side
                .parse()
                .map_err(|e: String| ExchangeError::Response(e))?;
            return Ok(Some(Position {
                side,
                contracts,
                entry_price: Self::parse_f64(&pos.open_price_avg, "openPriceAvg")?,
            }));
        }
        Ok(None)
    }

    async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>> {
        let mut orders = Vec::new();

        // Resting limit orders and trigger (plan) orders live on separate
        // endpoints; the bot needs both to judge orphaned state.
        let pending: RawOrderList = self
            .get(&format!(
                "/api/v2/mix/order/orders-pending?symbol={symbol}&productType={PRODUCT_TYPE}"
            ))
            .await?;
        let plans: RawOrderList = self
            .get(&format!(
                "/api/v2/mix/order/orders-plan-pending?symbol={symbol}&productType={PRODUCT_TYPE}"
            ))
            .await?;

        for raw in pending
            .entrusted_list
            .into_iter()
            .flatten()
            .chain(plans.entrusted_list.into_iter().flatten())
        {
            let trigger_price = match &raw.trigger_price {
                Some(p) if !p.is_empty() => Some(Self::parse_f64(p, "triggerPrice")?),
                _ => None,
            };
            // A trailing stop echoes its activation price in triggerPrice;
            // only the plan type tells it apart from a fixed stop.
            let is_trailing = raw
                .plan_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("track_plan"));
            orders.push(OpenOrder {
                id: raw.order_id,
                side: raw.side,
                trigger_price,
                reduce_only: raw
                    .reduce_only
                    .map(|v| v.eq_ignore_ascii_case("yes"))
                    .unwrap_or(false),
                is_trailing,
            });
        }
        Ok(orders)
    }

    async fn fetch_free_balance(&self) -> ExchangeResult<f64> {
        let accounts: Vec<RawAccount> = self
            .get(&format!(
                "/api/v2/mix/account/accounts?productType={PRODUCT_TYPE}"
            ))
            .await?;
        for account in accounts {
            if account.margin_coin == MARGIN_COIN {
                return Self::parse_f64(&account.available, "available");
            }
        }
        Ok(0.0)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        amount: f64,
        reduce_only: bool,
    ) -> ExchangeResult<OrderAck> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "size": amount.to_string(),
            "side": side,
            "orderType": "market",
            "reduceOnly": if reduce_only { "YES" } else { "NO" },
            "clientOid": uuid::Uuid::new_v4().to_string(),
        });
        let ack: RawAck = self.post("/api/v2/mix/order/place-order", body).await?;
        Ok(OrderAck { id: ack.order_id })
    }

    async fn place_stop_order(
        &self,
        symbol: &str,
        side: &str,
        amount: f64,
        trigger_price: f64,
    ) -> ExchangeResult<OrderAck> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "planType": "normal_plan",
            "triggerType": "mark_price",
            "triggerPrice": trigger_price.to_string(),
            "size": amount.to_string(),
            "side": side,
            "orderType": "market",
            "reduceOnly": "YES",
            "clientOid": uuid::Uuid::new_v4().to_string(),
        });
        let ack: RawAck = self.post("/api/v2/mix/order/place-plan-order", body).await?;
        Ok(OrderAck { id: ack.order_id })
    }

    async fn place_trailing_stop(
        &self,
        symbol: &str,
        side: &str,
        amount: f64,
        activation_price: f64,
        callback_rate: f64,
    ) -> ExchangeResult<OrderAck> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "planType": "track_plan",
            "triggerType": "mark_price",
            "triggerPrice": activation_price.to_string(),
            // Bitget expects the callback as a percentage
            "callbackRatio": (callback_rate * 100.0).to_string(),
            "size": amount.to_string(),
            "side": side,
            "orderType": "market",
            "reduceOnly": "YES",
            "clientOid": uuid::Uuid::new_v4().to_string(),
        });
        let ack: RawAck = self.post("/api/v2/mix/order/place-plan-order", body).await?;
        Ok(OrderAck { id: ack.order_id })
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> ExchangeResult<()> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "orderId": id,
        });
        // Plain and plan orders cancel through different endpoints; try the
        // plain one first and fall back.
        let plain: ExchangeResult<Value> =
            self.post("/api/v2/mix/order/cancel-order", body.clone()).await;
        if plain.is_ok() {
            return Ok(());
        }
        let _: Value = self.post("/api/v2/mix/order/cancel-plan-order", body).await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
        });
        // Mass cancel covers plain orders only; sweep surviving trigger
        // orders individually afterwards.
        let _: Value = self
            .post("/api/v2/mix/order/cancel-all-orders", body.clone())
            .await?;

        let plans: RawOrderList = self
            .get(&format!(
                "/api/v2/mix/order/orders-plan-pending?symbol={symbol}&productType={PRODUCT_TYPE}"
            ))
            .await?;
        for order in plans.entrusted_list.into_iter().flatten() {
            let cancel = json!({
                "symbol": symbol,
                "productType": PRODUCT_TYPE,
                "orderId": order.order_id,
            });
            let result: ExchangeResult<Value> =
                self.post("/api/v2/mix/order/cancel-plan-order", cancel).await;
            if let Err(e) = result {
                warn!(order_id = %order.order_id, error = %e, "failed to cancel trigger order");
            }
        }
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "leverage": leverage.to_string(),
        });
        let result: ExchangeResult<Value> =
            self.post("/api/v2/mix/account/set-leverage", body).await;
        if let Err(e) = result {
            // Leverage frequently cannot change while margin is deployed;
            // the entry itself is still valid at the current setting.
            warn!(symbol, leverage, error = %e, "could not set leverage, continuing");
        }
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, mode: &str) -> ExchangeResult<()> {
        let margin_mode = if mode == "cross" { "crossed" } else { mode };
        let body = json!({
            "symbol": symbol,
            "productType": PRODUCT_TYPE,
            "marginCoin": MARGIN_COIN,
            "marginMode": margin_mode,
        });
        let result: ExchangeResult<Value> =
            self.post("/api/v2/mix/account/set-margin-mode", body).await;
        if let Err(e) = result {
            warn!(symbol, mode, error = %e, "could not set margin mode, continuing");
        }
        Ok(())
    }
}
