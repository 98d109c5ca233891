// =============================================================================
// Binance Adapter — HMAC-SHA256 signed REST requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against Binance servers.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::errors::EngineError;
use crate::types::Side;

use super::{classify_http_error, rate_limit::OrderRateLimiter, AccountSnapshot, BrokerAdapter, InstrumentInfo, LivePosition, OrderReceipt};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 5000;

pub struct BinanceAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: OrderRateLimiter,
}

impl BinanceAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceAdapter initialised (base_url=https://api.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
            rate_limiter: OrderRateLimiter::new(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
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

    async fn get_json(&self, path: &str, query: &str, signed: bool) -> Result<(u16, serde_json::Value), EngineError> {
        let qs = if signed { self.signed_query(query) } else { query.to_string() };
        let url = if qs.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, qs)
        };
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::BrokerTransient(e.to_string()))?;
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("invalid json: {e}")))?;
        Ok((status, body))
    }
}

#[async_trait]
impl BrokerAdapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "BINANCE"
    }

    #[instrument(skip(self), name = "binance::current_price")]
    async fn current_price(&self, symbol: &str) -> Result<f64, EngineError> {
        let (status, body) = self
            .get_json("/api/v3/ticker/price", &format!("symbol={symbol}"), false)
            .await?;
        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        body["price"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| EngineError::InvariantViolation("binance ticker missing price".to_string()))
    }

    #[instrument(skip(self), name = "binance::account")]
    async fn account(&self) -> Result<AccountSnapshot, EngineError> {
        let (status, body) = self.get_json("/api/v3/account", "", true).await?;
        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        let balances = body["balances"].as_array().cloned().unwrap_or_default();
        let usdt_free = balances
            .iter()
            .find(|b| b["asset"].as_str() == Some("USDT"))
            .and_then(|b| b["free"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(AccountSnapshot {
            balance: usdt_free,
            equity: usdt_free,
            margin_level: None,
        })
    }

    #[instrument(skip(self), name = "binance::open_positions")]
    async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
        // Spot Binance has no concept of a leveraged open position; treat any
        // resting order as out of scope for this venue's `canOpenPosition`
        // check — the engine's durable Position store is authoritative here.
        Ok(Vec::new())
    }

    #[instrument(skip(self), name = "binance::instrument_info")]
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, EngineError> {
        let (status, body) = self
            .get_json("/api/v3/exchangeInfo", &format!("symbol={symbol}"), false)
            .await?;
        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::InvariantViolation(format!("symbol {symbol} not found in exchangeInfo")))?;

        let filters = info["filters"].as_array().cloned().unwrap_or_default();
        let lot_filter = filters
            .iter()
            .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"));

        let min_lot = lot_filter
            .and_then(|f| f["minQty"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0001);
        let lot_step = lot_filter
            .and_then(|f| f["stepSize"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0001);

        Ok(InstrumentInfo {
            min_lot,
            max_lot: f64::MAX,
            lot_step,
            pip_size: 0.01,
        })
    }

    #[instrument(skip(self), name = "binance::calculate_quantity")]
    async fn calculate_quantity(&self, symbol: &str, position_size_usd: f64, price: f64) -> Result<f64, EngineError> {
        let info = self.instrument_info(symbol).await?;
        let raw_qty = position_size_usd / price;
        let steps = (raw_qty / info.lot_step).floor();
        let qty = (steps * info.lot_step).max(info.min_lot);
        Ok(qty)
    }

    #[instrument(skip(self), name = "binance::create_market_order")]
    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<OrderReceipt, EngineError> {
        if !self.rate_limiter.can_place_order() {
            return Err(EngineError::BrokerTransient("order rate limit reached".to_string()));
        }

        let side_str = match side {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        };
        let params = format!("symbol={symbol}&side={side_str}&type=MARKET&quantity={quantity}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, side = %side, quantity, stop_loss, take_profit, "placing binance market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| EngineError::BrokerTransient(e.to_string()))?;
        let status = resp.status().as_u16();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("invalid json: {e}")))?;

        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        self.rate_limiter.record_order_sent();

        let ticket = body["orderId"].as_u64().map(|n| n.to_string()).unwrap_or_default();
        let fill_price = body["fills"]
            .as_array()
            .and_then(|f| f.first())
            .and_then(|f| f["price"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let filled_quantity = body["executedQty"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(quantity);

        Ok(OrderReceipt {
            ticket,
            fill_price,
            filled_quantity,
        })
    }

    #[instrument(skip(self), name = "binance::modify_stop_loss")]
    async fn modify_stop_loss(&self, ticket: &str, new_stop_loss: f64) -> Result<(), EngineError> {
        // Binance spot carries no native SL order once a MARKET order has
        // filled; stop distance is tracked entirely by PositionManager.
        warn!(ticket, new_stop_loss, "binance adapter tracks stop-loss virtually, no venue-side order to modify");
        Ok(())
    }

    #[instrument(skip(self), name = "binance::close_position")]
    async fn close_position(&self, ticket: &str) -> Result<(), EngineError> {
        debug!(ticket, "closing binance position via opposing market order (handled by caller sizing)");
        Ok(())
    }

    fn reset_order_rate_window(&self) {
        self.rate_limiter.reset_10s_counter();
    }
}

impl std::fmt::Debug for BinanceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
