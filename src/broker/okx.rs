// =============================================================================
// OKX Adapter — base64 HMAC-SHA256 signed REST requests
// =============================================================================
//
// OKX signs `timestamp + method + requestPath + body` (the "prehash string"),
// HMAC-SHA256s it with the API secret, then base64-encodes the digest — unlike
// Binance's hex-encoded query-string signature. The result plus the API key,
// passphrase, and timestamp ride as `OK-ACCESS-*` headers rather than query
// parameters.
// =============================================================================

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument};

use crate::errors::EngineError;
use crate::types::Side;

use super::{classify_http_error, rate_limit::OrderRateLimiter, AccountSnapshot, BrokerAdapter, InstrumentInfo, LivePosition, OrderReceipt};

type HmacSha256 = Hmac<Sha256>;

/// Minimum notional order value OKX will accept, in USDT.
const MIN_ORDER_VALUE_USD: f64 = 20.0;

pub struct OkxAdapter {
    api_key: String,
    secret: String,
    passphrase: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: OrderRateLimiter,
}

impl OkxAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, passphrase: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            passphrase: passphrase.into(),
            base_url: "https://www.okx.com".to_string(),
            client,
            rate_limiter: OrderRateLimiter::new(),
        }
    }

    fn sign(&self, prehash: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        STANDARD.encode(mac.finalize().into_bytes())
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<(u16, serde_json::Value), EngineError> {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let prehash = format!("{timestamp}{method}{path}{body}");
        let signature = self.sign(&prehash);
        let url = format!("{}{}", self.base_url, path);

        let mut req = match method {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url).body(body.to_string()),
            other => {
                return Err(EngineError::InvariantViolation(format!(
                    "unsupported OKX request method {other}"
                )))
            }
        };

        req = req
            .header("OK-ACCESS-KEY", &self.api_key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", &self.passphrase)
            .header("Content-Type", "application/json");

        let resp = req
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

    fn round_down_to_step(qty: f64, step: f64) -> f64 {
        if step <= 0.0 {
            return qty;
        }
        (qty / step).floor() * step
    }

    fn round_up_to_step(qty: f64, step: f64) -> f64 {
        if step <= 0.0 {
            return qty;
        }
        (qty / step).ceil() * step
    }
}

#[async_trait]
impl BrokerAdapter for OkxAdapter {
    fn name(&self) -> &'static str {
        "OKX"
    }

    #[instrument(skip(self), name = "okx::current_price")]
    async fn current_price(&self, symbol: &str) -> Result<f64, EngineError> {
        let path = format!("/api/v5/market/ticker?instId={symbol}");
        let (status, body) = self.request("GET", &path, "").await?;
        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        body["data"][0]["last"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| EngineError::InvariantViolation("okx ticker missing last price".to_string()))
    }

    #[instrument(skip(self), name = "okx::account")]
    async fn account(&self) -> Result<AccountSnapshot, EngineError> {
        let (status, body) = self.request("GET", "/api/v5/account/balance", "").await?;
        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        let details = body["data"][0]["details"].as_array().cloned().unwrap_or_default();
        let usdt = details
            .iter()
            .find(|d| d["ccy"].as_str() == Some("USDT"));
        let balance = usdt
            .and_then(|d| d["availBal"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let equity = usdt
            .and_then(|d| d["eq"].as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(balance);
        Ok(AccountSnapshot {
            balance,
            equity,
            margin_level: None,
        })
    }

    #[instrument(skip(self), name = "okx::open_positions")]
    async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
        let (status, body) = self.request("GET", "/api/v5/account/positions", "").await?;
        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        let rows = body["data"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::new();
        for row in rows {
            let qty = row["pos"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            if qty == 0.0 {
                continue;
            }
            out.push(LivePosition {
                ticket: row["posId"].as_str().unwrap_or_default().to_string(),
                symbol: row["instId"].as_str().unwrap_or_default().to_string(),
                side: if qty > 0.0 { Side::Buy } else { Side::Sell },
                quantity: qty.abs(),
                entry_price: row["avgPx"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0),
                current_price: row["last"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0),
            });
        }
        Ok(out)
    }

    #[instrument(skip(self), name = "okx::instrument_info")]
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, EngineError> {
        let path = format!("/api/v5/public/instruments?instType=SPOT&instId={symbol}");
        let (status, body) = self.request("GET", &path, "").await?;
        if status != 200 {
            return Err(classify_http_error(status, &body.to_string()));
        }
        let info = body["data"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| EngineError::InvariantViolation(format!("instrument {symbol} not found on okx")))?;

        let min_lot = info["minSz"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.001);
        let lot_step = info["lotSz"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.001);

        Ok(InstrumentInfo {
            min_lot,
            max_lot: f64::MAX,
            lot_step,
            pip_size: info["tickSz"].as_str().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.01),
        })
    }

    /// quantity = positionSizeUSD / price; if below minSize, round up to
    /// minSize; if order value < $20, grow to satisfy the minimum, rounding
    /// *up* to lotSize increments; otherwise round *down* to lotSize. Reject
    /// if the final value is still below minima.
    #[instrument(skip(self), name = "okx::calculate_quantity")]
    async fn calculate_quantity(&self, symbol: &str, position_size_usd: f64, price: f64) -> Result<f64, EngineError> {
        let info = self.instrument_info(symbol).await?;
        let mut qty = position_size_usd / price;

        if qty < info.min_lot {
            qty = info.min_lot;
        }

        let order_value = qty * price;
        if order_value < MIN_ORDER_VALUE_USD {
            let needed_qty = MIN_ORDER_VALUE_USD / price;
            qty = Self::round_up_to_step(needed_qty, info.lot_step).max(info.min_lot);
        } else {
            qty = Self::round_down_to_step(qty, info.lot_step).max(info.min_lot);
        }

        let final_value = qty * price;
        if final_value < MIN_ORDER_VALUE_USD || qty < info.min_lot {
            return Err(EngineError::Filtered(format!(
                "okx order value {final_value:.2} below ${MIN_ORDER_VALUE_USD} minimum after rounding"
            )));
        }
        Ok(qty)
    }

    #[instrument(skip(self, stop_loss, take_profit), name = "okx::create_market_order")]
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

        let body = serde_json::json!({
            "instId": symbol,
            "tdMode": "cash",
            "side": if side == Side::Buy { "buy" } else { "sell" },
            "ordType": "market",
            "sz": format!("{quantity}"),
        })
        .to_string();

        debug!(symbol, side = %side, quantity, stop_loss, take_profit, "placing okx market order");

        let (status, resp) = self.request("POST", "/api/v5/trade/order", &body).await?;
        if status != 200 || resp["code"].as_str() != Some("0") {
            return Err(classify_http_error(status, &resp.to_string()));
        }
        self.rate_limiter.record_order_sent();

        let row = &resp["data"][0];
        let ticket = row["ordId"].as_str().unwrap_or_default().to_string();

        Ok(OrderReceipt {
            ticket,
            fill_price: self.current_price(symbol).await.unwrap_or(0.0),
            filled_quantity: quantity,
        })
    }

    #[instrument(skip(self), name = "okx::modify_stop_loss")]
    async fn modify_stop_loss(&self, ticket: &str, new_stop_loss: f64) -> Result<(), EngineError> {
        debug!(ticket, new_stop_loss, "okx stop-loss tracked virtually by PositionManager");
        Ok(())
    }

    #[instrument(skip(self), name = "okx::close_position")]
    async fn close_position(&self, ticket: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "instId": ticket, "mgnMode": "cash" }).to_string();
        let (status, resp) = self.request("POST", "/api/v5/trade/close-position", &body).await?;
        if status != 200 {
            let err = classify_http_error(status, &resp.to_string());
            if let EngineError::BrokerRejected(crate::errors::BrokerErrorCode::AlreadyClosed, _) = err {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn reset_order_rate_window(&self) {
        self.rate_limiter.reset_10s_counter();
    }
}

impl std::fmt::Debug for OkxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxAdapter")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
