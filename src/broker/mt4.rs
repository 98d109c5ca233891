// =============================================================================
// MT4 Adapter — talks to a local MT4 bridge EA over HTTP
// =============================================================================
//
// MT4 itself speaks no HTTP; a bridge Expert Advisor exposes a small REST
// surface on localhost that this adapter calls. Lot sizing is computed
// upstream by `RiskAuthority::calculate_lot_size` — this adapter only
// converts a sized `position_size_usd` into a margin pre-check and normalizes
// MT4's error codes (4108 "no such ticket" / already closed, 4109
// "autotrading disabled").
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::errors::{BrokerErrorCode, EngineError};
use crate::types::Side;

use super::{classify_http_error, rate_limit::OrderRateLimiter, AccountSnapshot, BrokerAdapter, InstrumentInfo, LivePosition, OrderReceipt};

/// Broker-configured per-symbol contract size and leverage, used for the
/// free-margin pre-check ahead of order placement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Mt4SymbolConfig {
    pub contract_size: f64,
    pub leverage: f64,
}

impl Default for Mt4SymbolConfig {
    fn default() -> Self {
        Self {
            contract_size: 100_000.0,
            leverage: 100.0,
        }
    }
}

pub struct Mt4Adapter {
    bridge_url: String,
    client: reqwest::Client,
    symbol_config: HashMap<String, Mt4SymbolConfig>,
    rate_limiter: OrderRateLimiter,
}

impl Mt4Adapter {
    pub fn new(bridge_url: impl Into<String>, symbol_config: HashMap<String, Mt4SymbolConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            bridge_url: bridge_url.into(),
            client,
            symbol_config,
            rate_limiter: OrderRateLimiter::new(),
        }
    }

    fn symbol_config(&self, symbol: &str) -> Mt4SymbolConfig {
        self.symbol_config.get(symbol).copied().unwrap_or_default()
    }

    async fn get(&self, path: &str) -> Result<(u16, serde_json::Value), EngineError> {
        let url = format!("{}{}", self.bridge_url, path);
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

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<(u16, serde_json::Value), EngineError> {
        let url = format!("{}{}", self.bridge_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::BrokerTransient(e.to_string()))?;
        let status = resp.status().as_u16();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::BrokerTransient(format!("invalid json: {e}")))?;
        Ok((status, resp_body))
    }

    fn classify_mt4_error(status: u16, body: &serde_json::Value) -> EngineError {
        let code = body["errorCode"].as_i64();
        let message = body["message"].as_str().unwrap_or("mt4 bridge error").to_string();
        match code {
            Some(4108) => EngineError::BrokerRejected(BrokerErrorCode::AlreadyClosed, message),
            Some(4109) => EngineError::BrokerRejected(BrokerErrorCode::AutoTradingDisabled, message),
            _ => classify_http_error(status, &message),
        }
    }
}

#[async_trait]
impl BrokerAdapter for Mt4Adapter {
    fn name(&self) -> &'static str {
        "MT4"
    }

    #[instrument(skip(self), name = "mt4::current_price")]
    async fn current_price(&self, symbol: &str) -> Result<f64, EngineError> {
        let (status, body) = self.get(&format!("/price/{symbol}")).await?;
        if status != 200 {
            return Err(Self::classify_mt4_error(status, &body));
        }
        body["bid"]
            .as_f64()
            .ok_or_else(|| EngineError::InvariantViolation("mt4 bridge price missing bid".to_string()))
    }

    #[instrument(skip(self), name = "mt4::account")]
    async fn account(&self) -> Result<AccountSnapshot, EngineError> {
        let (status, body) = self.get("/account").await?;
        if status != 200 {
            return Err(Self::classify_mt4_error(status, &body));
        }
        Ok(AccountSnapshot {
            balance: body["balance"].as_f64().unwrap_or(0.0),
            equity: body["equity"].as_f64().unwrap_or(0.0),
            margin_level: body["marginLevel"].as_f64(),
        })
    }

    #[instrument(skip(self), name = "mt4::open_positions")]
    async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
        let (status, body) = self.get("/positions").await?;
        if status != 200 {
            return Err(Self::classify_mt4_error(status, &body));
        }
        let rows = body.as_array().cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| LivePosition {
                ticket: row["ticket"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
                symbol: row["symbol"].as_str().unwrap_or_default().to_string(),
                side: if row["type"].as_str() == Some("sell") { Side::Sell } else { Side::Buy },
                quantity: row["lots"].as_f64().unwrap_or(0.0),
                entry_price: row["openPrice"].as_f64().unwrap_or(0.0),
                current_price: row["currentPrice"].as_f64().unwrap_or(0.0),
            })
            .collect())
    }

    #[instrument(skip(self), name = "mt4::instrument_info")]
    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, EngineError> {
        let (status, body) = self.get(&format!("/symbol/{symbol}")).await?;
        if status != 200 {
            return Err(Self::classify_mt4_error(status, &body));
        }
        Ok(InstrumentInfo {
            min_lot: body["minLot"].as_f64().unwrap_or(0.01),
            max_lot: body["maxLot"].as_f64().unwrap_or(100.0),
            lot_step: body["lotStep"].as_f64().unwrap_or(0.01),
            pip_size: body["point"].as_f64().unwrap_or(0.0001),
        })
    }

    /// MT4 lot sizing is computed upstream by `RiskAuthority`; this only
    /// converts an already-computed USD position size into the broker's lot
    /// unit via the per-symbol contract size, as a fallback for callers that
    /// have not gone through the risk-sized path.
    #[instrument(skip(self), name = "mt4::calculate_quantity")]
    async fn calculate_quantity(&self, symbol: &str, position_size_usd: f64, price: f64) -> Result<f64, EngineError> {
        let info = self.instrument_info(symbol).await?;
        let cfg = self.symbol_config(symbol);
        let raw_lots = position_size_usd / (cfg.contract_size * price);
        let steps = (raw_lots / info.lot_step).round();
        let lots = (steps * info.lot_step).clamp(info.min_lot, info.max_lot);
        Ok(lots)
    }

    #[instrument(skip(self, stop_loss, take_profit), name = "mt4::create_market_order")]
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

        let cfg = self.symbol_config(symbol);
        let price = self.current_price(symbol).await?;
        let account = self.account().await?;
        let required_margin = (quantity * cfg.contract_size * price) / cfg.leverage;
        if required_margin > account.balance {
            return Err(EngineError::BrokerRejected(
                BrokerErrorCode::InsufficientMargin,
                format!(
                    "required margin {required_margin:.2} exceeds free balance {:.2}",
                    account.balance
                ),
            ));
        }

        let body = serde_json::json!({
            "symbol": symbol,
            "type": if side == Side::Buy { "buy" } else { "sell" },
            "lots": quantity,
            "stopLoss": stop_loss,
            "takeProfit": take_profit,
        });

        debug!(symbol, side = %side, quantity, stop_loss, take_profit, "placing mt4 market order");

        let (status, resp) = self.post("/order", &body).await?;
        if status != 200 {
            return Err(Self::classify_mt4_error(status, &resp));
        }
        self.rate_limiter.record_order_sent();

        Ok(OrderReceipt {
            ticket: resp["ticket"].as_u64().map(|n| n.to_string()).unwrap_or_default(),
            fill_price: resp["fillPrice"].as_f64().unwrap_or(price),
            filled_quantity: quantity,
        })
    }

    #[instrument(skip(self), name = "mt4::modify_stop_loss")]
    async fn modify_stop_loss(&self, ticket: &str, new_stop_loss: f64) -> Result<(), EngineError> {
        let body = serde_json::json!({ "ticket": ticket, "stopLoss": new_stop_loss });
        let (status, resp) = self.post("/modify", &body).await?;
        if status != 200 {
            let err = Self::classify_mt4_error(status, &resp);
            if let EngineError::BrokerRejected(BrokerErrorCode::AlreadyClosed, _) = err {
                warn!(ticket, "mt4 position already closed during stop-loss modify, ignoring");
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    #[instrument(skip(self), name = "mt4::close_position")]
    async fn close_position(&self, ticket: &str) -> Result<(), EngineError> {
        let body = serde_json::json!({ "ticket": ticket });
        let (status, resp) = self.post("/close", &body).await?;
        if status != 200 {
            let err = Self::classify_mt4_error(status, &resp);
            if let EngineError::BrokerRejected(BrokerErrorCode::AlreadyClosed, _) = err {
                warn!(ticket, "mt4 position already closed (4108), treating close as success");
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

impl std::fmt::Debug for Mt4Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mt4Adapter")
            .field("bridge_url", &self.bridge_url)
            .finish()
    }
}
