// =============================================================================
// BrokerAdapter — uniform interface over MT4, OKX, Binance
// =============================================================================
//
// Every venue-specific quirk (lot vs. quantity, pip vs. percentage stop
// distance, HMAC-hex vs. HMAC-base64 signing) lives behind this trait. The
// Executor and PositionManager never match on `Broker` themselves — they call
// through a `dyn BrokerAdapter` and let the concrete adapter translate.
// =============================================================================

pub mod binance;
pub mod mt4;
pub mod okx;
pub mod rate_limit;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::types::Side;

/// Live account snapshot as reported by the venue.
#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub balance: f64,
    pub equity: f64,
    pub margin_level: Option<f64>,
}

/// Per-instrument sizing metadata used by `RiskAuthority::calculate_lot_size`
/// and by order-quantity normalization.
#[derive(Debug, Clone, Copy)]
pub struct InstrumentInfo {
    pub min_lot: f64,
    pub max_lot: f64,
    pub lot_step: f64,
    pub pip_size: f64,
}

/// Result of successfully opening a position at the venue.
#[derive(Debug, Clone)]
pub struct OrderReceipt {
    pub ticket: String,
    pub fill_price: f64,
    pub filled_quantity: f64,
}

/// A currently-open position as reported live by the venue — used by
/// `RiskAuthority::can_open_position` and by reconciliation, since the
/// durable `Position` store can lag behind the broker by several minutes.
#[derive(Debug, Clone)]
pub struct LivePosition {
    pub ticket: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn current_price(&self, symbol: &str) -> Result<f64, EngineError>;

    async fn account(&self) -> Result<AccountSnapshot, EngineError>;

    /// Live, broker-authoritative open positions. `RiskAuthority` reads this
    /// directly rather than the durable store so a lagging sync does not
    /// allow an over-limit open.
    async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError>;

    async fn instrument_info(&self, symbol: &str) -> Result<InstrumentInfo, EngineError>;

    /// Convert a USD position size into the venue's native quantity unit
    /// (MT4 lots, OKX/Binance base-asset quantity), clamped to
    /// `[min_lot, max_lot]` and rounded to `lot_step`.
    async fn calculate_quantity(
        &self,
        symbol: &str,
        position_size_usd: f64,
        price: f64,
    ) -> Result<f64, EngineError>;

    async fn create_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
    ) -> Result<OrderReceipt, EngineError>;

    async fn modify_stop_loss(&self, ticket: &str, new_stop_loss: f64) -> Result<(), EngineError>;

    /// Idempotent: closing a ticket the venue already reports as closed
    /// succeeds silently rather than raising `BrokerRejected`.
    async fn close_position(&self, ticket: &str) -> Result<(), EngineError>;

    /// Rolls the adapter's 10-second order-rate window. Called by a periodic
    /// task in `main`; adapters with no local rate limiter no-op.
    fn reset_order_rate_window(&self) {}
}

/// Maps a raw HTTP status + venue error body into the typed taxonomy shared
/// by every adapter, so the Executor sees one error shape regardless of
/// venue.
pub(crate) fn classify_http_error(status: u16, body: &str) -> EngineError {
    use crate::errors::BrokerErrorCode;

    let lower = body.to_ascii_lowercase();
    if lower.contains("autotrading") || lower.contains("4109") {
        return EngineError::BrokerRejected(BrokerErrorCode::AutoTradingDisabled, body.to_string());
    }
    if lower.contains("margin") || lower.contains("insufficient") {
        return EngineError::BrokerRejected(BrokerErrorCode::InsufficientMargin, body.to_string());
    }
    if lower.contains("not found") || lower.contains("unknown position") || lower.contains("order does not exist") {
        return EngineError::BrokerRejected(BrokerErrorCode::AlreadyClosed, body.to_string());
    }
    if status >= 500 || status == 429 {
        return EngineError::BrokerTransient(format!("http {status}: {body}"));
    }
    EngineError::BrokerRejected(BrokerErrorCode::Unknown, format!("http {status}: {body}"))
}
