// =============================================================================
// Durable data model — Agent, Position, Trade, DailyTradingStats, SignalLog
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Broker, Category, DropLevel, PositionStatus, Recommendation, RiskClass, Side, SignalStatus,
    TradeResult,
};

/// A configured trading strategy instance tied to a user and a broker.
/// Immutable for the duration of one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub user_id: String,
    pub broker: Broker,
    pub category: Category,
    pub is_active: bool,
    pub allowed_signal_categories: Vec<Category>,
}

/// Aggregate of four LLM votes used by `RiskAuthority::evaluate_consensus`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LlmVotes {
    pub buy: u8,
    pub sell: u8,
    pub hold: u8,
    pub confidence: f64,
}

/// A candidate signal as emitted by an external detector or LLM agent, before
/// validation. Optional fields reflect the loose shape signals arrive in;
/// `SignalValidator` is responsible for turning this into a `ValidatedSignal`
/// with every optional field resolved or explicitly rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSignal {
    pub signal_id: String,
    pub agent_id: String,
    pub symbol: String,
    pub recommendation: Recommendation,
    pub category: Category,
    #[serde(default)]
    pub entry_hint: Option<f64>,
    #[serde(default)]
    pub stop_loss_hint: Option<f64>,
    #[serde(default)]
    pub take_profit_hint: Option<f64>,
    pub llm_votes: LlmVotes,
}

/// A candidate signal enriched with sizing, normalized SL/TP, and a risk
/// classification by `SignalValidator`.
///
/// Invariant: `is_valid ⇒ position_size_usd > 0 ∧ recommended_entry > 0 ∧
/// stop_loss_price` differs from `recommended_entry` on the risking side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedSignal {
    pub candidate: CandidateSignal,
    pub is_valid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    pub position_size_usd: f64,
    pub recommended_entry: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub risk_class: RiskClass,
}

impl ValidatedSignal {
    /// Side implied by the candidate's recommendation, if any (HOLD has none).
    pub fn side(&self) -> Option<Side> {
        Side::from_recommendation(self.candidate.recommendation)
    }
}

/// A single open or closed trading position, uniquely keyed by `ticket`.
///
/// Ownership (SPEC_FULL.md §3): the Executor exclusively creates Positions.
/// The PositionManager exclusively mutates the exit-related fields listed
/// below; all other components only read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticket: String,
    pub user_id: String,
    pub agent_id: String,
    pub symbol: String,
    pub side: Side,
    pub lot_size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub status: PositionStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub close_reason: Option<String>,

    // --- Exit-management fields (PositionManager-owned) ---------------------
    #[serde(default)]
    pub break_even_activated: bool,
    #[serde(default)]
    pub trailing_stop_activated: bool,
    pub highest_profit_price: f64,
    pub original_stop_loss: f64,
    #[serde(default)]
    pub one_to_one_locked: bool,
    #[serde(default)]
    pub profit_locked_75: bool,
    #[serde(default)]
    pub profit: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}

/// Ledger row mirroring a `Position` for downstream accounting; keyed by
/// `ticket`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ticket: String,
    pub user_id: String,
    pub agent_id: String,
    pub symbol: String,
    pub side: Side,
    pub lot_size: f64,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trade {
    pub fn from_position(p: &Position) -> Self {
        Self {
            ticket: p.ticket.clone(),
            user_id: p.user_id.clone(),
            agent_id: p.agent_id.clone(),
            symbol: p.symbol.clone(),
            side: p.side,
            lot_size: p.lot_size,
            entry_price: p.entry_price,
            exit_price: if p.is_open() { None } else { Some(p.current_price) },
            pnl: if p.is_open() { None } else { Some(p.profit) },
            opened_at: p.opened_at,
            closed_at: p.closed_at,
            close_reason: p.close_reason.clone(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

/// One document per UTC date. Invariant: `win_count + loss_count <=
/// total_trades`. Rolls over lazily at the first operation whose UTC date
/// differs from `date`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyTradingStats {
    pub date: String,
    pub total_trades: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub total_pnl: f64,
    pub consecutive_losses: u32,
    pub max_consecutive_losses: u32,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub last_trade_result: Option<TradeResult>,
    pub is_paused: bool,
    pub pause_reason: Option<String>,
    pub pause_until: Option<DateTime<Utc>>,
}

impl DailyTradingStats {
    pub fn new_for_date(date: String) -> Self {
        Self {
            date,
            total_trades: 0,
            win_count: 0,
            loss_count: 0,
            total_pnl: 0.0,
            consecutive_losses: 0,
            max_consecutive_losses: 0,
            last_trade_time: None,
            last_trade_result: None,
            is_paused: false,
            pause_reason: None,
            pause_until: None,
        }
    }
}

/// Per-signal lifecycle record; the authoritative audit trail. Transitions
/// monotonically from `Pending` to exactly one terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalLog {
    pub signal_id: String,
    pub agent_id: String,
    pub status: SignalStatus,
    #[serde(default)]
    pub failed_reason: Option<String>,
    #[serde(default)]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_price: Option<f64>,
    #[serde(default)]
    pub execution_quantity: Option<f64>,
    #[serde(default)]
    pub ticket: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignalLog {
    pub fn pending(signal_id: String, agent_id: String, now: DateTime<Utc>) -> Self {
        Self {
            signal_id,
            agent_id,
            status: SignalStatus::Pending,
            failed_reason: None,
            executed_at: None,
            execution_price: None,
            execution_quantity: None,
            ticket: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Transient per-symbol market snapshot produced by `MarketDropDetector`;
/// stored in KVStore with a 60s TTL and emitted as a pub-sub alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCondition {
    pub symbol: String,
    pub current_price: f64,
    pub price_change_1m: f64,
    pub price_change_3m: f64,
    pub price_change_5m: f64,
    pub volume_change: f64,
    pub velocity: f64,
    pub drop_level: DropLevel,
    pub timestamp: DateTime<Utc>,
}

/// Payload published on the `market_drops` channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropAlert {
    pub symbol: String,
    pub drop_level: DropLevel,
    pub price_change_1m: f64,
    pub price_change_3m: f64,
    pub price_change_5m: f64,
    pub velocity: f64,
    pub timestamp: DateTime<Utc>,
}

/// Payload published on the `mt4_emergency` channel when a severe market drop
/// triggers portfolio-wide protective liquidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyEvent {
    pub reason: String,
    pub symbol: String,
    pub closed_tickets: Vec<String>,
    pub timestamp: DateTime<Utc>,
}
