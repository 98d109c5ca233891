// =============================================================================
// Shared types used across the scalping engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// The broker/venue an [`Agent`](crate::statestore::model::Agent) trades through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Broker {
    Mt4,
    Okx,
    Binance,
}

impl std::fmt::Display for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mt4 => write!(f, "MT4"),
            Self::Okx => write!(f, "OKX"),
            Self::Binance => write!(f, "BINANCE"),
        }
    }
}

/// The LLM/detector recommendation for a candidate signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// Which side of the market a [`Position`](crate::statestore::model::Position) holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side — used by signal-reversal auto-close.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn from_recommendation(r: Recommendation) -> Option<Self> {
        match r {
            Recommendation::Buy => Some(Self::Buy),
            Recommendation::Sell => Some(Self::Sell),
            Recommendation::Hold => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Signal category. `FibonacciScalping` is the only category with priority-queue
/// routing; everything else routes to the standard queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    FibonacciScalping,
    Confluence,
    Momentum,
    MeanReversion,
    Other,
}

impl Category {
    pub fn is_priority(self) -> bool {
        matches!(self, Self::FibonacciScalping)
    }
}

/// Risk classification derived by the `SignalValidator` from LLM and market
/// context; determines the base position size before the consensus multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskClass {
    Safe,
    Moderate,
    Risky,
}

impl RiskClass {
    /// Base sizing multiplier documented in §4.2.
    pub fn size_factor(self) -> f64 {
        match self {
            Self::Safe => 1.0,
            Self::Moderate => 0.7,
            Self::Risky => 0.4,
        }
    }
}

/// Terminal/non-terminal lifecycle status of a `SignalLog` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Pending,
    Filtered,
    Rejected,
    Executed,
    Failed,
}

impl SignalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filtered | Self::Rejected | Self::Executed | Self::Failed
        )
    }
}

/// Lifecycle status of a `Position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
    AutoClosed,
}

/// Outcome recorded against `DailyTradingStats.lastTradeResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeResult {
    Win,
    Loss,
}

/// Classification produced by the `MarketDropDetector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropLevel {
    None,
    Moderate,
    Severe,
}

impl std::fmt::Display for DropLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Moderate => write!(f, "moderate"),
            Self::Severe => write!(f, "severe"),
        }
    }
}
