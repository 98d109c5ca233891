// =============================================================================
// EngineError — typed error taxonomy for the scalping engine
// =============================================================================
//
// Replaces the "error-as-string" pattern this engine would otherwise inherit:
// every outcome that must become a terminal `SignalLog` row is represented as
// one of these variants instead of matched against broker response text.
//
// RiskAuthority and the exit pipeline never raise these for *policy* outcomes
// (those are plain `(bool, Option<String>)` gate results) — `EngineError` is
// reserved for the boundary where an Executor/PositionManager call must decide
// a terminal status.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// A RiskAuthority gate or consensus evaluation rejected the signal.
    #[error("policy rejected: {0}")]
    PolicyRejected(String),

    /// The broker does not support this symbol/category for this agent.
    #[error("filtered: {0}")]
    Filtered(String),

    /// The broker refused the order outright (margin, invalid SL/TP, disabled
    /// autotrading).
    #[error("broker rejected: {0}")]
    BrokerRejected(BrokerErrorCode, String),

    /// Timeout or connectivity failure talking to a broker. Terminal — the
    /// caller must reconcile before any retry, and no automatic retry happens
    /// within the same drain tick.
    #[error("broker transient error: {0}")]
    BrokerTransient(String),

    /// KVStore or StateStore unavailable. Fail closed.
    #[error("risk store unavailable: {0}")]
    StoreUnavailable(String),

    /// An invariant that should be structurally impossible was violated.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl EngineError {
    /// The `SignalLog.failedReason` string for this error.
    pub fn reason(&self) -> String {
        match self {
            Self::PolicyRejected(r) => r.clone(),
            Self::Filtered(r) => r.clone(),
            Self::BrokerRejected(_, r) => r.clone(),
            Self::BrokerTransient(r) => r.clone(),
            Self::StoreUnavailable(_) => "risk store unavailable".to_string(),
            Self::InvariantViolation(r) => r.clone(),
        }
    }
}

/// Typed broker error codes, replacing string-matching on broker messages
/// (REDESIGN FLAG "Error-as-string" in SPEC_FULL.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerErrorCode {
    /// The position/order referenced no longer exists — a normal outcome for
    /// idempotent close, not a failure.
    AlreadyClosed,
    InsufficientMargin,
    /// MT4 error 4109 — the terminal's "AutoTrading" button is disabled.
    AutoTradingDisabled,
    Transient,
    Unknown,
}

impl std::fmt::Display for BrokerErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyClosed => write!(f, "already-closed"),
            Self::InsufficientMargin => write!(f, "insufficient-margin"),
            Self::AutoTradingDisabled => write!(f, "autotrading-disabled"),
            Self::Transient => write!(f, "transient"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}
