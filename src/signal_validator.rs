// =============================================================================
// SignalValidator — normalizes a CandidateSignal into a ValidatedSignal
// =============================================================================
//
// Sits between the agents that produce raw recommendations and the
// `PriorityQueue` that feeds the Executor. Three jobs, always in this order:
// resolve the entry price, cap/derive the stop-loss, and re-derive the
// take-profit from the risk-reward ratio rather than trust whatever the
// originating agent suggested. The LLM's own take-profit hint is discarded —
// SPEC_FULL.md §4.2 treats TP as a function of SL and RR, never an
// independent input.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::broker::BrokerAdapter;
use crate::errors::EngineError;
use crate::kvstore::KVStore;
use crate::runtime_config::ValidatorConfig;
use crate::statestore::model::{CandidateSignal, ValidatedSignal};
use crate::types::{Recommendation, RiskClass, Side};

/// The most recent detector output for a symbol, cached under `signal:{symbol}:latest`
/// so `PositionManager`'s signal-reversal check can see what the latest pattern
/// was without re-deriving it from raw candidate history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestSignalPattern {
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub at: DateTime<Utc>,
}

/// TTL on the cached latest pattern — a pattern older than this is treated as
/// stale and ignored by signal-reversal, matching the detector's own 15-minute
/// relevance window.
const LATEST_PATTERN_TTL_SECS: u64 = 900;

pub struct SignalValidator {
    broker: Arc<dyn BrokerAdapter>,
    kv: Arc<dyn KVStore>,
    config: ValidatorConfig,
}

impl SignalValidator {
    pub fn new(broker: Arc<dyn BrokerAdapter>, kv: Arc<dyn KVStore>, config: ValidatorConfig) -> Self {
        Self { broker, kv, config }
    }

    fn latest_pattern_key(symbol: &str) -> String {
        format!("signal:{symbol}:latest")
    }

    async fn record_latest_pattern(&self, symbol: &str, recommendation: Recommendation, confidence: f64) {
        let pattern = LatestSignalPattern { recommendation, confidence, at: Utc::now() };
        match serde_json::to_string(&pattern) {
            Ok(payload) => {
                let _ = self
                    .kv
                    .set(&Self::latest_pattern_key(symbol), payload, Some(Duration::from_secs(LATEST_PATTERN_TTL_SECS)))
                    .await;
            }
            Err(e) => warn!(symbol, error = %e, "failed to serialise latest signal pattern"),
        }
    }

    /// Turns a raw candidate into a `ValidatedSignal`. Never returns `Err`
    /// for a rejectable signal — rejection is expressed via `is_valid =
    /// false` and `invalid_reason`, so the caller can still log a terminal
    /// `SignalLog` entry. `Err` is reserved for infrastructure failure (the
    /// broker could not be reached to resolve a missing entry price).
    #[instrument(skip(self, candidate), fields(signal_id = %candidate.signal_id, symbol = %candidate.symbol))]
    pub async fn validate(&self, candidate: CandidateSignal) -> Result<ValidatedSignal, EngineError> {
        let side = match Side::from_recommendation(candidate.recommendation) {
            Some(side) => side,
            None => {
                return Ok(self.reject(candidate, 0.0, "recommendation is HOLD, nothing to validate"));
            }
        };

        self.record_latest_pattern(&candidate.symbol, candidate.recommendation, candidate.llm_votes.confidence)
            .await;

        let entry = match candidate.entry_hint {
            Some(hint) if hint > 0.0 => hint,
            _ => match self.broker.current_price(&candidate.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(error = %e, "signal validator could not resolve entry price");
                    return Err(e);
                }
            },
        };

        let stop_loss = self.normalize_stop_loss(entry, side, candidate.stop_loss_hint);
        let sl_distance = (entry - stop_loss).abs();

        if sl_distance <= 0.0 {
            return Ok(self.reject(candidate, entry, "stop-loss distance is zero"));
        }

        let take_profit = match side {
            Side::Buy => entry + sl_distance * self.config.rr_ratio,
            Side::Sell => entry - sl_distance * self.config.rr_ratio,
        };

        let risk_class = self.classify_risk(&candidate);
        let position_size_usd = self.config.account_risk_usd * risk_class.size_factor();

        if !self.broker_supports(&candidate.symbol).await {
            return Ok(self.reject(candidate, entry, "symbol not supported by configured broker"));
        }

        if position_size_usd <= 0.0 {
            return Ok(self.reject(candidate, entry, "computed position size is zero"));
        }

        Ok(ValidatedSignal {
            candidate,
            is_valid: true,
            invalid_reason: None,
            position_size_usd,
            recommended_entry: entry,
            stop_loss_price: stop_loss,
            take_profit_price: take_profit,
            risk_class,
        })
    }

    /// Caps an agent-suggested stop-loss to `max_sl_points`, or installs
    /// `default_sl_points` when the agent supplied none.
    fn normalize_stop_loss(&self, entry: f64, side: Side, hint: Option<f64>) -> f64 {
        let points = match hint {
            Some(sl) => {
                let requested_points = (entry - sl).abs();
                requested_points.min(self.config.max_sl_points)
            }
            None => self.config.default_sl_points,
        };

        match side {
            Side::Buy => entry - points,
            Side::Sell => entry + points,
        }
    }

    fn classify_risk(&self, candidate: &CandidateSignal) -> RiskClass {
        let votes = candidate.llm_votes;
        let total = votes.buy + votes.sell + votes.hold;
        let agreeing = votes.buy.max(votes.sell);
        let agreement_ratio = if total == 0 { 0.0 } else { agreeing as f64 / total as f64 };

        if agreement_ratio >= 1.0 && votes.confidence >= 80.0 {
            RiskClass::Safe
        } else if agreement_ratio >= 0.75 && votes.confidence >= 60.0 {
            RiskClass::Moderate
        } else {
            RiskClass::Risky
        }
    }

    async fn broker_supports(&self, symbol: &str) -> bool {
        self.broker.instrument_info(symbol).await.is_ok()
    }

    fn reject(&self, candidate: CandidateSignal, entry: f64, reason: &str) -> ValidatedSignal {
        ValidatedSignal {
            candidate,
            is_valid: false,
            invalid_reason: Some(reason.to_string()),
            position_size_usd: 0.0,
            recommended_entry: entry,
            stop_loss_price: entry,
            take_profit_price: entry,
            risk_class: RiskClass::Risky,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountSnapshot, InstrumentInfo, LivePosition, OrderReceipt};
    use crate::kvstore::InProcessKVStore;
    use crate::statestore::model::LlmVotes;
    use crate::types::Category;
    use async_trait::async_trait;

    struct FakeBroker {
        price: f64,
        supports: bool,
    }

    #[async_trait]
    impl BrokerAdapter for FakeBroker {
        fn name(&self) -> &'static str {
            "FAKE"
        }
        async fn current_price(&self, _symbol: &str) -> Result<f64, EngineError> {
            Ok(self.price)
        }
        async fn account(&self) -> Result<AccountSnapshot, EngineError> {
            unimplemented!()
        }
        async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
            Ok(vec![])
        }
        async fn instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo, EngineError> {
            if self.supports {
                Ok(InstrumentInfo { min_lot: 0.01, max_lot: 1.0, lot_step: 0.01, pip_size: 0.01 })
            } else {
                Err(EngineError::InvariantViolation("unknown symbol".to_string()))
            }
        }
        async fn calculate_quantity(&self, _s: &str, _u: f64, _p: f64) -> Result<f64, EngineError> {
            unimplemented!()
        }
        async fn create_market_order(
            &self,
            _s: &str,
            _side: Side,
            _q: f64,
            _sl: f64,
            _tp: f64,
        ) -> Result<OrderReceipt, EngineError> {
            unimplemented!()
        }
        async fn modify_stop_loss(&self, _t: &str, _sl: f64) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn close_position(&self, _t: &str) -> Result<(), EngineError> {
            unimplemented!()
        }
    }

    fn candidate(entry: Option<f64>, sl: Option<f64>) -> CandidateSignal {
        CandidateSignal {
            signal_id: "sig-1".to_string(),
            agent_id: "agent-1".to_string(),
            symbol: "BTCUSD".to_string(),
            recommendation: Recommendation::Buy,
            category: Category::FibonacciScalping,
            entry_hint: entry,
            stop_loss_hint: sl,
            take_profit_hint: Some(999_999.0),
            llm_votes: LlmVotes { buy: 4, sell: 0, hold: 0, confidence: 90.0 },
        }
    }

    #[tokio::test]
    async fn recomputes_tp_from_rr_ignoring_hint() {
        let broker = Arc::new(FakeBroker { price: 100.0, supports: true });
        let validator = SignalValidator::new(broker, Arc::new(InProcessKVStore::new()), ValidatorConfig::default());
        let result = validator.validate(candidate(Some(100.0), Some(90.0))).await.unwrap();
        assert!(result.is_valid);
        assert_eq!(result.stop_loss_price, 90.0);
        assert_eq!(result.take_profit_price, 100.0 + 10.0 * 1.5);
    }

    #[tokio::test]
    async fn caps_stop_loss_beyond_max_points() {
        let broker = Arc::new(FakeBroker { price: 100.0, supports: true });
        let validator = SignalValidator::new(broker, Arc::new(InProcessKVStore::new()), ValidatorConfig::default());
        let result = validator.validate(candidate(Some(100.0), Some(-300.0))).await.unwrap();
        assert_eq!(result.stop_loss_price, 100.0 - 200.0);
    }

    #[tokio::test]
    async fn installs_default_sl_when_hint_absent() {
        let broker = Arc::new(FakeBroker { price: 100.0, supports: true });
        let validator = SignalValidator::new(broker, Arc::new(InProcessKVStore::new()), ValidatorConfig::default());
        let result = validator.validate(candidate(Some(100.0), None)).await.unwrap();
        assert_eq!(result.stop_loss_price, 100.0 - 150.0);
    }

    #[tokio::test]
    async fn resolves_missing_entry_from_broker() {
        let broker = Arc::new(FakeBroker { price: 42.0, supports: true });
        let validator = SignalValidator::new(broker, Arc::new(InProcessKVStore::new()), ValidatorConfig::default());
        let result = validator.validate(candidate(None, None)).await.unwrap();
        assert_eq!(result.recommended_entry, 42.0);
    }

    #[tokio::test]
    async fn rejects_unsupported_symbol() {
        let broker = Arc::new(FakeBroker { price: 100.0, supports: false });
        let validator = SignalValidator::new(broker, Arc::new(InProcessKVStore::new()), ValidatorConfig::default());
        let result = validator.validate(candidate(Some(100.0), Some(90.0))).await.unwrap();
        assert!(!result.is_valid);
        assert!(result.invalid_reason.unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn hold_recommendation_rejects_without_broker_call() {
        let broker = Arc::new(FakeBroker { price: 100.0, supports: true });
        let validator = SignalValidator::new(broker, Arc::new(InProcessKVStore::new()), ValidatorConfig::default());
        let mut c = candidate(Some(100.0), Some(90.0));
        c.recommendation = Recommendation::Hold;
        let result = validator.validate(c).await.unwrap();
        assert!(!result.is_valid);
    }
}
