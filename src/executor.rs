// =============================================================================
// Executor — broker-routing order placement pipeline
// =============================================================================
//
// Turns a ValidatedSignal that has survived the queue into a live broker
// order, or a terminal SignalLog row explaining why not. The check order is
// contractual (SPEC_FULL.md §4.4): hard rejections, agent/category/broker
// eligibility, MT4-only RiskAuthority gating plus consensus-weighted lot
// sizing, SL/TP re-normalization, broker-specific quantity, order placement,
// then bookkeeping. A "direct" entrypoint runs the identical chain for
// callers that have already done their own queueing/backpressure — it skips
// only `PriorityQueue::drain`, never a gate.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::broker::BrokerAdapter;
use crate::broker_filter::BrokerFilter;
use crate::errors::{BrokerErrorCode, EngineError};
use crate::kvstore::KVStore;
use crate::queue::PriorityQueue;
use crate::risk::{evaluate_consensus, RiskAuthority};
use crate::runtime_config::ValidatorConfig;
use crate::statestore::model::{Position, SignalLog, ValidatedSignal};
use crate::statestore::StateStore;
use crate::types::{Broker, PositionStatus, Side, SignalStatus};

pub struct Executor {
    store: Arc<dyn StateStore>,
    risk: Arc<RiskAuthority>,
    filter: Arc<BrokerFilter>,
    queue: Arc<PriorityQueue>,
    brokers: HashMap<Broker, Arc<dyn BrokerAdapter>>,
    validator: ValidatorConfig,
    kv: Arc<dyn KVStore>,
    /// Guards against a second drain tick starting before the first finishes
    /// (SPEC_FULL.md §5 — single in-flight draining worker).
    drain_lock: Mutex<()>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn StateStore>,
        risk: Arc<RiskAuthority>,
        filter: Arc<BrokerFilter>,
        queue: Arc<PriorityQueue>,
        brokers: HashMap<Broker, Arc<dyn BrokerAdapter>>,
        validator: ValidatorConfig,
        kv: Arc<dyn KVStore>,
    ) -> Self {
        Self {
            store,
            risk,
            filter,
            queue,
            brokers,
            validator,
            kv,
            drain_lock: Mutex::new(()),
        }
    }

    /// One Executor tick: drains up to `batch_size` queued signals and
    /// executes each. Returns the number drained.
    #[instrument(skip(self))]
    pub async fn drain_tick(&self, batch_size: usize) -> anyhow::Result<usize> {
        let Ok(_permit) = self.drain_lock.try_lock() else {
            warn!("executor drain tick skipped, previous tick still in flight");
            return Ok(0);
        };

        let signals = self.queue.drain(batch_size).await?;
        let n = signals.len();
        for signal in signals {
            self.execute(signal).await;
        }
        Ok(n)
    }

    /// Executes a signal without going through the queue. Runs the exact
    /// same gate chain as a drained signal — the only thing skipped is
    /// `PriorityQueue::drain` itself.
    pub async fn execute_direct(&self, signal: ValidatedSignal) {
        self.execute(signal).await;
    }

    #[instrument(skip(self, signal), fields(signal_id = %signal.candidate.signal_id, symbol = %signal.candidate.symbol))]
    async fn execute(&self, signal: ValidatedSignal) {
        let signal_id = signal.candidate.signal_id.clone();
        let agent_id = signal.candidate.agent_id.clone();
        let now = Utc::now();

        if self.store.get_signal_log(&signal_id).await.ok().flatten().is_none() {
            let _ = self
                .store
                .create_signal_log(SignalLog::pending(signal_id.clone(), agent_id, now))
                .await;
        }

        if let Err(e) = self.try_execute(&signal).await {
            self.fail(&signal_id, e).await;
        }
    }

    async fn try_execute(&self, signal: &ValidatedSignal) -> Result<(), EngineError> {
        // 1. Hard rejections.
        if !signal.is_valid {
            return Err(EngineError::PolicyRejected(
                signal
                    .invalid_reason
                    .clone()
                    .unwrap_or_else(|| "signal is not valid".to_string()),
            ));
        }
        if signal.position_size_usd <= 0.0 {
            return Err(EngineError::PolicyRejected("positionSizeUSD is not positive".to_string()));
        }
        let side = signal
            .side()
            .ok_or_else(|| EngineError::PolicyRejected("signal has no actionable side".to_string()))?;

        // 2. Agent load + active check.
        let agent = self
            .store
            .get_agent(&signal.candidate.agent_id)
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?
            .ok_or_else(|| {
                EngineError::InvariantViolation(format!("agent {} not found", signal.candidate.agent_id))
            })?;
        if !agent.is_active {
            return Err(EngineError::PolicyRejected("agent is not active".to_string()));
        }

        // 3. Broker eligibility — FILTERED, never REJECTED.
        let (can_execute, reason) = self.filter.can_execute(&agent, &signal.candidate.symbol, signal.candidate.category);
        if !can_execute {
            return Err(EngineError::Filtered(reason.unwrap_or_else(|| "not eligible".to_string())));
        }

        let broker = self.brokers.get(&agent.broker).cloned().ok_or_else(|| {
            EngineError::InvariantViolation(format!("no adapter configured for {}", agent.broker))
        })?;

        // 4. MT4-only RiskAuthority gating (position → cooldown → daily).
        let mut consensus_multiplier = 1.0;
        if agent.broker == Broker::Mt4 {
            let (allowed, reason) = self.risk.validate_pre_trade(side, &agent.user_id).await;
            if !allowed {
                return Err(EngineError::PolicyRejected(
                    reason.unwrap_or_else(|| "rejected by risk authority".to_string()),
                ));
            }

            let votes = signal.candidate.llm_votes;
            let outcome = evaluate_consensus(votes.buy, votes.sell, votes.hold, votes.confidence);
            if !outcome.should_trade {
                return Err(EngineError::PolicyRejected(outcome.reason));
            }
            consensus_multiplier = outcome.size_multiplier;
        }

        // 5. SL/TP re-normalization, defense-in-depth against a stale queued
        // payload (the same 200-point cap and RR re-derivation SignalValidator
        // already applied).
        let entry = signal.recommended_entry;
        let (stop_loss, take_profit) = self.renormalize(entry, side, signal.stop_loss_price, signal.take_profit_price);

        // 6. Broker-specific quantity.
        let quantity = match agent.broker {
            Broker::Mt4 => self.risk.calculate_lot_size(entry, stop_loss, consensus_multiplier),
            _ => broker
                .calculate_quantity(&signal.candidate.symbol, signal.position_size_usd, entry)
                .await?,
        };

        // 7. Order placement.
        let receipt = broker
            .create_market_order(&signal.candidate.symbol, side, quantity, stop_loss, take_profit)
            .await?;

        // 8. Success bookkeeping.
        let ticket = receipt.ticket.clone();
        let opened_at = Utc::now();
        let position = Position {
            ticket: ticket.clone(),
            user_id: agent.user_id.clone(),
            agent_id: agent.id.clone(),
            symbol: signal.candidate.symbol.clone(),
            side,
            lot_size: receipt.filled_quantity,
            entry_price: receipt.fill_price,
            current_price: receipt.fill_price,
            stop_loss,
            take_profit,
            status: PositionStatus::Open,
            opened_at,
            closed_at: None,
            close_reason: None,
            break_even_activated: false,
            trailing_stop_activated: false,
            highest_profit_price: receipt.fill_price,
            original_stop_loss: stop_loss,
            one_to_one_locked: false,
            profit_locked_75: false,
            profit: 0.0,
            created_at: opened_at,
            updated_at: opened_at,
        };
        if let Ok(msg) = serde_json::to_string(&position) {
            self.kv.publish("position_opened", msg);
        }
        self.store
            .create_position(position)
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        self.risk
            .record_trade_opened()
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;

        if agent.broker == Broker::Mt4 {
            self.verify_mt4_sl_tp(broker.as_ref(), &ticket, stop_loss).await;
        }

        let price = receipt.fill_price;
        let quantity = receipt.filled_quantity;
        let ticket_for_log = ticket.clone();
        self.store
            .update_signal_log(
                &signal.candidate.signal_id,
                Box::new(move |log| {
                    log.status = SignalStatus::Executed;
                    log.executed_at = Some(opened_at);
                    log.execution_price = Some(price);
                    log.execution_quantity = Some(quantity);
                    log.ticket = Some(ticket_for_log);
                }),
            )
            .await
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;

        info!(ticket, broker = broker.name(), %side, quantity, price, "signal executed");
        Ok(())
    }

    fn renormalize(&self, entry: f64, side: Side, stop_loss: f64, take_profit: f64) -> (f64, f64) {
        let distance = (entry - stop_loss).abs();
        if distance > 0.0 && distance <= self.validator.max_sl_points {
            return (stop_loss, take_profit);
        }

        let points = if distance > self.validator.max_sl_points {
            self.validator.max_sl_points
        } else {
            self.validator.default_sl_points
        };
        let normalized_sl = match side {
            Side::Buy => entry - points,
            Side::Sell => entry + points,
        };
        let normalized_tp = match side {
            Side::Buy => entry + points * self.validator.rr_ratio,
            Side::Sell => entry - points * self.validator.rr_ratio,
        };
        (normalized_sl, normalized_tp)
    }

    /// Re-asserts the requested stop-loss on the broker ~1 second after fill.
    /// `BrokerAdapter::open_positions` does not surface the broker's stored
    /// SL/TP, so this cannot literally diff the two values; re-issuing
    /// `modify_stop_loss` is idempotent on every adapter and a failure here
    /// is exactly the "broker did not accept them" case the spec calls out —
    /// logged, never rolled back.
    async fn verify_mt4_sl_tp(&self, broker: &dyn BrokerAdapter, ticket: &str, stop_loss: f64) {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Err(e) = broker.modify_stop_loss(ticket, stop_loss).await {
            warn!(ticket, error = %e, "mt4 stop-loss verification failed, broker may not have accepted it");
        }
    }

    async fn fail(&self, signal_id: &str, err: EngineError) {
        let status = match &err {
            EngineError::Filtered(_) => SignalStatus::Filtered,
            EngineError::PolicyRejected(_) => SignalStatus::Rejected,
            EngineError::BrokerRejected(_, _) | EngineError::BrokerTransient(_) | EngineError::StoreUnavailable(_) | EngineError::InvariantViolation(_) => {
                SignalStatus::Failed
            }
        };

        let reason = match &err {
            EngineError::BrokerRejected(BrokerErrorCode::AutoTradingDisabled, msg) => {
                format!("autotrading-disabled: {msg}")
            }
            other => other.reason(),
        };

        warn!(signal_id, status = ?status, reason = %reason, "signal execution did not complete");

        let reason_for_store = reason.clone();
        let _ = self
            .store
            .update_signal_log(
                signal_id,
                Box::new(move |log| {
                    log.status = status;
                    log.failed_reason = Some(reason_for_store);
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountSnapshot, InstrumentInfo, LivePosition, OrderReceipt};
    use crate::clock::FakeClock;
    use crate::kvstore::InProcessKVStore;
    use crate::risk::RiskConfig;
    use crate::statestore::model::{Agent, CandidateSignal, LlmVotes};
    use crate::statestore::InMemoryStateStore;
    use crate::types::{Category, Recommendation, RiskClass};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    struct FakeBroker {
        price: f64,
        fail_order: bool,
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
            Ok(AccountSnapshot { balance: 10_000.0, equity: 10_000.0, margin_level: None })
        }
        async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
            Ok(vec![])
        }
        async fn instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo, EngineError> {
            Ok(InstrumentInfo { min_lot: 0.001, max_lot: 10.0, lot_step: 0.001, pip_size: 0.01 })
        }
        async fn calculate_quantity(&self, _symbol: &str, usd: f64, price: f64) -> Result<f64, EngineError> {
            Ok(usd / price)
        }
        async fn create_market_order(
            &self,
            _symbol: &str,
            _side: Side,
            quantity: f64,
            _sl: f64,
            _tp: f64,
        ) -> Result<OrderReceipt, EngineError> {
            if self.fail_order {
                return Err(EngineError::BrokerRejected(BrokerErrorCode::AutoTradingDisabled, "autotrading disabled".to_string()));
            }
            Ok(OrderReceipt { ticket: "T1".to_string(), fill_price: self.price, filled_quantity: quantity })
        }
        async fn modify_stop_loss(&self, _ticket: &str, _new_stop_loss: f64) -> Result<(), EngineError> {
            Ok(())
        }
        async fn close_position(&self, _ticket: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn candidate(symbol: &str) -> ValidatedSignal {
        ValidatedSignal {
            candidate: CandidateSignal {
                signal_id: "sig-1".to_string(),
                agent_id: "agent-1".to_string(),
                symbol: symbol.to_string(),
                recommendation: Recommendation::Buy,
                category: Category::FibonacciScalping,
                entry_hint: Some(100.0),
                stop_loss_hint: Some(90.0),
                take_profit_hint: None,
                llm_votes: LlmVotes { buy: 4, sell: 0, hold: 0, confidence: 90.0 },
            },
            is_valid: true,
            invalid_reason: None,
            position_size_usd: 15.0,
            recommended_entry: 100.0,
            stop_loss_price: 90.0,
            take_profit_price: 115.0,
            risk_class: RiskClass::Safe,
        }
    }

    fn agent(broker: Broker) -> Agent {
        Agent {
            id: "agent-1".to_string(),
            user_id: "user-1".to_string(),
            broker,
            category: Category::FibonacciScalping,
            is_active: true,
            allowed_signal_categories: vec![Category::FibonacciScalping],
        }
    }

    async fn build(broker_kind: Broker, fail_order: bool) -> (Executor, Arc<InMemoryStateStore>) {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()));
        let store = Arc::new(InMemoryStateStore::new(clock.clone()));
        store.put_agent(agent(broker_kind)).await.unwrap();

        let broker: Arc<dyn BrokerAdapter> = Arc::new(FakeBroker { price: 100.0, fail_order });
        let risk = Arc::new(RiskAuthority::new(clock, store.clone(), broker.clone(), RiskConfig::default()));
        let filter = Arc::new(BrokerFilter::new(std::collections::HashMap::new()));
        let kv = Arc::new(InProcessKVStore::new());
        let queue = Arc::new(PriorityQueue::new(kv.clone()));

        let mut brokers = HashMap::new();
        brokers.insert(broker_kind, broker);

        let executor = Executor::new(store.clone(), risk, filter, queue, brokers, ValidatorConfig::default(), kv);
        (executor, store)
    }

    #[tokio::test]
    async fn executes_okx_signal_and_marks_executed() {
        let (executor, store) = build(Broker::Okx, false).await;
        executor.execute_direct(candidate("BTCUSD")).await;

        let log = store.get_signal_log("sig-1").await.unwrap().unwrap();
        assert_eq!(log.status, SignalStatus::Executed);
        assert!(log.ticket.is_some());

        let positions = store.list_all_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
    }

    #[tokio::test]
    async fn broker_rejection_surfaces_autotrading_disabled() {
        let (executor, store) = build(Broker::Okx, true).await;
        executor.execute_direct(candidate("BTCUSD")).await;

        let log = store.get_signal_log("sig-1").await.unwrap().unwrap();
        assert_eq!(log.status, SignalStatus::Failed);
        assert!(log.failed_reason.unwrap().contains("autotrading-disabled"));
    }

    #[tokio::test]
    async fn invalid_signal_is_rejected_before_touching_broker() {
        let (executor, store) = build(Broker::Okx, false).await;
        let mut signal = candidate("BTCUSD");
        signal.is_valid = false;
        signal.invalid_reason = Some("stop-loss distance is zero".to_string());
        executor.execute_direct(signal).await;

        let log = store.get_signal_log("sig-1").await.unwrap().unwrap();
        assert_eq!(log.status, SignalStatus::Rejected);
    }

    #[tokio::test]
    async fn inactive_agent_is_policy_rejected() {
        let (executor, store) = build(Broker::Okx, false).await;
        store
            .put_agent(Agent { is_active: false, ..agent(Broker::Okx) })
            .await
            .unwrap();
        executor.execute_direct(candidate("BTCUSD")).await;

        let log = store.get_signal_log("sig-1").await.unwrap().unwrap();
        assert_eq!(log.status, SignalStatus::Rejected);
    }

    #[tokio::test]
    async fn unconfigured_symbol_is_filtered_not_rejected() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let store = Arc::new(InMemoryStateStore::new(clock.clone()));
        store.put_agent(agent(Broker::Okx)).await.unwrap();

        let broker: Arc<dyn BrokerAdapter> = Arc::new(FakeBroker { price: 100.0, fail_order: false });
        let risk = Arc::new(RiskAuthority::new(clock, store.clone(), broker.clone(), RiskConfig::default()));
        let mut allowed = std::collections::HashMap::new();
        allowed.insert(Broker::Okx, vec!["ETHUSD".to_string()]);
        let filter = Arc::new(BrokerFilter::new(allowed));
        let kv = Arc::new(InProcessKVStore::new());
        let queue = Arc::new(PriorityQueue::new(kv.clone()));
        let mut brokers = HashMap::new();
        brokers.insert(Broker::Okx, broker);
        let executor = Executor::new(store.clone(), risk, filter, queue, brokers, ValidatorConfig::default(), kv);

        executor.execute_direct(candidate("BTCUSD")).await;
        let log = store.get_signal_log("sig-1").await.unwrap().unwrap();
        assert_eq!(log.status, SignalStatus::Filtered);
    }
}
