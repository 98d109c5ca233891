// =============================================================================
// PositionManager — reconciliation-first exit pipeline for open positions
// =============================================================================
//
// Owns every mutation of a Position's exit-management fields (SPEC_FULL.md
// §3). Each scan tick, for every open position: reconcile against the
// broker's live truth first (a position the broker no longer reports is
// closed here too, no further pipeline steps run), then check for a signal
// reversal, then run the five-step exit ladder in order. The first step
// that closes the position short-circuits the rest; steps that only move
// the stop-loss (1:1 lock, percentage trailing) fall through to the next.
//
// A second, independent path reacts to severe `market_drops` alerts by
// liquidating every open BUY position across every user, regardless of its
// own exit-ladder state.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::broker::BrokerAdapter;
use crate::clock::ClockSource;
use crate::kvstore::KVStore;
use crate::risk::RiskRecorder;
use crate::runtime_config::ExitConfig;
use crate::signal_validator::LatestSignalPattern;
use crate::statestore::model::{DropAlert, EmergencyEvent, Position, Trade};
use crate::statestore::StateStore;
use crate::types::{Broker, DropLevel, Recommendation, Side};

/// Fixed breakeven buffer used by the percentage-based trailing path
/// (SPEC_FULL.md §4.5 step 3, "entry ± 5 points"). Not exposed as a
/// `RuntimeConfig` override — it is part of the algorithm, not a risk
/// tunable like the pip-based fallback's `breakeven_points`.
const BREAKEVEN_BUFFER_POINTS: f64 = 5.0;

/// Why a position closed, for the `close_reason` field and the `Trade` row.
enum CloseReason {
    TimeExitSlow,
    TimeExitMax,
    EarlyAdverse,
    StopLoss,
    TakeProfit,
    /// A buy closed by an opposing SELL pattern → `sell-signal`; a sell
    /// closed by an opposing BUY pattern → `buy-signal` (SPEC_FULL.md §4.5).
    SignalReversal(Recommendation),
    MarketDrop,
    BrokerReconciled,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::TimeExitSlow => "time-exit-slow",
            Self::TimeExitMax => "time-exit-max",
            Self::EarlyAdverse => "stop-loss",
            Self::StopLoss => "stop-loss",
            Self::TakeProfit => "take-profit",
            Self::SignalReversal(Recommendation::Sell) => "sell-signal",
            Self::SignalReversal(Recommendation::Buy) => "buy-signal",
            Self::SignalReversal(Recommendation::Hold) => "signal-reversal",
            Self::MarketDrop => "market-drop",
            Self::BrokerReconciled => "mt4-already-closed",
        }
    }

    /// `AutoClosed` for the two reasons the position diagram marks as
    /// system-driven rather than ladder-driven; everything else is a
    /// regular `Closed`.
    fn auto_closed(&self) -> bool {
        matches!(self, Self::SignalReversal(_) | Self::MarketDrop)
    }
}

pub struct PositionManager {
    clock: Arc<dyn ClockSource>,
    store: Arc<dyn StateStore>,
    risk: Arc<dyn RiskRecorder>,
    kv: Arc<dyn KVStore>,
    brokers: HashMap<Broker, Arc<dyn BrokerAdapter>>,
    config: ExitConfig,
    /// Guards against overlapping scans (mirrors `Executor::drain_lock`).
    scan_lock: Mutex<()>,
}

impl PositionManager {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        store: Arc<dyn StateStore>,
        risk: Arc<dyn RiskRecorder>,
        kv: Arc<dyn KVStore>,
        brokers: HashMap<Broker, Arc<dyn BrokerAdapter>>,
        config: ExitConfig,
    ) -> Self {
        Self { clock, store, risk, kv, brokers, config, scan_lock: Mutex::new(()) }
    }

    /// One scan tick over every open position. Returns the number of
    /// positions closed.
    #[instrument(skip(self))]
    pub async fn scan_tick(&self) -> anyhow::Result<usize> {
        let Ok(_permit) = self.scan_lock.try_lock() else {
            warn!("position manager scan skipped, previous scan still in flight");
            return Ok(0);
        };

        let positions = self.store.list_all_open_positions().await?;
        let mut closed = 0;
        for position in positions {
            if self.process_one(position).await? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Reacts to a `DropAlert` published on the `market_drops` channel.
    /// Severe alerts liquidate every open BUY position across every user;
    /// moderate and none are ignored here (the detector itself already
    /// gates on cooldown before publishing at all).
    #[instrument(skip(self, alert), fields(symbol = %alert.symbol))]
    pub async fn handle_drop_alert(&self, alert: DropAlert) -> anyhow::Result<()> {
        if alert.drop_level != DropLevel::Severe {
            return Ok(());
        }

        let positions = self.store.list_all_open_positions().await?;
        let mut closed_tickets = Vec::new();
        for position in positions {
            if position.side != Side::Buy {
                continue;
            }
            let ticket = position.ticket.clone();
            let price = position.current_price;
            if self.close(position, price, CloseReason::MarketDrop).await?.is_some() {
                closed_tickets.push(ticket);
            }
        }

        if !closed_tickets.is_empty() {
            let event = EmergencyEvent {
                reason: format!("severe market drop on {}", alert.symbol),
                symbol: alert.symbol.clone(),
                closed_tickets,
                timestamp: self.clock.now(),
            };
            if let Ok(msg) = serde_json::to_string(&event) {
                self.kv.publish("mt4_emergency", msg);
            }
        }

        Ok(())
    }

    /// Runs the reconciliation + signal-reversal + exit-ladder pipeline for
    /// a single position. Returns `true` if the position was closed.
    async fn process_one(&self, position: Position) -> anyhow::Result<bool> {
        let ticket = position.ticket.clone();

        let Some(broker) = self.brokers.get(&self.position_broker(&position).await) else {
            warn!(ticket, "no broker adapter configured for position's agent, skipping");
            return Ok(false);
        };

        let live = broker.open_positions().await.ok();
        let still_open_at_broker = live
            .as_ref()
            .map(|positions| positions.iter().any(|p| p.ticket == ticket))
            .unwrap_or(true);

        if !still_open_at_broker {
            let price = position.current_price;
            return Ok(self.close(position, price, CloseReason::BrokerReconciled).await?.is_some());
        }

        let current_price = match broker.current_price(&position.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(ticket, error = %e, "position manager could not refresh price, skipping this tick");
                return Ok(false);
            }
        };

        self.store
            .update_position(
                &ticket,
                Box::new(move |p| {
                    p.current_price = current_price;
                    p.highest_profit_price = higher_profit(p.side, p.highest_profit_price, current_price);
                }),
            )
            .await?;
        let Some(mut position) = self.store.get_position(&ticket).await? else {
            return Ok(false);
        };
        position.current_price = current_price;

        if let Some(pattern) = self.reversed(&position).await {
            return Ok(self.close(position, current_price, CloseReason::SignalReversal(pattern)).await?.is_some());
        }

        if let Some(reason) = self.exit_ladder(&position, broker.as_ref()).await? {
            return Ok(self.close(position, current_price, reason).await?.is_some());
        }

        Ok(false)
    }

    async fn position_broker(&self, position: &Position) -> Broker {
        match self.store.get_agent(&position.agent_id).await {
            Ok(Some(agent)) => agent.broker,
            _ => Broker::Mt4,
        }
    }

    /// Returns the opposing pattern's recommendation if the cached latest
    /// detector pattern for this symbol opposes the position's side with at
    /// least `signal_reversal_min_confidence`.
    async fn reversed(&self, position: &Position) -> Option<Recommendation> {
        let key = format!("signal:{}:latest", position.symbol);
        let raw = self.kv.get(&key).await.ok().flatten()?;
        let pattern = serde_json::from_str::<LatestSignalPattern>(&raw).ok()?;
        if pattern.confidence < self.config.signal_reversal_min_confidence {
            return None;
        }
        match (position.side, pattern.recommendation) {
            (Side::Buy, Recommendation::Sell) => Some(Recommendation::Sell),
            (Side::Sell, Recommendation::Buy) => Some(Recommendation::Buy),
            _ => None,
        }
    }

    /// Runs the five-step exit ladder. Steps 2 and 3 mutate the stop-loss
    /// in the store and on the broker but return `None` so the caller keeps
    /// scanning; steps 1, 4, and 5 return `Some(reason)` to close.
    async fn exit_ladder(
        &self,
        position: &Position,
        broker: &dyn BrokerAdapter,
    ) -> anyhow::Result<Option<CloseReason>> {
        if let Some(reason) = self.time_based_exit(position) {
            return Ok(Some(reason));
        }

        self.one_to_one_lock(position, broker).await?;
        let position = self.store.get_position(&position.ticket).await?.unwrap_or_else(|| position.clone());

        self.trailing_stop(&position, broker).await?;
        let position = self.store.get_position(&position.ticket).await?.unwrap_or(position);

        if let Some(points) = self.adverse_move_points(&position) {
            if points >= self.config.early_exit_loss_points {
                return Ok(Some(CloseReason::EarlyAdverse));
            }
        }

        Ok(self.backstop(&position))
    }

    fn time_based_exit(&self, position: &Position) -> Option<CloseReason> {
        let minutes_open = (self.clock.now() - position.opened_at).num_minutes();
        let progress = progress_to_tp(position);

        if minutes_open > self.config.time_exit_max_minutes {
            return Some(CloseReason::TimeExitMax);
        }
        if minutes_open > self.config.time_exit_slow_minutes && progress < self.config.time_exit_slow_progress {
            return Some(CloseReason::TimeExitSlow);
        }
        None
    }

    /// Step 2: once current profit (in price units) reaches the fixed-risk
    /// distance from entry to the original stop-loss, lock in half of that
    /// profit by moving the stop-loss toward the trade.
    async fn one_to_one_lock(&self, position: &Position, broker: &dyn BrokerAdapter) -> anyhow::Result<()> {
        if position.one_to_one_locked {
            return Ok(());
        }
        let risk = (position.entry_price - position.original_stop_loss).abs();
        if risk <= 0.0 {
            return Ok(());
        }
        let profit = current_profit_points(position);
        if profit < risk {
            return Ok(());
        }

        let lock = profit * self.config.one_to_one_lock_profit_pct;
        let candidate = match position.side {
            Side::Buy => position.entry_price + lock,
            Side::Sell => position.entry_price - lock,
        };
        self.move_stop_loss(position, broker, candidate, |p| p.one_to_one_locked = true).await
    }

    /// Step 3: percentage-based trailing against the take-profit distance
    /// when a TP is set, falling back to the legacy pip-based trail when it
    /// is not (no signal in this engine ever leaves TP unset, but the
    /// fallback is kept for completeness per SPEC_FULL.md §9's open
    /// question on trailing-stop style).
    async fn trailing_stop(&self, position: &Position, broker: &dyn BrokerAdapter) -> anyhow::Result<()> {
        let tp_distance = (position.take_profit - position.entry_price).abs();
        if tp_distance <= f64::EPSILON {
            return self.pip_based_trail(position, broker).await;
        }

        let progress = progress_to_tp(position);

        if !position.break_even_activated && progress >= self.config.trail_breakeven_pct {
            let candidate = match position.side {
                Side::Buy => position.entry_price + BREAKEVEN_BUFFER_POINTS,
                Side::Sell => position.entry_price - BREAKEVEN_BUFFER_POINTS,
            };
            self.move_stop_loss(position, broker, candidate, |p| p.break_even_activated = true).await?;
        }

        let position = self.store.get_position(&position.ticket).await?.unwrap_or_else(|| position.clone());
        if position.break_even_activated && !position.profit_locked_75 && progress >= self.config.trail_lock_pct {
            let lock = tp_distance * self.config.trail_lock_amount;
            let candidate = match position.side {
                Side::Buy => position.entry_price + lock,
                Side::Sell => position.entry_price - lock,
            };
            self.move_stop_loss(position, broker, candidate, |p| p.profit_locked_75 = true).await?;
        }

        Ok(())
    }

    /// Legacy pip-based trail: activate breakeven once profit reaches
    /// `trail_start_points`, then trail `trail_distance_points` behind the
    /// highest profit price seen so far.
    async fn pip_based_trail(&self, position: &Position, broker: &dyn BrokerAdapter) -> anyhow::Result<()> {
        let profit = current_profit_points(position);

        if !position.break_even_activated && profit >= self.config.trail_start_points {
            let candidate = match position.side {
                Side::Buy => position.entry_price + self.config.breakeven_points,
                Side::Sell => position.entry_price - self.config.breakeven_points,
            };
            self.move_stop_loss(position, broker, candidate, |p| {
                p.break_even_activated = true;
                p.trailing_stop_activated = true;
            })
            .await?;
        }

        let position = self.store.get_position(&position.ticket).await?.unwrap_or_else(|| position.clone());
        if position.trailing_stop_activated {
            let candidate = match position.side {
                Side::Buy => position.highest_profit_price - self.config.trail_distance_points,
                Side::Sell => position.highest_profit_price + self.config.trail_distance_points,
            };
            self.move_stop_loss(position, broker, candidate, |_| {}).await?;
        }

        Ok(())
    }

    /// Moves the stop-loss only if `candidate` is monotonically closer to
    /// profit than the current one, applying `mark` to the stored document
    /// in the same atomic update.
    async fn move_stop_loss(
        &self,
        position: &Position,
        broker: &dyn BrokerAdapter,
        candidate: f64,
        mark: impl FnOnce(&mut Position) + Send + 'static,
    ) -> anyhow::Result<()> {
        let improves = match position.side {
            Side::Buy => candidate > position.stop_loss,
            Side::Sell => candidate < position.stop_loss,
        };
        if !improves {
            return Ok(());
        }

        if let Err(e) = broker.modify_stop_loss(&position.ticket, candidate).await {
            warn!(ticket = %position.ticket, error = %e, "failed to move stop-loss at broker, leaving store unchanged");
            return Ok(());
        }

        let ticket = position.ticket.clone();
        self.store
            .update_position(
                &ticket,
                Box::new(move |p| {
                    p.stop_loss = candidate;
                    mark(p);
                }),
            )
            .await?;

        let channel = "trailing_stop_updated";
        let msg = serde_json::json!({ "ticket": ticket, "stop_loss": candidate }).to_string();
        self.kv.publish(channel, msg);
        Ok(())
    }

    /// Step 4: adverse points moved against the position since entry,
    /// regardless of where the current stop-loss sits.
    fn adverse_move_points(&self, position: &Position) -> Option<f64> {
        let points = match position.side {
            Side::Buy => position.entry_price - position.current_price,
            Side::Sell => position.current_price - position.entry_price,
        };
        (points > 0.0).then_some(points)
    }

    /// Step 5: app-level SL/TP backstop, in case the broker never actually
    /// enforced the resting order.
    fn backstop(&self, position: &Position) -> Option<CloseReason> {
        match position.side {
            Side::Buy => {
                if position.current_price <= position.stop_loss {
                    return Some(CloseReason::StopLoss);
                }
                if position.current_price >= position.take_profit {
                    return Some(CloseReason::TakeProfit);
                }
            }
            Side::Sell => {
                if position.current_price >= position.stop_loss {
                    return Some(CloseReason::StopLoss);
                }
                if position.current_price <= position.take_profit {
                    return Some(CloseReason::TakeProfit);
                }
            }
        }
        None
    }

    /// Closes a position: marks it in the store, syncs a `Trade` row,
    /// records the result with `RiskAuthority`, issues the broker-side
    /// close (best-effort, idempotent), and publishes `position_closed`.
    async fn close(
        &self,
        position: Position,
        close_price: f64,
        reason: CloseReason,
    ) -> anyhow::Result<Option<Position>> {
        let ticket = position.ticket.clone();
        let profit = match position.side {
            Side::Buy => close_price - position.entry_price,
            Side::Sell => position.entry_price - close_price,
        } * position.lot_size;

        let now = self.clock.now();
        let status = if reason.auto_closed() {
            crate::types::PositionStatus::AutoClosed
        } else {
            crate::types::PositionStatus::Closed
        };
        let reason_str = reason.as_str().to_string();
        let mark_reason = reason_str.clone();

        let updated = self
            .store
            .update_position(
                &ticket,
                Box::new(move |p| {
                    p.status = status;
                    p.current_price = close_price;
                    p.closed_at = Some(now);
                    p.close_reason = Some(mark_reason);
                    p.profit = profit;
                }),
            )
            .await?;

        let Some(updated) = updated else {
            return Ok(None);
        };

        if let Some(broker) = self.brokers.get(&self.position_broker(&updated).await) {
            if let Err(e) = broker.close_position(&ticket).await {
                warn!(ticket, error = %e, "broker close call failed, position is already marked closed locally");
            }
        }

        self.store.upsert_trade(Trade::from_position(&updated)).await?;
        self.risk.record_trade_result(profit).await?;

        if let Ok(msg) = serde_json::to_string(&updated) {
            self.kv.publish("position_closed", msg);
        }

        info!(ticket, reason = %reason_str, profit, "position closed");
        Ok(Some(updated))
    }
}

fn higher_profit(side: Side, highest: f64, current: f64) -> f64 {
    match side {
        Side::Buy => highest.max(current),
        Side::Sell => highest.min(current),
    }
}

fn current_profit_points(position: &Position) -> f64 {
    match position.side {
        Side::Buy => position.current_price - position.entry_price,
        Side::Sell => position.entry_price - position.current_price,
    }
}

/// Profit progress toward take-profit, clamped to `[0, 1]`. Returns 0 when
/// no TP distance exists (`trailing_stop` routes that case to the
/// pip-based fallback before this is ever consulted for the ladder steps
/// that matter).
fn progress_to_tp(position: &Position) -> f64 {
    let tp_distance = (position.take_profit - position.entry_price).abs();
    if tp_distance <= f64::EPSILON {
        return 0.0;
    }
    (current_profit_points(position) / tp_distance).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountSnapshot, InstrumentInfo, LivePosition, OrderReceipt};
    use crate::clock::FakeClock;
    use crate::errors::EngineError;
    use crate::kvstore::InProcessKVStore;
    use crate::statestore::model::Agent;
    use crate::statestore::InMemoryStateStore;
    use crate::types::{Category, PositionStatus};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::RwLock as PLRwLock;

    struct FakeBroker {
        price: PLRwLock<f64>,
        open: PLRwLock<bool>,
        sl_moves: PLRwLock<Vec<f64>>,
    }

    impl FakeBroker {
        fn new(price: f64) -> Self {
            Self { price: PLRwLock::new(price), open: PLRwLock::new(true), sl_moves: PLRwLock::new(vec![]) }
        }
        fn set_price(&self, p: f64) {
            *self.price.write() = p;
        }
    }

    #[async_trait]
    impl BrokerAdapter for FakeBroker {
        fn name(&self) -> &'static str {
            "FAKE"
        }
        async fn current_price(&self, _symbol: &str) -> Result<f64, EngineError> {
            Ok(*self.price.read())
        }
        async fn account(&self) -> Result<AccountSnapshot, EngineError> {
            Ok(AccountSnapshot { balance: 1000.0, equity: 1000.0, margin_level: None })
        }
        async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
            if *self.open.read() {
                Ok(vec![LivePosition {
                    ticket: "T1".to_string(),
                    symbol: "XAUUSD".to_string(),
                    side: Side::Buy,
                    quantity: 0.01,
                    entry_price: 100_000.0,
                    current_price: *self.price.read(),
                }])
            } else {
                Ok(vec![])
            }
        }
        async fn instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo, EngineError> {
            unimplemented!()
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
        async fn modify_stop_loss(&self, _t: &str, sl: f64) -> Result<(), EngineError> {
            self.sl_moves.write().push(sl);
            Ok(())
        }
        async fn close_position(&self, _t: &str) -> Result<(), EngineError> {
            *self.open.write() = false;
            Ok(())
        }
    }

    fn position() -> Position {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap();
        Position {
            ticket: "T1".to_string(),
            user_id: "u1".to_string(),
            agent_id: "agent-1".to_string(),
            symbol: "XAUUSD".to_string(),
            side: Side::Buy,
            lot_size: 1.0,
            entry_price: 100_000.0,
            current_price: 100_000.0,
            stop_loss: 99_850.0,
            take_profit: 100_225.0,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            close_reason: None,
            break_even_activated: false,
            trailing_stop_activated: false,
            highest_profit_price: 100_000.0,
            original_stop_loss: 99_850.0,
            one_to_one_locked: false,
            profit_locked_75: false,
            profit: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    async fn harness(
        price: f64,
    ) -> (PositionManager, Arc<InMemoryStateStore>, Arc<FakeBroker>, Arc<FakeClock>, Arc<InProcessKVStore>) {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap()));
        let store = Arc::new(InMemoryStateStore::new(clock.clone() as Arc<dyn ClockSource>));
        store
            .put_agent(Agent {
                id: "agent-1".to_string(),
                user_id: "u1".to_string(),
                broker: Broker::Mt4,
                category: Category::FibonacciScalping,
                is_active: true,
                allowed_signal_categories: vec![],
            })
            .await
            .unwrap();
        store.create_position(position()).await.unwrap();

        let broker = Arc::new(FakeBroker::new(price));
        let kv = Arc::new(InProcessKVStore::new());
        let risk_store = Arc::new(InMemoryStateStore::new(clock.clone() as Arc<dyn ClockSource>));
        let risk = Arc::new(crate::risk::RiskAuthority::new(
            clock.clone() as Arc<dyn ClockSource>,
            risk_store,
            broker.clone() as Arc<dyn BrokerAdapter>,
            crate::risk::RiskConfig::default(),
        ));

        let mut brokers: HashMap<Broker, Arc<dyn BrokerAdapter>> = HashMap::new();
        brokers.insert(Broker::Mt4, broker.clone());

        let manager = PositionManager::new(
            clock.clone() as Arc<dyn ClockSource>,
            store.clone(),
            risk as Arc<dyn RiskRecorder>,
            kv.clone(),
            brokers,
            ExitConfig::default(),
        );
        (manager, store, broker, clock, kv)
    }

    #[tokio::test]
    async fn exit_ladder_follows_the_worked_scenario() {
        let (manager, store, broker, _clock, _kv) = harness(100_000.0).await;

        // 50% progress toward TP: breakeven buffer move to entry+5.
        broker.set_price(100_113.0);
        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert!(p.break_even_activated);
        assert_eq!(p.stop_loss, 100_005.0);
        assert!(p.is_open());

        // 75% progress: lock in half of the TP distance.
        broker.set_price(100_169.0);
        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert!(p.profit_locked_75);
        assert_eq!(p.stop_loss, 100_000.0 + 0.5 * 225.0);

        // Price reverses back through the trailed stop: app-level backstop closes it.
        broker.set_price(100_100.0);
        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.close_reason.as_deref(), Some("stop-loss"));
    }

    #[tokio::test]
    async fn reconciliation_closes_position_broker_no_longer_reports() {
        let (manager, store, broker, _clock, _kv) = harness(100_000.0).await;
        broker.close_position("T1").await.unwrap();

        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.close_reason.as_deref(), Some("mt4-already-closed"));
    }

    #[tokio::test]
    async fn time_exit_max_closes_regardless_of_progress() {
        let (manager, store, broker, clock, _kv) = harness(100_000.0).await;
        broker.set_price(100_005.0);
        clock.advance(chrono::Duration::minutes(31));

        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.close_reason.as_deref(), Some("time-exit-max"));
    }

    #[tokio::test]
    async fn time_exit_slow_closes_on_low_progress_after_threshold() {
        let (manager, store, broker, clock, _kv) = harness(100_000.0).await;
        broker.set_price(100_010.0);
        clock.advance(chrono::Duration::minutes(16));

        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.close_reason.as_deref(), Some("time-exit-slow"));
    }

    #[tokio::test]
    async fn early_adverse_exit_closes_on_large_loss() {
        let (manager, store, broker, _clock, _kv) = harness(100_000.0).await;
        broker.set_price(99_900.0);

        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.close_reason.as_deref(), Some("stop-loss"));
    }

    #[tokio::test]
    async fn signal_reversal_auto_closes_position() {
        let (manager, store, broker, clock, kv) = harness(100_000.0).await;
        broker.set_price(100_050.0);

        let pattern = LatestSignalPattern {
            recommendation: Recommendation::Sell,
            confidence: 75.0,
            at: clock.now(),
        };
        kv.set("signal:XAUUSD:latest", serde_json::to_string(&pattern).unwrap(), None)
            .await
            .unwrap();

        manager.scan_tick().await.unwrap();
        let p = store.get_position("T1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::AutoClosed);
        assert_eq!(p.close_reason.as_deref(), Some("sell-signal"));
    }

    #[tokio::test]
    async fn severe_market_drop_liquidates_all_buy_positions() {
        let (manager, store, _broker, clock, _kv) = harness(100_100.0).await;

        let alert = DropAlert {
            symbol: "XAUUSD".to_string(),
            drop_level: DropLevel::Severe,
            price_change_1m: -6.0,
            price_change_3m: -7.0,
            price_change_5m: -8.0,
            velocity: -1.0,
            timestamp: clock.now(),
        };
        manager.handle_drop_alert(alert).await.unwrap();

        let p = store.get_position("T1").await.unwrap().unwrap();
        assert_eq!(p.status, PositionStatus::AutoClosed);
        assert_eq!(p.close_reason.as_deref(), Some("market-drop"));
    }
}
