// =============================================================================
// RiskAuthority — the single process-wide pre-trade gate and post-trade ledger
// =============================================================================
//
// Three named locks — position, cooldown, daily-stats — each acquired by
// exactly one operation and released on every exit path; no operation ever
// holds two at once. `canOpenPosition` is the sole exception permitted to
// perform broker I/O while holding a lock (SPEC_FULL.md §4.1), because the
// durable Position store can lag the broker by several minutes and only a
// live query is safe against double-entry during that window.
// =============================================================================

pub mod consensus;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::broker::BrokerAdapter;
use crate::clock::ClockSource;
use crate::statestore::StateStore;
use crate::types::Side;

pub use consensus::{evaluate_consensus, ConsensusOutcome};

/// Fixed defaults per SPEC_FULL.md §4.1; every field is also surfaced as a
/// `RuntimeConfig` override.
#[derive(Debug, Clone, Copy)]
pub struct RiskConfig {
    pub max_buy: u32,
    pub max_sell: u32,
    pub max_total: u32,

    pub min_between_minutes: i64,
    pub after_loss_minutes: i64,
    pub after_consecutive_losses_minutes: i64,

    pub max_daily_loss_usd: f64,
    pub max_daily_trades: u32,
    pub max_consecutive_losses: u32,

    pub max_risk_per_trade_usd: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    pub point_value_per_lot: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_buy: 1,
            max_sell: 1,
            max_total: 2,
            min_between_minutes: 15,
            after_loss_minutes: 30,
            after_consecutive_losses_minutes: 60,
            max_daily_loss_usd: 100.0,
            max_daily_trades: 40,
            max_consecutive_losses: 3,
            max_risk_per_trade_usd: 15.0,
            min_lot: 0.01,
            max_lot: 0.20,
            point_value_per_lot: 1.0,
        }
    }
}

/// `(allowed, reason)` — the uniform shape of every pre-trade gate.
pub type GateResult = (bool, Option<String>);

/// Narrow interface `PositionManager` depends on instead of the full
/// `RiskAuthority`, breaking the cyclic dependency the two would otherwise
/// have on each other (REDESIGN FLAG, SPEC_FULL.md §9).
#[async_trait::async_trait]
pub trait RiskRecorder: Send + Sync {
    async fn record_trade_opened(&self) -> anyhow::Result<()>;
    async fn record_trade_result(&self, pnl: f64) -> anyhow::Result<()>;
}

pub struct RiskAuthority {
    clock: Arc<dyn ClockSource>,
    store: Arc<dyn StateStore>,
    broker: Arc<dyn BrokerAdapter>,
    config: RiskConfig,

    position_lock: Mutex<()>,
    cooldown_lock: Mutex<()>,
    daily_stats_lock: Mutex<()>,
}

impl RiskAuthority {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        store: Arc<dyn StateStore>,
        broker: Arc<dyn BrokerAdapter>,
        config: RiskConfig,
    ) -> Self {
        Self {
            clock,
            store,
            broker,
            config,
            position_lock: Mutex::new(()),
            cooldown_lock: Mutex::new(()),
            daily_stats_lock: Mutex::new(()),
        }
    }

    /// Authoritative count source is the **live broker** open-position list,
    /// not the durable store — the store can lag by roughly a sync interval
    /// (~5 minutes) and the risk check must not allow double-entry during
    /// that window.
    pub async fn can_open_position(&self, direction: Side, user_id: &str) -> GateResult {
        let _guard = self.position_lock.lock().await;

        let live = match self.broker.open_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                warn!(error = %e, "can_open_position: broker query failed, failing closed");
                return (false, Some("risk store unavailable".to_string()));
            }
        };

        let _ = user_id; // live positions are already scoped to this account's broker session
        let buy_count = live.iter().filter(|p| p.side == Side::Buy).count() as u32;
        let sell_count = live.iter().filter(|p| p.side == Side::Sell).count() as u32;
        let total = live.len() as u32;

        if total >= self.config.max_total {
            return (false, Some("Max total positions reached".to_string()));
        }
        match direction {
            Side::Buy if buy_count >= self.config.max_buy => {
                (false, Some("Max BUY positions reached".to_string()))
            }
            Side::Sell if sell_count >= self.config.max_sell => {
                (false, Some("Max SELL positions reached".to_string()))
            }
            _ => (true, None),
        }
    }

    pub async fn check_and_start_cooldown(&self) -> GateResult {
        let _guard = self.cooldown_lock.lock().await;
        let now = self.clock.now();
        let today = self.clock.today();

        let mut stats = match self.store.get_or_create_daily_stats(&today).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "check_and_start_cooldown: store failure, failing closed");
                return (false, Some("risk store unavailable".to_string()));
            }
        };

        if stats.is_paused {
            if let Some(pause_until) = stats.pause_until {
                if now < pause_until {
                    let remaining = (pause_until - now).num_minutes().max(0);
                    return (
                        false,
                        Some(format!("Trading paused for {remaining} more minute(s)")),
                    );
                }
            }
            // Pause window elapsed: clear it before evaluating the ordinary
            // between-trade cooldown.
            let cleared = self
                .store
                .update_daily_stats(
                    &today,
                    Box::new(|s| {
                        s.is_paused = false;
                        s.consecutive_losses = 0;
                        s.pause_reason = None;
                        s.pause_until = None;
                    }),
                )
                .await;
            stats = match cleared {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "check_and_start_cooldown: failed to clear pause, failing closed");
                    return (false, Some("risk store unavailable".to_string()));
                }
            };
        }

        let cooldown_minutes = match stats.last_trade_result {
            Some(crate::types::TradeResult::Loss) => self.config.after_loss_minutes,
            _ => self.config.min_between_minutes,
        };

        if let Some(last_trade_time) = stats.last_trade_time {
            let elapsed = now - last_trade_time;
            if elapsed < chrono::Duration::minutes(cooldown_minutes) {
                let remaining = (chrono::Duration::minutes(cooldown_minutes) - elapsed).num_minutes().max(1);
                return (
                    false,
                    Some(format!("Cooldown active, {remaining} minute(s) remaining")),
                );
            }
        }

        // Writing lastTradeTime=now before releasing the lock is what
        // prevents two concurrent signals from both passing cooldown.
        if let Err(e) = self
            .store
            .update_daily_stats(&today, Box::new(move |s| s.last_trade_time = Some(now)))
            .await
        {
            warn!(error = %e, "check_and_start_cooldown: failed to record last_trade_time");
            return (false, Some("risk store unavailable".to_string()));
        }

        (true, None)
    }

    pub async fn check_daily_limits(&self) -> GateResult {
        let _guard = self.daily_stats_lock.lock().await;
        let today = self.clock.today();

        let stats = match self.store.get_or_create_daily_stats(&today).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "check_daily_limits: store failure, failing closed");
                return (false, Some("risk store unavailable".to_string()));
            }
        };

        if stats.total_pnl <= -self.config.max_daily_loss_usd {
            return (false, Some("Max daily loss reached".to_string()));
        }
        if stats.total_trades >= self.config.max_daily_trades {
            return (false, Some("Max daily trades reached".to_string()));
        }
        (true, None)
    }

    /// Chains the three gates in contractual order: position → cooldown →
    /// daily. The first failure short-circuits.
    pub async fn validate_pre_trade(&self, direction: Side, user_id: &str) -> GateResult {
        let position = self.can_open_position(direction, user_id).await;
        if !position.0 {
            return position;
        }
        let cooldown = self.check_and_start_cooldown().await;
        if !cooldown.0 {
            return cooldown;
        }
        self.check_daily_limits().await
    }

    pub async fn record_trade_opened(&self) -> anyhow::Result<()> {
        let _guard = self.daily_stats_lock.lock().await;
        let now = self.clock.now();
        let today = self.clock.today();
        self.store
            .update_daily_stats(
                &today,
                Box::new(move |s| {
                    s.total_trades += 1;
                    s.last_trade_time = Some(now);
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn record_trade_result(&self, pnl: f64) -> anyhow::Result<()> {
        let _guard = self.daily_stats_lock.lock().await;
        let now = self.clock.now();
        let today = self.clock.today();
        let max_consecutive = self.config.max_consecutive_losses;
        let pause_minutes = self.config.after_consecutive_losses_minutes;

        let updated = self
            .store
            .update_daily_stats(
                &today,
                Box::new(move |s| {
                    s.total_pnl += pnl;
                    if pnl >= 0.0 {
                        s.win_count += 1;
                        s.consecutive_losses = 0;
                        s.last_trade_result = Some(crate::types::TradeResult::Win);
                    } else {
                        s.loss_count += 1;
                        s.consecutive_losses += 1;
                        s.max_consecutive_losses = s.max_consecutive_losses.max(s.consecutive_losses);
                        s.last_trade_result = Some(crate::types::TradeResult::Loss);

                        if s.consecutive_losses >= max_consecutive && !s.is_paused {
                            s.is_paused = true;
                            s.pause_reason = Some(format!("{max_consecutive} consecutive losses"));
                            s.pause_until = Some(now + chrono::Duration::minutes(pause_minutes));
                        }
                    }
                }),
            )
            .await?;

        if updated.is_paused {
            info!(reason = ?updated.pause_reason, pause_until = ?updated.pause_until, "daily trading paused");
        }
        Ok(())
    }

    /// `risk = MAX_RISK_PER_TRADE_USD * consensusMultiplier`;
    /// `lots = risk / (|entry-stopLoss| * POINT_VALUE_PER_LOT) * consensusMultiplier`;
    /// clamp to `[MIN_LOT, MAX_LOT]`; round to 2 decimal places.
    pub fn calculate_lot_size(&self, entry: f64, stop_loss: f64, consensus_multiplier: f64) -> f64 {
        let sl_distance = (entry - stop_loss).abs();
        if sl_distance <= 0.0 {
            warn!(entry, stop_loss, "calculate_lot_size: non-positive SL distance, returning MIN_LOT");
            return self.config.min_lot;
        }

        let risk = self.config.max_risk_per_trade_usd * consensus_multiplier;
        let raw_lots = risk / (sl_distance * self.config.point_value_per_lot) * consensus_multiplier;
        let clamped = raw_lots.clamp(self.config.min_lot, self.config.max_lot);
        (clamped * 100.0).round() / 100.0
    }
}

#[async_trait::async_trait]
impl RiskRecorder for RiskAuthority {
    async fn record_trade_opened(&self) -> anyhow::Result<()> {
        RiskAuthority::record_trade_opened(self).await
    }

    async fn record_trade_result(&self, pnl: f64) -> anyhow::Result<()> {
        RiskAuthority::record_trade_result(self, pnl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountSnapshot, InstrumentInfo, LivePosition, OrderReceipt};
    use crate::clock::FakeClock;
    use crate::errors::EngineError;
    use crate::statestore::InMemoryStateStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use parking_lot::RwLock;

    struct FakeBroker {
        positions: RwLock<Vec<LivePosition>>,
    }

    #[async_trait]
    impl BrokerAdapter for FakeBroker {
        fn name(&self) -> &'static str {
            "FAKE"
        }
        async fn current_price(&self, _symbol: &str) -> Result<f64, EngineError> {
            Ok(100.0)
        }
        async fn account(&self) -> Result<AccountSnapshot, EngineError> {
            Ok(AccountSnapshot { balance: 1000.0, equity: 1000.0, margin_level: None })
        }
        async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
            Ok(self.positions.read().clone())
        }
        async fn instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo, EngineError> {
            Ok(InstrumentInfo { min_lot: 0.01, max_lot: 1.0, lot_step: 0.01, pip_size: 0.0001 })
        }
        async fn calculate_quantity(&self, _symbol: &str, usd: f64, price: f64) -> Result<f64, EngineError> {
            Ok(usd / price)
        }
        async fn create_market_order(&self, _s: &str, _side: Side, _q: f64, _sl: f64, _tp: f64) -> Result<OrderReceipt, EngineError> {
            unimplemented!()
        }
        async fn modify_stop_loss(&self, _t: &str, _sl: f64) -> Result<(), EngineError> {
            Ok(())
        }
        async fn close_position(&self, _t: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn authority(clock: Arc<FakeClock>, positions: Vec<LivePosition>) -> RiskAuthority {
        RiskAuthority::new(
            clock,
            Arc::new(InMemoryStateStore::new(Arc::new(crate::clock::SystemClock))),
            Arc::new(FakeBroker { positions: RwLock::new(positions) }),
            RiskConfig::default(),
        )
    }

    fn fake_position(side: Side) -> LivePosition {
        LivePosition {
            ticket: "T1".to_string(),
            symbol: "BTCUSD".to_string(),
            side,
            quantity: 0.01,
            entry_price: 100.0,
            current_price: 100.0,
        }
    }

    #[tokio::test]
    async fn can_open_position_blocks_on_max_total() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()));
        let risk = authority(clock, vec![fake_position(Side::Buy), fake_position(Side::Sell)]);
        let (allowed, reason) = risk.can_open_position(Side::Buy, "u1").await;
        assert!(!allowed);
        assert_eq!(reason.as_deref(), Some("Max total positions reached"));
    }

    #[tokio::test]
    async fn can_open_position_blocks_on_max_buy_with_room_in_total() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()));
        let risk = authority(clock, vec![fake_position(Side::Buy)]);
        let (allowed, reason) = risk.can_open_position(Side::Buy, "u1").await;
        assert!(!allowed);
        assert_eq!(reason.as_deref(), Some("Max BUY positions reached"));

        let (allowed_sell, _) = risk.can_open_position(Side::Sell, "u1").await;
        assert!(allowed_sell);
    }

    #[tokio::test]
    async fn cooldown_blocks_second_concurrent_call_until_window_elapses() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()));
        let risk = authority(clock.clone(), vec![]);

        let (first, _) = risk.check_and_start_cooldown().await;
        assert!(first);

        let (second, reason) = risk.check_and_start_cooldown().await;
        assert!(!second);
        assert!(reason.unwrap().contains("Cooldown active"));

        clock.advance(chrono::Duration::minutes(16));
        let (third, _) = risk.check_and_start_cooldown().await;
        assert!(third);
    }

    #[tokio::test]
    async fn daily_loss_limit_rejects_once_breached() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()));
        let risk = authority(clock, vec![]);
        risk.record_trade_result(-100.0).await.unwrap();
        let (allowed, reason) = risk.check_daily_limits().await;
        assert!(!allowed);
        assert_eq!(reason.as_deref(), Some("Max daily loss reached"));
    }

    #[tokio::test]
    async fn consecutive_losses_trigger_pause() {
        let clock = Arc::new(FakeClock::new(Utc.with_ymd_and_hms(2026, 7, 28, 0, 0, 0).unwrap()));
        let risk = authority(clock.clone(), vec![]);
        risk.record_trade_result(-10.0).await.unwrap();
        risk.record_trade_result(-10.0).await.unwrap();
        risk.record_trade_result(-10.0).await.unwrap();

        let (allowed, reason) = risk.check_and_start_cooldown().await;
        assert!(!allowed);
        assert!(reason.unwrap().contains("Trading paused"));

        clock.advance(chrono::Duration::minutes(61));
        let (allowed_after, _) = risk.check_and_start_cooldown().await;
        assert!(allowed_after);
    }

    #[test]
    fn calculate_lot_size_clamps_and_rounds() {
        let risk = RiskAuthority::new(
            Arc::new(crate::clock::SystemClock),
            Arc::new(InMemoryStateStore::new(Arc::new(crate::clock::SystemClock))),
            Arc::new(FakeBroker { positions: RwLock::new(vec![]) }),
            RiskConfig::default(),
        );
        // risk=15*1.0=15, distance=5 => 15/5*1.0=3.0 lots, clamped to MAX_LOT=0.20
        assert_eq!(risk.calculate_lot_size(100.0, 95.0, 1.0), 0.20);
        // zero distance falls back to MIN_LOT
        assert_eq!(risk.calculate_lot_size(100.0, 100.0, 1.0), 0.01);
    }
}
