// =============================================================================
// StateStore — durable document store for Agent, Position, Trade,
// DailyTradingStats, SignalLog
// =============================================================================
//
// Supports atomic single-document updates (via a closure applied under a
// single lock acquisition) and indexed queries on `(user_id, status)` and
// `(ticket)` for Position, matching SPEC_FULL.md §6's persisted-state index
// requirements.
//
// The production trait boundary is where a real document database (Mongo-
// shaped, or a SQL table per entity) would plug in. This module ships an
// in-process implementation behind the same trait so the engine runs
// standalone, following the same atomic-persistence discipline already used
// by `runtime_config.rs` for the hot-reloadable config file.
// =============================================================================

pub mod model;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::clock::ClockSource;
use model::{Agent, DailyTradingStats, Position, SignalLog, Trade};

/// Durable document store. All methods are async to mirror a real network-
/// backed document database; the in-memory implementation below never
/// actually awaits I/O.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>>;
    async fn put_agent(&self, agent: Agent) -> Result<()>;

    async fn create_position(&self, position: Position) -> Result<()>;
    async fn get_position(&self, ticket: &str) -> Result<Option<Position>>;
    /// Atomically mutate a position in place via `f`. Returns `Ok(None)` if no
    /// position with that ticket exists.
    async fn update_position(
        &self,
        ticket: &str,
        f: Box<dyn FnOnce(&mut Position) + Send>,
    ) -> Result<Option<Position>>;
    /// Indexed by `(user_id, status)`.
    async fn list_open_positions_for_user(&self, user_id: &str) -> Result<Vec<Position>>;
    async fn list_all_open_positions(&self) -> Result<Vec<Position>>;

    async fn upsert_trade(&self, trade: Trade) -> Result<()>;

    /// Fetch today's stats, creating a fresh document lazily if this is the
    /// first operation for the date.
    async fn get_or_create_daily_stats(&self, date: &str) -> Result<DailyTradingStats>;
    /// Atomically mutate today's stats via `f`, creating the document first
    /// if necessary. `winCount + lossCount <= totalTrades` is preserved
    /// because callers update both fields inside one `f`.
    async fn update_daily_stats(
        &self,
        date: &str,
        f: Box<dyn FnOnce(&mut DailyTradingStats) + Send>,
    ) -> Result<DailyTradingStats>;

    async fn create_signal_log(&self, log: SignalLog) -> Result<()>;
    async fn update_signal_log(
        &self,
        signal_id: &str,
        f: Box<dyn FnOnce(&mut SignalLog) + Send>,
    ) -> Result<Option<SignalLog>>;
    async fn get_signal_log(&self, signal_id: &str) -> Result<Option<SignalLog>>;
    async fn recent_signal_logs(&self, limit: usize) -> Result<Vec<SignalLog>>;
}

/// In-process `StateStore` backed by `parking_lot::RwLock<HashMap<..>>`.
pub struct InMemoryStateStore {
    clock: std::sync::Arc<dyn ClockSource>,
    agents: RwLock<HashMap<String, Agent>>,
    positions: RwLock<HashMap<String, Position>>,
    trades: RwLock<HashMap<String, Trade>>,
    daily_stats: RwLock<HashMap<String, DailyTradingStats>>,
    signal_logs: RwLock<HashMap<String, SignalLog>>,
    signal_log_order: RwLock<Vec<String>>,
}

impl InMemoryStateStore {
    pub fn new(clock: std::sync::Arc<dyn ClockSource>) -> Self {
        Self {
            clock,
            agents: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            trades: RwLock::new(HashMap::new()),
            daily_stats: RwLock::new(HashMap::new()),
            signal_logs: RwLock::new(HashMap::new()),
            signal_log_order: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        Ok(self.agents.read().get(agent_id).cloned())
    }

    async fn put_agent(&self, agent: Agent) -> Result<()> {
        self.agents.write().insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn create_position(&self, position: Position) -> Result<()> {
        self.positions
            .write()
            .insert(position.ticket.clone(), position);
        Ok(())
    }

    async fn get_position(&self, ticket: &str) -> Result<Option<Position>> {
        Ok(self.positions.read().get(ticket).cloned())
    }

    async fn update_position(
        &self,
        ticket: &str,
        f: Box<dyn FnOnce(&mut Position) + Send>,
    ) -> Result<Option<Position>> {
        let mut positions = self.positions.write();
        match positions.get_mut(ticket) {
            Some(pos) => {
                f(pos);
                pos.updated_at = self.clock.now();
                Ok(Some(pos.clone()))
            }
            None => Ok(None),
        }
    }

    async fn list_open_positions_for_user(&self, user_id: &str) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .values()
            .filter(|p| p.user_id == user_id && p.is_open())
            .cloned()
            .collect())
    }

    async fn list_all_open_positions(&self) -> Result<Vec<Position>> {
        Ok(self
            .positions
            .read()
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect())
    }

    async fn upsert_trade(&self, trade: Trade) -> Result<()> {
        self.trades.write().insert(trade.ticket.clone(), trade);
        Ok(())
    }

    async fn get_or_create_daily_stats(&self, date: &str) -> Result<DailyTradingStats> {
        let mut stats = self.daily_stats.write();
        Ok(stats
            .entry(date.to_string())
            .or_insert_with(|| DailyTradingStats::new_for_date(date.to_string()))
            .clone())
    }

    async fn update_daily_stats(
        &self,
        date: &str,
        f: Box<dyn FnOnce(&mut DailyTradingStats) + Send>,
    ) -> Result<DailyTradingStats> {
        let mut stats = self.daily_stats.write();
        let entry = stats
            .entry(date.to_string())
            .or_insert_with(|| DailyTradingStats::new_for_date(date.to_string()));
        f(entry);
        Ok(entry.clone())
    }

    async fn create_signal_log(&self, log: SignalLog) -> Result<()> {
        self.signal_log_order.write().push(log.signal_id.clone());
        self.signal_logs.write().insert(log.signal_id.clone(), log);
        Ok(())
    }

    async fn update_signal_log(
        &self,
        signal_id: &str,
        f: Box<dyn FnOnce(&mut SignalLog) + Send>,
    ) -> Result<Option<SignalLog>> {
        let mut logs = self.signal_logs.write();
        match logs.get_mut(signal_id) {
            Some(log) => {
                f(log);
                log.updated_at = Utc::now();
                Ok(Some(log.clone()))
            }
            None => Ok(None),
        }
    }

    async fn get_signal_log(&self, signal_id: &str) -> Result<Option<SignalLog>> {
        Ok(self.signal_logs.read().get(signal_id).cloned())
    }

    async fn recent_signal_logs(&self, limit: usize) -> Result<Vec<SignalLog>> {
        let order = self.signal_log_order.read();
        let logs = self.signal_logs.read();
        Ok(order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| logs.get(id).cloned())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::types::{Broker, Category, PositionStatus, Side};

    fn store() -> InMemoryStateStore {
        InMemoryStateStore::new(std::sync::Arc::new(SystemClock))
    }

    fn sample_position(ticket: &str, user_id: &str) -> Position {
        let now = Utc::now();
        Position {
            ticket: ticket.to_string(),
            user_id: user_id.to_string(),
            agent_id: "agent-1".to_string(),
            symbol: "BTCUSD".to_string(),
            side: Side::Buy,
            lot_size: 0.01,
            entry_price: 100.0,
            current_price: 100.0,
            stop_loss: 99.0,
            take_profit: 101.5,
            status: PositionStatus::Open,
            opened_at: now,
            closed_at: None,
            close_reason: None,
            break_even_activated: false,
            trailing_stop_activated: false,
            highest_profit_price: 100.0,
            original_stop_loss: 99.0,
            one_to_one_locked: false,
            profit_locked_75: false,
            profit: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn position_lifecycle_and_indexed_query() {
        let s = store();
        s.create_position(sample_position("T1", "u1")).await.unwrap();
        s.create_position(sample_position("T2", "u1")).await.unwrap();
        s.create_position(sample_position("T3", "u2")).await.unwrap();

        let open_u1 = s.list_open_positions_for_user("u1").await.unwrap();
        assert_eq!(open_u1.len(), 2);

        s.update_position(
            "T1",
            Box::new(|p| {
                p.status = PositionStatus::Closed;
                p.closed_at = Some(Utc::now());
            }),
        )
        .await
        .unwrap();

        let open_u1 = s.list_open_positions_for_user("u1").await.unwrap();
        assert_eq!(open_u1.len(), 1);
        assert_eq!(open_u1[0].ticket, "T2");

        let all_open = s.list_all_open_positions().await.unwrap();
        assert_eq!(all_open.len(), 2);
    }

    #[tokio::test]
    async fn daily_stats_lazy_creation_and_atomic_update() {
        let s = store();
        let stats = s.get_or_create_daily_stats("2026-07-28").await.unwrap();
        assert_eq!(stats.total_trades, 0);

        let updated = s
            .update_daily_stats(
                "2026-07-28",
                Box::new(|st| {
                    st.total_trades += 1;
                    st.win_count += 1;
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.total_trades, 1);
        assert_eq!(updated.win_count, 1);
        assert!(updated.win_count + updated.loss_count <= updated.total_trades);
    }

    #[tokio::test]
    async fn signal_log_transitions_to_terminal_status() {
        let s = store();
        let now = Utc::now();
        s.create_signal_log(SignalLog::pending(
            "sig-1".to_string(),
            "agent-1".to_string(),
            now,
        ))
        .await
        .unwrap();

        let updated = s
            .update_signal_log(
                "sig-1",
                Box::new(|log| {
                    log.status = crate::types::SignalStatus::Rejected;
                    log.failed_reason = Some("Max total positions reached".to_string());
                }),
            )
            .await
            .unwrap()
            .expect("signal log exists");

        assert!(updated.status.is_terminal());
        assert_eq!(
            updated.failed_reason.as_deref(),
            Some("Max total positions reached")
        );
    }

    #[tokio::test]
    async fn agent_roundtrip() {
        let s = store();
        s.put_agent(Agent {
            id: "agent-1".to_string(),
            user_id: "u1".to_string(),
            broker: Broker::Mt4,
            category: Category::FibonacciScalping,
            is_active: true,
            allowed_signal_categories: vec![Category::FibonacciScalping],
        })
        .await
        .unwrap();

        let agent = s.get_agent("agent-1").await.unwrap().expect("agent exists");
        assert_eq!(agent.broker, Broker::Mt4);
        assert!(agent.is_active);
    }
}
