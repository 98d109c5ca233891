// =============================================================================
// AppState — shared component graph wired once at startup
// =============================================================================
//
// Every long-running task (the Executor drain loop, the PositionManager scan
// loop, the per-symbol MarketDropDetector ticks, the market-drop pub-sub
// subscriber, and the narrow operational HTTP surface) reaches the engine's
// components through this struct rather than constructing their own copies,
// so a hot-reloaded RuntimeConfig and a single RiskAuthority/StateStore/
// KVStore are genuinely shared process-wide.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::broker::BrokerAdapter;
use crate::broker_filter::BrokerFilter;
use crate::clock::ClockSource;
use crate::executor::Executor;
use crate::kvstore::KVStore;
use crate::market_drop::MarketDropDetector;
use crate::position_manager::PositionManager;
use crate::queue::PriorityQueue;
use crate::risk::RiskAuthority;
use crate::runtime_config::RuntimeConfig;
use crate::signal_validator::SignalValidator;
use crate::statestore::model::{DailyTradingStats, SignalLog};
use crate::statestore::StateStore;
use crate::types::{AccountMode, Broker, TradingMode};

/// A recorded error event surfaced by the operational status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: chrono::DateTime<Utc>,
}

const MAX_RECENT_ERRORS: usize = 50;

/// Everything the engine's long-running tasks and the ops HTTP surface
/// share. Built once in `main` and handed around behind an `Arc`.
pub struct AppState {
    pub clock: Arc<dyn ClockSource>,
    pub kv: Arc<dyn KVStore>,
    pub store: Arc<dyn StateStore>,
    pub runtime_config: RwLock<RuntimeConfig>,

    pub brokers: HashMap<Broker, Arc<dyn BrokerAdapter>>,
    pub risk: Arc<RiskAuthority>,
    pub filter: Arc<BrokerFilter>,
    pub queue: Arc<PriorityQueue>,
    pub validator: Arc<SignalValidator>,
    pub executor: Arc<Executor>,
    pub position_manager: Arc<PositionManager>,
    pub drop_detectors: HashMap<String, Arc<MarketDropDetector>>,

    state_version: AtomicU64,
    recent_errors: RwLock<Vec<ErrorRecord>>,
    start_time: std::time::Instant,
}

/// Minimal operational snapshot returned by `GET /api/v1/status` — trading
/// mode, open-position count, today's ledger, and the most recent signal
/// and error activity. Deliberately not the rich multi-panel dashboard
/// snapshot this engine's forebear served; an operator here needs to know
/// whether the engine is trading and whether it is healthy.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state_version: u64,
    pub trading_mode: TradingMode,
    pub account_mode: AccountMode,
    pub symbols: Vec<String>,
    pub open_position_count: usize,
    pub daily_stats: DailyTradingStats,
    pub recent_signal_logs: Vec<SignalLog>,
    pub recent_errors: Vec<ErrorRecord>,
    pub uptime_secs: u64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn ClockSource>,
        kv: Arc<dyn KVStore>,
        store: Arc<dyn StateStore>,
        runtime_config: RuntimeConfig,
        brokers: HashMap<Broker, Arc<dyn BrokerAdapter>>,
        risk: Arc<RiskAuthority>,
        filter: Arc<BrokerFilter>,
        queue: Arc<PriorityQueue>,
        validator: Arc<SignalValidator>,
        executor: Arc<Executor>,
        position_manager: Arc<PositionManager>,
        drop_detectors: HashMap<String, Arc<MarketDropDetector>>,
    ) -> Self {
        Self {
            clock,
            kv,
            store,
            runtime_config: RwLock::new(runtime_config),
            brokers,
            risk,
            filter,
            queue,
            validator,
            executor,
            position_manager,
            drop_detectors,
            state_version: AtomicU64::new(0),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord { message: message.into(), at: Utc::now() });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    pub fn trading_mode(&self) -> TradingMode {
        self.runtime_config.read().trading_mode
    }

    pub fn set_trading_mode(&self, mode: TradingMode) {
        self.runtime_config.write().trading_mode = mode;
        self.increment_version();
    }

    pub async fn build_status_snapshot(&self) -> anyhow::Result<StatusSnapshot> {
        let config = self.runtime_config.read().clone();
        let open_positions = self.store.list_all_open_positions().await?;
        let today = self.clock.today();
        let daily_stats = self.store.get_or_create_daily_stats(&today).await?;
        let recent_signal_logs = self.store.recent_signal_logs(25).await?;
        let recent_errors = self.recent_errors.read().clone();

        Ok(StatusSnapshot {
            state_version: self.current_state_version(),
            trading_mode: config.trading_mode,
            account_mode: config.account_mode,
            symbols: config.symbols,
            open_position_count: open_positions.len(),
            daily_stats,
            recent_signal_logs,
            recent_errors,
            uptime_secs: self.start_time.elapsed().as_secs(),
        })
    }

    /// Cooldown between repeated market-drop alerts for the same symbol, read
    /// back from whatever the hot-reloaded config currently holds.
    pub fn alert_cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.runtime_config.read().intervals.alert_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountSnapshot, InstrumentInfo, LivePosition, OrderReceipt};
    use crate::clock::SystemClock;
    use crate::errors::EngineError;
    use crate::kvstore::InProcessKVStore;
    use crate::runtime_config::ValidatorConfig;
    use crate::statestore::InMemoryStateStore;
    use crate::types::Side;
    use async_trait::async_trait;

    struct NullBroker;

    #[async_trait]
    impl BrokerAdapter for NullBroker {
        fn name(&self) -> &'static str {
            "NULL"
        }
        async fn current_price(&self, _symbol: &str) -> Result<f64, EngineError> {
            Ok(0.0)
        }
        async fn account(&self) -> Result<AccountSnapshot, EngineError> {
            Ok(AccountSnapshot { balance: 0.0, equity: 0.0, margin_level: None })
        }
        async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
            Ok(vec![])
        }
        async fn instrument_info(&self, _symbol: &str) -> Result<InstrumentInfo, EngineError> {
            Ok(InstrumentInfo { min_lot: 0.01, max_lot: 1.0, lot_step: 0.01, pip_size: 0.01 })
        }
        async fn calculate_quantity(&self, _s: &str, usd: f64, price: f64) -> Result<f64, EngineError> {
            Ok(usd / price.max(1.0))
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
            Ok(())
        }
        async fn close_position(&self, _t: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn state() -> AppState {
        let clock = Arc::new(SystemClock) as Arc<dyn ClockSource>;
        let kv = Arc::new(InProcessKVStore::new()) as Arc<dyn KVStore>;
        let store = Arc::new(InMemoryStateStore::new(clock.clone())) as Arc<dyn StateStore>;
        let broker: Arc<dyn BrokerAdapter> = Arc::new(NullBroker);

        let config = RuntimeConfig::default();
        let risk = Arc::new(RiskAuthority::new(clock.clone(), store.clone(), broker.clone(), config.risk.into()));
        let filter = Arc::new(BrokerFilter::new(HashMap::new()));
        let queue = Arc::new(PriorityQueue::new(kv.clone()));
        let validator = Arc::new(SignalValidator::new(broker.clone(), kv.clone(), ValidatorConfig::default()));

        let mut brokers = HashMap::new();
        brokers.insert(Broker::Mt4, broker.clone());

        let executor = Arc::new(Executor::new(
            store.clone(),
            risk.clone(),
            filter.clone(),
            queue.clone(),
            brokers.clone(),
            ValidatorConfig::default(),
            kv.clone(),
        ));
        let position_manager = Arc::new(PositionManager::new(
            clock.clone(),
            store.clone(),
            risk.clone() as Arc<dyn crate::risk::RiskRecorder>,
            kv.clone(),
            brokers.clone(),
            config.exit,
        ));

        AppState::new(
            clock,
            kv,
            store,
            config,
            brokers,
            risk,
            filter,
            queue,
            validator,
            executor,
            position_manager,
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn status_snapshot_reflects_trading_mode_and_version_bumps() {
        let state = state();
        assert_eq!(state.current_state_version(), 0);
        state.set_trading_mode(TradingMode::Live);
        assert_eq!(state.current_state_version(), 1);

        let snapshot = state.build_status_snapshot().await.unwrap();
        assert_eq!(snapshot.trading_mode, TradingMode::Live);
        assert_eq!(snapshot.open_position_count, 0);
        assert_eq!(snapshot.state_version, 1);
    }

    #[test]
    fn push_error_caps_recent_errors() {
        let state = state();
        for i in 0..(MAX_RECENT_ERRORS + 20) {
            state.push_error(format!("error {i}"));
        }
        assert_eq!(state.recent_errors.read().len(), MAX_RECENT_ERRORS);
        assert_eq!(
            state.recent_errors.read().last().unwrap().message,
            format!("error {}", MAX_RECENT_ERRORS + 19)
        );
    }
}
