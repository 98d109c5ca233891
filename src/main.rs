// =============================================================================
// Scalping Engine — Main Entry Point
// =============================================================================
//
// Wires the component graph described by SPEC_FULL.md §2 — ClockSource,
// KVStore, StateStore, per-broker BrokerAdapters, RiskAuthority,
// BrokerFilter, PriorityQueue, SignalValidator, Executor, PositionManager,
// and one MarketDropDetector per monitored symbol — then spawns the
// long-running loops: the Executor 1s drain tick, the PositionManager 10s
// scan tick, a 10s detector tick per symbol, the `market_drops` pub-sub
// subscriber that feeds severe alerts to the PositionManager, and the
// narrow operational HTTP surface.
//
// The engine starts in Demo + Paused mode for safety. An operator must
// explicitly switch to Live mode via `POST /api/v1/admin/mode`.
// =============================================================================

mod api;
mod app_state;
mod broker;
mod broker_filter;
mod clock;
mod errors;
mod executor;
mod kvstore;
mod market_drop;
mod position_manager;
mod queue;
mod risk;
mod runtime_config;
mod signal_validator;
mod statestore;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::binance::BinanceAdapter;
use crate::broker::mt4::Mt4Adapter;
use crate::broker::okx::OkxAdapter;
use crate::broker::BrokerAdapter;
use crate::broker_filter::BrokerFilter;
use crate::clock::{ClockSource, SystemClock};
use crate::executor::Executor;
use crate::kvstore::{InProcessKVStore, KVStore};
use crate::market_drop::MarketDropDetector;
use crate::position_manager::PositionManager;
use crate::queue::PriorityQueue;
use crate::risk::RiskAuthority;
use crate::runtime_config::RuntimeConfig;
use crate::signal_validator::SignalValidator;
use crate::statestore::model::DropAlert;
use crate::statestore::{InMemoryStateStore, StateStore};
use crate::types::{AccountMode, Broker, TradingMode};

const CONFIG_PATH: &str = "runtime_config.json";
const EXECUTOR_BATCH_SIZE: usize = 20;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Scalping Engine — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: always start Demo + Paused regardless of what was persisted.
    config.trading_mode = TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    if let Ok(syms) = std::env::var("ENGINE_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec!["BTCUSD".to_string(), "ETHUSD".to_string()];
    }

    info!(symbols = ?config.symbols, "configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Clock, KVStore, StateStore ────────────────────────────────────
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);
    let kv: Arc<dyn KVStore> = Arc::new(InProcessKVStore::new());
    let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(clock.clone()));

    // ── 3. Broker adapters ───────────────────────────────────────────────
    let mt4_bridge_url = std::env::var("MT4_BRIDGE_URL").unwrap_or_else(|_| "http://127.0.0.1:9000".to_string());
    let mt4: Arc<dyn BrokerAdapter> = Arc::new(Mt4Adapter::new(mt4_bridge_url, config.mt4_symbol_config.clone()));

    let okx_key = std::env::var("OKX_API_KEY").unwrap_or_default();
    let okx_secret = std::env::var("OKX_API_SECRET").unwrap_or_default();
    let okx_passphrase = std::env::var("OKX_API_PASSPHRASE").unwrap_or_default();
    let okx: Arc<dyn BrokerAdapter> = Arc::new(OkxAdapter::new(okx_key, okx_secret, okx_passphrase));

    let binance_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let binance_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance: Arc<dyn BrokerAdapter> = Arc::new(BinanceAdapter::new(binance_key, binance_secret));

    let mut brokers: HashMap<Broker, Arc<dyn BrokerAdapter>> = HashMap::new();
    brokers.insert(Broker::Mt4, mt4.clone());
    brokers.insert(Broker::Okx, okx.clone());
    brokers.insert(Broker::Binance, binance.clone());

    // ── 4. RiskAuthority (MT4 is the only broker it gates, per §4.4) ─────
    let risk = Arc::new(RiskAuthority::new(clock.clone(), store.clone(), mt4.clone(), config.risk.into()));

    // ── 5. BrokerFilter, PriorityQueue, SignalValidator ──────────────────
    let filter = Arc::new(BrokerFilter::new(HashMap::new()));
    let queue = Arc::new(PriorityQueue::new(kv.clone()));
    // The validator's reference-price lookups default to the MT4 adapter;
    // the Executor re-derives broker-specific quantities per agent.broker.
    let validator = Arc::new(SignalValidator::new(mt4.clone(), kv.clone(), config.validator));

    // ── 6. Executor, PositionManager ─────────────────────────────────────
    let executor = Arc::new(Executor::new(
        store.clone(),
        risk.clone(),
        filter.clone(),
        queue.clone(),
        brokers.clone(),
        config.validator,
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

    // ── 7. One MarketDropDetector per monitored symbol ───────────────────
    let alert_cooldown = Duration::from_secs(config.intervals.alert_cooldown_secs);
    let mut drop_detectors: HashMap<String, Arc<MarketDropDetector>> = HashMap::new();
    for symbol in &config.symbols {
        // Each symbol's detector reads prices from the venue that actually
        // quotes it; OKX/Binance-style symbols default to the Binance
        // adapter, everything else to MT4. Operators needing a different
        // split can repoint this via MT4_SYMBOLS.
        let broker_for_symbol: Arc<dyn BrokerAdapter> =
            if symbol.ends_with("USDT") { binance.clone() } else { mt4.clone() };
        let detector = Arc::new(MarketDropDetector::new(
            clock.clone(),
            broker_for_symbol,
            kv.clone(),
            alert_cooldown,
        ));
        drop_detectors.insert(symbol.clone(), detector);
    }

    let state = Arc::new(AppState::new(
        clock.clone(),
        kv.clone(),
        store.clone(),
        config.clone(),
        brokers,
        risk.clone(),
        filter,
        queue,
        validator,
        executor.clone(),
        position_manager.clone(),
        drop_detectors.clone(),
    ));

    // ── 8. Executor drain loop ────────────────────────────────────────────
    {
        let state = state.clone();
        let interval_secs = config.intervals.executor_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if state.trading_mode() == TradingMode::Killed {
                    continue;
                }
                match state.executor.drain_tick(EXECUTOR_BATCH_SIZE).await {
                    Ok(n) if n > 0 => {
                        state.increment_version();
                        info!(drained = n, "executor drain tick");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        state.push_error(format!("executor drain tick failed: {e}"));
                        error!(error = %e, "executor drain tick failed");
                    }
                }
            }
        });
    }

    // ── 8b. Order rate-limit window reset, one tick per 10 s ─────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                for broker in state.brokers.values() {
                    broker.reset_order_rate_window();
                }
            }
        });
    }

    // ── 9. PositionManager scan loop ──────────────────────────────────────
    {
        let state = state.clone();
        let interval_secs = config.intervals.position_manager_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                match state.position_manager.scan_tick().await {
                    Ok(n) if n > 0 => {
                        state.increment_version();
                        info!(closed = n, "position manager scan tick");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        state.push_error(format!("position manager scan tick failed: {e}"));
                        error!(error = %e, "position manager scan tick failed");
                    }
                }
            }
        });
    }

    // ── 10. MarketDropDetector ticks, one task per symbol ─────────────────
    for (symbol, detector) in &drop_detectors {
        let symbol = symbol.clone();
        let detector = detector.clone();
        let state = state.clone();
        let interval_secs = config.intervals.drop_detector_secs.max(1);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                if let Err(e) = detector.tick(&symbol).await {
                    state.push_error(format!("drop detector tick failed for {symbol}: {e}"));
                    warn!(symbol = %symbol, error = %e, "drop detector tick failed");
                }
            }
        });
    }

    // ── 11. market_drops pub-sub subscriber feeding PositionManager ──────
    {
        let state = state.clone();
        let mut rx = state.kv.subscribe("market_drops");
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => match serde_json::from_str::<DropAlert>(&payload) {
                        Ok(alert) => {
                            if let Err(e) = state.position_manager.handle_drop_alert(alert).await {
                                state.push_error(format!("drop alert handling failed: {e}"));
                                error!(error = %e, "drop alert handling failed");
                            } else {
                                state.increment_version();
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to parse DropAlert payload"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "market_drops subscriber lagged, dropped alerts");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    // ── 12. Operational HTTP surface ─────────────────────────────────────
    {
        let state = state.clone();
        let bind_addr = std::env::var("ENGINE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
        tokio::spawn(async move {
            let app = api::rest::router(state);
            let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(addr = %bind_addr, error = %e, "failed to bind operational HTTP surface");
                    return;
                }
            };
            info!(addr = %bind_addr, "operational HTTP surface listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "operational HTTP surface exited");
            }
        });
    }

    info!("all subsystems running, ctrl+c to stop");

    // ── 13. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("scalping engine shut down complete");
    Ok(())
}
