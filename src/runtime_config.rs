// =============================================================================
// Runtime Configuration — Hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the scalping engine. Every tunable named in
// SPEC_FULL.md §6 lives here so the engine can be reconfigured without a
// restart: risk constants, exit geometry, SL/TP normalization, OKX minimum
// order value, monitoring intervals, and per-symbol broker contract configs.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::mt4::Mt4SymbolConfig;
use crate::types::{AccountMode, TradingMode};

fn default_symbols() -> Vec<String> {
    vec!["BTCUSD".to_string(), "ETHUSD".to_string()]
}

fn default_max_sl_points() -> f64 {
    200.0
}

fn default_sl_points() -> f64 {
    150.0
}

fn default_rr_ratio() -> f64 {
    1.5
}

/// Base USD notional before the per-`RiskClass` size factor is applied.
fn default_account_risk_usd() -> f64 {
    15.0
}

fn default_okx_min_order_value_usd() -> f64 {
    20.0
}

fn default_executor_interval_secs() -> u64 {
    1
}

fn default_position_manager_interval_secs() -> u64 {
    10
}

fn default_drop_detector_interval_secs() -> u64 {
    10
}

fn default_alert_cooldown_secs() -> u64 {
    60
}

fn default_risk_max_buy() -> u32 {
    1
}
fn default_risk_max_sell() -> u32 {
    1
}
fn default_risk_max_total() -> u32 {
    2
}
fn default_risk_min_between_minutes() -> i64 {
    15
}
fn default_risk_after_loss_minutes() -> i64 {
    30
}
fn default_risk_after_consecutive_losses_minutes() -> i64 {
    60
}
fn default_risk_max_daily_loss_usd() -> f64 {
    100.0
}
fn default_risk_max_daily_trades() -> u32 {
    40
}
fn default_risk_max_consecutive_losses() -> u32 {
    3
}
fn default_risk_max_risk_per_trade_usd() -> f64 {
    15.0
}
fn default_risk_min_lot() -> f64 {
    0.01
}
fn default_risk_max_lot() -> f64 {
    0.20
}
fn default_risk_point_value_per_lot() -> f64 {
    1.0
}

/// Fixed risk defaults from SPEC_FULL.md §4.1, all overridable at runtime.
/// Mirrors `crate::risk::RiskConfig` field-for-field so a loaded config can
/// be converted directly into the value `RiskAuthority` consumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskConfigOverrides {
    #[serde(default = "default_risk_max_buy")]
    pub max_buy: u32,
    #[serde(default = "default_risk_max_sell")]
    pub max_sell: u32,
    #[serde(default = "default_risk_max_total")]
    pub max_total: u32,
    #[serde(default = "default_risk_min_between_minutes")]
    pub min_between_minutes: i64,
    #[serde(default = "default_risk_after_loss_minutes")]
    pub after_loss_minutes: i64,
    #[serde(default = "default_risk_after_consecutive_losses_minutes")]
    pub after_consecutive_losses_minutes: i64,
    #[serde(default = "default_risk_max_daily_loss_usd")]
    pub max_daily_loss_usd: f64,
    #[serde(default = "default_risk_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default = "default_risk_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_risk_max_risk_per_trade_usd")]
    pub max_risk_per_trade_usd: f64,
    #[serde(default = "default_risk_min_lot")]
    pub min_lot: f64,
    #[serde(default = "default_risk_max_lot")]
    pub max_lot: f64,
    #[serde(default = "default_risk_point_value_per_lot")]
    pub point_value_per_lot: f64,
}

impl Default for RiskConfigOverrides {
    fn default() -> Self {
        let d = crate::risk::RiskConfig::default();
        Self {
            max_buy: d.max_buy,
            max_sell: d.max_sell,
            max_total: d.max_total,
            min_between_minutes: d.min_between_minutes,
            after_loss_minutes: d.after_loss_minutes,
            after_consecutive_losses_minutes: d.after_consecutive_losses_minutes,
            max_daily_loss_usd: d.max_daily_loss_usd,
            max_daily_trades: d.max_daily_trades,
            max_consecutive_losses: d.max_consecutive_losses,
            max_risk_per_trade_usd: d.max_risk_per_trade_usd,
            min_lot: d.min_lot,
            max_lot: d.max_lot,
            point_value_per_lot: d.point_value_per_lot,
        }
    }
}

impl From<RiskConfigOverrides> for crate::risk::RiskConfig {
    fn from(o: RiskConfigOverrides) -> Self {
        Self {
            max_buy: o.max_buy,
            max_sell: o.max_sell,
            max_total: o.max_total,
            min_between_minutes: o.min_between_minutes,
            after_loss_minutes: o.after_loss_minutes,
            after_consecutive_losses_minutes: o.after_consecutive_losses_minutes,
            max_daily_loss_usd: o.max_daily_loss_usd,
            max_daily_trades: o.max_daily_trades,
            max_consecutive_losses: o.max_consecutive_losses,
            max_risk_per_trade_usd: o.max_risk_per_trade_usd,
            min_lot: o.min_lot,
            max_lot: o.max_lot,
            point_value_per_lot: o.point_value_per_lot,
        }
    }
}

/// Exit-geometry constants consumed by the `PositionManager` pipeline
/// (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitConfig {
    #[serde(default = "ExitConfig::default_early_exit_loss_points")]
    pub early_exit_loss_points: f64,
    #[serde(default = "ExitConfig::default_breakeven_points")]
    pub breakeven_points: f64,
    #[serde(default = "ExitConfig::default_trail_start_points")]
    pub trail_start_points: f64,
    #[serde(default = "ExitConfig::default_trail_distance_points")]
    pub trail_distance_points: f64,
    #[serde(default = "ExitConfig::default_max_position_minutes")]
    pub max_position_minutes: i64,
    #[serde(default = "ExitConfig::default_trail_breakeven_pct")]
    pub trail_breakeven_pct: f64,
    #[serde(default = "ExitConfig::default_trail_lock_pct")]
    pub trail_lock_pct: f64,
    #[serde(default = "ExitConfig::default_trail_lock_amount")]
    pub trail_lock_amount: f64,
    #[serde(default = "ExitConfig::default_one_to_one_lock_profit_pct")]
    pub one_to_one_lock_profit_pct: f64,
    #[serde(default = "ExitConfig::default_time_exit_slow_minutes")]
    pub time_exit_slow_minutes: i64,
    #[serde(default = "ExitConfig::default_time_exit_slow_progress")]
    pub time_exit_slow_progress: f64,
    #[serde(default = "ExitConfig::default_time_exit_max_minutes")]
    pub time_exit_max_minutes: i64,
    #[serde(default = "ExitConfig::default_signal_reversal_min_confidence")]
    pub signal_reversal_min_confidence: f64,
}

impl ExitConfig {
    fn default_early_exit_loss_points() -> f64 {
        80.0
    }
    fn default_breakeven_points() -> f64 {
        40.0
    }
    fn default_trail_start_points() -> f64 {
        50.0
    }
    fn default_trail_distance_points() -> f64 {
        30.0
    }
    fn default_max_position_minutes() -> i64 {
        45
    }
    fn default_trail_breakeven_pct() -> f64 {
        0.50
    }
    fn default_trail_lock_pct() -> f64 {
        0.75
    }
    fn default_trail_lock_amount() -> f64 {
        0.50
    }
    fn default_one_to_one_lock_profit_pct() -> f64 {
        0.50
    }
    fn default_time_exit_slow_minutes() -> i64 {
        15
    }
    fn default_time_exit_slow_progress() -> f64 {
        0.25
    }
    fn default_time_exit_max_minutes() -> i64 {
        30
    }
    fn default_signal_reversal_min_confidence() -> f64 {
        60.0
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            early_exit_loss_points: Self::default_early_exit_loss_points(),
            breakeven_points: Self::default_breakeven_points(),
            trail_start_points: Self::default_trail_start_points(),
            trail_distance_points: Self::default_trail_distance_points(),
            max_position_minutes: Self::default_max_position_minutes(),
            trail_breakeven_pct: Self::default_trail_breakeven_pct(),
            trail_lock_pct: Self::default_trail_lock_pct(),
            trail_lock_amount: Self::default_trail_lock_amount(),
            one_to_one_lock_profit_pct: Self::default_one_to_one_lock_profit_pct(),
            time_exit_slow_minutes: Self::default_time_exit_slow_minutes(),
            time_exit_slow_progress: Self::default_time_exit_slow_progress(),
            time_exit_max_minutes: Self::default_time_exit_max_minutes(),
            signal_reversal_min_confidence: Self::default_signal_reversal_min_confidence(),
        }
    }
}

/// `SignalValidator` normalization constants (SPEC_FULL.md §4.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidatorConfig {
    #[serde(default = "default_max_sl_points")]
    pub max_sl_points: f64,
    #[serde(default = "default_sl_points")]
    pub default_sl_points: f64,
    #[serde(default = "default_rr_ratio")]
    pub rr_ratio: f64,
    /// Base position-size-USD before `RiskClass::size_factor()` is applied.
    #[serde(default = "default_account_risk_usd")]
    pub account_risk_usd: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_sl_points: default_max_sl_points(),
            default_sl_points: default_sl_points(),
            rr_ratio: default_rr_ratio(),
            account_risk_usd: default_account_risk_usd(),
        }
    }
}

/// Monitoring loop cadences (SPEC_FULL.md §5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(default = "default_executor_interval_secs")]
    pub executor_secs: u64,
    #[serde(default = "default_position_manager_interval_secs")]
    pub position_manager_secs: u64,
    #[serde(default = "default_drop_detector_interval_secs")]
    pub drop_detector_secs: u64,
    #[serde(default = "default_alert_cooldown_secs")]
    pub alert_cooldown_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            executor_secs: default_executor_interval_secs(),
            position_manager_secs: default_position_manager_interval_secs(),
            drop_detector_secs: default_drop_detector_interval_secs(),
            alert_cooldown_secs: default_alert_cooldown_secs(),
        }
    }
}

/// Top-level runtime configuration for the scalping engine.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,

    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub risk: RiskConfigOverrides,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default = "default_okx_min_order_value_usd")]
    pub okx_min_order_value_usd: f64,

    /// Per-symbol MT4 contract size and leverage.
    #[serde(default)]
    pub mt4_symbol_config: HashMap<String, Mt4SymbolConfig>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            symbols: default_symbols(),
            risk: RiskConfigOverrides::default(),
            exit: ExitConfig::default(),
            validator: ValidatorConfig::default(),
            intervals: IntervalConfig::default(),
            okx_min_order_value_usd: default_okx_min_order_value_usd(),
            mt4_symbol_config: HashMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), symbols = ?config.symbols, trading_mode = %config.trading_mode, "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) to prevent corruption on crash.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
