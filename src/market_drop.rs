// =============================================================================
// MarketDropDetector — ring-buffer price history and drop classification
// =============================================================================
//
// Keeps a small in-memory ring buffer of recent price samples per symbol
// (seeded from 1-minute bars, then appended to on each detector tick) and,
// on every tick, looks back to the samples nearest 60s/180s/300s ago to
// derive 1m/3m/5m percentage changes and a velocity figure. Classification
// follows SPEC_FULL.md §4.6: severe on a ≤ -5% move over 3m or 5m, moderate
// on a ≤ -2% move over 1m or 3m, otherwise none. A `DropAlert` publish is
// gated by a per-symbol cooldown so one sustained drop does not flood the
// `market_drops` channel.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::broker::BrokerAdapter;
use crate::clock::ClockSource;
use crate::kvstore::KVStore;
use crate::statestore::model::{DropAlert, MarketCondition};
use crate::types::DropLevel;

const RING_CAPACITY: usize = 60;
const LOOKBACK_TOLERANCE_SECS: i64 = 30;
const MODERATE_PCT: f64 = -2.0;
const SEVERE_PCT: f64 = -5.0;
const CONDITION_TTL_SECS: u64 = 60;
const HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: DateTime<Utc>,
    price: f64,
}

pub struct MarketDropDetector {
    clock: Arc<dyn ClockSource>,
    broker: Arc<dyn BrokerAdapter>,
    kv: Arc<dyn KVStore>,
    alert_cooldown: StdDuration,

    history: RwLock<HashMap<String, VecDeque<Sample>>>,
    last_alert_at: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MarketDropDetector {
    pub fn new(
        clock: Arc<dyn ClockSource>,
        broker: Arc<dyn BrokerAdapter>,
        kv: Arc<dyn KVStore>,
        alert_cooldown: StdDuration,
    ) -> Self {
        Self {
            clock,
            broker,
            kv,
            alert_cooldown,
            history: RwLock::new(HashMap::new()),
            last_alert_at: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds a symbol's ring buffer from historical 1-minute closes, oldest
    /// first. Used at startup so the first few detector ticks already have a
    /// useful lookback window instead of waiting ~5 minutes to fill live.
    pub fn seed(&self, symbol: &str, bars: impl IntoIterator<Item = (DateTime<Utc>, f64)>) {
        let mut history = self.history.write();
        let ring = history.entry(symbol.to_string()).or_insert_with(|| VecDeque::with_capacity(RING_CAPACITY));
        for (at, price) in bars {
            push_bounded(ring, Sample { at, price }, RING_CAPACITY);
        }
    }

    /// One detector tick for `symbol`: fetch the current price, append to the
    /// ring buffer, classify, persist the `MarketCondition` snapshot, and
    /// publish a `DropAlert` if the classification is non-`None` and the
    /// per-symbol cooldown has elapsed.
    #[instrument(skip(self), fields(symbol))]
    pub async fn tick(&self, symbol: &str) -> anyhow::Result<MarketCondition> {
        let price = self.broker.current_price(symbol).await?;
        let now = self.clock.now();

        let condition = {
            let mut history = self.history.write();
            let ring = history.entry(symbol.to_string()).or_insert_with(|| VecDeque::with_capacity(RING_CAPACITY));
            push_bounded(ring, Sample { at: now, price }, RING_CAPACITY);
            let mut c = classify(ring, now, price);
            c.symbol = symbol.to_string();
            c
        };

        let payload = serde_json::to_string(&condition)?;
        self.kv
            .set(
                &format!("market_condition:{symbol}"),
                payload,
                Some(StdDuration::from_secs(CONDITION_TTL_SECS)),
            )
            .await?;
        self.kv
            .zadd(&format!("market_condition_history:{symbol}"), now.to_rfc3339(), now.timestamp() as f64)
            .await?;
        self.trim_history(symbol).await?;

        if condition.drop_level != DropLevel::None && self.should_alert(symbol, now) {
            let alert = DropAlert {
                symbol: symbol.to_string(),
                drop_level: condition.drop_level,
                price_change_1m: condition.price_change_1m,
                price_change_3m: condition.price_change_3m,
                price_change_5m: condition.price_change_5m,
                velocity: condition.velocity,
                timestamp: now,
            };
            match serde_json::to_string(&alert) {
                Ok(msg) => {
                    self.kv.publish("market_drops", msg);
                    self.last_alert_at.write().insert(symbol.to_string(), now);
                    debug!(symbol, level = %condition.drop_level, "drop alert published");
                }
                Err(e) => warn!(error = %e, "failed to serialise drop alert"),
            }
        }

        Ok(condition)
    }

    fn should_alert(&self, symbol: &str, now: DateTime<Utc>) -> bool {
        let last = self.last_alert_at.read().get(symbol).copied();
        match last {
            Some(prev) => (now - prev).num_seconds() >= self.alert_cooldown.as_secs() as i64,
            None => true,
        }
    }

    async fn trim_history(&self, symbol: &str) -> anyhow::Result<()> {
        let key = format!("market_condition_history:{symbol}");
        while self.kv.zcard(&key).await? > HISTORY_CAP {
            let oldest = self.kv.zrevrange(&key, self.kv.zcard(&key).await?).await?;
            if let Some((member, _)) = oldest.last() {
                self.kv.zrem(&key, member).await?;
            } else {
                break;
            }
        }
        Ok(())
    }
}

fn push_bounded(ring: &mut VecDeque<Sample>, sample: Sample, capacity: usize) {
    ring.push_back(sample);
    while ring.len() > capacity {
        ring.pop_front();
    }
}

/// Finds the sample closest to `now - lookback`, accepting it only if within
/// `LOOKBACK_TOLERANCE_SECS` of the target — otherwise the window is treated
/// as not-yet-available and the percentage change is reported as zero.
fn closest_sample(ring: &VecDeque<Sample>, now: DateTime<Utc>, lookback_secs: i64) -> Option<Sample> {
    let target = now - chrono::Duration::seconds(lookback_secs);
    ring.iter()
        .min_by_key(|s| (s.at - target).num_seconds().abs())
        .filter(|s| (s.at - target).num_seconds().abs() <= LOOKBACK_TOLERANCE_SECS)
        .copied()
}

fn pct_change(from: f64, to: f64) -> f64 {
    if from == 0.0 {
        return 0.0;
    }
    ((to - from) / from) * 100.0
}

fn classify(ring: &VecDeque<Sample>, now: DateTime<Utc>, current_price: f64) -> MarketCondition {
    let change_1m = closest_sample(ring, now, 60).map(|s| pct_change(s.price, current_price)).unwrap_or(0.0);
    let change_3m = closest_sample(ring, now, 180).map(|s| pct_change(s.price, current_price)).unwrap_or(0.0);
    let change_5m = closest_sample(ring, now, 300).map(|s| pct_change(s.price, current_price)).unwrap_or(0.0);

    let oldest = ring.front().copied();
    let velocity = match oldest {
        Some(s) if s.at != now => pct_change(s.price, current_price) / ((now - s.at).num_seconds().max(1) as f64),
        _ => 0.0,
    };

    let drop_level = if change_3m <= SEVERE_PCT || change_5m <= SEVERE_PCT {
        DropLevel::Severe
    } else if change_1m <= MODERATE_PCT || change_3m <= MODERATE_PCT {
        DropLevel::Moderate
    } else {
        DropLevel::None
    };

    MarketCondition {
        symbol: String::new(),
        current_price,
        price_change_1m: change_1m,
        price_change_3m: change_3m,
        price_change_5m: change_5m,
        volume_change: 0.0,
        velocity,
        drop_level,
        timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountSnapshot, InstrumentInfo, LivePosition, OrderReceipt};
    use crate::clock::FakeClock;
    use crate::errors::EngineError;
    use crate::kvstore::InProcessKVStore;
    use crate::types::Side;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedBroker {
        prices: Vec<f64>,
        idx: AtomicUsize,
    }

    #[async_trait]
    impl BrokerAdapter for ScriptedBroker {
        fn name(&self) -> &'static str {
            "FAKE"
        }
        async fn current_price(&self, _symbol: &str) -> Result<f64, EngineError> {
            let i = self.idx.fetch_add(1, Ordering::SeqCst);
            Ok(self.prices[i.min(self.prices.len() - 1)])
        }
        async fn account(&self) -> Result<AccountSnapshot, EngineError> {
            unimplemented!()
        }
        async fn open_positions(&self) -> Result<Vec<LivePosition>, EngineError> {
            Ok(vec![])
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
        async fn modify_stop_loss(&self, _t: &str, _sl: f64) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn close_position(&self, _t: &str) -> Result<(), EngineError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn classifies_severe_drop_over_three_minutes() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let broker = Arc::new(ScriptedBroker { prices: vec![94.0], idx: AtomicUsize::new(0) });
        let kv = Arc::new(InProcessKVStore::new());
        let detector = MarketDropDetector::new(clock.clone(), broker, kv.clone(), StdDuration::from_secs(60));

        let seed_time = clock.now() - Duration::seconds(180);
        detector.seed("BTCUSD", vec![(seed_time, 100.0)]);

        let condition = detector.tick("BTCUSD").await.unwrap();
        assert_eq!(condition.drop_level, DropLevel::Severe);
    }

    #[tokio::test]
    async fn no_drop_when_price_is_flat() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let broker = Arc::new(ScriptedBroker { prices: vec![100.0], idx: AtomicUsize::new(0) });
        let kv = Arc::new(InProcessKVStore::new());
        let detector = MarketDropDetector::new(clock.clone(), broker, kv, StdDuration::from_secs(60));

        let seed_time = clock.now() - Duration::seconds(60);
        detector.seed("ETHUSD", vec![(seed_time, 100.0)]);

        let condition = detector.tick("ETHUSD").await.unwrap();
        assert_eq!(condition.drop_level, DropLevel::None);
    }

    #[tokio::test]
    async fn alert_respects_cooldown() {
        let clock = Arc::new(FakeClock::new(Utc::now()));
        let broker = Arc::new(ScriptedBroker { prices: vec![90.0, 90.0], idx: AtomicUsize::new(0) });
        let kv = Arc::new(InProcessKVStore::new());
        let detector = MarketDropDetector::new(clock.clone(), broker, kv.clone(), StdDuration::from_secs(60));

        let seed_time = clock.now() - Duration::seconds(180);
        detector.seed("BTCUSD", vec![(seed_time, 100.0)]);

        let mut rx = kv.subscribe("market_drops");
        detector.tick("BTCUSD").await.unwrap();
        assert!(rx.try_recv().is_ok());

        detector.tick("BTCUSD").await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
