// =============================================================================
// KVStore — transient state: key/value+TTL, sorted sets, lists, pub-sub
// =============================================================================
//
// Backs the priority queue, the signal-validation cache, and the
// `MarketCondition` snapshot cache, plus the `market_drops` / `mt4_emergency`
// pub-sub channels. Unlike StateStore this data is not expected to survive a
// restart, so the in-process implementation here is the only one the engine
// ships — there is no durability layer underneath it.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Transient store used for priority-queue scoring, short-TTL caches, and
/// pub-sub fan-out between the detector, executor, and position manager.
#[async_trait]
pub trait KVStore: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn del(&self, key: &str) -> Result<()>;

    /// Add `member` to the sorted set `key` with `score`, replacing any
    /// existing entry for that member.
    async fn zadd(&self, key: &str, member: String, score: f64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    /// Highest-scored `limit` members, descending.
    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>>;
    async fn zcard(&self, key: &str) -> Result<usize>;

    async fn lpush(&self, key: &str, value: String) -> Result<()>;
    /// Pop from the tail (FIFO relative to `lpush`).
    async fn rpop(&self, key: &str) -> Result<Option<String>>;
    async fn llen(&self, key: &str) -> Result<usize>;

    /// Subscribe to a pub-sub channel. Returns a receiver; messages published
    /// before subscription are not delivered.
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;
    /// Publish to a channel. A channel with no subscribers silently drops the
    /// message, matching standard pub-sub semantics.
    fn publish(&self, channel: &str, message: String);
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// In-process `KVStore`. Sorted sets are kept as a plain `HashMap<member,
/// score>` per key; `zrevrange` sorts on read rather than maintaining a
/// separate ordered index, which is adequate at the queue depths this engine
/// runs at (single-digit to low hundreds of pending signals).
pub struct InProcessKVStore {
    kv: RwLock<HashMap<String, Entry>>,
    zsets: RwLock<HashMap<String, HashMap<String, f64>>>,
    lists: RwLock<HashMap<String, Vec<String>>>,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl Default for InProcessKVStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessKVStore {
    pub fn new() -> Self {
        Self {
            kv: RwLock::new(HashMap::new()),
            zsets: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn channel(&self, name: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.write();
        channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl KVStore for InProcessKVStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        self.kv.write().insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut kv = self.kv.write();
        match kv.get(key) {
            Some(entry) => {
                if let Some(expires_at) = entry.expires_at {
                    if Instant::now() >= expires_at {
                        kv.remove(key);
                        return Ok(None);
                    }
                }
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.kv.write().remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, member: String, score: f64) -> Result<()> {
        self.zsets
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        if let Some(set) = self.zsets.write().get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        let zsets = self.zsets.read();
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut ranked: BTreeMap<(i64, String), ()> = BTreeMap::new();
        for (member, score) in set.iter() {
            // Negate + fixed-point so the natural BTreeMap ascending order
            // yields descending score order.
            let key = (-(score * 1_000_000.0) as i64, member.clone());
            ranked.insert(key, ());
        }
        Ok(ranked
            .into_keys()
            .take(limit)
            .map(|(neg_score, member)| (member, -(neg_score as f64) / 1_000_000.0))
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        Ok(self.zsets.read().get(key).map(|s| s.len()).unwrap_or(0))
    }

    async fn lpush(&self, key: &str, value: String) -> Result<()> {
        self.lists
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(0, value);
        Ok(())
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lists.write().get_mut(key).and_then(|l| l.pop()))
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        Ok(self.lists.read().get(key).map(|l| l.len()).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.channel(channel).subscribe()
    }

    fn publish(&self, channel: &str, message: String) {
        let _ = self.channel(channel).send(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_roundtrip_and_ttl_expiry() {
        let store = InProcessKVStore::new();
        store.set("k", "v".to_string(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store
            .set("ttl", "v".to_string(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("ttl").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zset_ranks_descending_by_score() {
        let store = InProcessKVStore::new();
        store.zadd("q", "low".to_string(), 1.0).await.unwrap();
        store.zadd("q", "high".to_string(), 10.0).await.unwrap();
        store.zadd("q", "mid".to_string(), 5.0).await.unwrap();

        let top = store.zrevrange("q", 2).await.unwrap();
        assert_eq!(top[0].0, "high");
        assert_eq!(top[1].0, "mid");
        assert_eq!(store.zcard("q").await.unwrap(), 3);

        store.zrem("q", "high").await.unwrap();
        assert_eq!(store.zcard("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_is_fifo() {
        let store = InProcessKVStore::new();
        store.lpush("l", "a".to_string()).await.unwrap();
        store.lpush("l", "b".to_string()).await.unwrap();
        store.lpush("l", "c".to_string()).await.unwrap();

        assert_eq!(store.rpop("l").await.unwrap(), Some("a".to_string()));
        assert_eq!(store.rpop("l").await.unwrap(), Some("b".to_string()));
        assert_eq!(store.llen("l").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pub_sub_delivers_to_subscriber() {
        let store = InProcessKVStore::new();
        let mut rx = store.subscribe("market_drops");
        store.publish("market_drops", "BTCUSD:severe".to_string());
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, "BTCUSD:severe");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let store = InProcessKVStore::new();
        store.publish("nobody_listening", "x".to_string());
    }
}
