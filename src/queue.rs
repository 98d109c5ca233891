// =============================================================================
// PriorityQueue — two-tier drain over validated signals
// =============================================================================
//
// Backed by two KVStore sorted sets: `fibonacci-priority` for
// `Category::FibonacciScalping` signals and `validated` for everything else.
// Members are scored by insertion timestamp (seconds since epoch) so
// `zrevrange` naturally yields newest-first; the Executor drains oldest-first
// by reading the tail, which `KVStore::zrevrange` does not expose directly —
// instead the queue requests `N` entries and reverses locally, since depth at
// any moment is small (single digits to low hundreds).
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::kvstore::KVStore;
use crate::statestore::model::ValidatedSignal;

const FIBONACCI_KEY: &str = "queue:fibonacci-priority";
const VALIDATED_KEY: &str = "queue:validated";
const PAYLOAD_PREFIX: &str = "queue:payload:";

pub struct PriorityQueue {
    kv: Arc<dyn KVStore>,
}

impl PriorityQueue {
    pub fn new(kv: Arc<dyn KVStore>) -> Self {
        Self { kv }
    }

    /// Enqueues a validated, tradeable signal. Rejected/invalid signals never
    /// reach the queue — the caller logs them directly as terminal
    /// `SignalLog` rows.
    #[instrument(skip(self, signal), fields(signal_id = %signal.candidate.signal_id))]
    pub async fn enqueue(&self, signal: ValidatedSignal, enqueued_at_epoch_secs: f64) -> Result<()> {
        let key = if signal.candidate.category.is_priority() { FIBONACCI_KEY } else { VALIDATED_KEY };
        let signal_id = signal.candidate.signal_id.clone();

        let payload = serde_json::to_string(&signal)?;
        self.kv
            .set(&format!("{PAYLOAD_PREFIX}{signal_id}"), payload, None)
            .await?;
        self.kv.zadd(key, signal_id.clone(), enqueued_at_epoch_secs).await?;

        debug!(signal_id, key, "signal enqueued");
        Ok(())
    }

    /// Drains up to `n` signals for one Executor pass: `ceil(n/2)` from the
    /// fibonacci-priority set first (oldest first), then fills the remainder
    /// from the standard validated set, also oldest first.
    #[instrument(skip(self))]
    pub async fn drain(&self, n: usize) -> Result<Vec<ValidatedSignal>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let priority_quota = (n + 1) / 2;
        let mut out = Vec::with_capacity(n);

        let priority_ids = self.pop_oldest(FIBONACCI_KEY, priority_quota).await?;
        out.extend(self.load_payloads(FIBONACCI_KEY, priority_ids).await?);

        let remainder = n.saturating_sub(out.len());
        if remainder > 0 {
            let validated_ids = self.pop_oldest(VALIDATED_KEY, remainder).await?;
            out.extend(self.load_payloads(VALIDATED_KEY, validated_ids).await?);
        }

        debug!(drained = out.len(), requested = n, "queue drained");
        Ok(out)
    }

    pub async fn depth(&self) -> Result<(usize, usize)> {
        Ok((self.kv.zcard(FIBONACCI_KEY).await?, self.kv.zcard(VALIDATED_KEY).await?))
    }

    /// `zrevrange` returns highest-score-first (newest); since score is
    /// enqueue time, the oldest entries we want to drain are at the *end* of
    /// that list, not the start. We ask for everything currently in the set
    /// and take from the tail, bounded by `limit`.
    async fn pop_oldest(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let total = self.kv.zcard(key).await?;
        if total == 0 {
            return Ok(Vec::new());
        }
        let all = self.kv.zrevrange(key, total).await?;
        let take = limit.min(all.len());
        let oldest = &all[all.len() - take..];

        let mut ids = Vec::with_capacity(take);
        for (member, _score) in oldest {
            self.kv.zrem(key, member).await?;
            ids.push(member.clone());
        }
        Ok(ids)
    }

    async fn load_payloads(&self, _key: &str, ids: Vec<String>) -> Result<Vec<ValidatedSignal>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let payload_key = format!("{PAYLOAD_PREFIX}{id}");
            if let Some(raw) = self.kv.get(&payload_key).await? {
                match serde_json::from_str(&raw) {
                    Ok(signal) => out.push(signal),
                    Err(e) => debug!(id, error = %e, "dropping malformed queued signal payload"),
                }
                self.kv.del(&payload_key).await?;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::InProcessKVStore;
    use crate::statestore::model::{CandidateSignal, LlmVotes};
    use crate::types::{Category, Recommendation, RiskClass};

    fn signal(id: &str, category: Category) -> ValidatedSignal {
        ValidatedSignal {
            candidate: CandidateSignal {
                signal_id: id.to_string(),
                agent_id: "agent-1".to_string(),
                symbol: "BTCUSD".to_string(),
                recommendation: Recommendation::Buy,
                category,
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

    #[tokio::test]
    async fn drains_priority_quota_before_standard() {
        let kv = Arc::new(InProcessKVStore::new());
        let queue = PriorityQueue::new(kv);

        queue.enqueue(signal("fib-1", Category::FibonacciScalping), 1.0).await.unwrap();
        queue.enqueue(signal("fib-2", Category::FibonacciScalping), 2.0).await.unwrap();
        queue.enqueue(signal("std-1", Category::Momentum), 3.0).await.unwrap();
        queue.enqueue(signal("std-2", Category::Momentum), 4.0).await.unwrap();

        let drained = queue.drain(4).await.unwrap();
        let ids: Vec<_> = drained.iter().map(|s| s.candidate.signal_id.clone()).collect();

        assert!(ids.contains(&"fib-1".to_string()));
        assert!(ids.contains(&"fib-2".to_string()));
        assert!(ids.contains(&"std-1".to_string()));
        assert!(ids.contains(&"std-2".to_string()));
    }

    #[tokio::test]
    async fn drains_oldest_first_within_a_tier() {
        let kv = Arc::new(InProcessKVStore::new());
        let queue = PriorityQueue::new(kv);

        queue.enqueue(signal("old", Category::Momentum), 1.0).await.unwrap();
        queue.enqueue(signal("new", Category::Momentum), 100.0).await.unwrap();

        let drained = queue.drain(1).await.unwrap();
        assert_eq!(drained[0].candidate.signal_id, "old");
    }

    #[tokio::test]
    async fn drain_is_empty_when_queue_is_empty() {
        let kv = Arc::new(InProcessKVStore::new());
        let queue = PriorityQueue::new(kv);
        let drained = queue.drain(5).await.unwrap();
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn fills_remainder_from_standard_when_priority_exhausted() {
        let kv = Arc::new(InProcessKVStore::new());
        let queue = PriorityQueue::new(kv);

        queue.enqueue(signal("fib-1", Category::FibonacciScalping), 1.0).await.unwrap();
        queue.enqueue(signal("std-1", Category::Momentum), 2.0).await.unwrap();
        queue.enqueue(signal("std-2", Category::Momentum), 3.0).await.unwrap();

        let drained = queue.drain(3).await.unwrap();
        assert_eq!(drained.len(), 3);
    }
}
