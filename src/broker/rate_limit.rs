// =============================================================================
// Order Rate Limiter — shared discipline across MT4, OKX, Binance
// =============================================================================
//
// Generalizes the Binance-specific weight tracker into a venue-agnostic
// token-bucket: every adapter gets a 10-second order cap and a daily order
// cap, checked before the order is sent and incremented once it is. Venues
// whose response headers carry live usage (Binance) additionally feed that
// back in; venues that don't (MT4, OKX) rely solely on the local counters.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Maximum orders per 10-second window, per broker connection.
const ORDER_10S_LIMIT: u32 = 10;
/// Maximum orders per day, per broker connection.
const ORDER_1D_LIMIT: u32 = 200_000;

/// Thread-safe per-adapter order-rate tracker.
pub struct OrderRateLimiter {
    order_count_10s: AtomicU32,
    order_count_1d: AtomicU32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub order_count_10s: u32,
    pub order_count_1d: u32,
}

impl OrderRateLimiter {
    pub fn new() -> Self {
        Self {
            order_count_10s: AtomicU32::new(0),
            order_count_1d: AtomicU32::new(0),
        }
    }

    /// `true` if another order may be sent without violating the 10 s or
    /// daily cap.
    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        let count_1d = self.order_count_1d.load(Ordering::Relaxed);

        if count_10s >= ORDER_10S_LIMIT {
            warn!(count_10s, limit = ORDER_10S_LIMIT, "order blocked — 10s order limit reached");
            return false;
        }
        if count_1d >= ORDER_1D_LIMIT {
            warn!(count_1d, limit = ORDER_1D_LIMIT, "order blocked — daily order limit reached");
            return false;
        }
        true
    }

    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
        self.order_count_1d.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset_10s_counter(&self) {
        self.order_count_10s.store(0, Ordering::Relaxed);
    }

    pub fn reset_daily_counter(&self) {
        self.order_count_1d.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1d: self.order_count_1d.load(Ordering::Relaxed),
        }
    }
}

impl Default for OrderRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OrderRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderRateLimiter")
            .field("order_count_10s", &self.order_count_10s.load(Ordering::Relaxed))
            .field("order_count_1d", &self.order_count_1d.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_once_10s_cap_reached() {
        let limiter = OrderRateLimiter::new();
        for _ in 0..ORDER_10S_LIMIT {
            assert!(limiter.can_place_order());
            limiter.record_order_sent();
        }
        assert!(!limiter.can_place_order());
        limiter.reset_10s_counter();
        assert!(limiter.can_place_order());
    }
}
