// =============================================================================
// ClockSource — the only source of "now" for the engine
// =============================================================================
//
// Every component that needs wall-clock time for a risk or exit decision goes
// through this trait instead of calling `chrono::Utc::now()` directly, so that
// tests can inject a fixed or steppable clock without sleeping.
// =============================================================================

use chrono::{DateTime, Utc};

/// Abstract source of wall-clock time.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// UTC calendar date of `now()`, formatted `YYYY-MM-DD`. Used by every
    /// daily-rollover check in [`crate::risk`].
    fn today(&self) -> String {
        self.now().format("%Y-%m-%d").to_string()
    }
}

/// Production clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that returns a fixed, externally-advanceable instant.
///
/// Used throughout the risk/position-manager test suites so that cooldown and
/// daily-pause windows can be exercised deterministically.
#[cfg(test)]
pub struct FakeClock {
    inner: parking_lot::RwLock<DateTime<Utc>>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: parking_lot::RwLock::new(start),
        }
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut inner = self.inner.write();
        *inner += d;
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.inner.write() = t;
    }
}

#[cfg(test)]
impl ClockSource for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.read()
    }
}
