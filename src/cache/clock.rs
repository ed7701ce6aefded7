//! Clock Sources
//!
//! Wall-clock time for TTL and recency bookkeeping. Tiers never call
//! `Utc::now()` directly so expiry can be driven deterministically.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time
    fn now(&self) -> DateTime<Utc>;
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the current system time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = add(*now, by);
    }

    /// Set the clock to an absolute time
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Default shared system clock
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// Elapsed time from `since` to `now`, zero if `since` lies in the future
#[inline]
pub fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or_default()
}

/// `at + by`, saturating at the maximum representable time
#[inline]
pub fn add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
