//! Time sources.
//!
//! Bucket state and idempotency records store wall-clock time as Unix
//! nanoseconds so that every replica can interpret them. `MockClock` lets
//! tests drive time explicitly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Source of the current time in Unix nanoseconds.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

/// Clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default()
    }
}

/// Manually driven clock. Clones share the same time value.
#[derive(Debug, Clone)]
pub struct MockClock {
    current: Arc<AtomicI64>,
}

impl MockClock {
    pub fn new(start_nanos: i64) -> Self {
        Self {
            current: Arc::new(AtomicI64::new(start_nanos)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.current
            .fetch_add(duration.as_nanos() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: i64) {
        self.current.store(nanos, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for MockClock {
    fn now_nanos(&self) -> i64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// Converts a duration to nanoseconds, saturating at `i64::MAX`.
pub fn duration_to_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
