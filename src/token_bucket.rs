//! Single-process token bucket.
//!
//! Every read-modify-write happens under one mutex, so concurrent callers in
//! the same process never observe a torn update. There is no cross-process
//! guarantee: run more than one replica and each gets its own full quota.
//! Use [`crate::rate_limiter::RateLimiter`] over a shared store for that.

use crate::bucket::{BucketPolicy, BucketState, DebitOutcome};
use crate::clock::{Clock, SystemClock};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub struct LocalTokenBucket {
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
}

impl LocalTokenBucket {
    pub fn new(policy: BucketPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(policy: BucketPolicy, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_nanos();
        Self {
            state: Mutex::new(BucketState::full(&policy, now)),
            clock,
        }
    }

    /// Admits `cost` tokens of work if available.
    pub fn allow(&self, cost: f64) -> bool {
        self.try_acquire(cost).admitted
    }

    pub fn try_acquire(&self, cost: f64) -> DebitOutcome {
        let mut state = self.lock();
        let now = self.clock.now_nanos();
        state.try_debit(cost, now)
    }

    pub fn available_tokens(&self) -> f64 {
        let mut state = self.lock();
        state.refill(self.clock.now_nanos());
        state.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.lock().capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.lock().refill_rate
    }

    pub fn time_until_available(&self, cost: f64) -> Option<Duration> {
        let mut state = self.lock();
        state.refill(self.clock.now_nanos());
        state.time_until_available(cost)
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // The state is plain data; a panic mid-update cannot leave it
        // outside its bounds because every mutation re-clamps.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn bucket(capacity: f64, rate: f64) -> (LocalTokenBucket, MockClock) {
        let clock = MockClock::new(0);
        let bucket = LocalTokenBucket::with_clock(BucketPolicy::new(capacity, rate), Arc::new(clock.clone()));
        (bucket, clock)
    }

    #[test]
    fn test_token_bucket_creation() {
        let (bucket, _) = bucket(10.0, 2.0);
        assert_eq!(bucket.capacity(), 10.0);
        assert_eq!(bucket.refill_rate(), 2.0);
        assert_eq!(bucket.available_tokens(), 10.0);
    }

    #[test]
    fn test_token_consumption() {
        let (bucket, _) = bucket(10.0, 2.0);
        assert!(bucket.allow(5.0));
        assert_eq!(bucket.available_tokens(), 5.0);
        assert!(bucket.allow(5.0));
        assert_eq!(bucket.available_tokens(), 0.0);
        assert!(!bucket.allow(1.0));
    }

    #[test]
    fn test_scenario_three_then_refill() {
        let (bucket, clock) = bucket(3.0, 1.0);

        assert!(bucket.allow(1.0));
        assert!(bucket.allow(1.0));
        assert!(bucket.allow(1.0));
        assert!(!bucket.allow(1.0));

        clock.advance(Duration::from_secs(1));
        assert!(bucket.allow(1.0));
        assert_eq!(bucket.available_tokens(), 0.0);
        assert!(!bucket.allow(1.0));
    }

    #[test]
    fn test_capacity_overflow_prevention() {
        let (bucket, clock) = bucket(5.0, 1000.0);
        bucket.allow(3.0);

        clock.advance(Duration::from_millis(10));
        assert_eq!(bucket.available_tokens(), 5.0);
    }

    #[test]
    fn test_time_until_available() {
        let (bucket, _) = bucket(4.0, 2.0);
        assert!(bucket.allow(4.0));
        assert_eq!(bucket.time_until_available(1.0), Some(Duration::from_millis(500)));
        assert_eq!(bucket.time_until_available(5.0), None);
    }

    #[test]
    fn test_concurrent_callers_share_one_token() {
        let (bucket, _) = bucket(1.0, 0.0);
        let bucket = Arc::new(bucket);
        let admitted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || {
                    if bucket.allow(1.0) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(bucket.available_tokens(), 0.0);
    }
}
