//! In-process backend.
//!
//! Implements both store contracts with per-key locks. State lives in this
//! process only, so it is correct for a single instance and for tests, but
//! gives no guarantee across replicas.

use crate::bucket::{BucketPolicy, BucketState, DebitOutcome};
use crate::clock::{duration_to_nanos, Clock, SystemClock};
use crate::error::Result;
use crate::store::{BucketStore, IdempotencyStore};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: i64,
}

impl Entry {
    fn is_live(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

pub struct MemoryBackend {
    buckets: Mutex<HashMap<String, Arc<Mutex<BucketState>>>>,
    records: Mutex<HashMap<String, Entry>>,
    claims: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            records: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        lock(&self.buckets).len()
    }

    /// Drops expired records and claims, and buckets that have sat idle long
    /// enough to be full again. A dropped bucket is recreated full on next
    /// use, so this never changes a decision.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_nanos();
        let mut purged = 0;
        for map in [&self.records, &self.claims] {
            let mut entries = lock(map);
            let before = entries.len();
            entries.retain(|_, entry| entry.is_live(now));
            purged += before - entries.len();
        }

        let mut buckets = lock(&self.buckets);
        let before = buckets.len();
        // A bucket handed out under the map lock is still in use; keep it.
        buckets.retain(|_, bucket| Arc::strong_count(bucket) > 1 || !is_idle(&lock(bucket.as_ref()), now));
        purged + before - buckets.len()
    }

    fn bucket(&self, key: &str, policy: &BucketPolicy, now: i64) -> Arc<Mutex<BucketState>> {
        let mut buckets = lock(&self.buckets);
        Arc::clone(
            buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BucketState::full(policy, now)))),
        )
    }

    fn expires_at(&self, ttl: Duration) -> i64 {
        self.clock.now_nanos().saturating_add(duration_to_nanos(ttl))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn is_idle(state: &BucketState, now: i64) -> bool {
    state
        .idle_expiry()
        .is_some_and(|expiry| state.last_refill_at.saturating_add(duration_to_nanos(expiry)) <= now)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl BucketStore for MemoryBackend {
    async fn read_and_refill(&self, key: &str, policy: &BucketPolicy, now: i64) -> Result<BucketState> {
        let bucket = self.bucket(key, policy, now);
        let mut state = lock(&bucket);
        state.apply_policy(policy);
        state.refill(now);
        Ok(*state)
    }

    async fn try_debit(&self, key: &str, policy: &BucketPolicy, cost: f64, now: i64) -> Result<DebitOutcome> {
        let bucket = self.bucket(key, policy, now);
        let mut state = lock(&bucket);
        state.apply_policy(policy);
        Ok(state.try_debit(cost, now))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl IdempotencyStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now_nanos();
        let records = lock(&self.records);
        Ok(records
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let now = self.clock.now_nanos();
        let mut records = lock(&self.records);
        if records.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        records.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: self.expires_at(ttl),
            },
        );
        Ok(true)
    }

    async fn replace_if_equals(&self, key: &str, expected: &[u8], value: &[u8], ttl: Duration) -> Result<bool> {
        let now = self.clock.now_nanos();
        let mut records = lock(&self.records);
        match records.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                records.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_vec(),
                        expires_at: self.expires_at(ttl),
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_nanos();
        let mut claims = lock(&self.claims);
        if claims.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }
        claims.insert(
            key.to_string(),
            Entry {
                value: token.as_bytes().to_vec(),
                expires_at: self.expires_at(ttl),
            },
        );
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let mut claims = lock(&self.claims);
        if claims.get(key).is_some_and(|entry| entry.value == token.as_bytes()) {
            claims.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
