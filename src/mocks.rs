//! Store doubles for exercising failure handling in tests.

use crate::bucket::{BucketPolicy, BucketState, DebitOutcome};
use crate::error::{AdmissionError, Result};
use crate::memory::MemoryBackend;
use crate::store::{BucketStore, IdempotencyStore};
use async_trait::async_trait;
use std::time::Duration;

fn unavailable<T>() -> Result<T> {
    Err(AdmissionError::BackendUnavailable("connection refused".to_string()))
}

/// Every call fails as if the backend were unreachable.
pub struct UnavailableBackend;

#[async_trait]
impl BucketStore for UnavailableBackend {
    async fn read_and_refill(&self, _key: &str, _policy: &BucketPolicy, _now: i64) -> Result<BucketState> {
        unavailable()
    }

    async fn try_debit(&self, _key: &str, _policy: &BucketPolicy, _cost: f64, _now: i64) -> Result<DebitOutcome> {
        unavailable()
    }

    async fn ping(&self) -> Result<()> {
        unavailable()
    }

    fn backend_name(&self) -> &'static str {
        "unavailable"
    }
}

#[async_trait]
impl IdempotencyStore for UnavailableBackend {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        unavailable()
    }

    async fn put_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<bool> {
        unavailable()
    }

    async fn replace_if_equals(&self, _key: &str, _expected: &[u8], _value: &[u8], _ttl: Duration) -> Result<bool> {
        unavailable()
    }

    async fn claim(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool> {
        unavailable()
    }

    async fn release(&self, _key: &str, _token: &str) -> Result<bool> {
        unavailable()
    }
}

/// Answers correctly, but only after `delay`.
pub struct SlowBackend {
    inner: MemoryBackend,
    delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryBackend::new(),
            delay,
        }
    }
}

#[async_trait]
impl BucketStore for SlowBackend {
    async fn read_and_refill(&self, key: &str, policy: &BucketPolicy, now: i64) -> Result<BucketState> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_and_refill(key, policy, now).await
    }

    async fn try_debit(&self, key: &str, policy: &BucketPolicy, cost: f64, now: i64) -> Result<DebitOutcome> {
        tokio::time::sleep(self.delay).await;
        self.inner.try_debit(key, policy, cost, now).await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}

#[async_trait]
impl IdempotencyStore for SlowBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_if_absent(key, value, ttl).await
    }

    async fn replace_if_equals(&self, key: &str, expected: &[u8], value: &[u8], ttl: Duration) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.replace_if_equals(key, expected, value, ttl).await
    }

    async fn claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.claim(key, token, ttl).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.inner.release(key, token).await
    }
}

/// Reads and claims work, record writes always fail.
pub struct ReadOnlyBackend {
    inner: MemoryBackend,
}

impl ReadOnlyBackend {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
        }
    }
}

#[async_trait]
impl IdempotencyStore for ReadOnlyBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put_if_absent(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<bool> {
        unavailable()
    }

    async fn replace_if_equals(&self, _key: &str, _expected: &[u8], _value: &[u8], _ttl: Duration) -> Result<bool> {
        unavailable()
    }

    async fn claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.inner.claim(key, token, ttl).await
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        self.inner.release(key, token).await
    }
}
