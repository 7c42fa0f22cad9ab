//! Contracts every shared-state backend must satisfy.
//!
//! Both traits are written so that each method is one indivisible operation
//! at the backend. Implementations must never emulate them with a separate
//! read followed by a separate write.

use crate::bucket::{BucketPolicy, BucketState, DebitOutcome};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Applies the refill formula and returns the resulting state, persisting
    /// it in the same atomic step. Missing buckets start full.
    async fn read_and_refill(&self, key: &str, policy: &BucketPolicy, now: i64) -> Result<BucketState>;

    /// Refill, compare and subtract as a single atomic step.
    async fn try_debit(&self, key: &str, policy: &BucketPolicy, cost: f64, now: i64) -> Result<DebitOutcome>;

    /// Liveness probe used by readiness checks.
    async fn ping(&self) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the stored bytes, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create-if-absent. Returns `false` if a live entry already exists.
    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Replaces the entry only if it still holds exactly `expected`.
    async fn replace_if_equals(&self, key: &str, expected: &[u8], value: &[u8], ttl: Duration) -> Result<bool>;

    /// Takes the in-flight marker for `key`. Returns `false` if another
    /// request holds it.
    async fn claim(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Drops the in-flight marker, but only if it is still held by `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;
}
