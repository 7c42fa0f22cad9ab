//! Needs a running Redis: `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`

use gatekeeper::bucket::{BucketPolicy, Scope};
use gatekeeper::clock::NANOS_PER_SEC;
use gatekeeper::idempotency::{IdempotencyCache, StoreOutcome};
use gatekeeper::rate_limiter::RateLimiter;
use gatekeeper::redis_backend::{RedisBackend, RedisBackendConfig};
use gatekeeper::store::{BucketStore, IdempotencyStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn backend() -> RedisBackend {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    // A fresh prefix per test keeps runs independent without FLUSHDB.
    let config = RedisBackendConfig {
        key_prefix: format!("gatekeeper-test:{}:", Uuid::new_v4()),
    };
    RedisBackend::connect_with_config(&url, config).await.unwrap()
}

#[tokio::test]
#[ignore]
async fn test_bucket_script_matches_scenario() {
    let backend = backend().await;
    let policy = BucketPolicy::new(3.0, 1.0);
    let start = 1_700_000_000 * NANOS_PER_SEC;

    for i in 0..3 {
        let outcome = backend.try_debit("u1:global", &policy, 1.0, start + i).await.unwrap();
        assert!(outcome.admitted);
    }
    let denied = backend.try_debit("u1:global", &policy, 1.0, start + 3).await.unwrap();
    assert!(!denied.admitted);
    assert!(denied.retry_after.unwrap() <= Duration::from_secs(1));

    let later = start + NANOS_PER_SEC + 3;
    assert!(backend.try_debit("u1:global", &policy, 1.0, later).await.unwrap().admitted);
}

#[tokio::test]
#[ignore]
async fn test_refill_never_moves_backwards() {
    let backend = backend().await;
    let policy = BucketPolicy::new(3.0, 1.0);
    let now = 1_700_000_000 * NANOS_PER_SEC;

    backend.try_debit("u1:global", &policy, 3.0, now).await.unwrap();
    let skewed = backend.read_and_refill("u1:global", &policy, now - NANOS_PER_SEC).await.unwrap();

    assert_eq!(skewed.last_refill_at, now);
    assert_eq!(skewed.tokens, 0.0);
}

#[tokio::test]
#[ignore]
async fn test_concurrent_debits_are_atomic() {
    let backend = Arc::new(backend().await);
    let limiter = RateLimiter::new(backend, BucketPolicy::new(5.0, 0.0));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow_request("u1", &Scope::Global, 1.0).await.unwrap() })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap().admitted {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}

#[tokio::test]
#[ignore]
async fn test_first_writer_wins() {
    let backend = Arc::new(backend().await);
    let cache = IdempotencyCache::new(backend, Duration::from_secs(60));

    let first = cache.record("abc123", 201, BTreeMap::new(), b"first".to_vec());
    let second = cache.record("abc123", 201, BTreeMap::new(), b"second".to_vec());

    assert_eq!(cache.store(&first).await.unwrap(), StoreOutcome::Stored);
    assert_eq!(cache.store(&second).await.unwrap(), StoreOutcome::AlreadyStored);
    assert_eq!(cache.lookup("abc123").await.unwrap().unwrap().body, b"first".to_vec());
}

#[tokio::test]
#[ignore]
async fn test_claims_and_release() {
    let backend = backend().await;

    assert!(backend.claim("abc123", "token-a", Duration::from_secs(30)).await.unwrap());
    assert!(!backend.claim("abc123", "token-b", Duration::from_secs(30)).await.unwrap());
    assert!(!backend.release("abc123", "token-b").await.unwrap());
    assert!(backend.release("abc123", "token-a").await.unwrap());
    assert!(backend.claim("abc123", "token-b", Duration::from_secs(30)).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_replace_if_equals() {
    let backend = backend().await;
    let ttl = Duration::from_secs(60);

    backend.put_if_absent("abc123", b"garbage", ttl).await.unwrap();
    assert!(!backend.replace_if_equals("abc123", b"other", b"new", ttl).await.unwrap());
    assert!(backend.replace_if_equals("abc123", b"garbage", b"new", ttl).await.unwrap());
    assert_eq!(backend.get("abc123").await.unwrap(), Some(b"new".to_vec()));
}

#[tokio::test]
#[ignore]
async fn test_ping() {
    assert!(backend().await.ping().await.is_ok());
}
