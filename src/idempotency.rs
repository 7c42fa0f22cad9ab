//! Idempotency cache.
//!
//! Stores the complete response (status, headers, body) of a finished request
//! under the client-supplied key, so a retry is answered byte-for-byte without
//! running the handler again. The first successful writer for a key wins; a
//! live, valid record is never overwritten.

use crate::clock::{duration_to_nanos, Clock, SystemClock};
use crate::config::FailurePolicy;
use crate::error::{AdmissionError, Result};
use crate::metrics::{AdmissionEvent, MetricsCollector};
use crate::store::IdempotencyStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Unix nanoseconds.
    pub created_at: i64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.created_at.saturating_add(duration_to_nanos(self.ttl)) <= now
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| AdmissionError::Internal(format!("Failed to serialize record: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Storage key for a caller's idempotency key. Records are namespaced per
/// subject so one caller can never read another caller's response.
/// Idempotency keys contain no spaces, so the last space splits the two
/// parts unambiguously.
pub fn record_key(subject: &str, key: &str) -> String {
    format!("{} {}", subject, key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// A valid record already existed; it stays authoritative.
    AlreadyStored,
    /// A corrupt or logically expired entry was overwritten.
    Replaced,
}

/// Marker that this request owns the in-flight slot for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightClaim {
    key: String,
    token: String,
    held: bool,
}

impl InFlightClaim {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// `false` when the claim could not be recorded and fail-open let the
    /// request through anyway.
    pub fn is_held(&self) -> bool {
        self.held
    }
}

#[derive(Clone)]
pub struct IdempotencyCache {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    claim_ttl: Duration,
    failure_policy: FailurePolicy,
    backend_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            claim_ttl: Duration::from_secs(30),
            failure_policy: FailurePolicy::Closed,
            backend_timeout: Duration::from_millis(250),
            clock: Arc::new(SystemClock::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Builds a record for `key` stamped with the current time and cache TTL.
    pub fn record(&self, key: &str, status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.to_string(),
            status,
            headers,
            body,
            created_at: self.clock.now_nanos(),
            ttl: self.ttl,
        }
    }

    /// Returns the live record for `key`. Corrupt and expired entries are
    /// reported as misses.
    pub async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let bytes = match self.call(self.store.get(key)).await {
            Ok(bytes) => bytes,
            Err(err) => {
                self.metrics.record(None, AdmissionEvent::BackendError).await;
                return match self.failure_policy {
                    FailurePolicy::Open => {
                        warn!(
                            target: "gatekeeper::idempotency",
                            key = %key,
                            error = %err,
                            "Idempotency lookup failed, treating as miss (fail-open)"
                        );
                        Ok(None)
                    }
                    FailurePolicy::Closed => {
                        warn!(
                            target: "gatekeeper::idempotency",
                            key = %key,
                            error = %err,
                            "Idempotency lookup failed, rejecting request (fail-closed)"
                        );
                        Err(err)
                    }
                };
            }
        };

        let Some(bytes) = bytes else {
            return Ok(None);
        };

        match self.decode(key, &bytes) {
            Ok(record) if record.is_expired(self.clock.now_nanos()) => Ok(None),
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(
                    target: "gatekeeper::idempotency",
                    key = %key,
                    error = %err,
                    "Stored idempotency record is corrupt, treating as miss"
                );
                self.metrics.record(None, AdmissionEvent::CorruptRecord).await;
                Ok(None)
            }
        }
    }

    /// Persists `record` unless a valid one already exists for its key.
    pub async fn store(&self, record: &IdempotencyRecord) -> Result<StoreOutcome> {
        let key = record.key.as_str();
        let bytes = record.to_bytes()?;

        if self.call(self.store.put_if_absent(key, &bytes, record.ttl)).await? {
            debug!(target: "gatekeeper::idempotency", key = %key, status = record.status, "Stored idempotency record");
            return Ok(StoreOutcome::Stored);
        }

        let existing = self.call(self.store.get(key)).await?;
        let Some(existing) = existing else {
            // Expired between the two calls.
            let stored = self.call(self.store.put_if_absent(key, &bytes, record.ttl)).await?;
            return Ok(if stored {
                StoreOutcome::Stored
            } else {
                StoreOutcome::AlreadyStored
            });
        };

        let replaceable = match self.decode(key, &existing) {
            Ok(current) => current.is_expired(self.clock.now_nanos()),
            Err(_) => true,
        };

        if !replaceable {
            debug!(
                target: "gatekeeper::idempotency",
                key = %key,
                "Idempotency record already present, keeping the first one"
            );
            return Ok(StoreOutcome::AlreadyStored);
        }

        let replaced = self
            .call(self.store.replace_if_equals(key, &existing, &bytes, record.ttl))
            .await?;
        if replaced {
            warn!(target: "gatekeeper::idempotency", key = %key, "Overwrote unusable idempotency record");
            Ok(StoreOutcome::Replaced)
        } else {
            // Someone else replaced it first.
            Ok(StoreOutcome::AlreadyStored)
        }
    }

    /// Tries to take the in-flight slot for `key`. `Ok(None)` means another
    /// request holds it.
    pub async fn claim(&self, key: &str) -> Result<Option<InFlightClaim>> {
        let token = Uuid::new_v4().to_string();

        match self.call(self.store.claim(key, &token, self.claim_ttl)).await {
            Ok(true) => Ok(Some(InFlightClaim {
                key: key.to_string(),
                token,
                held: true,
            })),
            Ok(false) => Ok(None),
            Err(err) => {
                self.metrics.record(None, AdmissionEvent::BackendError).await;
                match self.failure_policy {
                    FailurePolicy::Open => {
                        warn!(
                            target: "gatekeeper::idempotency",
                            key = %key,
                            error = %err,
                            "Could not record in-flight claim, proceeding without it (fail-open)"
                        );
                        Ok(Some(InFlightClaim {
                            key: key.to_string(),
                            token,
                            held: false,
                        }))
                    }
                    FailurePolicy::Closed => Err(err),
                }
            }
        }
    }

    /// Frees the in-flight slot. Failures only delay reuse until the claim TTL
    /// lapses, so they are logged and swallowed.
    pub async fn release(&self, claim: InFlightClaim) {
        if !claim.held {
            return;
        }
        if let Err(err) = self.call(self.store.release(&claim.key, &claim.token)).await {
            error!(
                target: "gatekeeper::idempotency",
                key = %claim.key,
                error = %err,
                "Failed to release in-flight claim"
            );
        }
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<IdempotencyRecord> {
        let record = IdempotencyRecord::from_bytes(bytes)?;
        if record.key != key {
            return Err(AdmissionError::RecordCorrupt(format!(
                "record stored under '{}' belongs to '{}'",
                key, record.key
            )));
        }
        Ok(record)
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.backend_timeout, fut)
            .await
            .map_err(|_| {
                AdmissionError::BackendUnavailable(format!(
                    "idempotency store timed out after {:?}",
                    self.backend_timeout
                ))
            })?
    }
}
