use crate::bucket::{validate_cost, BucketKey, BucketPolicy, BucketState, Scope};
use crate::clock::{Clock, SystemClock};
use crate::config::FailurePolicy;
use crate::error::{AdmissionError, Result};
use crate::metrics::{AdmissionEvent, MetricsCollector};
use crate::store::BucketStore;
use crate::token_bucket::LocalTokenBucket;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on per-process fallback buckets kept while fail-open.
const MAX_FALLBACK_BUCKETS: usize = 10_000;

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateDecision {
    pub admitted: bool,
    pub remaining: f64,
    pub limit: f64,
    pub retry_after: Option<Duration>,
    /// Decided by the per-process fallback because the shared store failed.
    pub degraded: bool,
}

/// Token-bucket rate limiter over a shared [`BucketStore`].
///
/// Buckets are keyed `subject:scope`. The global scope gives one bucket per
/// subject across all endpoints; endpoint scopes give each (subject, endpoint)
/// pair its own bucket, so draining one route never starves another.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn BucketStore>,
    global_policy: BucketPolicy,
    endpoint_policy: BucketPolicy,
    endpoint_overrides: Arc<HashMap<String, BucketPolicy>>,
    failure_policy: FailurePolicy,
    backend_timeout: Duration,
    clock: Arc<dyn Clock>,
    fallback: Arc<Mutex<HashMap<String, Arc<LocalTokenBucket>>>>,
    metrics: MetricsCollector,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn BucketStore>, policy: BucketPolicy) -> Self {
        Self {
            store,
            global_policy: policy,
            endpoint_policy: policy,
            endpoint_overrides: Arc::new(HashMap::new()),
            failure_policy: FailurePolicy::Closed,
            backend_timeout: Duration::from_millis(250),
            clock: Arc::new(SystemClock::new()),
            fallback: Arc::new(Mutex::new(HashMap::new())),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_endpoint_policy(mut self, policy: BucketPolicy) -> Self {
        self.endpoint_policy = policy;
        self
    }

    /// Overrides capacity and refill rate for one endpoint scope.
    pub fn with_scope_policy(mut self, endpoint: impl Into<String>, policy: BucketPolicy) -> Self {
        Arc::make_mut(&mut self.endpoint_overrides).insert(endpoint.into(), policy);
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

    pub fn policy_for(&self, scope: &Scope) -> BucketPolicy {
        match scope {
            Scope::Global => self.global_policy,
            Scope::Endpoint(name) => self
                .endpoint_overrides
                .get(name)
                .copied()
                .unwrap_or(self.endpoint_policy),
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Debits `cost` tokens from the `(subject, scope)` bucket if available.
    pub async fn allow_request(&self, subject: &str, scope: &Scope, cost: f64) -> Result<RateDecision> {
        validate_cost(cost).map_err(AdmissionError::Validation)?;

        let key = BucketKey::new(subject, scope.clone()).to_string();
        let policy = self.policy_for(scope);
        let now = self.clock.now_nanos();

        let result = tokio::time::timeout(self.backend_timeout, self.store.try_debit(&key, &policy, cost, now)).await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => return self.on_backend_failure(subject, &key, &policy, cost, err.to_string()).await,
            Err(_) => {
                let reason = format!("bucket store timed out after {:?}", self.backend_timeout);
                return self.on_backend_failure(subject, &key, &policy, cost, reason).await;
            }
        };

        let event = if outcome.admitted {
            AdmissionEvent::Admitted
        } else {
            AdmissionEvent::Throttled
        };
        self.metrics.record(Some(subject), event).await;

        debug!(
            target: "gatekeeper::rate_limiter",
            subject = %subject,
            scope = %scope,
            admitted = outcome.admitted,
            remaining = outcome.remaining,
            "Rate limit checked"
        );

        Ok(RateDecision {
            admitted: outcome.admitted,
            remaining: outcome.remaining,
            limit: policy.capacity,
            retry_after: outcome.retry_after,
            degraded: false,
        })
    }

    /// Current state of a bucket after refill, without debiting.
    pub async fn bucket_state(&self, subject: &str, scope: &Scope) -> Result<BucketState> {
        let key = BucketKey::new(subject, scope.clone()).to_string();
        let policy = self.policy_for(scope);
        let now = self.clock.now_nanos();

        tokio::time::timeout(self.backend_timeout, self.store.read_and_refill(&key, &policy, now))
            .await
            .map_err(|_| AdmissionError::BackendUnavailable("bucket store timed out".to_string()))?
    }

    async fn on_backend_failure(
        &self,
        subject: &str,
        key: &str,
        policy: &BucketPolicy,
        cost: f64,
        reason: String,
    ) -> Result<RateDecision> {
        self.metrics.record(Some(subject), AdmissionEvent::BackendError).await;

        match self.failure_policy {
            FailurePolicy::Closed => {
                warn!(
                    target: "gatekeeper::rate_limiter",
                    key = %key,
                    error = %reason,
                    "Bucket store unavailable, rejecting request (fail-closed)"
                );
                Err(AdmissionError::BackendUnavailable(reason))
            }
            FailurePolicy::Open => {
                let bucket = self.fallback_bucket(key, policy);
                let outcome = bucket.try_acquire(cost);
                warn!(
                    target: "gatekeeper::rate_limiter",
                    key = %key,
                    error = %reason,
                    admitted = outcome.admitted,
                    "Bucket store unavailable, using local fallback bucket (fail-open)"
                );

                let event = if outcome.admitted {
                    AdmissionEvent::DegradedAdmission
                } else {
                    AdmissionEvent::Throttled
                };
                self.metrics.record(Some(subject), event).await;

                Ok(RateDecision {
                    admitted: outcome.admitted,
                    remaining: outcome.remaining,
                    limit: policy.capacity,
                    retry_after: outcome.retry_after,
                    degraded: true,
                })
            }
        }
    }

    fn fallback_bucket(&self, key: &str, policy: &BucketPolicy) -> Arc<LocalTokenBucket> {
        let mut buckets = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bucket) = buckets.get(key) {
            return Arc::clone(bucket);
        }
        if buckets.len() >= MAX_FALLBACK_BUCKETS {
            buckets.clear();
        }
        let bucket = Arc::new(LocalTokenBucket::with_clock(*policy, Arc::clone(&self.clock)));
        buckets.insert(key.to_string(), Arc::clone(&bucket));
        bucket
    }
}
