//! Admission pipeline.
//!
//! Per request: idempotency-key check, idempotency lookup, in-flight claim,
//! rate-limit check, downstream call, idempotency store. Lookup runs before
//! the rate check so a retry of completed work never spends quota, and the
//! claim is taken before the rate check so a duplicate that is turned away
//! does not spend it either.
//!
//! Everything after the claim runs on its own task, so a caller that
//! disconnects mid-request still gets its response stored and the claim
//! released, and its retry is replayed instead of executed again.

use crate::config::DuplicateInFlightPolicy;
use crate::error::{AdmissionError, Result};
use crate::idempotency::{record_key, IdempotencyCache, IdempotencyRecord, InFlightClaim, StoreOutcome};
use crate::metrics::{AdmissionEvent, MetricsCollector};
use crate::rate_limiter::RateLimiter;
use crate::routes::{RoutePolicy, RouteRegistry};
use crate::validation::RequestValidator;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What the pipeline needs to know about an inbound request.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub subject: String,
    pub route: String,
    pub idempotency_key: Option<String>,
    /// Caller deadline. Defaults to now plus the configured request timeout.
    pub deadline: Option<Instant>,
}

impl InboundRequest {
    pub fn new(subject: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            route: route.into(),
            idempotency_key: None,
            deadline: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Joins the values of a repeated header in [`CapturedResponse::headers`].
pub const REPEATED_HEADER_SEPARATOR: char = '\n';

/// Response produced by the downstream handler, or replayed from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl CapturedResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl From<IdempotencyRecord> for CapturedResponse {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            status: record.status,
            headers: record.headers,
            body: record.body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Replayed from the idempotency cache; the handler did not run.
    Cached,
    /// The handler ran for this request.
    Fresh,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Served {
        response: CapturedResponse,
        source: ResponseSource,
    },
    Rejected {
        retry_after: Option<Duration>,
        limit: f64,
        remaining: f64,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub duplicate_in_flight: DuplicateInFlightPolicy,
    pub request_timeout: Duration,
    /// How often a waiting duplicate re-checks for the first request's record.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            duplicate_in_flight: DuplicateInFlightPolicy::Reject,
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionPipeline {
    limiter: RateLimiter,
    cache: IdempotencyCache,
    routes: RouteRegistry,
    config: PipelineConfig,
    metrics: MetricsCollector,
}

impl AdmissionPipeline {
    pub fn new(limiter: RateLimiter, cache: IdempotencyCache, routes: RouteRegistry, config: PipelineConfig) -> Self {
        Self {
            limiter,
            cache,
            routes,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    pub fn routes(&self) -> &RouteRegistry {
        &self.routes
    }

    /// Runs one request through admission. `downstream` is called at most
    /// once, and not at all when the response is replayed or the request is
    /// turned away.
    pub async fn handle<F, Fut>(&self, request: InboundRequest, downstream: F) -> Result<Outcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CapturedResponse> + Send + 'static,
    {
        let deadline = request
            .deadline
            .unwrap_or_else(|| Instant::now() + self.config.request_timeout);

        let result = self.admit(&request, deadline, downstream).await;

        if let Err(AdmissionError::DeadlineExceeded) = &result {
            warn!(
                target: "gatekeeper::pipeline",
                subject = %request.subject,
                route = %request.route,
                "Request deadline expired while waiting on the backend"
            );
            self.metrics
                .record(Some(&request.subject), AdmissionEvent::DeadlineExceeded)
                .await;
        }

        result
    }

    async fn admit<F, Fut>(&self, request: &InboundRequest, deadline: Instant, downstream: F) -> Result<Outcome>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CapturedResponse> + Send + 'static,
    {
        let route = self
            .routes
            .get(&request.route)
            .ok_or_else(|| AdmissionError::Configuration(format!("Unknown route '{}'", request.route)))?;
        RequestValidator::validate_subject(&request.subject)?;

        if !route.require_idempotency_key {
            return self.execute(request, route, deadline, None, downstream).await;
        }

        let key = RequestValidator::validate_idempotency_key(request.idempotency_key.as_deref())?;
        let key = record_key(&request.subject, &key);

        if let Some(record) = self.bounded(deadline, self.cache.lookup(&key)).await? {
            return Ok(self.replay(request, record).await);
        }

        let claim = match self.acquire_claim(request, &key, deadline).await? {
            Ok(claim) => claim,
            Err(record) => return Ok(self.replay(request, record).await),
        };

        // Once the claim is held, the downstream call, the store and the
        // release run to completion even if the caller goes away.
        let pipeline = self.clone();
        let request = request.clone();
        let route = route.clone();
        let claimed = tokio::spawn(async move {
            // The previous holder may have finished between our lookup and claim.
            let result = match pipeline.bounded(deadline, pipeline.cache.lookup(&key)).await {
                Ok(Some(record)) => Ok(pipeline.replay(&request, record).await),
                Ok(None) => {
                    pipeline
                        .execute(&request, &route, deadline, Some(key.as_str()), downstream)
                        .await
                }
                Err(err) => Err(err),
            };

            pipeline.cache.release(claim).await;
            result
        });

        claimed
            .await
            .map_err(|e| AdmissionError::Internal(format!("Claimed request task failed: {}", e)))?
    }

    /// Takes the in-flight slot for `key`, or returns the record a concurrent
    /// request finished with while this one waited.
    async fn acquire_claim(
        &self,
        request: &InboundRequest,
        key: &str,
        deadline: Instant,
    ) -> Result<std::result::Result<InFlightClaim, IdempotencyRecord>> {
        loop {
            if let Some(claim) = self.bounded(deadline, self.cache.claim(key)).await? {
                return Ok(Ok(claim));
            }

            match self.config.duplicate_in_flight {
                DuplicateInFlightPolicy::Reject => {
                    info!(
                        target: "gatekeeper::pipeline",
                        subject = %request.subject,
                        key = %key,
                        "Rejecting duplicate of in-flight request"
                    );
                    self.metrics
                        .record(Some(&request.subject), AdmissionEvent::DuplicateInFlight)
                        .await;
                    let client_key = request.idempotency_key.as_deref().map(str::trim).unwrap_or_default();
                    return Err(AdmissionError::DuplicateInFlight(client_key.to_string()));
                }
                DuplicateInFlightPolicy::Wait => {
                    debug!(
                        target: "gatekeeper::pipeline",
                        key = %key,
                        "Waiting for in-flight request with the same key"
                    );
                    self.bounded(deadline, async {
                        tokio::time::sleep(self.config.poll_interval).await;
                        Ok(())
                    })
                    .await?;

                    if let Some(record) = self.bounded(deadline, self.cache.lookup(key)).await? {
                        return Ok(Err(record));
                    }
                }
            }
        }
    }

    async fn execute<F, Fut>(
        &self,
        request: &InboundRequest,
        route: &RoutePolicy,
        deadline: Instant,
        key: Option<&str>,
        downstream: F,
    ) -> Result<Outcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CapturedResponse>,
    {
        let scope = route.scope();
        let decision = self
            .bounded(deadline, self.limiter.allow_request(&request.subject, &scope, route.cost))
            .await?;

        if !decision.admitted {
            info!(
                target: "gatekeeper::pipeline",
                subject = %request.subject,
                scope = %scope,
                route = %route.name,
                "Rate limit exceeded"
            );
            return Ok(Outcome::Rejected {
                retry_after: decision.retry_after,
                limit: decision.limit,
                remaining: decision.remaining,
            });
        }

        let response = downstream().await;

        if let Some(key) = key {
            self.remember(request, key, &response).await;
        }

        Ok(Outcome::Served {
            response,
            source: ResponseSource::Fresh,
        })
    }

    /// Persists a finished response. A failure here never fails the client
    /// response; the key just loses replay protection.
    async fn remember(&self, request: &InboundRequest, key: &str, response: &CapturedResponse) {
        // Server errors are not replayed so the client can retry them.
        if response.status >= 500 {
            debug!(
                target: "gatekeeper::pipeline",
                key = %key,
                status = response.status,
                "Not storing server error response"
            );
            return;
        }

        let record = self
            .cache
            .record(key, response.status, response.headers.clone(), response.body.clone());

        match self.cache.store(&record).await {
            Ok(StoreOutcome::Stored) | Ok(StoreOutcome::Replaced) => {}
            Ok(StoreOutcome::AlreadyStored) => {
                warn!(
                    target: "gatekeeper::pipeline",
                    subject = %request.subject,
                    key = %key,
                    "Another response was stored first for this key; it will be replayed from now on"
                );
            }
            Err(err) => {
                error!(
                    target: "gatekeeper::pipeline",
                    subject = %request.subject,
                    key = %key,
                    error = %err,
                    "Failed to store idempotency record, replay protection unavailable for this key"
                );
                self.metrics.record(Some(&request.subject), AdmissionEvent::StoreFailure).await;
            }
        }
    }

    async fn replay(&self, request: &InboundRequest, record: IdempotencyRecord) -> Outcome {
        info!(
            target: "gatekeeper::pipeline",
            subject = %request.subject,
            key = %record.key,
            status = record.status,
            "Replaying stored response"
        );
        self.metrics.record(Some(&request.subject), AdmissionEvent::Replayed).await;

        Outcome::Served {
            response: record.into(),
            source: ResponseSource::Cached,
        }
    }

    async fn bounded<T>(&self, deadline: Instant, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout_at(deadline, fut)
            .await
            .unwrap_or(Err(AdmissionError::DeadlineExceeded))
    }
}
