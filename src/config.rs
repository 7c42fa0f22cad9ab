use crate::bucket::BucketPolicy;
use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// What to do when the shared backend cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Reject requests and refuse to serve cached replies.
    Closed,
    /// Bypass the shared limiter (a per-process cap still applies) and treat
    /// idempotency lookups as misses.
    Open,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "closed" | "fail-closed" => Ok(FailurePolicy::Closed),
            "open" | "fail-open" => Ok(FailurePolicy::Open),
            other => Err(format!("unknown failure policy '{}', expected 'open' or 'closed'", other)),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Closed => f.write_str("closed"),
            FailurePolicy::Open => f.write_str("open"),
        }
    }
}

/// How a request is treated when another request with the same idempotency
/// key is still being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateInFlightPolicy {
    /// Fail fast with a conflict.
    Reject,
    /// Wait for the first request's record, bounded by the caller deadline.
    Wait,
}

impl FromStr for DuplicateInFlightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(DuplicateInFlightPolicy::Reject),
            "wait" => Ok(DuplicateInFlightPolicy::Wait),
            other => Err(format!("unknown in-flight policy '{}', expected 'reject' or 'wait'", other)),
        }
    }
}

impl fmt::Display for DuplicateInFlightPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateInFlightPolicy::Reject => f.write_str("reject"),
            DuplicateInFlightPolicy::Wait => f.write_str("wait"),
        }
    }
}

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL. Empty runs on the in-process backend.
    #[envconfig(from = "REDIS_URL", default = "")]
    pub redis_url: String,

    #[envconfig(from = "REDIS_KEY_PREFIX", default = "gatekeeper:")]
    pub redis_key_prefix: String,

    /// Per-subject bucket shared by every endpoint
    #[envconfig(from = "BUCKET_CAPACITY", default = "3")]
    pub bucket_capacity: f64,

    #[envconfig(from = "BUCKET_REFILL_RATE", default = "1")]
    pub bucket_refill_rate: f64,

    /// Per-(subject, endpoint) buckets
    #[envconfig(from = "ENDPOINT_BUCKET_CAPACITY", default = "3")]
    pub endpoint_bucket_capacity: f64,

    #[envconfig(from = "ENDPOINT_BUCKET_REFILL_RATE", default = "1")]
    pub endpoint_bucket_refill_rate: f64,

    #[envconfig(from = "IDEMPOTENCY_TTL_SECS", default = "3600")]
    pub idempotency_ttl_secs: u64,

    #[envconfig(from = "IDEMPOTENCY_HEADER", default = "idempotency-key")]
    pub idempotency_header: String,

    #[envconfig(from = "IN_FLIGHT_CLAIM_TTL_SECS", default = "30")]
    pub in_flight_claim_ttl_secs: u64,

    #[envconfig(from = "DUPLICATE_IN_FLIGHT", default = "reject")]
    pub duplicate_in_flight: DuplicateInFlightPolicy,

    #[envconfig(from = "BACKEND_FAILURE_POLICY", default = "closed")]
    pub backend_failure_policy: FailurePolicy,

    #[envconfig(from = "BACKEND_TIMEOUT_MS", default = "250")]
    pub backend_timeout_ms: u64,

    /// Deadline for a whole request when the caller does not supply one
    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "5000")]
    pub request_timeout_ms: u64,

    /// Charge requests to `x-forwarded-for`, `x-real-ip` or `x-api-key`.
    /// Only safe behind a proxy that overwrites those headers.
    #[envconfig(from = "TRUST_PROXY_HEADERS", default = "false")]
    pub trust_proxy_headers: bool,

    #[envconfig(from = "MAX_BODY_BYTES", default = "2097152")]
    pub max_body_bytes: usize,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn global_policy(&self) -> BucketPolicy {
        BucketPolicy::new(self.bucket_capacity, self.bucket_refill_rate)
    }

    pub fn endpoint_policy(&self) -> BucketPolicy {
        BucketPolicy::new(self.endpoint_bucket_capacity, self.endpoint_bucket_refill_rate)
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_secs)
    }

    pub fn in_flight_claim_ttl(&self) -> Duration {
        Duration::from_secs(self.in_flight_claim_ttl_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.trim().is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            redis_url: String::new(),
            redis_key_prefix: "gatekeeper:".to_string(),
            bucket_capacity: 3.0,
            bucket_refill_rate: 1.0,
            endpoint_bucket_capacity: 3.0,
            endpoint_bucket_refill_rate: 1.0,
            idempotency_ttl_secs: 3600,
            idempotency_header: "idempotency-key".to_string(),
            in_flight_claim_ttl_secs: 30,
            duplicate_in_flight: DuplicateInFlightPolicy::Reject,
            backend_failure_policy: FailurePolicy::Closed,
            backend_timeout_ms: 250,
            request_timeout_ms: 5000,
            trust_proxy_headers: false,
            max_body_bytes: 2 * 1024 * 1024,
            log_level: "info".to_string(),
        }
    }
}
