pub mod bucket;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod idempotency;
pub mod memory;
pub mod metrics;
pub mod middleware;
pub mod pipeline;
pub mod rate_limiter;
pub mod redis_backend;
pub mod response;
pub mod routes;
pub mod server;
pub mod store;
pub mod token_bucket;
pub mod validation;

#[cfg(test)]
mod mocks;

pub use bucket::{BucketPolicy, BucketState, Scope};
pub use config::{Config, DuplicateInFlightPolicy, FailurePolicy};
pub use error::{AdmissionError, Result};
pub use idempotency::{IdempotencyCache, IdempotencyRecord};
pub use pipeline::{AdmissionPipeline, CapturedResponse, InboundRequest, Outcome};
pub use rate_limiter::{RateDecision, RateLimiter};
pub use server::create_app;
pub use token_bucket::LocalTokenBucket;
