use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the admission layer.
///
/// Every variant maps onto a structured HTTP response, so nothing raised by
/// the rate limiter, the idempotency cache or the pipeline escapes as a panic.
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    #[error("Idempotency key header is required")]
    MissingIdempotencyKey,

    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),

    #[error("Rate limit exceeded")]
    QuotaExceeded { retry_after: Option<Duration> },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Stored record is corrupt: {0}")]
    RecordCorrupt(String),

    #[error("Request with idempotency key '{0}' is already in progress")]
    DuplicateInFlight(String),

    #[error("Request deadline exceeded while waiting on the backend")]
    DeadlineExceeded,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        AdmissionError::BackendUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AdmissionError {
    fn from(err: serde_json::Error) -> Self {
        AdmissionError::RecordCorrupt(err.to_string())
    }
}

impl AdmissionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::MissingIdempotencyKey => StatusCode::BAD_REQUEST,
            AdmissionError::InvalidIdempotencyKey(_) => StatusCode::BAD_REQUEST,
            AdmissionError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdmissionError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::RecordCorrupt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::DuplicateInFlight(_) => StatusCode::CONFLICT,
            AdmissionError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            AdmissionError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_admission_error(err: &AdmissionError) -> Self {
        let code = err.status_code().as_u16();
        let message = err.to_string();
        match err {
            AdmissionError::MissingIdempotencyKey => Self::new("missing_idempotency_key", &message, code),
            AdmissionError::InvalidIdempotencyKey(_) => Self::new("invalid_idempotency_key", &message, code),
            AdmissionError::QuotaExceeded { .. } => Self::new("rate_limit_exceeded", "Request rate limit exceeded", code),
            AdmissionError::BackendUnavailable(_) => Self::new("service_unavailable", &message, code),
            // Internal detail stays in the logs.
            AdmissionError::RecordCorrupt(_) => Self::new("internal_error", "Internal server error", code),
            AdmissionError::DuplicateInFlight(_) => Self::new("request_in_progress", &message, code),
            AdmissionError::DeadlineExceeded => Self::new("deadline_exceeded", &message, code),
            AdmissionError::Configuration(_) => Self::new("configuration_error", &message, code),
            AdmissionError::Validation(_) => Self::new("validation_error", &message, code),
            AdmissionError::Internal(_) => Self::new("internal_error", "Internal server error", code),
        }
    }
}

/// Whole seconds for a `Retry-After` header, rounded up and never below one.
pub fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs_f64().ceil() as u64;
    secs.max(1)
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::from_admission_error(&self);
        let mut response = (status, Json(body)).into_response();

        let retry_after = match &self {
            // No hint when the cost can never fit the bucket.
            AdmissionError::QuotaExceeded { retry_after } => retry_after.map(retry_after_secs),
            AdmissionError::BackendUnavailable(_) | AdmissionError::DuplicateInFlight(_) => Some(1),
            _ => None,
        };
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }

        response
    }
}
