use crate::error::AdmissionError;
use crate::pipeline::{CapturedResponse, Outcome, REPEATED_HEADER_SEPARATOR};
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub backend: String,
    pub backend_connected: bool,
}

impl HealthResponse {
    pub fn healthy(backend: &str) -> Self {
        Self::build("healthy", backend, true)
    }

    pub fn unhealthy(backend: &str) -> Self {
        Self::build("unhealthy", backend, false)
    }

    fn build(status: &str, backend: &str, backend_connected: bool) -> Self {
        Self {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: backend.to_string(),
            backend_connected,
        }
    }
}

impl IntoResponse for CapturedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        for (name, joined) in self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in joined.split(REPEATED_HEADER_SEPARATOR) {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }

        response
    }
}

impl IntoResponse for Outcome {
    fn into_response(self) -> Response {
        match self {
            Outcome::Served { response, .. } => response.into_response(),
            Outcome::Rejected {
                retry_after,
                limit,
                remaining,
            } => {
                let mut response = AdmissionError::QuotaExceeded { retry_after }.into_response();

                let headers = response.headers_mut();
                headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit.floor() as u64));
                headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining.floor() as u64));

                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ResponseSource;
    use axum::http::header;
    use std::time::Duration;

    #[test]
    fn test_rejection_headers() {
        let outcome = Outcome::Rejected {
            retry_after: Some(Duration::from_millis(200)),
            limit: 3.0,
            remaining: 0.4,
        };
        let response = outcome.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT], "3");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING], "0");
    }

    #[test]
    fn test_unsatisfiable_rejection_has_no_retry_after() {
        let outcome = Outcome::Rejected {
            retry_after: None,
            limit: 3.0,
            remaining: 3.0,
        };
        let response = outcome.into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn test_served_response_keeps_status_and_headers() {
        let captured = CapturedResponse::new(201, "{}").with_header("content-type", "application/json");
        let response = Outcome::Served {
            response: captured,
            source: ResponseSource::Cached,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_repeated_headers_are_replayed_separately() {
        let captured = CapturedResponse::new(200, "")
            .with_header("set-cookie", "a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT\nb=2")
            .with_header("x-request-id", "abc");
        let response = captured.into_response();

        let cookies: Vec<_> = response.headers().get_all(header::SET_COOKIE).iter().collect();
        assert_eq!(cookies, ["a=1; Expires=Wed, 21 Oct 2026 07:28:00 GMT", "b=2"]);
        assert_eq!(response.headers()["x-request-id"], "abc");
    }

    #[test]
    fn test_health_response_serialization() {
        let json = serde_json::to_string(&HealthResponse::healthy("memory")).unwrap();
        assert!(json.contains(r#""status":"healthy""#));
        assert!(json.contains(r#""backend":"memory""#));
    }
}
