use crate::error::AdmissionError;
use crate::pipeline::{AdmissionPipeline, CapturedResponse, InboundRequest, REPEATED_HEADER_SEPARATOR};
use axum::body::to_bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

// Hop-by-hop or per-transmission headers that must not be replayed.
const UNREPLAYED_HEADERS: [&str; 4] = ["content-length", "transfer-encoding", "connection", "date"];

/// Request id attached to every request's extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Per-route state for [`admission_middleware`].
#[derive(Clone)]
pub struct RouteAdmission {
    pub pipeline: Arc<AdmissionPipeline>,
    pub route: &'static str,
    pub idempotency_header: HeaderName,
    pub subjects: SubjectResolver,
}

/// Decides who a request is charged to.
///
/// Identity headers (`x-forwarded-for`, `x-real-ip`, `x-api-key`) are set by
/// whoever sends the request, so they are only honored behind a reverse proxy
/// or gateway that overwrites them. Otherwise the connection address is used.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubjectResolver {
    pub trust_proxy_headers: bool,
}

impl SubjectResolver {
    pub fn new(trust_proxy_headers: bool) -> Self {
        Self { trust_proxy_headers }
    }

    pub fn resolve(&self, request: &Request) -> String {
        if self.trust_proxy_headers {
            if let Some(subject) = proxy_subject(request) {
                return subject;
            }
        }
        peer_address(request)
    }
}

/// Logging middleware for request/response tracking. Assigns an
/// `x-request-id` when the client did not send one and echoes it back.
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let peer = peer_address(&request);

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    info!(
        target: "gatekeeper::middleware",
        method = %method,
        uri = %uri,
        peer = %peer,
        request_id = %request_id,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    let status = response.status();
    info!(
        target: "gatekeeper::middleware",
        method = %method,
        uri = %uri,
        status = %status,
        request_id = %request_id,
        "Request completed"
    );

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

/// Runs the request through the admission pipeline. The inner handler is
/// only reached when the pipeline decides to execute it.
pub async fn admission_middleware(State(admission): State<RouteAdmission>, request: Request, next: Next) -> Response {
    let subject = admission.subjects.resolve(&request);

    let idempotency_key = match request.headers().get(&admission.idempotency_header) {
        None => None,
        Some(value) => match value.to_str() {
            Ok(key) => Some(key.to_string()),
            Err(_) => {
                return AdmissionError::InvalidIdempotencyKey("must contain only visible ASCII characters".to_string())
                    .into_response()
            }
        },
    };

    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let inbound = InboundRequest {
        subject,
        route: admission.route.to_string(),
        idempotency_key,
        deadline: None,
    };

    let result = admission
        .pipeline
        .handle(inbound, move || async move { capture(next.run(request).await).await })
        .await;

    match result {
        Ok(outcome) => outcome.into_response(),
        Err(err) => {
            info!(
                target: "gatekeeper::middleware",
                route = admission.route,
                request_id = %request_id,
                error = %err,
                "Request refused by admission control"
            );
            err.into_response()
        }
    }
}

/// Buffers a handler response so it can be stored and replayed.
async fn capture(response: Response) -> CapturedResponse {
    let (parts, body) = response.into_parts();

    let body = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(err) => {
            error!(target: "gatekeeper::middleware", error = %err, "Failed to read handler response body");
            return CapturedResponse::new(500, Vec::new());
        }
    };

    CapturedResponse {
        status: parts.status.as_u16(),
        headers: replayable_headers(&parts.headers),
        body,
    }
}

/// Flattens headers for storage. Repeated headers such as `set-cookie` are
/// joined with a newline, which cannot occur inside a header value, so
/// replay can split them back into separate headers.
fn replayable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flattened: BTreeMap<String, String> = BTreeMap::new();

    for (name, value) in headers {
        if UNREPLAYED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        flattened
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(REPEATED_HEADER_SEPARATOR);
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    flattened
}

fn proxy_subject(request: &Request) -> Option<String> {
    let header_value = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(first_ip) = forwarded.split(',').next().map(str::trim).filter(|ip| !ip.is_empty()) {
            return Some(first_ip.to_string());
        }
    }

    if let Some(real_ip) = header_value("x-real-ip") {
        return Some(real_ip.to_string());
    }

    header_value("x-api-key").map(|api_key| format!("api-key/{}", api_key))
}

/// Address of the connected peer.
pub fn peer_address(request: &Request) -> String {
    match request.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn trusted() -> SubjectResolver {
        SubjectResolver::new(true)
    }

    fn from_peer(ip: [u8; 4]) -> Request {
        let mut request = Request::new(Body::empty());
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 51000))));
        request
    }

    #[test]
    fn test_subject_with_forwarded_header() {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));

        assert_eq!(trusted().resolve(&request), "192.168.1.1");
    }

    #[test]
    fn test_subject_with_real_ip_header() {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));

        assert_eq!(trusted().resolve(&request), "203.0.113.1");
    }

    #[test]
    fn test_subject_with_api_key() {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_static("tenant-42"));

        assert_eq!(trusted().resolve(&request), "api-key/tenant-42");
    }

    #[test]
    fn test_identity_headers_ignored_unless_trusted() {
        let mut request = from_peer([10, 1, 2, 3]);
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1"));
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_static("tenant-42"));

        assert_eq!(SubjectResolver::default().resolve(&request), "10.1.2.3");
        assert_eq!(trusted().resolve(&request), "192.168.1.1");
    }

    #[test]
    fn test_subject_from_connection() {
        let request = from_peer([10, 1, 2, 3]);
        assert_eq!(trusted().resolve(&request), "10.1.2.3");
        assert_eq!(SubjectResolver::default().resolve(&request), "10.1.2.3");
    }

    #[test]
    fn test_subject_fallback() {
        let request = Request::new(Body::empty());
        assert_eq!(SubjectResolver::default().resolve(&request), "unknown");
    }

    #[test]
    fn test_replayable_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("27"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let flattened = replayable_headers(&headers);
        assert_eq!(flattened.get("content-type").unwrap(), "application/json");
        assert_eq!(flattened.get("set-cookie").unwrap(), "a=1\nb=2");
        assert!(!flattened.contains_key("content-length"));
    }

    #[tokio::test]
    async fn test_capture_buffers_body() {
        let response = (axum::http::StatusCode::CREATED, "created").into_response();
        let captured = capture(response).await;

        assert_eq!(captured.status, 201);
        assert_eq!(captured.body, b"created".to_vec());
        assert_eq!(captured.headers.get("content-type").unwrap(), "text/plain; charset=utf-8");
    }
}
