use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::response::HealthResponse;
use crate::store::BucketStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub backend: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

pub struct HealthChecker {
    store: Arc<dyn BucketStore>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn BucketStore>, timeout: Duration) -> Self {
        // Touch the start time so uptime counts from construction.
        let _ = *START_TIME;
        Self { store, timeout }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let backend = self.check_backend().await;

        // The process can still answer fail-open without its backend.
        let overall_status = if backend.status == "healthy" { "healthy" } else { "degraded" };

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            dependencies: DependencyStatus { backend },
        }
    }

    pub async fn check_readiness(&self) -> HealthResponse {
        let backend = self.check_backend().await;
        if backend.error.is_none() {
            HealthResponse::healthy(&backend.name)
        } else {
            HealthResponse::unhealthy(&backend.name)
        }
    }

    async fn check_backend(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = tokio::time::timeout(self.timeout, self.store.ping()).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("ping timed out after {:?}", self.timeout)),
        };

        ServiceStatus {
            name: self.store.backend_name().to_string(),
            status: if error.is_none() { "healthy" } else { "unavailable" }.to_string(),
            response_time_ms,
            error,
        }
    }
}
