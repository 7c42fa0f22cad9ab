use crate::config::Config;
use crate::error::{AdmissionError, Result};
use crate::handlers::{
    create_address, get_address, health_check, list_addresses, metrics, readiness_check, AddressBook, AppState,
};
use crate::health::HealthChecker;
use crate::idempotency::IdempotencyCache;
use crate::memory::MemoryBackend;
use crate::metrics::MetricsCollector;
use crate::middleware::{
    admission_middleware, logging_middleware, security_headers_middleware, RouteAdmission, SubjectResolver,
};
use crate::pipeline::{AdmissionPipeline, PipelineConfig};
use crate::rate_limiter::RateLimiter;
use crate::redis_backend::{RedisBackend, RedisBackendConfig};
use crate::routes::{default_registry, names};
use crate::store::{BucketStore, IdempotencyStore};
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const MEMORY_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Storage behind the rate limiter and the idempotency cache.
#[derive(Clone)]
pub struct Backends {
    pub buckets: Arc<dyn BucketStore>,
    pub records: Arc<dyn IdempotencyStore>,
    memory: Option<Arc<MemoryBackend>>,
}

impl Backends {
    pub fn memory(backend: Arc<MemoryBackend>) -> Self {
        Self {
            buckets: backend.clone(),
            records: backend.clone(),
            memory: Some(backend),
        }
    }

    pub fn redis(backend: RedisBackend) -> Self {
        let backend = Arc::new(backend);
        Self {
            buckets: backend.clone(),
            records: backend,
            memory: None,
        }
    }

    /// Redis when a URL is configured, otherwise the in-process backend.
    pub async fn from_config(config: &Config) -> Result<Self> {
        if !config.uses_redis() {
            info!("No Redis URL configured, using in-process backend (single instance only)");
            return Ok(Self::memory(Arc::new(MemoryBackend::new())));
        }

        let redis_config = RedisBackendConfig {
            key_prefix: config.redis_key_prefix.clone(),
        };
        let backend = RedisBackend::connect_with_config(&config.redis_url, redis_config).await?;
        info!(prefix = %config.redis_key_prefix, "Connected to Redis backend");
        Ok(Self::redis(backend))
    }
}

/// Wires the rate limiter and idempotency cache into a pipeline.
pub fn build_pipeline(config: &Config, backends: &Backends, metrics: &MetricsCollector) -> Result<AdmissionPipeline> {
    let limiter = RateLimiter::new(backends.buckets.clone(), config.global_policy())
        .with_endpoint_policy(config.endpoint_policy())
        .with_failure_policy(config.backend_failure_policy)
        .with_backend_timeout(config.backend_timeout())
        .with_metrics(metrics.clone());

    let cache = IdempotencyCache::new(backends.records.clone(), config.idempotency_ttl())
        .with_claim_ttl(config.in_flight_claim_ttl())
        .with_failure_policy(config.backend_failure_policy)
        .with_backend_timeout(config.backend_timeout())
        .with_metrics(metrics.clone());

    let pipeline_config = PipelineConfig {
        duplicate_in_flight: config.duplicate_in_flight,
        request_timeout: config.request_timeout(),
        ..PipelineConfig::default()
    };

    Ok(AdmissionPipeline::new(limiter, cache, default_registry()?, pipeline_config).with_metrics(metrics.clone()))
}

/// Builds the router over already connected backends.
pub fn create_router(config: &Config, backends: &Backends) -> Result<Router> {
    let metrics_collector = MetricsCollector::new();
    let pipeline = Arc::new(build_pipeline(config, backends, &metrics_collector)?);
    info!(
        routes = pipeline.routes().len(),
        trust_proxy_headers = config.trust_proxy_headers,
        "Admission control configured"
    );

    let idempotency_header = HeaderName::from_bytes(config.idempotency_header.to_ascii_lowercase().as_bytes())
        .map_err(|e| AdmissionError::Configuration(format!("Invalid idempotency header name: {}", e)))?;

    let admit = |route: &'static str| {
        middleware::from_fn_with_state(
            RouteAdmission {
                pipeline: pipeline.clone(),
                route,
                idempotency_header: idempotency_header.clone(),
                subjects: SubjectResolver::new(config.trust_proxy_headers),
            },
            admission_middleware,
        )
    };

    let state = AppState {
        addresses: AddressBook::new(),
        health: Arc::new(HealthChecker::new(backends.buckets.clone(), config.backend_timeout())),
        metrics: metrics_collector,
    };

    let app = Router::new()
        // Admission-controlled resource
        .route("/api/v1/addresses", post(create_address).layer(admit(names::CREATE_ADDRESS)))
        .route("/api/v1/addresses", get(list_addresses).layer(admit(names::LIST_ADDRESSES)))
        .route("/api/v1/addresses/:id", get(get_address).layer(admit(names::GET_ADDRESS)))
        // Health, readiness and counters
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(middleware::from_fn(logging_middleware))
                .layer(middleware::from_fn(security_headers_middleware)),
        );

    Ok(app)
}

/// Connects the configured backends and builds the router.
pub async fn create_app(config: &Config) -> Result<Router> {
    let backends = Backends::from_config(config).await?;
    create_router(config, &backends)
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    backends: Backends,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let backends = Backends::from_config(&config).await?;
        let app = create_router(&config, &backends)?;

        Ok(Self {
            app,
            bind_addr: config.bind_addr,
            backends,
        })
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;

        info!("Gatekeeper server starting on {}", self.bind_addr);
        info!("Health check available at /health");
        info!("Readiness check available at /ready");

        if let Some(memory) = self.backends.memory.clone() {
            tokio::spawn(purge_expired_entries(memory));
        }

        // Run server with graceful shutdown
        axum::serve(listener, self.app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn purge_expired_entries(memory: Arc<MemoryBackend>) {
    let mut interval = tokio::time::interval(MEMORY_PURGE_INTERVAL);
    loop {
        interval.tick().await;
        let purged = memory.purge_expired();
        if purged > 0 {
            tracing::debug!(purged, "Purged expired idempotency entries");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
