use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{AdmissionError, ErrorResponse};
use crate::health::HealthChecker;
use crate::metrics::MetricsCollector;

/// Demonstration resource behind the admission layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Address {
    pub id: u64,
    pub street: Option<String>,
    pub city: String,
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAddressRequest {
    pub street: Option<String>,
    pub city: String,
    pub country: Option<String>,
}

#[derive(Default)]
struct AddressTable {
    next_id: u64,
    rows: BTreeMap<u64, Address>,
}

/// In-memory address storage.
#[derive(Clone, Default)]
pub struct AddressBook {
    inner: Arc<RwLock<AddressTable>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, request: CreateAddressRequest) -> Address {
        let mut table = self.inner.write().await;
        table.next_id += 1;
        let address = Address {
            id: table.next_id,
            street: request.street,
            city: request.city,
            country: request.country,
        };
        table.rows.insert(address.id, address.clone());
        address
    }

    pub async fn get(&self, id: u64) -> Option<Address> {
        self.inner.read().await.rows.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<Address> {
        self.inner.read().await.rows.values().cloned().collect()
    }
}

/// Shared application state for handlers
#[derive(Clone)]
pub struct AppState {
    pub addresses: AddressBook,
    pub health: Arc<HealthChecker>,
    pub metrics: MetricsCollector,
}

/// Create an address
pub async fn create_address(
    State(state): State<AppState>,
    Json(payload): Json<CreateAddressRequest>,
) -> Result<impl IntoResponse, AdmissionError> {
    if payload.city.trim().is_empty() {
        return Err(AdmissionError::Validation("City cannot be empty".to_string()));
    }

    let address = state.addresses.insert(payload).await;
    info!(target: "gatekeeper::handlers", id = address.id, "Address created");

    Ok((StatusCode::CREATED, Json(address)))
}

/// List all addresses
pub async fn list_addresses(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.addresses.list().await)
}

/// Get one address
pub async fn get_address(State(state): State<AppState>, Path(id): Path<u64>) -> impl IntoResponse {
    match state.addresses.get(id).await {
        Some(address) => Json(address).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("not_found", &format!("Address {} not found", id), 404)),
        )
            .into_response(),
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health().await)
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let readiness = state.health.check_readiness().await;
    let status = if readiness.backend_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

/// Admission counters
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let global = state.metrics.get_global_metrics().await;
    let tracked_subjects = state.metrics.tracked_subjects().await;

    Json(serde_json::json!({
        "global": global,
        "tracked_subjects": tracked_subjects,
    }))
}
