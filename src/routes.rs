//! Route registry.
//!
//! Maps a route name to the admission rules applied to it. Built once at
//! startup and shared read-only afterwards.

use crate::bucket::{validate_cost, Scope};
use crate::error::{AdmissionError, Result};
use crate::validation::RequestValidator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeMode {
    /// Draws from the subject's single bucket shared by every route.
    Global,
    /// Draws from a bucket dedicated to this route.
    PerEndpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePolicy {
    pub name: String,
    pub scope_mode: ScopeMode,
    pub cost: f64,
    pub require_idempotency_key: bool,
}

impl RoutePolicy {
    pub fn new(name: impl Into<String>, scope_mode: ScopeMode) -> Self {
        Self {
            name: name.into(),
            scope_mode,
            cost: 1.0,
            require_idempotency_key: false,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.require_idempotency_key = true;
        self
    }

    pub fn scope(&self) -> Scope {
        match self.scope_mode {
            ScopeMode::Global => Scope::Global,
            ScopeMode::PerEndpoint => Scope::endpoint(self.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RouteRegistry {
    routes: Arc<HashMap<String, RoutePolicy>>,
}

impl RouteRegistry {
    pub fn builder() -> RouteRegistryBuilder {
        RouteRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&RoutePolicy> {
        self.routes.get(name)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RouteRegistryBuilder {
    routes: HashMap<String, RoutePolicy>,
}

impl RouteRegistryBuilder {
    pub fn route(mut self, policy: RoutePolicy) -> Result<Self> {
        RequestValidator::validate_route_name(&policy.name)?;
        validate_cost(policy.cost)
            .map_err(|e| AdmissionError::Configuration(format!("Route '{}': {}", policy.name, e)))?;

        if self.routes.contains_key(&policy.name) {
            return Err(AdmissionError::Configuration(format!(
                "Route '{}' is registered twice",
                policy.name
            )));
        }

        self.routes.insert(policy.name.clone(), policy);
        Ok(self)
    }

    pub fn build(self) -> RouteRegistry {
        RouteRegistry {
            routes: Arc::new(self.routes),
        }
    }
}

/// Route names used by the HTTP surface.
pub mod names {
    pub const CREATE_ADDRESS: &str = "create-address";
    pub const LIST_ADDRESSES: &str = "list-addresses";
    pub const GET_ADDRESS: &str = "get-address";
}

/// Registry for the routes the server exposes.
pub fn default_registry() -> Result<RouteRegistry> {
    Ok(RouteRegistry::builder()
        .route(RoutePolicy::new(names::CREATE_ADDRESS, ScopeMode::PerEndpoint).idempotent())?
        .route(RoutePolicy::new(names::LIST_ADDRESSES, ScopeMode::PerEndpoint))?
        .route(RoutePolicy::new(names::GET_ADDRESS, ScopeMode::PerEndpoint))?
        .build())
}
