//! HTTP surface for the transactional core.
//!
//! Exposes policy evaluation, idempotent operation execution and saga
//! lifecycle endpoints, with structured logging (tracing) and Prometheus
//! metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use idempotency::IdempotencyManager;
use metrics_exporter_prometheus::PrometheusHandle;
use policy::PolicyEngine;
use saga::{SagaCoordinator, SagaRegistry, service_provisioning_definition};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{AppState, CoreStore};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: CoreStore>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/policies", post(routes::policies::publish::<S>))
        .route("/policies/evaluate", post(routes::policies::evaluate::<S>))
        .route("/operations", post(routes::operations::execute::<S>))
        .route("/sagas", post(routes::sagas::create::<S>))
        .route("/sagas/{id}", get(routes::sagas::get::<S>))
        .route("/sagas/{id}/cancel", post(routes::sagas::cancel::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the default application state over the given store, with the
/// built-in saga definitions registered.
pub fn create_default_state<S: CoreStore>(store: S) -> Arc<AppState<S>> {
    let mut registry = SagaRegistry::new();
    registry.register(service_provisioning_definition(Arc::new(
        saga::InMemoryProvisioningService::new(),
    )));
    let registry = Arc::new(registry);

    let policy_engine = PolicyEngine::new(store.clone());
    let idempotency = IdempotencyManager::new(store.clone());
    let saga_coordinator = Arc::new(SagaCoordinator::new(store.clone(), registry.clone()));

    Arc::new(AppState {
        policy_engine,
        idempotency,
        saga_coordinator,
        registry,
        store,
    })
}
