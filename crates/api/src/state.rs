//! Shared application state.

use std::sync::Arc;

use idempotency::IdempotencyManager;
use policy::PolicyEngine;
use saga::{SagaCoordinator, SagaRegistry};
use store::{IdempotencyStore, PolicyStore, SagaStore};

/// The combined storage contract the API runs against. Implemented by both
/// `InMemoryStore` and `PostgresStore`.
pub trait CoreStore:
    PolicyStore + IdempotencyStore + SagaStore + Clone + Send + Sync + 'static
{
}

impl<S> CoreStore for S where
    S: PolicyStore + IdempotencyStore + SagaStore + Clone + Send + Sync + 'static
{
}

/// Shared application state accessible from all handlers.
pub struct AppState<S: CoreStore> {
    pub policy_engine: PolicyEngine<S>,
    pub idempotency: IdempotencyManager<S>,
    pub saga_coordinator: Arc<SagaCoordinator<S>>,
    pub registry: Arc<SagaRegistry>,
    pub store: S,
}
