//! Saga coordinator for multi-step business operations.
//!
//! Executes an ordered sequence of steps, each declaring a compensating
//! action, against a durable execution record. On step failure, completed
//! steps are compensated in reverse order using per-step context snapshots.
//! Progress is persisted after every transition so a crashed coordinator can
//! resume (forward or in reverse) after restart.
//!
//! Steps with external side effects declare themselves idempotent and are
//! wrapped through the idempotency manager keyed on (saga id, step name), so
//! a resumed saga never double-applies them.

pub mod context;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod provisioning;
pub mod step;

pub use context::SagaContext;
pub use coordinator::{CoordinatorConfig, SagaCoordinator, SagaResult};
pub use definition::{SagaDefinition, SagaRegistry};
pub use error::SagaError;
pub use provisioning::{
    InMemoryProvisioningService, ProvisioningService, SERVICE_PROVISIONING,
    service_provisioning_definition,
};
pub use step::{SagaStep, StepError, StepOutput};
