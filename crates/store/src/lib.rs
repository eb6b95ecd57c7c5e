pub mod error;
pub mod idempotency_store;
pub mod memory;
pub mod policy_store;
pub mod postgres;
pub mod saga_store;

pub use common::{SagaId, TenantId};
pub use error::{Result, StoreError};
pub use idempotency_store::{
    IdempotencyRecord, IdempotencyStatus, IdempotencyStore, InsertOutcome,
};
pub use memory::InMemoryStore;
pub use policy_store::{PolicyDefinitionRecord, PolicyStore};
pub use postgres::PostgresStore;
pub use saga_store::{
    SagaExecutionRecord, SagaStatus, SagaStepHistoryRecord, SagaStore, StepStatus,
};
