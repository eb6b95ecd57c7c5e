use common::SagaId;
use thiserror::Error;

/// Errors that can occur when interacting with the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An optimistic version check failed when updating a saga execution.
    /// Another worker holds (or held) the row.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: i64,
        actual: i64,
    },

    /// The saga execution was not found in the store.
    #[error("Saga execution not found: {0}")]
    SagaNotFound(SagaId),

    /// A policy version with this (name, version) pair already exists.
    /// Policies are immutable once stored; publish a new version instead.
    #[error("Policy version already exists: {name} v{version}")]
    DuplicatePolicyVersion { name: String, version: String },

    /// The requested policy version does not exist.
    #[error("Policy not found: {name} v{version}")]
    PolicyNotFound { name: String, version: String },

    /// The idempotency record was not found (or has expired).
    #[error("Idempotency record not found: {0}")]
    RecordNotFound(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
