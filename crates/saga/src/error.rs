//! Saga coordinator error types.

use common::SagaId;
use idempotency::IdempotencyError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur while coordinating a saga.
///
/// Step failure and compensation exhaustion are not errors: they resolve to
/// the `Compensated` and `Failed` terminal statuses and are reported through
/// the saga's result. Errors here mean the coordinator itself could not make
/// progress.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition registered under the requested name.
    #[error("Unknown saga definition: {0}")]
    UnknownDefinition(String),

    /// No execution exists for this ID.
    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// A cancel was requested for a saga that already reached a terminal
    /// status.
    #[error("Saga {0} is already in terminal status {1}")]
    AlreadyTerminal(SagaId, String),

    /// The stored step count no longer matches the registered definition.
    #[error("Saga {saga_id} has {recorded} recorded steps but definition '{definition}' declares {declared}")]
    DefinitionMismatch {
        saga_id: SagaId,
        definition: String,
        recorded: usize,
        declared: usize,
    },

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Idempotent step wrapper error.
    #[error("Idempotency error: {0}")]
    Idempotency(#[from] IdempotencyError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
