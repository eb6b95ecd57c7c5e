//! Idempotency manager error types.

use store::StoreError;
use thiserror::Error;

/// Errors that can occur during idempotent execution.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// Another caller owns an in-flight execution for this key and the call
    /// site chose not to wait. Back off and retry the read; do not resubmit.
    #[error("Duplicate operation in flight for key {0}")]
    DuplicateInFlight(String),

    /// The bounded wait for an in-flight owner expired.
    #[error("Timed out after {waited_ms}ms waiting for in-flight operation {key}")]
    WaitTimeout { key: String, waited_ms: u64 },

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Convenience type alias for idempotency results.
pub type Result<T> = std::result::Result<T, IdempotencyError>;
