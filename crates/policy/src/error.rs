//! Policy engine error types.

use store::StoreError;
use thiserror::Error;

/// Errors that can occur during policy operations.
///
/// A denied evaluation is not an error — it is a `PolicyResult` with
/// `admitted: false`. These variants cover lookup and storage problems only.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// No definition exists for the requested policy name/version.
    #[error("Policy not found: {name} ({version})")]
    NotFound { name: String, version: String },

    /// No version of this policy is currently active.
    #[error("Policy has no active version: {0}")]
    NoActiveVersion(String),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error while loading stored rules.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for policy results.
pub type Result<T> = std::result::Result<T, PolicyError>;
