//! Idempotent operation manager.
//!
//! Wraps arbitrary operations so that repeated invocations with the same
//! logical key return the original result instead of re-executing. Ownership
//! of an execution is decided by a single atomic insert-if-absent against
//! the durable store; everything else follows from that.

pub mod error;
pub mod key;
pub mod manager;

pub use error::IdempotencyError;
pub use key::IdempotencyKey;
pub use manager::{DuplicatePolicy, IdempotencyManager, ManagerConfig, OperationResult};
