//! Policy evaluation engine.
//!
//! Evaluates declarative, versioned business rules against a context and a
//! data payload, returning an admit/deny decision with the specific rules
//! that failed and a weighted score.
//!
//! Design points:
//! - rules never short-circuit: every rule is evaluated so callers can show
//!   a complete explanation
//! - a missing target field fails the rule rather than raising an error, so
//!   malformed payloads fail closed
//! - a pinned version always yields the same decision for the same inputs;
//!   nothing in evaluation reads the wall clock
//! - no side effects, no locks; safe to call concurrently

pub mod engine;
pub mod error;
pub mod path;
pub mod types;

pub use engine::{PolicyEngine, VersionSelector};
pub use error::PolicyError;
pub use types::{
    Operator, PolicyContext, PolicyDefinition, PolicyResult, PolicyRule, RuleResult, Severity,
};
