//! Saga step contracts.

use async_trait::async_trait;
use thiserror::Error;

use crate::context::SagaContext;

/// A step-level failure. Converted by the coordinator into a compensation
/// trigger (execute) or retried a bounded number of times (compensate).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct StepError(pub String);

impl StepError {
    /// Creates a step error from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

/// Values a step contributes to the shared context on success.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl StepOutput {
    /// An output contributing nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builds an output with a single key.
    pub fn with(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut output = Self::default();
        output.values.insert(key.into(), value);
        output
    }

    /// Adds a key to the output.
    pub fn and(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// One step of a saga definition.
///
/// Implementations are pure descriptors: stateless apart from handles to
/// external services, shared across concurrent saga executions.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name, unique within its definition.
    fn name(&self) -> &str;

    /// Whether the step has external side effects that must not be applied
    /// twice. Idempotent steps are wrapped through the idempotency manager
    /// keyed on (saga id, step name); any step that talks to an external
    /// service should return true, or crash-resume cannot be made safe.
    fn idempotent(&self) -> bool {
        false
    }

    /// Performs the step against the accumulated context.
    async fn execute(&self, context: &SagaContext) -> Result<StepOutput, StepError>;

    /// Semantically undoes a previously successful execution.
    ///
    /// Receives the context snapshot taken right after this step ran, so it
    /// must not assume later steps' contributions exist. Must tolerate being
    /// called more than once.
    async fn compensate(&self, context: &SagaContext) -> Result<(), StepError>;
}
