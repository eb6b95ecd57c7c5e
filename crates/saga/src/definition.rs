//! Saga definitions and the definition registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::step::SagaStep;

/// A named, ordered sequence of saga steps.
///
/// Definitions are immutable once registered; the durable execution record
/// stores the definition name, and recovery resolves it back through the
/// registry.
#[derive(Clone)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
}

impl SagaDefinition {
    /// Creates an empty definition with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step. Steps run in insertion order and compensate in
    /// reverse.
    pub fn step(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// The definition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The ordered steps.
    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True when the definition has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Lookup table of registered saga definitions.
#[derive(Default)]
pub struct SagaRegistry {
    definitions: HashMap<String, SagaDefinition>,
}

impl SagaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition under its own name, replacing any previous
    /// registration.
    pub fn register(&mut self, definition: SagaDefinition) {
        self.definitions
            .insert(definition.name().to_string(), definition);
    }

    /// Looks up a definition by name.
    pub fn get(&self, name: &str) -> Option<&SagaDefinition> {
        self.definitions.get(name)
    }

    /// Names of all registered definitions.
    pub fn names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SagaContext;
    use crate::step::{StepError, StepOutput};
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl SagaStep for Noop {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _context: &SagaContext) -> Result<StepOutput, StepError> {
            Ok(StepOutput::none())
        }

        async fn compensate(&self, _context: &SagaContext) -> Result<(), StepError> {
            Ok(())
        }
    }

    #[test]
    fn definition_preserves_step_order() {
        let definition = SagaDefinition::new("checkout")
            .step(Arc::new(Noop("reserve")))
            .step(Arc::new(Noop("charge")))
            .step(Arc::new(Noop("ship")));

        let names: Vec<_> = definition.steps().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["reserve", "charge", "ship"]);
        assert_eq!(definition.len(), 3);
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = SagaRegistry::new();
        registry.register(SagaDefinition::new("checkout").step(Arc::new(Noop("reserve"))));

        assert!(registry.get("checkout").is_some());
        assert!(registry.get("unknown").is_none());
    }
}
