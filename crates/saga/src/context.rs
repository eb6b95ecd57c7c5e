//! Shared saga execution context.

use serde::{Deserialize, Serialize};

/// The mutable key/value mapping accumulated by saga steps.
///
/// Steps read what earlier steps produced and contribute their own outputs.
/// The coordinator snapshots the context after every successful step; a
/// step's compensation sees the snapshot taken right after that step ran,
/// never later steps' contributions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SagaContext {
    values: serde_json::Map<String, serde_json::Value>,
}

impl SagaContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from a JSON value. Non-object values yield an empty
    /// context.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(values) => Self { values },
            _ => Self::default(),
        }
    }

    /// Returns the context as a JSON object value.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::Value::Object(self.values.clone())
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Looks up a key as a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    /// Sets a key.
    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Merges a step's output into the context, overwriting existing keys.
    pub fn merge(&mut self, output: serde_json::Map<String, serde_json::Value>) {
        for (key, value) in output {
            self.values.insert(key, value);
        }
    }

    /// Returns true if the context holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
