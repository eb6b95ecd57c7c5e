//! Deterministic idempotency key derivation.

use common::{SagaId, TenantId};
use sha2::{Digest, Sha256};

/// A deterministic identifier ensuring repeated requests with identical
/// intent execute at most once.
///
/// Derived as SHA-256 over the operation type, the tenant and the
/// canonicalized payload, so two requests that mean the same thing hash to
/// the same key regardless of JSON key ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derives a key from an operation's identity.
    pub fn derive(operation_type: &str, tenant_id: TenantId, payload: &serde_json::Value) -> Self {
        let mut canonical = String::new();
        canonicalize(payload, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(operation_type.as_bytes());
        hasher.update([0]);
        hasher.update(tenant_id.as_uuid().as_bytes());
        hasher.update([0]);
        hasher.update(canonical.as_bytes());

        let digest = hasher.finalize();
        Self(hex_encode(&digest))
    }

    /// Derives the key for an idempotent saga step invocation.
    ///
    /// Keyed on (saga id, step name) so a resumed saga re-running the step
    /// hits the original record instead of double-applying side effects.
    pub fn for_saga_step(saga_id: SagaId, step_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"saga-step");
        hasher.update([0]);
        hasher.update(saga_id.as_uuid().as_bytes());
        hasher.update([0]);
        hasher.update(step_name.as_bytes());

        let digest = hasher.finalize();
        Self(hex_encode(&digest))
    }

    /// Returns the key as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Writes a canonical text form of a JSON value: object keys sorted
/// recursively, no insignificant whitespace.
fn canonicalize(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                canonicalize(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
