//! Versioned policy definition storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// A stored policy definition version.
///
/// Rules are kept as raw JSON; the policy crate owns the typed rule model.
/// Rows are immutable once written — changing a policy means storing a new
/// version and flipping the `active` flag, which preserves the audit trail
/// of past decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDefinitionRecord {
    /// Policy name (e.g. "residential_basic").
    pub name: String,
    /// Semantic version string, unique per name.
    pub version: String,
    /// Rule set as JSON.
    pub rules: serde_json::Value,
    /// Whether this is the active version for its name.
    pub active: bool,
    /// When this version was stored.
    pub created_at: DateTime<Utc>,
}

impl PolicyDefinitionRecord {
    /// Creates a new inactive record timestamped now.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        rules: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            rules,
            active: false,
            created_at: Utc::now(),
        }
    }
}

/// Storage contract for versioned policy definitions.
///
/// At most one version per policy name is active at a time; activation
/// flips the flag transactionally.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Stores a new policy version.
    ///
    /// Fails with `DuplicatePolicyVersion` if the (name, version) pair
    /// already exists.
    async fn save_definition(&self, record: PolicyDefinitionRecord) -> Result<()>;

    /// Retrieves a specific policy version.
    async fn get_definition(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PolicyDefinitionRecord>>;

    /// Retrieves the active version for a policy name.
    async fn get_active_definition(&self, name: &str) -> Result<Option<PolicyDefinitionRecord>>;

    /// Marks the given version active and deactivates all others for the
    /// same name, as a single transaction.
    ///
    /// Fails with `PolicyNotFound` if the version does not exist.
    async fn activate_version(&self, name: &str, version: &str) -> Result<()>;

    /// Lists all stored versions for a policy name, oldest first.
    async fn list_versions(&self, name: &str) -> Result<Vec<String>>;
}
