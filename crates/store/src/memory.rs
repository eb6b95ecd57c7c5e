use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use tokio::sync::RwLock;

use crate::{
    IdempotencyRecord, IdempotencyStatus, IdempotencyStore, InsertOutcome, PolicyDefinitionRecord,
    PolicyStore, Result, SagaExecutionRecord, SagaStatus, SagaStepHistoryRecord, SagaStore,
    StoreError,
};

/// In-memory store implementation for testing and single-process use.
///
/// Provides the same contracts as the PostgreSQL implementation. Writes take
/// the whole-map lock, so insert-if-absent and version checks are atomic by
/// construction.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    policies: Arc<RwLock<Vec<PolicyDefinitionRecord>>>,
    idempotency: Arc<RwLock<HashMap<String, IdempotencyRecord>>>,
    sagas: Arc<RwLock<HashMap<SagaId, SagaExecutionRecord>>>,
    step_history: Arc<RwLock<Vec<SagaStepHistoryRecord>>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live (unexpired) idempotency records.
    pub async fn idempotency_record_count(&self) -> usize {
        let now = Utc::now();
        self.idempotency
            .read()
            .await
            .values()
            .filter(|r| !r.is_expired_at(now))
            .count()
    }

    /// Clears all stored state.
    pub async fn clear(&self) {
        self.policies.write().await.clear();
        self.idempotency.write().await.clear();
        self.sagas.write().await.clear();
        self.step_history.write().await.clear();
    }
}

#[async_trait]
impl PolicyStore for InMemoryStore {
    async fn save_definition(&self, record: PolicyDefinitionRecord) -> Result<()> {
        let mut policies = self.policies.write().await;
        if policies
            .iter()
            .any(|p| p.name == record.name && p.version == record.version)
        {
            return Err(StoreError::DuplicatePolicyVersion {
                name: record.name,
                version: record.version,
            });
        }
        policies.push(record);
        Ok(())
    }

    async fn get_definition(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PolicyDefinitionRecord>> {
        let policies = self.policies.read().await;
        Ok(policies
            .iter()
            .find(|p| p.name == name && p.version == version)
            .cloned())
    }

    async fn get_active_definition(&self, name: &str) -> Result<Option<PolicyDefinitionRecord>> {
        let policies = self.policies.read().await;
        Ok(policies
            .iter()
            .find(|p| p.name == name && p.active)
            .cloned())
    }

    async fn activate_version(&self, name: &str, version: &str) -> Result<()> {
        let mut policies = self.policies.write().await;
        if !policies
            .iter()
            .any(|p| p.name == name && p.version == version)
        {
            return Err(StoreError::PolicyNotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        for policy in policies.iter_mut().filter(|p| p.name == name) {
            policy.active = policy.version == version;
        }
        Ok(())
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<String>> {
        let policies = self.policies.read().await;
        let mut versions: Vec<_> = policies
            .iter()
            .filter(|p| p.name == name)
            .map(|p| (p.created_at, p.version.clone()))
            .collect();
        versions.sort();
        Ok(versions.into_iter().map(|(_, v)| v).collect())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn try_insert_pending(&self, record: IdempotencyRecord) -> Result<InsertOutcome> {
        let mut records = self.idempotency.write().await;
        let now = Utc::now();

        if let Some(existing) = records.get(&record.key)
            && !existing.is_expired_at(now)
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }

        // Absent or expired: this caller owns execution.
        records.insert(record.key.clone(), record);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let records = self.idempotency.read().await;
        let now = Utc::now();
        Ok(records
            .get(key)
            .filter(|r| !r.is_expired_at(now))
            .cloned())
    }

    async fn mark_completed(&self, key: &str, result: serde_json::Value) -> Result<()> {
        let mut records = self.idempotency.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::RecordNotFound(key.to_string()))?;
        record.status = IdempotencyStatus::Completed;
        record.result = Some(result);
        record.error = None;
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: String) -> Result<()> {
        let mut records = self.idempotency.write().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::RecordNotFound(key.to_string()))?;
        record.status = IdempotencyStatus::Failed;
        record.error = Some(error);
        record.result = None;
        Ok(())
    }

    async fn reclaim_pending(
        &self,
        key: &str,
        stale_before: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut records = self.idempotency.write().await;
        let Some(record) = records.get_mut(key) else {
            return Ok(false);
        };
        if record.status != IdempotencyStatus::Pending || record.created_at >= stale_before {
            return Ok(false);
        }
        record.created_at = Utc::now();
        record.expires_at = new_expires_at;
        record.retry_count += 1;
        Ok(true)
    }
}

#[async_trait]
impl SagaStore for InMemoryStore {
    async fn insert_execution(&self, record: &SagaExecutionRecord) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        sagas.insert(record.saga_id, record.clone());
        Ok(())
    }

    async fn get_execution(&self, saga_id: SagaId) -> Result<Option<SagaExecutionRecord>> {
        let sagas = self.sagas.read().await;
        Ok(sagas.get(&saga_id).cloned())
    }

    async fn update_execution(&self, record: &SagaExecutionRecord) -> Result<i64> {
        let mut sagas = self.sagas.write().await;
        let stored = sagas
            .get_mut(&record.saga_id)
            .ok_or(StoreError::SagaNotFound(record.saga_id))?;

        if stored.version != record.version {
            return Err(StoreError::ConcurrencyConflict {
                saga_id: record.saga_id,
                expected: record.version,
                actual: stored.version,
            });
        }

        // Preserve a cancellation requested while the caller held a stale
        // snapshot, mirroring the SQL implementation.
        let cancel_requested = stored.cancel_requested || record.cancel_requested;
        let new_version = record.version + 1;
        *stored = record.clone();
        stored.cancel_requested = cancel_requested;
        stored.version = new_version;
        stored.updated_at = Utc::now();
        Ok(new_version)
    }

    async fn claim_execution(
        &self,
        saga_id: SagaId,
        expected_version: i64,
    ) -> Result<SagaExecutionRecord> {
        let mut sagas = self.sagas.write().await;
        let stored = sagas
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;

        if stored.version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn list_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaExecutionRecord>> {
        let sagas = self.sagas.read().await;
        let mut matching: Vec<_> = sagas
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.started_at);
        Ok(matching)
    }

    async fn request_cancel(&self, saga_id: SagaId) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        let stored = sagas
            .get_mut(&saga_id)
            .ok_or(StoreError::SagaNotFound(saga_id))?;
        stored.cancel_requested = true;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn append_step_history(&self, record: &SagaStepHistoryRecord) -> Result<()> {
        let mut history = self.step_history.write().await;
        history.push(record.clone());
        Ok(())
    }

    async fn get_step_history(&self, saga_id: SagaId) -> Result<Vec<SagaStepHistoryRecord>> {
        let history = self.step_history.read().await;
        Ok(history
            .iter()
            .filter(|h| h.saga_id == saga_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::TenantId;
    use crate::StepStatus;

    #[tokio::test]
    async fn policy_versions_are_immutable() {
        let store = InMemoryStore::new();
        let record = PolicyDefinitionRecord::new("p", "1.0.0", serde_json::json!([]));
        store.save_definition(record.clone()).await.unwrap();

        let result = store.save_definition(record).await;
        assert!(matches!(
            result,
            Err(StoreError::DuplicatePolicyVersion { .. })
        ));
    }

    #[tokio::test]
    async fn activation_is_exclusive_per_name() {
        let store = InMemoryStore::new();
        store
            .save_definition(PolicyDefinitionRecord::new("p", "1.0.0", serde_json::json!([])))
            .await
            .unwrap();
        store
            .save_definition(PolicyDefinitionRecord::new("p", "2.0.0", serde_json::json!([])))
            .await
            .unwrap();

        store.activate_version("p", "1.0.0").await.unwrap();
        store.activate_version("p", "2.0.0").await.unwrap();

        let active = store.get_active_definition("p").await.unwrap().unwrap();
        assert_eq!(active.version, "2.0.0");

        let old = store.get_definition("p", "1.0.0").await.unwrap().unwrap();
        assert!(!old.active);
    }

    #[tokio::test]
    async fn activating_missing_version_fails() {
        let store = InMemoryStore::new();
        let result = store.activate_version("p", "9.9.9").await;
        assert!(matches!(result, Err(StoreError::PolicyNotFound { .. })));
    }

    #[tokio::test]
    async fn insert_if_absent_yields_one_owner() {
        let store = InMemoryStore::new();
        let record = IdempotencyRecord::pending("key-1", Duration::seconds(60));

        let first = store.try_insert_pending(record.clone()).await.unwrap();
        assert!(matches!(first, InsertOutcome::Inserted));

        let second = store.try_insert_pending(record).await.unwrap();
        assert!(matches!(second, InsertOutcome::Existing(_)));
    }

    #[tokio::test]
    async fn expired_record_is_treated_as_absent() {
        let store = InMemoryStore::new();
        let mut record = IdempotencyRecord::pending("key-1", Duration::seconds(60));
        record.expires_at = Utc::now() - Duration::seconds(1);
        store.try_insert_pending(record.clone()).await.unwrap();

        assert!(store.get("key-1").await.unwrap().is_none());

        let fresh = IdempotencyRecord::pending("key-1", Duration::seconds(60));
        let outcome = store.try_insert_pending(fresh).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::Inserted));
    }

    #[tokio::test]
    async fn completion_stores_result() {
        let store = InMemoryStore::new();
        store
            .try_insert_pending(IdempotencyRecord::pending("key-1", Duration::seconds(60)))
            .await
            .unwrap();
        store
            .mark_completed("key-1", serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let record = store.get("key-1").await.unwrap().unwrap();
        assert_eq!(record.status, IdempotencyStatus::Completed);
        assert_eq!(record.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn reclaim_only_wins_on_stale_pending() {
        let store = InMemoryStore::new();
        store
            .try_insert_pending(IdempotencyRecord::pending("key-1", Duration::seconds(600)))
            .await
            .unwrap();

        // Fresh record: not reclaimable.
        let won = store
            .reclaim_pending(
                "key-1",
                Utc::now() - Duration::seconds(300),
                Utc::now() + Duration::seconds(600),
            )
            .await
            .unwrap();
        assert!(!won);

        // Pretend the owner crashed ten minutes ago.
        let won = store
            .reclaim_pending(
                "key-1",
                Utc::now() + Duration::seconds(1),
                Utc::now() + Duration::seconds(600),
            )
            .await
            .unwrap();
        assert!(won);

        let record = store.get("key-1").await.unwrap().unwrap();
        assert_eq!(record.retry_count, 1);
    }

    fn make_execution() -> SagaExecutionRecord {
        SagaExecutionRecord::new(
            SagaId::new(),
            "service_provisioning",
            TenantId::new(),
            4,
            serde_json::json!({"plan": "basic"}),
        )
    }

    #[tokio::test]
    async fn update_with_stale_version_conflicts() {
        let store = InMemoryStore::new();
        let mut record = make_execution();
        store.insert_execution(&record).await.unwrap();

        record.current_step = 1;
        let new_version = store.update_execution(&record).await.unwrap();
        assert_eq!(new_version, 2);

        // Second update from the same stale snapshot must fail.
        let result = store.update_execution(&record).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryStore::new();
        let record = make_execution();
        store.insert_execution(&record).await.unwrap();

        let claimed = store
            .claim_execution(record.saga_id, record.version)
            .await
            .unwrap();
        assert_eq!(claimed.version, record.version + 1);

        // A second worker claiming from the same snapshot loses.
        let result = store.claim_execution(record.saga_id, record.version).await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn list_by_status_filters() {
        let store = InMemoryStore::new();
        let running = make_execution();
        store.insert_execution(&running).await.unwrap();

        let mut completed = make_execution();
        completed.status = SagaStatus::Completed;
        store.insert_execution(&completed).await.unwrap();

        let incomplete = store
            .list_by_status(&[SagaStatus::Running, SagaStatus::Compensating])
            .await
            .unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].saga_id, running.saga_id);
    }

    #[tokio::test]
    async fn step_history_is_scoped_per_saga() {
        let store = InMemoryStore::new();
        let saga_a = SagaId::new();
        let saga_b = SagaId::new();

        store
            .append_step_history(&SagaStepHistoryRecord::new(
                saga_a,
                "validate",
                StepStatus::Succeeded,
                serde_json::json!({"validated": true}),
            ))
            .await
            .unwrap();
        store
            .append_step_history(&SagaStepHistoryRecord::new(
                saga_b,
                "validate",
                StepStatus::Failed,
                serde_json::json!({}),
            ))
            .await
            .unwrap();

        let history = store.get_step_history(saga_a).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StepStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancel_flag_is_persisted() {
        let store = InMemoryStore::new();
        let record = make_execution();
        store.insert_execution(&record).await.unwrap();

        store.request_cancel(record.saga_id).await.unwrap();
        let stored = store.get_execution(record.saga_id).await.unwrap().unwrap();
        assert!(stored.cancel_requested);
    }
}
