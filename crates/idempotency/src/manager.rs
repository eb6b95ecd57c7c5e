//! Idempotent execution wrapper.

use chrono::Utc;
use store::{IdempotencyRecord, IdempotencyStatus, IdempotencyStore, InsertOutcome};

use crate::error::{IdempotencyError, Result};
use crate::key::IdempotencyKey;

/// What to do when another caller owns an in-flight execution for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Poll with bounded backoff until the owner finishes (hard timeout).
    Wait,
    /// Return `DuplicateInFlight` immediately.
    Reject,
}

/// Tuning knobs for duplicate handling.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Interval between polls while waiting on an in-flight owner.
    pub poll_interval: std::time::Duration,
    /// Hard cap on the total wait; prevents unbounded blocking.
    pub poll_timeout: std::time::Duration,
    /// Age past which a `pending` record is presumed orphaned by a crashed
    /// owner and may be reclaimed.
    pub stale_after: chrono::Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(50),
            poll_timeout: std::time::Duration::from_secs(5),
            stale_after: chrono::Duration::minutes(5),
        }
    }
}

/// The outcome of an idempotent execution.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub success: bool,
    /// Operation output when successful.
    pub data: Option<serde_json::Value>,
    /// Failure detail when not.
    pub error: Option<String>,
    /// True when this call returned a previously stored outcome instead of
    /// executing the operation.
    pub from_cache: bool,
}

impl OperationResult {
    fn cached(record: IdempotencyRecord) -> Self {
        Self {
            success: record.status == IdempotencyStatus::Completed,
            data: record.result,
            error: record.error,
            from_cache: true,
        }
    }
}

/// Executes operations at most once per key against a durable store.
///
/// Correctness rests entirely on the atomicity of the store's
/// insert-if-absent: of N concurrent callers sharing a key, exactly one
/// observes `Inserted` and runs the operation; the rest read its outcome.
pub struct IdempotencyManager<S: IdempotencyStore> {
    store: S,
    config: ManagerConfig,
}

impl<S: IdempotencyStore> IdempotencyManager<S> {
    /// Creates a manager with default duplicate handling.
    pub fn new(store: S) -> Self {
        Self::with_config(store, ManagerConfig::default())
    }

    /// Creates a manager with explicit tuning.
    pub fn with_config(store: S, config: ManagerConfig) -> Self {
        Self { store, config }
    }

    /// Runs `op` at most once for `key`.
    ///
    /// - no live record: this caller owns execution; the outcome (success or
    ///   failure) is stored and returned with `from_cache: false`
    /// - `completed` or `failed` record: its stored outcome is returned with
    ///   `from_cache: true`, the operation does not run
    /// - `pending` record: handled per `policy`; a stale `pending` (owner
    ///   presumed crashed) is reclaimed by whichever caller wins the
    ///   compare-and-swap
    ///
    /// Records expire after `ttl` and then count as absent, permitting safe
    /// retries after the cooldown.
    #[tracing::instrument(skip(self, op), fields(key = %key))]
    pub async fn execute<F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        ttl: chrono::Duration,
        policy: DuplicatePolicy,
        op: F,
    ) -> Result<OperationResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, E>>,
        E: std::fmt::Display,
    {
        let record = IdempotencyRecord::pending(key.as_str(), ttl);
        match self.store.try_insert_pending(record).await? {
            InsertOutcome::Inserted => self.run_as_owner(key, op).await,
            InsertOutcome::Existing(existing) => {
                self.handle_existing(key, ttl, policy, existing, op).await
            }
        }
    }

    async fn handle_existing<F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        ttl: chrono::Duration,
        policy: DuplicatePolicy,
        existing: IdempotencyRecord,
        op: F,
    ) -> Result<OperationResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, E>>,
        E: std::fmt::Display,
    {
        if existing.status != IdempotencyStatus::Pending {
            metrics::counter!("idempotency_cache_hits_total").increment(1);
            return Ok(OperationResult::cached(existing));
        }

        if self.try_reclaim(key, ttl, &existing).await? {
            return self.run_as_owner(key, op).await;
        }

        match policy {
            DuplicatePolicy::Reject => {
                Err(IdempotencyError::DuplicateInFlight(key.to_string()))
            }
            DuplicatePolicy::Wait => self.wait_for_owner(key, ttl, op).await,
        }
    }

    /// Bounded poll on an in-flight owner. If the record vanishes (TTL
    /// elapsed mid-wait) this caller attempts a fresh insert and may become
    /// the new owner.
    async fn wait_for_owner<F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        ttl: chrono::Duration,
        op: F,
    ) -> Result<OperationResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, E>>,
        E: std::fmt::Display,
    {
        let started = std::time::Instant::now();
        let mut op = Some(op);

        while started.elapsed() < self.config.poll_timeout {
            tokio::time::sleep(self.config.poll_interval).await;

            match self.store.get(key.as_str()).await? {
                Some(record) if record.status != IdempotencyStatus::Pending => {
                    metrics::counter!("idempotency_cache_hits_total").increment(1);
                    return Ok(OperationResult::cached(record));
                }
                Some(record) => {
                    if self.try_reclaim(key, ttl, &record).await?
                        && let Some(f) = op.take()
                    {
                        return self.run_as_owner(key, f).await;
                    }
                }
                None => {
                    // Record expired while we waited; race for ownership.
                    if let Some(f) = op.take() {
                        let fresh = IdempotencyRecord::pending(key.as_str(), ttl);
                        match self.store.try_insert_pending(fresh).await? {
                            InsertOutcome::Inserted => return self.run_as_owner(key, f).await,
                            InsertOutcome::Existing(_) => op = Some(f),
                        }
                    }
                }
            }
        }

        Err(IdempotencyError::WaitTimeout {
            key: key.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Attempts to take over a stale `pending` record. Returns true if this
    /// caller won ownership and should re-execute.
    async fn try_reclaim(
        &self,
        key: &IdempotencyKey,
        ttl: chrono::Duration,
        existing: &IdempotencyRecord,
    ) -> Result<bool> {
        let stale_before = Utc::now() - self.config.stale_after;
        if existing.created_at >= stale_before {
            return Ok(false);
        }

        let won = self
            .store
            .reclaim_pending(key.as_str(), stale_before, Utc::now() + ttl)
            .await?;
        if !won {
            return Ok(false);
        }

        // The prior owner may or may not have applied its side effect before
        // crashing; only idempotent operations are safe to re-run here.
        tracing::warn!(
            key = %key,
            pending_age_secs = (Utc::now() - existing.created_at).num_seconds(),
            retry_count = existing.retry_count + 1,
            "reclaimed stale pending record; prior owner presumed crashed, re-executing"
        );
        metrics::counter!("idempotency_reclaims_total").increment(1);
        Ok(true)
    }

    async fn run_as_owner<F, Fut, E>(&self, key: &IdempotencyKey, op: F) -> Result<OperationResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<serde_json::Value, E>>,
        E: std::fmt::Display,
    {
        metrics::counter!("idempotency_executions_total").increment(1);

        match op().await {
            Ok(data) => {
                self.store.mark_completed(key.as_str(), data.clone()).await?;
                Ok(OperationResult {
                    success: true,
                    data: Some(data),
                    error: None,
                    from_cache: false,
                })
            }
            Err(e) => {
                let message = e.to_string();
                self.store.mark_failed(key.as_str(), message.clone()).await?;
                Ok(OperationResult {
                    success: false,
                    data: None,
                    error: Some(message),
                    from_cache: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TenantId;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::InMemoryStore;

    type OpResult = std::result::Result<serde_json::Value, String>;

    fn make_key() -> IdempotencyKey {
        IdempotencyKey::derive("provision", TenantId::new(), &json!({"name": "x"}))
    }

    fn ttl() -> chrono::Duration {
        chrono::Duration::seconds(60)
    }

    #[tokio::test]
    async fn second_call_returns_cached_result() {
        let manager = IdempotencyManager::new(InMemoryStore::new());
        let key = make_key();
        let executions = Arc::new(AtomicUsize::new(0));

        let counter = executions.clone();
        let first = manager
            .execute(&key, ttl(), DuplicatePolicy::Wait, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                OpResult::Ok(json!({"provisioned": true}))
            })
            .await
            .unwrap();
        assert!(first.success);
        assert!(!first.from_cache);

        let counter = executions.clone();
        let second = manager
            .execute(&key, ttl(), DuplicatePolicy::Wait, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                OpResult::Ok(json!({"provisioned": "again"}))
            })
            .await
            .unwrap();

        assert!(second.success);
        assert!(second.from_cache);
        assert_eq!(second.data, first.data);
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_cached_and_not_retried() {
        let manager = IdempotencyManager::new(InMemoryStore::new());
        let key = make_key();

        let first = manager
            .execute(&key, ttl(), DuplicatePolicy::Wait, || async {
                OpResult::Err("downstream unavailable".to_string())
            })
            .await
            .unwrap();
        assert!(!first.success);
        assert_eq!(first.error.as_deref(), Some("downstream unavailable"));

        let second = manager
            .execute(&key, ttl(), DuplicatePolicy::Wait, || async {
                OpResult::Ok(json!({"should": "not run"}))
            })
            .await
            .unwrap();
        assert!(!second.success);
        assert!(second.from_cache);
        assert_eq!(second.error.as_deref(), Some("downstream unavailable"));
    }

    #[tokio::test]
    async fn concurrent_callers_execute_once() {
        let store = InMemoryStore::new();
        let manager = Arc::new(IdempotencyManager::new(store));
        let key = make_key();
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let key = key.clone();
            let counter = executions.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .execute(&key, chrono::Duration::seconds(60), DuplicatePolicy::Wait, {
                        move || async move {
                            // Hold ownership long enough for others to pile up.
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            counter.fetch_add(1, Ordering::SeqCst);
                            OpResult::Ok(json!({"winner": true}))
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        for result in &results {
            assert!(result.success);
            assert_eq!(result.data, Some(json!({"winner": true})));
        }
        assert_eq!(results.iter().filter(|r| !r.from_cache).count(), 1);
    }

    #[tokio::test]
    async fn reject_policy_signals_duplicate_in_flight() {
        let store = InMemoryStore::new();
        let key = make_key();

        // Simulate an in-flight owner.
        store
            .try_insert_pending(IdempotencyRecord::pending(key.as_str(), ttl()))
            .await
            .unwrap();

        let manager = IdempotencyManager::new(store);
        let result = manager
            .execute(&key, ttl(), DuplicatePolicy::Reject, || async {
                OpResult::Ok(json!({}))
            })
            .await;

        assert!(matches!(
            result,
            Err(IdempotencyError::DuplicateInFlight(_))
        ));
    }

    #[tokio::test]
    async fn wait_times_out_on_stuck_owner() {
        let store = InMemoryStore::new();
        let key = make_key();
        store
            .try_insert_pending(IdempotencyRecord::pending(key.as_str(), ttl()))
            .await
            .unwrap();

        let config = ManagerConfig {
            poll_interval: std::time::Duration::from_millis(10),
            poll_timeout: std::time::Duration::from_millis(80),
            stale_after: chrono::Duration::minutes(5),
        };
        let manager = IdempotencyManager::with_config(store, config);

        let result = manager
            .execute(&key, ttl(), DuplicatePolicy::Wait, || async {
                OpResult::Ok(json!({}))
            })
            .await;

        assert!(matches!(result, Err(IdempotencyError::WaitTimeout { .. })));
    }

    #[tokio::test]
    async fn expired_record_allows_reexecution() {
        let store = InMemoryStore::new();
        let key = make_key();

        let mut record = IdempotencyRecord::pending(key.as_str(), ttl());
        record.status = IdempotencyStatus::Completed;
        record.result = Some(json!({"old": true}));
        record.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.try_insert_pending(record).await.unwrap();

        let manager = IdempotencyManager::new(store);
        let result = manager
            .execute(&key, ttl(), DuplicatePolicy::Wait, || async {
                OpResult::Ok(json!({"new": true}))
            })
            .await
            .unwrap();

        assert!(result.success);
        assert!(!result.from_cache);
        assert_eq!(result.data, Some(json!({"new": true})));
    }

    #[tokio::test]
    async fn stale_pending_is_reclaimed() {
        let store = InMemoryStore::new();
        let key = make_key();

        // An owner that "crashed" ten minutes ago.
        let mut record = IdempotencyRecord::pending(key.as_str(), chrono::Duration::hours(1));
        record.created_at = Utc::now() - chrono::Duration::minutes(10);
        store.try_insert_pending(record).await.unwrap();

        let manager = IdempotencyManager::new(store.clone());
        let result = manager
            .execute(&key, ttl(), DuplicatePolicy::Wait, || async {
                OpResult::Ok(json!({"reclaimed": true}))
            })
            .await
            .unwrap();

        assert!(result.success);
        assert!(!result.from_cache);

        let stored = store.get(key.as_str()).await.unwrap().unwrap();
        assert_eq!(stored.status, IdempotencyStatus::Completed);
        assert_eq!(stored.retry_count, 1);
    }
}
