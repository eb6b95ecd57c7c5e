//! Durable idempotency record storage.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Lifecycle status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The owning caller is executing the operation.
    Pending,
    /// The operation finished successfully; `result` holds its output.
    Completed,
    /// The operation failed terminally; `error` holds the detail.
    Failed,
}

impl IdempotencyStatus {
    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    /// Parses a status from its stored form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IdempotencyStatus::Pending),
            "completed" => Some(IdempotencyStatus::Completed),
            "failed" => Some(IdempotencyStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A durable record of one idempotent operation invocation.
///
/// Invariant: at most one non-expired record exists per key. A record past
/// its `expires_at` is treated as absent by every store operation, which is
/// what permits safe retries after the TTL cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Deterministic key (hex digest over operation type, tenant, payload).
    pub key: String,
    pub status: IdempotencyStatus,
    /// Operation output, present only when `completed`.
    pub result: Option<serde_json::Value>,
    /// Failure detail, present only when `failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Number of times ownership of this record was (re)taken.
    pub retry_count: i32,
}

impl IdempotencyRecord {
    /// Creates a fresh `pending` record owned by the calling process.
    pub fn pending(key: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            status: IdempotencyStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            expires_at: now + ttl,
            retry_count: 0,
        }
    }

    /// Returns true if the record has expired at the given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Returns true if the record has expired now.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Outcome of an insert-if-absent attempt.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// No live record existed; the caller owns execution.
    Inserted,
    /// A live record already exists; the caller lost the race (or arrived
    /// after the owner finished).
    Existing(IdempotencyRecord),
}

/// Storage contract for idempotency records.
///
/// `try_insert_pending` is the one operation whose atomicity the whole
/// deduplication guarantee rests on: two concurrent callers with the same
/// key must observe exactly one `Inserted`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically inserts the record if no live record exists for its key.
    ///
    /// An expired record counts as absent and is replaced.
    async fn try_insert_pending(&self, record: IdempotencyRecord) -> Result<InsertOutcome>;

    /// Fetches the live record for a key. Expired records yield `None`.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Transitions a record to `completed`, storing the operation result.
    async fn mark_completed(&self, key: &str, result: serde_json::Value) -> Result<()>;

    /// Transitions a record to `failed`, storing the error detail.
    async fn mark_failed(&self, key: &str, error: String) -> Result<()>;

    /// Attempts to take over a stale `pending` record (owner presumed
    /// crashed). Compare-and-swap on the creation timestamp: succeeds for
    /// exactly one caller, refreshing `created_at`/`expires_at` and bumping
    /// `retry_count`.
    ///
    /// Returns true if this caller won ownership.
    async fn reclaim_pending(
        &self,
        key: &str,
        stale_before: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_record_carries_ttl() {
        let record = IdempotencyRecord::pending("abc", Duration::seconds(60));
        assert_eq!(record.status, IdempotencyStatus::Pending);
        assert_eq!(record.expires_at - record.created_at, Duration::seconds(60));
        assert!(!record.is_expired());
    }

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let record = IdempotencyRecord::pending("abc", Duration::seconds(60));
        assert!(record.is_expired_at(record.expires_at));
        assert!(!record.is_expired_at(record.expires_at - Duration::seconds(1)));
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(IdempotencyStatus::parse("bogus"), None);
    }
}
