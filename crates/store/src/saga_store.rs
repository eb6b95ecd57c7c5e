//! Durable saga execution state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, TenantId};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Overall status of a saga execution.
///
/// ```text
/// Running ──┬──► Completed
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// ```
///
/// `Failed` means a compensation could not complete within its retry limit
/// and the saga needs operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Running,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::Failed => "failed",
        }
    }

    /// Parses a status from its stored form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SagaStatus::Running),
            "completed" => Some(SagaStatus::Completed),
            "compensating" => Some(SagaStatus::Compensating),
            "compensated" => Some(SagaStatus::Compensated),
            "failed" => Some(SagaStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of an individual step within a saga execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Succeeded,
    Compensating,
    Compensated,
    Failed,
}

impl StepStatus {
    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Compensating => "compensating",
            StepStatus::Compensated => "compensated",
            StepStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The durable state of one saga execution.
///
/// `version` is the optimistic concurrency token: every update (including a
/// worker claim) must present the current value and bumps it by one, which
/// is what guarantees no two workers ever drive the same saga.
///
/// Rows are retained after completion for audit and never deleted by the
/// core; cleanup is an external concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaExecutionRecord {
    pub saga_id: SagaId,
    pub definition_name: String,
    pub tenant_id: TenantId,
    pub status: SagaStatus,
    /// Index of the next step to run (forward) or the step being unwound
    /// (while compensating).
    pub current_step: i32,
    /// Per-step status, one entry per step of the definition.
    pub step_statuses: Vec<StepStatus>,
    /// Accumulated saga context as JSON.
    pub context: serde_json::Value,
    /// Name of the step that triggered failure, if any.
    pub failed_step: Option<String>,
    /// Set between steps to request cooperative cancellation.
    pub cancel_requested: bool,
    /// Optimistic concurrency version.
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SagaExecutionRecord {
    /// Creates a new `running` execution at step 0 with the given context.
    pub fn new(
        saga_id: SagaId,
        definition_name: impl Into<String>,
        tenant_id: TenantId,
        step_count: usize,
        context: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            definition_name: definition_name.into(),
            tenant_id,
            status: SagaStatus::Running,
            current_step: 0,
            step_statuses: vec![StepStatus::Pending; step_count],
            context,
            failed_step: None,
            cancel_requested: false,
            version: 1,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// One row of the append-only per-step audit trail.
///
/// `context_snapshot` is the saga context as it existed right after the step
/// executed; compensation replays against this snapshot, never the final
/// context, so it cannot observe later steps' contributions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStepHistoryRecord {
    pub saga_id: SagaId,
    pub step_name: String,
    pub status: StepStatus,
    pub context_snapshot: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl SagaStepHistoryRecord {
    /// Creates a history row timestamped now.
    pub fn new(
        saga_id: SagaId,
        step_name: impl Into<String>,
        status: StepStatus,
        context_snapshot: serde_json::Value,
    ) -> Self {
        Self {
            saga_id,
            step_name: step_name.into(),
            status,
            context_snapshot,
            recorded_at: Utc::now(),
        }
    }
}

/// Storage contract for saga executions and their step history.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persists a brand-new execution. Durability-first: this happens before
    /// any step runs, so a crash immediately after start is observable.
    async fn insert_execution(&self, record: &SagaExecutionRecord) -> Result<()>;

    /// Fetches an execution by ID.
    async fn get_execution(&self, saga_id: SagaId) -> Result<Option<SagaExecutionRecord>>;

    /// Updates an execution with an optimistic version check.
    ///
    /// `record.version` must equal the stored version; the row is written
    /// with `version + 1`, which is returned. Fails with
    /// `ConcurrencyConflict` otherwise.
    async fn update_execution(&self, record: &SagaExecutionRecord) -> Result<i64>;

    /// Atomically claims an execution for exclusive processing by bumping
    /// its version from `expected_version`.
    ///
    /// Returns the claimed record (with the new version). A competing
    /// worker's claim from the same snapshot fails with
    /// `ConcurrencyConflict`.
    async fn claim_execution(
        &self,
        saga_id: SagaId,
        expected_version: i64,
    ) -> Result<SagaExecutionRecord>;

    /// Lists executions whose status is in `statuses`, oldest first.
    /// Used by crash recovery to find `running`/`compensating` sagas.
    async fn list_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaExecutionRecord>>;

    /// Marks an execution for cooperative cancellation. No version check:
    /// the flag is write-once and only ever read between steps.
    async fn request_cancel(&self, saga_id: SagaId) -> Result<()>;

    /// Appends a step history row.
    async fn append_step_history(&self, record: &SagaStepHistoryRecord) -> Result<()>;

    /// Returns the step history for a saga in insertion order.
    async fn get_step_history(&self, saga_id: SagaId) -> Result<Vec<SagaStepHistoryRecord>>;
}
