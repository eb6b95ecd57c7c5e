use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SagaId, TenantId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    IdempotencyRecord, IdempotencyStatus, IdempotencyStore, InsertOutcome, PolicyDefinitionRecord,
    PolicyStore, Result, SagaExecutionRecord, SagaStatus, SagaStepHistoryRecord, SagaStore,
    StepStatus, StoreError,
};

/// PostgreSQL-backed store implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn invalid_column(message: impl Into<String>) -> StoreError {
    StoreError::Serialization(serde_json::Error::io(std::io::Error::other(message.into())))
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_policy(row: PgRow) -> Result<PolicyDefinitionRecord> {
        Ok(PolicyDefinitionRecord {
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            rules: row.try_get("rules")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_idempotency(row: PgRow) -> Result<IdempotencyRecord> {
        let status: String = row.try_get("status")?;
        let status = IdempotencyStatus::parse(&status)
            .ok_or_else(|| invalid_column(format!("unknown idempotency status: {status}")))?;

        Ok(IdempotencyRecord {
            key: row.try_get("key")?,
            status,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
            retry_count: row.try_get("retry_count")?,
        })
    }

    fn row_to_execution(row: PgRow) -> Result<SagaExecutionRecord> {
        let status: String = row.try_get("status")?;
        let status = SagaStatus::parse(&status)
            .ok_or_else(|| invalid_column(format!("unknown saga status: {status}")))?;
        let step_statuses: Vec<StepStatus> =
            serde_json::from_value(row.try_get("step_statuses")?)?;

        Ok(SagaExecutionRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            definition_name: row.try_get("definition_name")?,
            tenant_id: TenantId::from_uuid(row.try_get::<Uuid, _>("tenant_id")?),
            status,
            current_step: row.try_get("current_step")?,
            step_statuses,
            context: row.try_get("context")?,
            failed_step: row.try_get("failed_step")?,
            cancel_requested: row.try_get("cancel_requested")?,
            version: row.try_get("version")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }

    fn row_to_step_history(row: PgRow) -> Result<SagaStepHistoryRecord> {
        let status: serde_json::Value =
            serde_json::Value::String(row.try_get::<String, _>("status")?);
        let status: StepStatus = serde_json::from_value(status)?;

        Ok(SagaStepHistoryRecord {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            step_name: row.try_get("step_name")?,
            status,
            context_snapshot: row.try_get("context_snapshot")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl PolicyStore for PostgresStore {
    async fn save_definition(&self, record: PolicyDefinitionRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO policy_definitions (name, version, rules, active, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (name, version) DO NOTHING
            "#,
        )
        .bind(&record.name)
        .bind(&record.version)
        .bind(&record.rules)
        .bind(record.active)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicatePolicyVersion {
                name: record.name,
                version: record.version,
            });
        }
        Ok(())
    }

    async fn get_definition(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<PolicyDefinitionRecord>> {
        let row = sqlx::query(
            "SELECT name, version, rules, active, created_at FROM policy_definitions \
             WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_policy).transpose()
    }

    async fn get_active_definition(&self, name: &str) -> Result<Option<PolicyDefinitionRecord>> {
        let row = sqlx::query(
            "SELECT name, version, rules, active, created_at FROM policy_definitions \
             WHERE name = $1 AND active",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_policy).transpose()
    }

    async fn activate_version(&self, name: &str, version: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM policy_definitions WHERE name = $1 AND version = $2 FOR UPDATE",
        )
        .bind(name)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await?;

        if exists.is_none() {
            return Err(StoreError::PolicyNotFound {
                name: name.to_string(),
                version: version.to_string(),
            });
        }

        sqlx::query("UPDATE policy_definitions SET active = false WHERE name = $1 AND active")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE policy_definitions SET active = true WHERE name = $1 AND version = $2",
        )
        .bind(name)
        .bind(version)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_versions(&self, name: &str) -> Result<Vec<String>> {
        let versions: Vec<String> = sqlx::query_scalar(
            "SELECT version FROM policy_definitions WHERE name = $1 ORDER BY created_at ASC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;
        Ok(versions)
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn try_insert_pending(&self, record: IdempotencyRecord) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        // Expired rows count as absent; clear them so the primary key is free.
        sqlx::query("DELETE FROM idempotency_records WHERE key = $1 AND expires_at <= now()")
            .bind(&record.key)
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (key, status, result, error, created_at, expires_at, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(&record.key)
        .bind(record.status.as_str())
        .bind(&record.result)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.retry_count)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            tx.commit().await?;
            return Ok(InsertOutcome::Inserted);
        }

        let row = sqlx::query(
            "SELECT key, status, result, error, created_at, expires_at, retry_count \
             FROM idempotency_records WHERE key = $1",
        )
        .bind(&record.key)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(InsertOutcome::Existing(Self::row_to_idempotency(row)?))
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row = sqlx::query(
            "SELECT key, status, result, error, created_at, expires_at, retry_count \
             FROM idempotency_records WHERE key = $1 AND expires_at > now()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_idempotency).transpose()
    }

    async fn mark_completed(&self, key: &str, result: serde_json::Value) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET status = 'completed', result = $2, error = NULL \
             WHERE key = $1",
        )
        .bind(key)
        .bind(&result)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn mark_failed(&self, key: &str, error: String) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE idempotency_records SET status = 'failed', error = $2, result = NULL \
             WHERE key = $1",
        )
        .bind(key)
        .bind(&error)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::RecordNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn reclaim_pending(
        &self,
        key: &str,
        stale_before: DateTime<Utc>,
        new_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET created_at = now(), expires_at = $3, retry_count = retry_count + 1
            WHERE key = $1 AND status = 'pending' AND created_at < $2
            "#,
        )
        .bind(key)
        .bind(stale_before)
        .bind(new_expires_at)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() == 1)
    }
}

#[async_trait]
impl SagaStore for PostgresStore {
    async fn insert_execution(&self, record: &SagaExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_executions
                (saga_id, definition_name, tenant_id, status, current_step, step_statuses,
                 context, failed_step, cancel_requested, version, started_at, updated_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(&record.definition_name)
        .bind(record.tenant_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.current_step)
        .bind(serde_json::to_value(&record.step_statuses)?)
        .bind(&record.context)
        .bind(&record.failed_step)
        .bind(record.cancel_requested)
        .bind(record.version)
        .bind(record.started_at)
        .bind(record.updated_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution(&self, saga_id: SagaId) -> Result<Option<SagaExecutionRecord>> {
        let row = sqlx::query("SELECT * FROM saga_executions WHERE saga_id = $1")
            .bind(saga_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_execution).transpose()
    }

    async fn update_execution(&self, record: &SagaExecutionRecord) -> Result<i64> {
        // cancel_requested is ORed with the stored value so a cancellation
        // requested while the worker holds a stale snapshot is not clobbered.
        let updated = sqlx::query(
            r#"
            UPDATE saga_executions
            SET status = $2, current_step = $3, step_statuses = $4, context = $5,
                failed_step = $6, cancel_requested = cancel_requested OR $7,
                finished_at = $8, version = version + 1, updated_at = now()
            WHERE saga_id = $1 AND version = $9
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.current_step)
        .bind(serde_json::to_value(&record.step_statuses)?)
        .bind(&record.context)
        .bind(&record.failed_step)
        .bind(record.cancel_requested)
        .bind(record.finished_at)
        .bind(record.version)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 1 {
            return Ok(record.version + 1);
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_executions WHERE saga_id = $1")
                .bind(record.saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match actual {
            Some(actual) => Err(StoreError::ConcurrencyConflict {
                saga_id: record.saga_id,
                expected: record.version,
                actual,
            }),
            None => Err(StoreError::SagaNotFound(record.saga_id)),
        }
    }

    async fn claim_execution(
        &self,
        saga_id: SagaId,
        expected_version: i64,
    ) -> Result<SagaExecutionRecord> {
        let row = sqlx::query(
            r#"
            UPDATE saga_executions
            SET version = version + 1, updated_at = now()
            WHERE saga_id = $1 AND version = $2
            RETURNING *
            "#,
        )
        .bind(saga_id.as_uuid())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return Self::row_to_execution(row);
        }

        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_executions WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        match actual {
            Some(actual) => Err(StoreError::ConcurrencyConflict {
                saga_id,
                expected: expected_version,
                actual,
            }),
            None => Err(StoreError::SagaNotFound(saga_id)),
        }
    }

    async fn list_by_status(&self, statuses: &[SagaStatus]) -> Result<Vec<SagaExecutionRecord>> {
        let names: Vec<&str> = statuses.iter().map(SagaStatus::as_str).collect();
        let rows = sqlx::query(
            "SELECT * FROM saga_executions WHERE status = ANY($1) ORDER BY started_at ASC",
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_execution).collect()
    }

    async fn request_cancel(&self, saga_id: SagaId) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE saga_executions SET cancel_requested = true, updated_at = now() \
             WHERE saga_id = $1",
        )
        .bind(saga_id.as_uuid())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::SagaNotFound(saga_id));
        }
        Ok(())
    }

    async fn append_step_history(&self, record: &SagaStepHistoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_step_history (saga_id, step_name, status, context_snapshot, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(record.saga_id.as_uuid())
        .bind(&record.step_name)
        .bind(record.status.as_str())
        .bind(&record.context_snapshot)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_step_history(&self, saga_id: SagaId) -> Result<Vec<SagaStepHistoryRecord>> {
        let rows = sqlx::query(
            "SELECT saga_id, step_name, status, context_snapshot, recorded_at \
             FROM saga_step_history WHERE saga_id = $1 ORDER BY id ASC",
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_step_history).collect()
    }
}
