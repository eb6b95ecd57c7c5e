//! The saga coordinator.
//!
//! Drives executions forward step by step, persisting state after every
//! transition, and unwinds completed steps in reverse order when a step
//! fails or cancellation is requested. Exclusivity between workers rests on
//! the store's optimistic version claim.

use std::sync::Arc;

use chrono::Utc;
use common::{SagaId, TenantId};
use idempotency::{DuplicatePolicy, IdempotencyKey, IdempotencyManager};
use store::{
    IdempotencyStore, SagaExecutionRecord, SagaStatus, SagaStepHistoryRecord, SagaStore,
    StepStatus, StoreError,
};

use crate::context::SagaContext;
use crate::definition::SagaRegistry;
use crate::error::{Result, SagaError};
use crate::step::SagaStep;

/// Tuning knobs for saga execution.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Hard cap on a single step execution or compensation attempt.
    pub step_timeout: std::time::Duration,
    /// Retries granted to a failing compensation before the saga is marked
    /// `failed` for operator intervention.
    pub compensation_retries: u32,
    /// Base delay between compensation retries, doubled per attempt.
    pub compensation_backoff: std::time::Duration,
    /// TTL on the idempotency records guarding idempotent steps. Long by
    /// default so a resumed saga still hits the original outcome.
    pub step_ttl: chrono::Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_timeout: std::time::Duration::from_secs(30),
            compensation_retries: 3,
            compensation_backoff: std::time::Duration::from_millis(100),
            step_ttl: chrono::Duration::hours(24),
        }
    }
}

/// The observable outcome of a saga execution.
#[derive(Debug, Clone)]
pub struct SagaResult {
    pub saga_id: SagaId,
    pub status: SagaStatus,
    /// Final accumulated context.
    pub context: serde_json::Value,
    /// The step that triggered failure. `None` for completed sagas and for
    /// compensations triggered by cancellation.
    pub failed_step: Option<String>,
}

impl SagaResult {
    fn from_record(record: &SagaExecutionRecord) -> Self {
        Self {
            saga_id: record.saga_id,
            status: record.status,
            context: record.context.clone(),
            failed_step: record.failed_step.clone(),
        }
    }
}

/// Outcome of one step invocation: the step's output map, or the failure
/// message that triggers compensation.
type StepInvocation = std::result::Result<serde_json::Map<String, serde_json::Value>, String>;

/// Coordinates saga executions against a durable store.
///
/// Terminal statuses (`completed`, `compensated`, `failed`) are results, not
/// errors; `Err` from the coordinator means it could not make progress at
/// all.
pub struct SagaCoordinator<S>
where
    S: SagaStore + IdempotencyStore + Clone + Send + Sync + 'static,
{
    store: S,
    registry: Arc<SagaRegistry>,
    idempotency: IdempotencyManager<S>,
    config: CoordinatorConfig,
}

impl<S> SagaCoordinator<S>
where
    S: SagaStore + IdempotencyStore + Clone + Send + Sync + 'static,
{
    /// Creates a coordinator with default tuning.
    pub fn new(store: S, registry: Arc<SagaRegistry>) -> Self {
        Self::with_config(store, registry, CoordinatorConfig::default())
    }

    /// Creates a coordinator with explicit tuning.
    pub fn with_config(store: S, registry: Arc<SagaRegistry>, config: CoordinatorConfig) -> Self {
        let idempotency = IdempotencyManager::new(store.clone());
        Self {
            store,
            registry,
            idempotency,
            config,
        }
    }

    /// Persists a new `running` execution without driving it.
    ///
    /// Durability-first: the record exists before any step runs, so a crash
    /// immediately after start leaves a recoverable saga rather than an
    /// untracked one.
    pub async fn begin(
        &self,
        definition_name: &str,
        tenant_id: TenantId,
        context: serde_json::Value,
    ) -> Result<SagaExecutionRecord> {
        let definition = self
            .registry
            .get(definition_name)
            .ok_or_else(|| SagaError::UnknownDefinition(definition_name.to_string()))?;

        let record = SagaExecutionRecord::new(
            SagaId::new(),
            definition_name,
            tenant_id,
            definition.len(),
            context,
        );
        self.store.insert_execution(&record).await?;

        metrics::counter!("saga_executions_total").increment(1);
        tracing::info!(
            saga_id = %record.saga_id,
            definition = definition_name,
            tenant_id = %tenant_id,
            steps = definition.len(),
            "saga started"
        );
        Ok(record)
    }

    /// Starts and drives a saga to a terminal status.
    #[tracing::instrument(skip(self, context), fields(definition = definition_name, tenant_id = %tenant_id))]
    pub async fn execute(
        &self,
        definition_name: &str,
        tenant_id: TenantId,
        context: serde_json::Value,
    ) -> Result<SagaResult> {
        let record = self.begin(definition_name, tenant_id, context).await?;
        self.run_to_completion(record.saga_id).await
    }

    /// Claims an execution and drives it to a terminal status, resuming from
    /// wherever the record left off.
    ///
    /// Already-terminal sagas return their stored result unchanged. A saga
    /// found `compensating` resumes in reverse without re-running forward
    /// steps.
    #[tracing::instrument(skip(self))]
    pub async fn run_to_completion(&self, saga_id: SagaId) -> Result<SagaResult> {
        let record = self
            .store
            .get_execution(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;

        if record.status.is_terminal() {
            return Ok(SagaResult::from_record(&record));
        }

        let definition = self
            .registry
            .get(&record.definition_name)
            .ok_or_else(|| SagaError::UnknownDefinition(record.definition_name.clone()))?;
        if record.step_statuses.len() != definition.len() {
            return Err(SagaError::DefinitionMismatch {
                saga_id,
                definition: record.definition_name.clone(),
                recorded: record.step_statuses.len(),
                declared: definition.len(),
            });
        }

        let steps: Vec<Arc<dyn SagaStep>> = definition.steps().to_vec();
        let record = self.store.claim_execution(saga_id, record.version).await?;

        match record.status {
            SagaStatus::Running => self.run_forward(record, &steps).await,
            SagaStatus::Compensating => self.compensate(record, &steps).await,
            // Terminal between the read and the claim is impossible: the
            // claim would have failed on the version bump of the finishing
            // update.
            _ => Ok(SagaResult::from_record(&record)),
        }
    }

    /// Returns the current state of an execution.
    pub async fn status(&self, saga_id: SagaId) -> Result<SagaResult> {
        let record = self
            .store
            .get_execution(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        Ok(SagaResult::from_record(&record))
    }

    /// Requests cooperative cancellation. The running worker observes the
    /// flag between steps and compensates everything completed so far.
    pub async fn request_cancel(&self, saga_id: SagaId) -> Result<()> {
        let record = self
            .store
            .get_execution(saga_id)
            .await?
            .ok_or(SagaError::NotFound(saga_id))?;
        if record.status.is_terminal() {
            return Err(SagaError::AlreadyTerminal(
                saga_id,
                record.status.as_str().to_string(),
            ));
        }
        self.store.request_cancel(saga_id).await?;
        tracing::info!(saga_id = %saga_id, "saga cancellation requested");
        Ok(())
    }

    /// Finds all non-terminal executions and drives each to completion.
    ///
    /// Intended to run at process startup. Executions claimed by a competing
    /// worker in the meantime are skipped.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<SagaResult>> {
        let pending = self
            .store
            .list_by_status(&[SagaStatus::Running, SagaStatus::Compensating])
            .await?;
        if !pending.is_empty() {
            tracing::info!(count = pending.len(), "recovering in-flight sagas");
        }

        let mut results = Vec::new();
        for record in pending {
            match self.run_to_completion(record.saga_id).await {
                Ok(result) => results.push(result),
                Err(SagaError::Store(StoreError::ConcurrencyConflict { saga_id, .. })) => {
                    tracing::debug!(saga_id = %saga_id, "saga claimed by another worker, skipping");
                }
                Err(e) => {
                    tracing::warn!(saga_id = %record.saga_id, error = %e, "saga recovery failed");
                }
            }
        }
        Ok(results)
    }

    /// Runs forward from `current_step`, persisting after every transition.
    async fn run_forward(
        &self,
        mut record: SagaExecutionRecord,
        steps: &[Arc<dyn SagaStep>],
    ) -> Result<SagaResult> {
        let mut context = SagaContext::from_value(record.context.clone());

        while (record.current_step as usize) < steps.len() {
            // Cancellation is only observed between steps; the flag is set
            // without a version bump so re-reading it is safe mid-claim.
            if let Some(fresh) = self.store.get_execution(record.saga_id).await?
                && fresh.cancel_requested
            {
                tracing::info!(saga_id = %record.saga_id, "cancellation observed, compensating");
                record.cancel_requested = true;
                record.status = SagaStatus::Compensating;
                record.updated_at = Utc::now();
                record.version = self.store.update_execution(&record).await?;
                return self.compensate(record, steps).await;
            }

            let idx = record.current_step as usize;
            let step = &steps[idx];

            match self.invoke_step(record.saga_id, step, &context).await? {
                Ok(output) => {
                    context.merge(output);
                    record.context = context.to_value();
                    record.step_statuses[idx] = StepStatus::Succeeded;
                    record.current_step = idx as i32 + 1;
                    record.updated_at = Utc::now();
                    record.version = self.store.update_execution(&record).await?;
                    self.store
                        .append_step_history(&SagaStepHistoryRecord::new(
                            record.saga_id,
                            step.name(),
                            StepStatus::Succeeded,
                            record.context.clone(),
                        ))
                        .await?;
                    tracing::debug!(
                        saga_id = %record.saga_id,
                        step = step.name(),
                        "step succeeded"
                    );
                }
                Err(reason) => {
                    tracing::warn!(
                        saga_id = %record.saga_id,
                        step = step.name(),
                        reason = %reason,
                        "step failed, compensating"
                    );
                    record.step_statuses[idx] = StepStatus::Failed;
                    record.failed_step = Some(step.name().to_string());
                    record.status = SagaStatus::Compensating;
                    record.updated_at = Utc::now();
                    record.version = self.store.update_execution(&record).await?;
                    self.store
                        .append_step_history(&SagaStepHistoryRecord::new(
                            record.saga_id,
                            step.name(),
                            StepStatus::Failed,
                            record.context.clone(),
                        ))
                        .await?;
                    return self.compensate(record, steps).await;
                }
            }
        }

        record.status = SagaStatus::Completed;
        record.updated_at = Utc::now();
        record.finished_at = Some(record.updated_at);
        record.version = self.store.update_execution(&record).await?;

        metrics::counter!("saga_completed_total").increment(1);
        self.observe_duration(&record);
        tracing::info!(saga_id = %record.saga_id, "saga completed");
        Ok(SagaResult::from_record(&record))
    }

    /// Invokes one step, bounded by the step timeout.
    ///
    /// Idempotent steps go through the idempotency manager keyed on
    /// (saga id, step name): a resumed saga that already applied the side
    /// effect replays the stored outcome instead of executing twice.
    async fn invoke_step(
        &self,
        saga_id: SagaId,
        step: &Arc<dyn SagaStep>,
        context: &SagaContext,
    ) -> Result<StepInvocation> {
        if !step.idempotent() {
            return Ok(self.run_step_raw(step, context).await);
        }

        let key = IdempotencyKey::for_saga_step(saga_id, step.name());
        let timeout = self.config.step_timeout;
        let step_for_op = step.clone();
        let context_for_op = context.clone();

        let result = self
            .idempotency
            .execute(&key, self.config.step_ttl, DuplicatePolicy::Wait, move || {
                async move {
                    match tokio::time::timeout(timeout, step_for_op.execute(&context_for_op)).await
                    {
                        Ok(Ok(output)) => Ok(serde_json::Value::Object(output.values)),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!(
                            "step '{}' timed out after {}ms",
                            step_for_op.name(),
                            timeout.as_millis()
                        )),
                    }
                }
            })
            .await?;

        if result.from_cache {
            tracing::info!(
                saga_id = %saga_id,
                step = step.name(),
                success = result.success,
                "replayed stored step outcome"
            );
        }

        if result.success {
            let output = result
                .data
                .and_then(|v| match v {
                    serde_json::Value::Object(map) => Some(map),
                    _ => None,
                })
                .unwrap_or_default();
            Ok(Ok(output))
        } else {
            Ok(Err(result
                .error
                .unwrap_or_else(|| format!("step '{}' failed", step.name()))))
        }
    }

    async fn run_step_raw(&self, step: &Arc<dyn SagaStep>, context: &SagaContext) -> StepInvocation {
        match tokio::time::timeout(self.config.step_timeout, step.execute(context)).await {
            Ok(Ok(output)) => Ok(output.values),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "step '{}' timed out after {}ms",
                step.name(),
                self.config.step_timeout.as_millis()
            )),
        }
    }

    /// Compensates completed steps in reverse order.
    ///
    /// Each step's compensation receives the context snapshot taken right
    /// after that step succeeded, so it never observes later steps'
    /// contributions. A compensation that exhausts its retries marks
    /// the saga `failed` for operator intervention.
    async fn compensate(
        &self,
        mut record: SagaExecutionRecord,
        steps: &[Arc<dyn SagaStep>],
    ) -> Result<SagaResult> {
        let history = self.store.get_step_history(record.saga_id).await?;

        for idx in (0..steps.len()).rev() {
            // `Compensating` entries are steps a crashed worker was already
            // unwinding; redo them, compensations are re-entrant.
            if !matches!(
                record.step_statuses[idx],
                StepStatus::Succeeded | StepStatus::Compensating
            ) {
                continue;
            }
            let step = &steps[idx];

            record.step_statuses[idx] = StepStatus::Compensating;
            record.current_step = idx as i32;
            record.updated_at = Utc::now();
            record.version = self.store.update_execution(&record).await?;

            // Last snapshot recorded after this step succeeded; fall back to
            // the live context for records predating their history row.
            let snapshot = history
                .iter()
                .rev()
                .find(|h| h.step_name == step.name() && h.status == StepStatus::Succeeded)
                .map(|h| h.context_snapshot.clone())
                .unwrap_or_else(|| record.context.clone());
            let snapshot = SagaContext::from_value(snapshot);

            match self.compensate_with_retries(&record, step, &snapshot).await {
                Ok(()) => {
                    record.step_statuses[idx] = StepStatus::Compensated;
                    record.updated_at = Utc::now();
                    record.version = self.store.update_execution(&record).await?;
                    self.store
                        .append_step_history(&SagaStepHistoryRecord::new(
                            record.saga_id,
                            step.name(),
                            StepStatus::Compensated,
                            snapshot.to_value(),
                        ))
                        .await?;
                }
                Err(reason) => {
                    tracing::error!(
                        saga_id = %record.saga_id,
                        step = step.name(),
                        reason = %reason,
                        "compensation exhausted retries, saga needs operator intervention"
                    );
                    record.step_statuses[idx] = StepStatus::Failed;
                    record.failed_step = Some(step.name().to_string());
                    record.status = SagaStatus::Failed;
                    record.updated_at = Utc::now();
                    record.finished_at = Some(record.updated_at);
                    record.version = self.store.update_execution(&record).await?;
                    self.store
                        .append_step_history(&SagaStepHistoryRecord::new(
                            record.saga_id,
                            step.name(),
                            StepStatus::Failed,
                            snapshot.to_value(),
                        ))
                        .await?;

                    metrics::counter!("saga_failed_total").increment(1);
                    self.observe_duration(&record);
                    return Ok(SagaResult::from_record(&record));
                }
            }
        }

        record.status = SagaStatus::Compensated;
        record.updated_at = Utc::now();
        record.finished_at = Some(record.updated_at);
        record.version = self.store.update_execution(&record).await?;

        metrics::counter!("saga_compensated_total").increment(1);
        self.observe_duration(&record);
        tracing::info!(
            saga_id = %record.saga_id,
            failed_step = record.failed_step.as_deref().unwrap_or("<cancelled>"),
            "saga compensated"
        );
        Ok(SagaResult::from_record(&record))
    }

    /// One compensation with bounded retries and exponential backoff.
    async fn compensate_with_retries(
        &self,
        record: &SagaExecutionRecord,
        step: &Arc<dyn SagaStep>,
        snapshot: &SagaContext,
    ) -> std::result::Result<(), String> {
        let mut attempt = 0u32;
        loop {
            let outcome =
                match tokio::time::timeout(self.config.step_timeout, step.compensate(snapshot))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!(
                        "compensation for '{}' timed out after {}ms",
                        step.name(),
                        self.config.step_timeout.as_millis()
                    )),
                };

            match outcome {
                Ok(()) => return Ok(()),
                Err(reason) if attempt < self.config.compensation_retries => {
                    let delay = self.config.compensation_backoff * 2u32.pow(attempt);
                    tracing::warn!(
                        saga_id = %record.saga_id,
                        step = step.name(),
                        attempt = attempt + 1,
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "compensation attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(reason) => return Err(reason),
            }
        }
    }

    fn observe_duration(&self, record: &SagaExecutionRecord) {
        let elapsed = (Utc::now() - record.started_at)
            .to_std()
            .unwrap_or_default();
        metrics::histogram!("saga_duration_seconds").record(elapsed.as_secs_f64());
    }
}
