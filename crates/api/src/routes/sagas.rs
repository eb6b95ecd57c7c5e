//! Saga lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::{SagaId, TenantId};
use serde::{Deserialize, Serialize};
use store::SagaStore;

use crate::error::ApiError;
use crate::state::{AppState, CoreStore};

#[derive(Deserialize)]
pub struct StartSagaRequest {
    pub definition_name: String,
    pub tenant_id: uuid::Uuid,
    #[serde(default = "empty_context")]
    pub initial_context: serde_json::Value,
}

fn empty_context() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Serialize)]
pub struct StartSagaResponse {
    pub saga_id: String,
    pub status: String,
}

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub saga_id: String,
    pub definition_name: String,
    pub tenant_id: String,
    pub status: String,
    pub current_step: i32,
    pub step_statuses: Vec<String>,
    pub context: serde_json::Value,
    pub failed_step: Option<String>,
    pub cancel_requested: bool,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

#[derive(Serialize)]
pub struct CancelSagaResponse {
    pub saga_id: String,
    pub status: String,
}

/// POST /sagas — start a saga and drive it in the background.
///
/// Returns 202 with the saga ID as soon as the execution record is durable;
/// callers poll GET /sagas/{id} for the terminal status.
#[tracing::instrument(skip(state, req), fields(definition = %req.definition_name))]
pub async fn create<S: CoreStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<StartSagaRequest>,
) -> Result<(axum::http::StatusCode, Json<StartSagaResponse>), ApiError> {
    let tenant_id = TenantId::from_uuid(req.tenant_id);
    let record = state
        .saga_coordinator
        .begin(&req.definition_name, tenant_id, req.initial_context)
        .await?;

    let coordinator = state.saga_coordinator.clone();
    let saga_id = record.saga_id;
    tokio::spawn(async move {
        if let Err(e) = coordinator.run_to_completion(saga_id).await {
            tracing::error!(saga_id = %saga_id, error = %e, "background saga run failed");
        }
    });

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(StartSagaResponse {
            saga_id: saga_id.to_string(),
            status: record.status.to_string(),
        }),
    ))
}

/// GET /sagas/{id} — current state of a saga execution.
#[tracing::instrument(skip(state))]
pub async fn get<S: CoreStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let record = state
        .store
        .get_execution(saga_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;

    Ok(Json(SagaStatusResponse {
        saga_id: record.saga_id.to_string(),
        definition_name: record.definition_name,
        tenant_id: record.tenant_id.to_string(),
        status: record.status.to_string(),
        current_step: record.current_step,
        step_statuses: record
            .step_statuses
            .iter()
            .map(|s| s.to_string())
            .collect(),
        context: record.context,
        failed_step: record.failed_step,
        cancel_requested: record.cancel_requested,
        started_at: record.started_at.to_rfc3339(),
        updated_at: record.updated_at.to_rfc3339(),
        finished_at: record.finished_at.map(|t| t.to_rfc3339()),
    }))
}

/// POST /sagas/{id}/cancel — request cooperative cancellation.
///
/// The running worker observes the flag between steps; already-terminal
/// sagas return 409.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: CoreStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<(axum::http::StatusCode, Json<CancelSagaResponse>), ApiError> {
    let saga_id = parse_saga_id(&id)?;
    state.saga_coordinator.request_cancel(saga_id).await?;

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(CancelSagaResponse {
            saga_id: saga_id.to_string(),
            status: "cancel_requested".to_string(),
        }),
    ))
}

fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    Ok(SagaId::from_uuid(uuid))
}
