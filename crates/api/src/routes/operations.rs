//! Idempotent operation execution endpoint.
//!
//! An operation is a registered saga definition executed at most once per
//! derived key. The request may name a policy gate; a denial stops the
//! request before the idempotency layer is touched.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::{TenantId, UserId};
use idempotency::{DuplicatePolicy, IdempotencyKey};
use policy::{PolicyContext, VersionSelector};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::{AppState, CoreStore};

const DEFAULT_TTL_SECONDS: i64 = 86_400;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDuplicate {
    /// Block (bounded) until the in-flight owner finishes, then return its
    /// result.
    #[default]
    Wait,
    /// Return 409 immediately.
    Reject,
}

#[derive(Deserialize)]
pub struct PolicyGate {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Deserialize)]
pub struct ExecuteOperationRequest {
    /// Name of a registered saga definition.
    pub operation_type: String,
    pub tenant_id: uuid::Uuid,
    pub user_id: Option<uuid::Uuid>,
    pub payload: serde_json::Value,
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub on_duplicate: OnDuplicate,
    /// Optional policy to gate the operation on before executing.
    pub policy: Option<PolicyGate>,
}

#[derive(Serialize)]
pub struct ExecuteOperationResponse {
    /// True only when the operation's saga completed. A compensated or
    /// failed saga is a failed operation even though its outcome (with
    /// `saga_id` and `failed_step`) is still returned in `data`.
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub from_cache: bool,
}

/// POST /operations — execute a named operation idempotently.
///
/// Two calls with the same operation type, tenant and payload within the TTL
/// execute once; the second returns the stored outcome with
/// `from_cache: true`.
#[tracing::instrument(skip(state, req), fields(operation = %req.operation_type))]
pub async fn execute<S: CoreStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<ExecuteOperationRequest>,
) -> Result<Json<ExecuteOperationResponse>, ApiError> {
    let tenant_id = TenantId::from_uuid(req.tenant_id);

    if let Some(gate) = &req.policy {
        let user_id = req.user_id.map(UserId::from_uuid).unwrap_or_default();
        let context = PolicyContext::new(tenant_id, user_id, req.operation_type.clone());
        let selector = match gate.version.as_deref() {
            Some(v) => VersionSelector::Exact(v),
            None => VersionSelector::Latest,
        };
        let result = state
            .policy_engine
            .evaluate(&gate.name, selector, &context, &req.payload)
            .await?;
        if !result.admitted {
            return Err(ApiError::PolicyDenied(result));
        }
    }

    if state.registry.get(&req.operation_type).is_none() {
        return Err(ApiError::NotFound(format!(
            "Unknown operation type '{}'",
            req.operation_type
        )));
    }

    let ttl_seconds = req.ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS);
    if ttl_seconds <= 0 {
        return Err(ApiError::BadRequest(
            "ttl_seconds must be positive".to_string(),
        ));
    }
    let ttl = chrono::Duration::seconds(ttl_seconds);

    let key = IdempotencyKey::derive(&req.operation_type, tenant_id, &req.payload);
    let duplicate_policy = match req.on_duplicate {
        OnDuplicate::Wait => DuplicatePolicy::Wait,
        OnDuplicate::Reject => DuplicatePolicy::Reject,
    };

    let coordinator = state.saga_coordinator.clone();
    let operation_type = req.operation_type.clone();
    let payload = req.payload.clone();

    let result = state
        .idempotency
        .execute(&key, ttl, duplicate_policy, move || async move {
            match coordinator.execute(&operation_type, tenant_id, payload).await {
                Ok(saga) => Ok(serde_json::json!({
                    "saga_id": saga.saga_id,
                    "status": saga.status,
                    "context": saga.context,
                    "failed_step": saga.failed_step,
                })),
                Err(e) => Err(e.to_string()),
            }
        })
        .await?;

    let saga_status = result
        .data
        .as_ref()
        .and_then(|d| d.get("status"))
        .and_then(|s| s.as_str())
        .map(str::to_string);
    let completed = saga_status.as_deref() == Some("completed");
    let error = result.error.or_else(|| {
        saga_status
            .filter(|_| !completed)
            .map(|s| format!("operation ended {s}"))
    });

    Ok(Json(ExecuteOperationResponse {
        success: result.success && completed,
        data: result.data,
        error,
        from_cache: result.from_cache,
    }))
}
