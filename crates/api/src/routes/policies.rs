//! Policy publication and evaluation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use common::{TenantId, UserId};
use policy::{PolicyContext, PolicyDefinition, PolicyResult, PolicyRule, VersionSelector};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::{AppState, CoreStore};

#[derive(Deserialize)]
pub struct PublishPolicyRequest {
    pub name: String,
    pub version: String,
    pub rules: Vec<PolicyRule>,
    /// Make this version the active one immediately.
    #[serde(default)]
    pub activate: bool,
}

#[derive(Serialize)]
pub struct PublishPolicyResponse {
    pub name: String,
    pub version: String,
    pub active: bool,
}

#[derive(Deserialize)]
pub struct EvaluatePolicyRequest {
    pub policy_name: String,
    /// Pin a specific version; omitted means the active one.
    pub version: Option<String>,
    pub tenant_id: uuid::Uuid,
    pub user_id: Option<uuid::Uuid>,
    /// Operation being gated; defaults to the policy name.
    pub operation: Option<String>,
    pub payload: serde_json::Value,
}

/// POST /policies — store a new policy version.
#[tracing::instrument(skip(state, req), fields(policy = %req.name, version = %req.version))]
pub async fn publish<S: CoreStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<PublishPolicyRequest>,
) -> Result<(axum::http::StatusCode, Json<PublishPolicyResponse>), ApiError> {
    let definition = PolicyDefinition::new(req.name.clone(), req.version.clone(), req.rules);
    state.policy_engine.publish(&definition, req.activate).await?;

    Ok((
        axum::http::StatusCode::CREATED,
        Json(PublishPolicyResponse {
            name: req.name,
            version: req.version,
            active: req.activate,
        }),
    ))
}

/// POST /policies/evaluate — evaluate a policy against a payload.
///
/// An admitted payload returns 200 with the full result; a denial is a 403
/// carrying the failed rules, never a 5xx.
#[tracing::instrument(skip(state, req), fields(policy = %req.policy_name))]
pub async fn evaluate<S: CoreStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<EvaluatePolicyRequest>,
) -> Result<Json<PolicyResult>, ApiError> {
    let tenant_id = TenantId::from_uuid(req.tenant_id);
    let user_id = req.user_id.map(UserId::from_uuid).unwrap_or_default();
    let operation = req.operation.unwrap_or_else(|| req.policy_name.clone());
    let context = PolicyContext::new(tenant_id, user_id, operation);

    let selector = match req.version.as_deref() {
        Some(v) => VersionSelector::Exact(v),
        None => VersionSelector::Latest,
    };

    let result = state
        .policy_engine
        .evaluate(&req.policy_name, selector, &context, &req.payload)
        .await?;

    if !result.admitted {
        return Err(ApiError::PolicyDenied(result));
    }
    Ok(Json(result))
}
