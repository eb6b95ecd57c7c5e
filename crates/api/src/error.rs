//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use idempotency::IdempotencyError;
use policy::{PolicyError, PolicyResult};
use saga::SagaError;
use store::StoreError;

/// API-level error type that maps to HTTP responses.
///
/// Policy denials and duplicate-in-flight conflicts are structured client
/// responses (403 / 409), never 5xx.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// A blocking policy rule failed; carries the full evaluation result.
    PolicyDenied(PolicyResult),
    /// Policy lookup or storage error.
    Policy(PolicyError),
    /// Idempotent execution error.
    Idempotency(IdempotencyError),
    /// Saga coordination error.
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::PolicyDenied(result) = self {
            let body = serde_json::json!({
                "error": "policy denied",
                "result": result,
            });
            return (StatusCode::FORBIDDEN, axum::Json(body)).into_response();
        }

        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::PolicyDenied(_) => unreachable!(),
            ApiError::Policy(err) => policy_error_to_response(err),
            ApiError::Idempotency(err) => idempotency_error_to_response(err),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn policy_error_to_response(err: PolicyError) -> (StatusCode, String) {
    match &err {
        PolicyError::NotFound { .. } | PolicyError::NoActiveVersion(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        PolicyError::Store(StoreError::DuplicatePolicyVersion { .. }) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        PolicyError::Store(StoreError::PolicyNotFound { .. }) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        PolicyError::Serialization(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn idempotency_error_to_response(err: IdempotencyError) -> (StatusCode, String) {
    match &err {
        IdempotencyError::DuplicateInFlight(_) => (StatusCode::CONFLICT, err.to_string()),
        IdempotencyError::WaitTimeout { .. } => (StatusCode::REQUEST_TIMEOUT, err.to_string()),
        IdempotencyError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::UnknownDefinition(_) | SagaError::NotFound(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        SagaError::AlreadyTerminal(_, _) => (StatusCode::CONFLICT, err.to_string()),
        SagaError::Store(StoreError::ConcurrencyConflict { .. }) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        ApiError::Policy(err)
    }
}

impl From<IdempotencyError> for ApiError {
    fn from(err: IdempotencyError) -> Self {
        ApiError::Idempotency(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
