use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use cubeflow_infra::activity_store::StoreError;
use cubeflow_infra::engine::{InspectorError, SubmitError};

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn not_found(what: impl std::fmt::Display) -> Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("{what} not found"))
}

pub fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", err.to_string())
        }
        StoreError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
        StoreError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

pub fn submit_error_to_response(err: SubmitError) -> Response {
    match err {
        SubmitError::InvalidSpec(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_spec", msg),
        SubmitError::Catalog(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "catalog_unavailable", e.to_string()),
        SubmitError::Store(e) => store_error_to_response(e),
        // The job exists; the client can resume it.
        err @ SubmitError::Dispatch { .. } => json_error(StatusCode::BAD_GATEWAY, "dispatch_incomplete", err.to_string()),
        SubmitError::NotFound(id) => not_found(format!("job {id}")),
    }
}

pub fn inspector_error_to_response(err: InspectorError) -> Response {
    match err {
        InspectorError::NotFound(id) => not_found(format!("dead letter {id}")),
        err @ InspectorError::AlreadyRedriven(_) => json_error(StatusCode::CONFLICT, "already_redriven", err.to_string()),
        err @ InspectorError::NotRedrivable { .. } => json_error(StatusCode::CONFLICT, "not_redrivable", err.to_string()),
        err @ InspectorError::JobSuperseded(_) => json_error(StatusCode::CONFLICT, "job_superseded", err.to_string()),
        InspectorError::Store(e) => store_error_to_response(e),
        InspectorError::Channel(e) => json_error(StatusCode::BAD_GATEWAY, "channel_error", e.to_string()),
    }
}

/// The blocking task running an engine call panicked or was cancelled.
pub fn join_error_to_response(err: tokio::task::JoinError) -> Response {
    tracing::error!(error = %err, "engine task failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "engine task failed")
}
