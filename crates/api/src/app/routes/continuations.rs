use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use tracing::error;

use cubeflow_infra::engine::UnitOutcome;

use crate::app::routes::common;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Run the continuation handler on a batch of dispatch messages, as a channel
/// consumer would. Per-message results come back in input order.
///
/// Failed units go to the dispatch queue's dead-letter path, the same as on
/// the channel workers, so the inspector records them.
pub async fn handle_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::ContinuationRequest>,
) -> Response {
    if body.messages.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "messages must not be empty");
    }

    let handler = services.handler.clone();
    let queue = services.queue.clone();
    let messages = body.messages;
    let result = common::blocking(move || {
        let report = handler.handle_batch(&messages);
        let mut dead_lettered = 0;
        for (outcome, message) in report.outcomes.iter().zip(&messages) {
            let Ok(UnitOutcome::Failed { error, .. }) = outcome else {
                continue;
            };
            match queue.dead_letter(message.clone(), error) {
                Ok(_) => dead_lettered += 1,
                Err(e) => error!(unit_id = %message.unit_id, error = %e, "could not dead-letter failed unit"),
            }
        }
        dto::BatchResponse::new(&report, &messages, dead_lettered)
    })
    .await;

    match result {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(resp) => resp,
    }
}
