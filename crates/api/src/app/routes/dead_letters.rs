use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use cubeflow_core::{DeadLetterId, JobId};

use crate::app::routes::common;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:id/redrive", post(redrive))
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::DeadLettersQuery>,
) -> Response {
    let job_id = match query.job_id.as_deref() {
        Some(raw) => match common::parse_id::<JobId>(raw, "job") {
            Ok(v) => Some(v),
            Err(resp) => return resp,
        },
        None => None,
    };
    let limit = dto::page_size(query.limit);

    let store = services.store.clone();
    match common::blocking(move || store.list_dead_letters(job_id, limit)).await {
        Ok(Ok(entries)) => Json(entries).into_response(),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn redrive(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let id: DeadLetterId = match common::parse_id(&id, "dead letter") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let inspector = services.inspector.clone();
    match common::blocking(move || inspector.redrive(id)).await {
        Ok(Ok(message)) => (StatusCode::ACCEPTED, Json(message)).into_response(),
        Ok(Err(e)) => errors::inspector_error_to_response(e),
        Err(resp) => resp,
    }
}
