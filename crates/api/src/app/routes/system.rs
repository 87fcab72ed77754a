use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    response::{sse::Event as SseEvent, IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use cubeflow_core::JobId;

use crate::app::routes::common;
use crate::app::services::{self, AppServices};

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "backend": services.backend,
        "channel": services.config.channel,
        "workers": services.worker_names(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(alias = "job_id")]
    pub job_id: Option<String>,
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<StreamQuery>,
) -> Result<axum::response::Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>>, Response> {
    let job_filter = match query.job_id.as_deref() {
        Some(raw) => Some(common::parse_id::<JobId>(raw, "job")?),
        None => None,
    };
    Ok(services::notification_sse_stream(services, job_filter))
}
