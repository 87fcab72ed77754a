use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use cubeflow_core::{JobId, JobStatus};
use cubeflow_infra::activity_store::StoreError;
use cubeflow_infra::collaborators::JobSpec;
use cubeflow_infra::engine::job_status;

use crate::app::routes::common;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/:id", get(get_job))
        .route("/:id/units", get(list_units))
        .route("/:id/metadata", get(get_metadata))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/resume", post(resume_job))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(spec): Json<JobSpec>,
) -> Response {
    let submitter = services.submitter.clone();
    match common::blocking(move || submitter.submit(&spec)).await {
        Ok(Ok(outcome)) => (StatusCode::ACCEPTED, Json(outcome)).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(s) => s,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_status", e.to_string()),
    };
    let limit = dto::page_size(query.limit);

    let store = services.store.clone();
    match common::blocking(move || store.list_jobs(status, limit)).await {
        Ok(Ok(jobs)) => {
            let summaries: Vec<dto::JobSummary> = jobs.iter().map(dto::JobSummary::from).collect();
            Json(summaries).into_response()
        }
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn get_job(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let job_id: JobId = match common::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let store = services.store.clone();
    match common::blocking(move || job_status(&store, job_id)).await {
        Ok(Ok(Some(report))) => Json(report).into_response(),
        Ok(Ok(None)) => errors::not_found(format!("job {job_id}")),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn list_units(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let job_id: JobId = match common::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let store = services.store.clone();
    let result = common::blocking(move || -> Result<Option<Vec<dto::UnitView>>, StoreError> {
        if store.get_job(job_id)?.is_none() {
            return Ok(None);
        }
        Ok(Some(store.list_units(job_id)?.into_iter().map(dto::UnitView::from).collect()))
    })
    .await;

    match result {
        Ok(Ok(Some(units))) => Json(units).into_response(),
        Ok(Ok(None)) => errors::not_found(format!("job {job_id}")),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn get_metadata(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let job_id: JobId = match common::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let store = services.store.clone();
    let result = common::blocking(move || -> Result<_, StoreError> {
        let Some(job) = store.get_job(job_id)? else {
            return Ok(None);
        };
        // Metadata is written just before the job turns done; hide it until then.
        let metadata = match job.status {
            JobStatus::Done => store.cube_metadata(job_id)?,
            _ => None,
        };
        Ok(Some((job.status, metadata)))
    })
    .await;

    match result {
        Ok(Ok(Some((_, Some(metadata))))) => Json(metadata).into_response(),
        Ok(Ok(Some((status, None)))) => errors::json_error(
            StatusCode::CONFLICT,
            "metadata_not_ready",
            format!("job {job_id} is {status}; metadata is published once every unit is done"),
        ),
        Ok(Ok(None)) => errors::not_found(format!("job {job_id}")),
        Ok(Err(e)) => errors::store_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn cancel_job(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let job_id: JobId = match common::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let submitter = services.submitter.clone();
    match common::blocking(move || submitter.cancel(job_id)).await {
        Ok(Ok(outcome)) => Json(outcome).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}

pub async fn resume_job(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let job_id: JobId = match common::parse_id(&id, "job") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let submitter = services.submitter.clone();
    match common::blocking(move || submitter.resume(job_id)).await {
        Ok(Ok(emitted)) => (StatusCode::ACCEPTED, Json(dto::ResumeResponse { job_id, emitted })).into_response(),
        Ok(Err(e)) => errors::submit_error_to_response(e),
        Err(resp) => resp,
    }
}
