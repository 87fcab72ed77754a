//! Job status reporting.

use chrono::{DateTime, Utc};
use serde::Serialize;

use cubeflow_core::{JobId, JobStatus, PeriodId, TileId, UnitCounts, UnitStatus, UnitId};

use crate::activity_store::{ActivityStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitFailure {
    pub unit_id: UnitId,
    pub tile_id: TileId,
    pub period_id: PeriodId,
    pub error: String,
}

/// Point-in-time view of a job, read from the activity store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub job_id: JobId,
    pub cube: String,
    /// Derived from the current unit statuses.
    pub status: JobStatus,
    /// Whether the stored job status has been finalized.
    pub finalized: bool,
    pub units_total: usize,
    pub units_done: usize,
    pub units_failed: usize,
    pub units_pending: usize,
    pub units_running: usize,
    pub units_skipped: usize,
    pub failures: Vec<UnitFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
}

/// Build the status report of a job. `Ok(None)` for an unknown job.
pub fn job_status<S: ActivityStore + ?Sized>(store: &S, job_id: JobId) -> Result<Option<JobStatusReport>, StoreError> {
    let Some(job) = store.get_job(job_id)? else {
        return Ok(None);
    };
    let units = store.list_units(job_id)?;
    let counts = UnitCounts::tally(units.iter().map(|u| u.status));

    let failures = units
        .into_iter()
        .filter(|u| u.status == UnitStatus::Failed)
        .map(|u| UnitFailure {
            unit_id: u.id,
            error: u.last_error.unwrap_or_else(|| "unknown error".to_string()),
            tile_id: u.tile_id,
            period_id: u.period_id,
        })
        .collect();

    let duration_secs = match (job.started_at, job.finished_at) {
        (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
        _ => None,
    };

    Ok(Some(JobStatusReport {
        job_id,
        cube: job.definition.name.to_string(),
        status: counts.derive_status(),
        finalized: job.status.is_terminal(),
        units_total: counts.total,
        units_done: counts.done,
        units_failed: counts.failed,
        units_pending: counts.pending,
        units_running: counts.running,
        units_skipped: counts.skipped,
        failures,
        created_at: job.created_at,
        started_at: job.started_at,
        finished_at: job.finished_at,
        duration_secs,
    }))
}
