use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cubeflow_channels::DispatchMessage;
use cubeflow_core::{Job, JobId, JobStatus, PeriodId, TileId, UnitId, UnitStatus, WorkUnit};
use cubeflow_infra::engine::{BatchReport, CompletionOutcome, SkipReason, UnitOutcome};

pub const DEFAULT_PAGE: usize = 50;
pub const MAX_PAGE: usize = 500;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLettersQuery {
    #[serde(alias = "job_id")]
    pub job_id: Option<String>,
    pub limit: Option<usize>,
}

/// Direct trigger of the continuation handler, bypassing the channels.
#[derive(Debug, Deserialize)]
pub struct ContinuationRequest {
    pub messages: Vec<DispatchMessage>,
}

pub fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: JobId,
    pub cube: String,
    pub status: JobStatus,
    pub units: usize,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            cube: job.definition.name.to_string(),
            status: job.status,
            units: job.definition.unit_count(),
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitView {
    pub unit_id: UnitId,
    pub tile_id: TileId,
    pub period_id: PeriodId,
    pub status: UnitStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<WorkUnit> for UnitView {
    fn from(unit: WorkUnit) -> Self {
        Self {
            unit_id: unit.id,
            tile_id: unit.tile_id,
            period_id: unit.period_id,
            status: unit.status,
            attempt_count: unit.attempt_count,
            last_error: unit.last_error,
            updated_at: unit.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeResponse {
    pub job_id: JobId,
    pub emitted: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeView {
    pub unit_id: UnitId,
    /// `completed`, `failed`, `skipped` or `error`.
    pub outcome: &'static str,
    pub job_status: Option<JobStatus>,
    pub detail: Option<String>,
}

impl From<&UnitOutcome> for OutcomeView {
    fn from(outcome: &UnitOutcome) -> Self {
        match outcome {
            UnitOutcome::Completed { unit_id, job } => Self {
                unit_id: *unit_id,
                outcome: "completed",
                job_status: Some(match job {
                    CompletionOutcome::InProgress(progress) => progress.status,
                    CompletionOutcome::Finalized { status, .. } | CompletionOutcome::AlreadyTerminal(status) => *status,
                }),
                detail: None,
            },
            UnitOutcome::Failed { unit_id, error } => Self {
                unit_id: *unit_id,
                outcome: "failed",
                job_status: None,
                detail: Some(error.clone()),
            },
            UnitOutcome::Skipped { unit_id, reason } => Self {
                unit_id: *unit_id,
                outcome: "skipped",
                job_status: None,
                detail: Some(skip_detail(reason)),
            },
        }
    }
}

fn skip_detail(reason: &SkipReason) -> String {
    match reason {
        SkipReason::UnknownUnit => "unknown unit".to_string(),
        SkipReason::AlreadyTerminal(status) => format!("unit already {status}"),
        SkipReason::LostRace => "unit claimed by another handler".to_string(),
        SkipReason::Mismatch => "unit belongs to a different job".to_string(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Failed units handed to the dead-letter path.
    pub dead_lettered: usize,
    pub outcomes: Vec<OutcomeView>,
}

impl BatchResponse {
    pub fn new(report: &BatchReport, messages: &[DispatchMessage], dead_lettered: usize) -> Self {
        let outcomes = report
            .outcomes
            .iter()
            .zip(messages)
            .map(|(result, message)| match result {
                Ok(outcome) => OutcomeView::from(outcome),
                Err(e) => OutcomeView {
                    unit_id: message.unit_id,
                    outcome: "error",
                    job_status: None,
                    detail: Some(e.to_string()),
                },
            })
            .collect();

        Self {
            completed: report.completed(),
            failed: report.failed(),
            skipped: report.skipped(),
            errors: report.errors(),
            dead_lettered,
            outcomes,
        }
    }
}
