//! Activity store abstraction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use cubeflow_channels::DeadLetterRecord;
use cubeflow_core::{
    ControlEntry, ControlKey, CubeMetadata, DeadLetterId, Fingerprint, Job, JobId, JobStatus,
    UnitCounts, UnitId, UnitStatus, WorkUnit,
};

/// Extra fields written together with a unit transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionUpdate {
    pub attempt_count: Option<u32>,
    pub last_error: Option<String>,
}

impl TransitionUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn attempt(count: u32) -> Self {
        Self {
            attempt_count: Some(count),
            last_error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            attempt_count: None,
            last_error: Some(message.into()),
        }
    }
}

/// Aggregate progress of one job, derived from its units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub counts: UnitCounts,
    /// Status implied by `counts`.
    pub status: JobStatus,
}

/// Operator-visible ledger entry for a drained dead-letter record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub job_id: JobId,
    pub unit_id: UnitId,
    pub record: DeadLetterRecord,
    pub recorded_at: DateTime<Utc>,
    pub redriven_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn new(record: DeadLetterRecord, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: record.id,
            job_id: record.original_message.job_id,
            unit_id: record.original_message.unit_id,
            record,
            recorded_at,
            redriven_at: None,
        }
    }
}

/// Activity store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint rejected the write (e.g. duplicate active fingerprint).
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable, conditionally-updatable engine state.
///
/// Unit status changes go through [`ActivityStore::transition`] only. It is a
/// compare-and-swap on the stored status: when two callers race on the same
/// unit, exactly one gets `Ok(true)` and the other `Ok(false)`. Losing a race is
/// not an error.
pub trait ActivityStore: Send + Sync {
    /// Create a job and all its units in one batch.
    ///
    /// Fails with [`StoreError::Conflict`] if a non-failed job with the same
    /// fingerprint already exists.
    fn create_job(&self, job: &Job, units: &[WorkUnit]) -> Result<(), StoreError>;

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    /// Most recent job with this fingerprint whose status is not `failed`.
    fn find_active_by_fingerprint(&self, fingerprint: Fingerprint) -> Result<Option<Job>, StoreError>;

    /// Jobs ordered newest first.
    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError>;

    fn get_unit(&self, unit_id: UnitId) -> Result<Option<WorkUnit>, StoreError>;

    fn list_units(&self, job_id: JobId) -> Result<Vec<WorkUnit>, StoreError>;

    /// Conditional unit transition. `Ok(false)` when the stored status is not `expected`.
    fn transition(
        &self,
        unit_id: UnitId,
        expected: UnitStatus,
        next: UnitStatus,
        update: TransitionUpdate,
    ) -> Result<bool, StoreError>;

    /// Progress derived from the current unit statuses.
    fn job_state(&self, job_id: JobId) -> Result<JobProgress, StoreError>;

    /// Conditional job status write. `Ok(false)` when the stored status is not `expected`.
    ///
    /// Moving a job out of `failed` fails with [`StoreError::Conflict`] while
    /// another non-failed job holds the same fingerprint.
    fn transition_job(&self, job_id: JobId, expected: JobStatus, next: JobStatus) -> Result<bool, StoreError>;

    fn control(&self, key: &ControlKey) -> Result<Option<ControlEntry>, StoreError>;

    /// Store `entry.merged` if the stored version equals `expected_version`
    /// (`0` = absent). The stored version becomes `expected_version + 1`.
    fn swap_control(&self, entry: &ControlEntry, expected_version: u64) -> Result<bool, StoreError>;

    fn record_cube_metadata(&self, metadata: &CubeMetadata) -> Result<(), StoreError>;

    fn cube_metadata(&self, job_id: JobId) -> Result<Option<CubeMetadata>, StoreError>;

    /// Idempotent on the entry id.
    fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError>;

    fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Entries ordered newest first.
    fn list_dead_letters(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Conditionally set `redriven_at`. `Ok(false)` if it was already set.
    fn mark_dead_letter_redriven(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError>;
}

impl<S> ActivityStore for Arc<S>
where
    S: ActivityStore + ?Sized,
{
    fn create_job(&self, job: &Job, units: &[WorkUnit]) -> Result<(), StoreError> {
        (**self).create_job(job, units)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get_job(job_id)
    }

    fn find_active_by_fingerprint(&self, fingerprint: Fingerprint) -> Result<Option<Job>, StoreError> {
        (**self).find_active_by_fingerprint(fingerprint)
    }

    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).list_jobs(status, limit)
    }

    fn get_unit(&self, unit_id: UnitId) -> Result<Option<WorkUnit>, StoreError> {
        (**self).get_unit(unit_id)
    }

    fn list_units(&self, job_id: JobId) -> Result<Vec<WorkUnit>, StoreError> {
        (**self).list_units(job_id)
    }

    fn transition(
        &self,
        unit_id: UnitId,
        expected: UnitStatus,
        next: UnitStatus,
        update: TransitionUpdate,
    ) -> Result<bool, StoreError> {
        (**self).transition(unit_id, expected, next, update)
    }

    fn job_state(&self, job_id: JobId) -> Result<JobProgress, StoreError> {
        (**self).job_state(job_id)
    }

    fn transition_job(&self, job_id: JobId, expected: JobStatus, next: JobStatus) -> Result<bool, StoreError> {
        (**self).transition_job(job_id, expected, next)
    }

    fn control(&self, key: &ControlKey) -> Result<Option<ControlEntry>, StoreError> {
        (**self).control(key)
    }

    fn swap_control(&self, entry: &ControlEntry, expected_version: u64) -> Result<bool, StoreError> {
        (**self).swap_control(entry, expected_version)
    }

    fn record_cube_metadata(&self, metadata: &CubeMetadata) -> Result<(), StoreError> {
        (**self).record_cube_metadata(metadata)
    }

    fn cube_metadata(&self, job_id: JobId) -> Result<Option<CubeMetadata>, StoreError> {
        (**self).cube_metadata(job_id)
    }

    fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        (**self).record_dead_letter(entry)
    }

    fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        (**self).get_dead_letter(id)
    }

    fn list_dead_letters(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        (**self).list_dead_letters(job_id, limit)
    }

    fn mark_dead_letter_redriven(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        (**self).mark_dead_letter_redriven(id, at)
    }
}

pub(crate) fn check_unit_transition(expected: UnitStatus, next: UnitStatus) -> Result<(), StoreError> {
    if expected.allows(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            from: expected.to_string(),
            to: next.to_string(),
        })
    }
}

pub(crate) fn check_job_transition(expected: JobStatus, next: JobStatus) -> Result<(), StoreError> {
    if expected.allows(next) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            from: expected.to_string(),
            to: next.to_string(),
        })
    }
}
