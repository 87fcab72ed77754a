//! Job completion check.
//!
//! Every terminal unit transition is followed by a check. Many callers may run
//! it concurrently for the same job; the final status write is conditional, so
//! exactly one of them finalizes and notifies. Cube metadata is written before
//! that status write and may be written more than once; the write is an upsert.

use chrono::Utc;
use tracing::{debug, error, info};

use cubeflow_core::{
    ControlKey, CubeMetadata, Job, JobId, JobStatus, SliceMetadata, UnitStatus,
};

use crate::activity_store::{ActivityStore, JobProgress, StoreError};

use super::notify::{CompletionNotifier, JobNotification};

const MAX_STATUS_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Units are still outstanding.
    InProgress(JobProgress),
    /// This caller moved the job to its terminal status.
    Finalized { status: JobStatus, progress: JobProgress },
    /// Another caller already finalized the job.
    AlreadyTerminal(JobStatus),
}

#[derive(Debug, Clone)]
pub struct CompletionTracker<S, N> {
    store: S,
    notifier: N,
}

impl<S, N> CompletionTracker<S, N>
where
    S: ActivityStore,
    N: CompletionNotifier,
{
    pub fn new(store: S, notifier: N) -> Self {
        Self { store, notifier }
    }

    pub fn check(&self, job_id: JobId) -> Result<CompletionOutcome, StoreError> {
        for _ in 0..MAX_STATUS_ATTEMPTS {
            let job = self
                .store
                .get_job(job_id)?
                .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;

            if job.status.is_terminal() {
                return Ok(CompletionOutcome::AlreadyTerminal(job.status));
            }

            let progress = self.store.job_state(job_id)?;
            let derived = progress.status;

            if !derived.is_terminal() {
                if job.status == JobStatus::Pending && derived == JobStatus::Running {
                    // Losing this write just means someone else already did it.
                    self.store
                        .transition_job(job_id, JobStatus::Pending, JobStatus::Running)?;
                }
                return Ok(CompletionOutcome::InProgress(progress));
            }

            // Metadata lands before the terminal write so a crash in between
            // leaves the job open for the next check to finish.
            if derived == JobStatus::Done {
                self.record_metadata(&job)?;
            }
            if self.store.transition_job(job_id, job.status, derived)? {
                self.finalize(&job, &progress);
                return Ok(CompletionOutcome::Finalized {
                    status: derived,
                    progress,
                });
            }
            debug!(job_id = %job_id, expected = %job.status, "job status moved underneath completion check");
        }

        Err(StoreError::Conflict(format!(
            "job {job_id}: status kept changing during completion check"
        )))
    }

    fn record_metadata(&self, job: &Job) -> Result<(), StoreError> {
        let metadata = self.build_metadata(job).inspect_err(|e| {
            error!(job_id = %job.id, error = %e, "failed to collect cube metadata");
        })?;
        self.store.record_cube_metadata(&metadata).inspect_err(|e| {
            error!(job_id = %job.id, error = %e, "failed to record cube metadata");
        })
    }

    fn finalize(&self, job: &Job, progress: &JobProgress) {
        let cube = job.definition.name.to_string();
        info!(
            job_id = %job.id,
            cube = %cube,
            status = %progress.status,
            units_total = progress.counts.total,
            units_done = progress.counts.done,
            units_failed = progress.counts.failed,
            "job finalized"
        );
        self.notifier
            .notify(&JobNotification::new(job.id, cube, progress.status, &progress.counts, Utc::now()));
    }

    fn build_metadata(&self, job: &Job) -> Result<CubeMetadata, StoreError> {
        let name = &job.definition.name;
        let mut slices = Vec::new();
        for unit in self.store.list_units(job.id)? {
            if unit.status != UnitStatus::Done {
                continue;
            }
            let key = ControlKey::new(name.to_string(), unit.tile_id.clone(), unit.period_id.clone());
            let inputs = self.store.control(&key)?.map(|e| e.len()).unwrap_or(0);
            slices.push(SliceMetadata {
                tile_id: unit.tile_id,
                period_id: unit.period_id,
                inputs,
            });
        }

        Ok(CubeMetadata {
            job_id: job.id,
            cube: name.to_string(),
            resolution: name.resolution(),
            composite_function: name.composite_function(),
            collections: job.definition.collections.iter().cloned().collect(),
            slices,
            finalized_at: Utc::now(),
        })
    }
}
