//! Job submitter: resolve, deduplicate, seed and dispatch.

use serde::Serialize;
use tracing::{debug, info, warn};

use cubeflow_channels::{ChannelError, Dispatcher, DispatchMessage};
use cubeflow_core::{Job, JobId, JobStatus, UnitStatus, WorkUnit};

use crate::activity_store::{ActivityStore, StoreError, TransitionUpdate};
use crate::collaborators::{CatalogError, CatalogStore, JobSpec};

use super::completion::{CompletionOutcome, CompletionTracker};
use super::notify::CompletionNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOutcome {
    pub job_id: JobId,
    /// `false` when an identical, non-failed job already existed.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOutcome {
    pub skipped: usize,
    pub status: JobStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Rejected before anything was written.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("catalog error: {0}")]
    Catalog(CatalogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The job exists, but only `emitted` of `total` messages went out.
    /// `resume` re-emits the rest.
    #[error("dispatched {emitted}/{total} units of job {job_id}: {source}")]
    Dispatch {
        job_id: JobId,
        emitted: usize,
        total: usize,
        #[source]
        source: ChannelError,
    },
    #[error("job {0} not found")]
    NotFound(JobId),
}

impl From<CatalogError> for SubmitError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Unavailable(_) => SubmitError::Catalog(err),
            other => SubmitError::InvalidSpec(other.to_string()),
        }
    }
}

pub struct JobSubmitter<S, C, D, N> {
    store: S,
    catalog: C,
    dispatcher: D,
    completion: CompletionTracker<S, N>,
}

impl<S, C, D, N> JobSubmitter<S, C, D, N>
where
    S: ActivityStore + Clone,
    C: CatalogStore,
    D: Dispatcher,
    N: CompletionNotifier,
{
    pub fn new(store: S, catalog: C, dispatcher: D, notifier: N) -> Self {
        Self {
            completion: CompletionTracker::new(store.clone(), notifier),
            store,
            catalog,
            dispatcher,
        }
    }

    pub fn submit(&self, spec: &JobSpec) -> Result<SubmitOutcome, SubmitError> {
        let definition = self.catalog.resolve(spec)?;
        let fingerprint = definition.fingerprint();

        if let Some(existing) = self.store.find_active_by_fingerprint(fingerprint)? {
            info!(job_id = %existing.id, fingerprint = %fingerprint, "identical job already submitted");
            return Ok(SubmitOutcome {
                job_id: existing.id,
                created: false,
            });
        }

        let job = Job::new(definition);
        let units = job.seed_units();

        match self.store.create_job(&job, &units) {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                // Lost a concurrent submission of the same definition.
                return match self.store.find_active_by_fingerprint(fingerprint)? {
                    Some(winner) => {
                        debug!(job_id = %winner.id, "concurrent submission won");
                        Ok(SubmitOutcome {
                            job_id: winner.id,
                            created: false,
                        })
                    }
                    None => Err(StoreError::Conflict(reason).into()),
                };
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            job_id = %job.id,
            cube = %job.definition.name,
            units = units.len(),
            "job created"
        );
        self.emit(job.id, &units)?;

        Ok(SubmitOutcome {
            job_id: job.id,
            created: true,
        })
    }

    /// Re-emit dispatch messages for every unit still `pending`.
    pub fn resume(&self, job_id: JobId) -> Result<usize, SubmitError> {
        self.store
            .get_job(job_id)?
            .ok_or(SubmitError::NotFound(job_id))?;

        let pending: Vec<WorkUnit> = self
            .store
            .list_units(job_id)?
            .into_iter()
            .filter(|u| u.status == UnitStatus::Pending)
            .collect();

        let emitted = self.emit(job_id, &pending)?;
        info!(job_id = %job_id, emitted, "job resumed");
        Ok(emitted)
    }

    /// Skip every `pending` unit. Running units are left to finish.
    pub fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, SubmitError> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or(SubmitError::NotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(CancelOutcome {
                skipped: 0,
                status: job.status,
            });
        }

        let mut skipped = 0;
        for unit in self.store.list_units(job_id)? {
            if unit.status != UnitStatus::Pending {
                continue;
            }
            if self
                .store
                .transition(unit.id, UnitStatus::Pending, UnitStatus::Skipped, TransitionUpdate::none())?
            {
                skipped += 1;
            }
        }

        let status = match self.completion.check(job_id)? {
            CompletionOutcome::InProgress(progress) => progress.status,
            CompletionOutcome::Finalized { status, .. } | CompletionOutcome::AlreadyTerminal(status) => status,
        };
        info!(job_id = %job_id, skipped, status = %status, "job cancelled");
        Ok(CancelOutcome { skipped, status })
    }

    fn emit(&self, job_id: JobId, units: &[WorkUnit]) -> Result<usize, SubmitError> {
        let total = units.len();
        for (emitted, unit) in units.iter().enumerate() {
            let message = DispatchMessage::for_unit(unit, unit.attempt_count + 1);
            if let Err(source) = self.dispatcher.dispatch(message) {
                warn!(job_id = %job_id, emitted, total, error = %source, "dispatch interrupted");
                return Err(SubmitError::Dispatch {
                    job_id,
                    emitted,
                    total,
                    source,
                });
            }
        }
        Ok(total)
    }
}
