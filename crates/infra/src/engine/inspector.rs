//! Dead-letter inspector.
//!
//! Drains the dispatch channel's dead-letter path, makes the activity store
//! reflect each failure (unit `failed`, job completion re-checked) and keeps
//! an operator-visible ledger of the records. Operators can redrive a ledger
//! entry once; an optional `auto_redrive_limit` does the same automatically
//! for early attempts.
//!
//! Record ids are derived from `(unit, attempt)`, so a record that shows up
//! twice lands on the same ledger entry.

use chrono::Utc;
use tracing::{error, info, warn};

use cubeflow_channels::{ChannelError, DeadLetterRecord, DispatchMessage, DispatchQueue};
use cubeflow_core::{DeadLetterId, JobId, JobStatus, UnitId, UnitStatus, WorkUnit};

use crate::activity_store::{ActivityStore, DeadLetterEntry, StoreError, TransitionUpdate};

use super::completion::{CompletionOutcome, CompletionTracker};
use super::notify::CompletionNotifier;

/// What draining a record did to its unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitResolution {
    MarkedFailed,
    AlreadyTerminal(UnitStatus),
    /// The unit moved while we tried to fail it.
    LostRace,
    UnknownUnit,
    /// The ledger entry for this attempt was already redriven; the record is stale.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct InspectedFailure {
    pub entry: DeadLetterEntry,
    pub unit: UnitResolution,
    pub job: Option<CompletionOutcome>,
    /// Set when the record was redriven automatically.
    pub redriven: Option<DispatchMessage>,
}

#[derive(Debug, thiserror::Error)]
pub enum InspectorError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dead letter {0} not found")]
    NotFound(DeadLetterId),
    #[error("dead letter {0} was already redriven")]
    AlreadyRedriven(DeadLetterId),
    #[error("unit {unit_id} is {status}, only failed units can be redriven")]
    NotRedrivable { unit_id: UnitId, status: UnitStatus },
    /// An identical job was submitted after this one failed.
    #[error("job {0} cannot reopen, an identical job is active")]
    JobSuperseded(JobId),
}

pub struct DeadLetterInspector<S, Q, N> {
    store: S,
    queue: Q,
    completion: CompletionTracker<S, N>,
    auto_redrive_limit: u32,
}

impl<S, Q, N> DeadLetterInspector<S, Q, N>
where
    S: ActivityStore + Clone,
    Q: DispatchQueue,
    N: CompletionNotifier,
{
    pub fn new(store: S, queue: Q, notifier: N) -> Self {
        Self {
            completion: CompletionTracker::new(store.clone(), notifier),
            store,
            queue,
            auto_redrive_limit: 0,
        }
    }

    /// Redrive automatically while the failed attempt is below `limit`.
    /// `0` leaves every redrive to an operator.
    pub fn with_auto_redrive_limit(mut self, limit: u32) -> Self {
        self.auto_redrive_limit = limit;
        self
    }

    /// Drain up to `max` dead-letter records.
    ///
    /// Each record is written to the ledger before anything else happens to
    /// it. If the store fails, the current and all remaining records are put
    /// back on the dead-letter path unchanged and the error is returned.
    pub fn drain(&self, max: usize) -> Result<Vec<InspectedFailure>, InspectorError> {
        let mut records = self.queue.drain_dead_letters(max)?.into_iter();
        let mut inspected = Vec::new();

        while let Some(record) = records.next() {
            match self.inspect(&record) {
                Ok(failure) => inspected.push(failure),
                Err(err) => {
                    error!(dead_letter_id = %record.id, error = %err, "dead-letter inspection failed");
                    let rest: Vec<_> = std::iter::once(record).chain(records).collect();
                    let count = rest.len();
                    if let Err(e) = self.queue.restore_dead_letters(rest) {
                        error!(count, error = %e, "could not return records to dead-letter path");
                    }
                    return Err(err);
                }
            }
        }

        Ok(inspected)
    }

    /// Reopen the unit of a ledger entry and dispatch it again. Succeeds at most
    /// once per entry.
    ///
    /// The entry is marked redriven only after the message is on the queue. If
    /// reopening the job or sending fails, the unit and job go back to where
    /// they were and the entry stays redrivable.
    pub fn redrive(&self, id: DeadLetterId) -> Result<DispatchMessage, InspectorError> {
        let entry = self
            .store
            .get_dead_letter(id)?
            .ok_or(InspectorError::NotFound(id))?;
        if entry.redriven_at.is_some() {
            return Err(InspectorError::AlreadyRedriven(id));
        }

        let unit = self
            .store
            .get_unit(entry.unit_id)?
            .ok_or_else(|| StoreError::NotFound(format!("unit {}", entry.unit_id)))?;
        if unit.status != UnitStatus::Failed {
            return Err(InspectorError::NotRedrivable {
                unit_id: unit.id,
                status: unit.status,
            });
        }

        if !self
            .store
            .transition(unit.id, UnitStatus::Failed, UnitStatus::Pending, TransitionUpdate::none())?
        {
            let status = self.store.get_unit(unit.id)?.map_or(unit.status, |u| u.status);
            return Err(InspectorError::NotRedrivable {
                unit_id: unit.id,
                status,
            });
        }

        let reopened = match self.reopen_job(unit.job_id) {
            Ok(reopened) => reopened,
            Err(err) => {
                self.undo_redrive(&unit, None);
                return Err(match err {
                    StoreError::Conflict(_) => InspectorError::JobSuperseded(unit.job_id),
                    other => other.into(),
                });
            }
        };

        let message = DispatchMessage::for_unit(&unit, entry.record.original_message.attempt + 1);
        if let Err(err) = self.queue.send(message.clone()) {
            self.undo_redrive(&unit, reopened);
            return Err(err.into());
        }

        match self.store.mark_dead_letter_redriven(id, Utc::now()) {
            Ok(true) => {}
            Ok(false) => warn!(dead_letter_id = %id, "dead letter marked redriven concurrently"),
            Err(e) => warn!(dead_letter_id = %id, error = %e, "could not mark dead letter redriven"),
        }
        info!(dead_letter_id = %id, unit_id = %unit.id, attempt = message.attempt, "unit redriven");
        Ok(message)
    }

    /// Move a finalized failed or degraded job back to running. Returns the
    /// status it left.
    fn reopen_job(&self, job_id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let Some(job) = self.store.get_job(job_id)? else {
            return Ok(None);
        };
        if matches!(job.status, JobStatus::Failed | JobStatus::Degraded)
            && self.store.transition_job(job.id, job.status, JobStatus::Running)?
        {
            return Ok(Some(job.status));
        }
        Ok(None)
    }

    fn undo_redrive(&self, unit: &WorkUnit, reopened: Option<JobStatus>) {
        let reason = unit.last_error.clone().unwrap_or_else(|| "redrive aborted".to_string());
        if let Err(e) = self
            .store
            .transition(unit.id, UnitStatus::Pending, UnitStatus::Failed, TransitionUpdate::error(reason))
        {
            error!(unit_id = %unit.id, error = %e, "could not return unit to failed after aborted redrive");
        }
        if let Some(previous) = reopened {
            if let Err(e) = self.store.transition_job(unit.job_id, JobStatus::Running, previous) {
                error!(job_id = %unit.job_id, error = %e, "could not restore job status after aborted redrive");
            }
        }
    }

    fn inspect(&self, record: &DeadLetterRecord) -> Result<InspectedFailure, InspectorError> {
        if let Some(existing) = self.store.get_dead_letter(record.id)? {
            if existing.redriven_at.is_some() {
                info!(dead_letter_id = %record.id, unit_id = %existing.unit_id, "stale dead letter for a redriven attempt");
                return Ok(InspectedFailure {
                    entry: existing,
                    unit: UnitResolution::Superseded,
                    job: None,
                    redriven: None,
                });
            }
        }

        let entry = DeadLetterEntry::new(record.clone(), Utc::now());
        self.store.record_dead_letter(&entry)?;
        warn!(
            dead_letter_id = %entry.id,
            job_id = %entry.job_id,
            unit_id = %entry.unit_id,
            reason = %record.failure_reason,
            receive_count = record.receive_count,
            attempt = record.original_message.attempt,
            "dead letter recorded"
        );

        let resolution = self.fail_unit(record)?;
        let job = match resolution {
            UnitResolution::UnknownUnit => None,
            _ => Some(self.completion.check(entry.job_id)?),
        };

        let redrivable = matches!(
            resolution,
            UnitResolution::MarkedFailed | UnitResolution::AlreadyTerminal(UnitStatus::Failed)
        );
        let redriven = if redrivable && record.original_message.attempt < self.auto_redrive_limit {
            Some(self.redrive(entry.id)?)
        } else {
            None
        };

        Ok(InspectedFailure {
            entry,
            unit: resolution,
            job,
            redriven,
        })
    }

    fn fail_unit(&self, record: &DeadLetterRecord) -> Result<UnitResolution, StoreError> {
        let Some(unit) = self.store.get_unit(record.original_message.unit_id)? else {
            return Ok(UnitResolution::UnknownUnit);
        };
        if unit.status.is_terminal() {
            return Ok(UnitResolution::AlreadyTerminal(unit.status));
        }

        let marked = self.store.transition(
            unit.id,
            unit.status,
            UnitStatus::Failed,
            TransitionUpdate::error(record.failure_reason.clone()),
        )?;
        Ok(if marked {
            UnitResolution::MarkedFailed
        } else {
            UnitResolution::LostRace
        })
    }
}
