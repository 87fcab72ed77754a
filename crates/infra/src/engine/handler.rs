//! Continuation handler: processes one dispatch message into a terminal unit.
//!
//! ```text
//! DispatchMessage
//!   ↓
//! 1. Load unit (unknown / already terminal → skip)
//!   ↓
//! 2. Claim: transition pending → running (lost → skip)
//!   ↓
//! 3. Load control entry, RasterCompute::compose
//!   ↓
//! 4a. ok:  CAS control entry (union on conflict), running → done
//! 4b. err: record error, running → failed
//!   ↓
//! 5. Completion check for the job
//! ```
//!
//! A store error after the claim releases the unit to `failed` so it cannot
//! stay `running` with nobody working on it. A redelivery of the attempt that
//! failed reports `Failed` again, so a dead-letter step that was lost on the
//! first delivery gets another chance.
//!
//! The handler holds no state between invocations. Everything it knows comes
//! from the message and the activity store, so any number of handlers can run
//! concurrently and a message can be delivered any number of times.

use tracing::{debug, error, warn};

use cubeflow_channels::DispatchMessage;
use cubeflow_core::{ControlEntry, ControlKey, JobId, UnitId, UnitStatus, WorkUnit};

use crate::activity_store::{ActivityStore, StoreError, TransitionUpdate};
use crate::collaborators::RasterCompute;

use super::completion::{CompletionOutcome, CompletionTracker};
use super::notify::CompletionNotifier;

const MAX_CONTROL_ATTEMPTS: usize = 8;

/// Why a message was skipped without processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    UnknownUnit,
    /// Duplicate delivery of a unit that already reached this status.
    AlreadyTerminal(UnitStatus),
    /// Another handler (or the dead-letter inspector) moved the unit first.
    LostRace,
    /// The message names a unit of a different job.
    Mismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed { unit_id: UnitId, job: CompletionOutcome },
    /// The unit is now `failed`; the message should be dead-lettered.
    Failed { unit_id: UnitId, error: String },
    Skipped { unit_id: UnitId, reason: SkipReason },
}

impl UnitOutcome {
    pub fn unit_id(&self) -> UnitId {
        match self {
            Self::Completed { unit_id, .. } | Self::Failed { unit_id, .. } | Self::Skipped { unit_id, .. } => {
                *unit_id
            }
        }
    }

    /// Whether the delivery should be acknowledged.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Infrastructure failure while handling a message. The message must not be
/// acknowledged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("control entry {key} kept changing; gave up after {attempts} attempts")]
    ControlContention { key: String, attempts: usize },
}

/// Per-message results of [`ContinuationHandler::handle_batch`], in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<Result<UnitOutcome, HandlerError>>,
}

impl BatchReport {
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Completed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Skipped { .. }))
    }

    pub fn errors(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_err()).count()
    }

    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.as_ref().is_ok_and(&pred))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct ContinuationHandler<S, R, N> {
    store: S,
    compute: R,
    completion: CompletionTracker<S, N>,
}

impl<S, R, N> ContinuationHandler<S, R, N>
where
    S: ActivityStore + Clone,
    R: RasterCompute,
    N: CompletionNotifier,
{
    pub fn new(store: S, compute: R, notifier: N) -> Self {
        Self {
            completion: CompletionTracker::new(store.clone(), notifier),
            store,
            compute,
        }
    }

    pub fn completion(&self) -> &CompletionTracker<S, N> {
        &self.completion
    }

    pub fn handle(&self, message: &DispatchMessage) -> Result<UnitOutcome, HandlerError> {
        let unit_id = message.unit_id;
        let skip = |reason| Ok(UnitOutcome::Skipped { unit_id, reason });

        let Some(unit) = self.store.get_unit(unit_id)? else {
            warn!(unit_id = %unit_id, job_id = %message.job_id, "dispatch for unknown unit");
            return skip(SkipReason::UnknownUnit);
        };
        if unit.job_id != message.job_id {
            warn!(unit_id = %unit_id, job_id = %message.job_id, owner = %unit.job_id, "dispatch names the wrong job");
            return skip(SkipReason::Mismatch);
        }
        if unit.status.is_terminal() {
            debug!(unit_id = %unit_id, status = %unit.status, "duplicate delivery");
            // Re-run the check so a lost finalization still converges.
            self.completion.check(unit.job_id)?;
            if unit.status == UnitStatus::Failed && unit.attempt_count == message.attempt {
                let error = unit.last_error.unwrap_or_else(|| "unit failed".to_string());
                return Ok(UnitOutcome::Failed { unit_id, error });
            }
            return skip(SkipReason::AlreadyTerminal(unit.status));
        }

        // A redriven message carries the attempt it starts; never count backwards.
        let attempt = message.attempt.max(unit.attempt_count + 1);
        let claimed = self.store.transition(
            unit_id,
            UnitStatus::Pending,
            UnitStatus::Running,
            TransitionUpdate::attempt(attempt),
        )?;
        if !claimed {
            debug!(unit_id = %unit_id, "unit claimed elsewhere");
            return skip(SkipReason::LostRace);
        }
        debug!(unit_id = %unit_id, tile = %unit.tile_id, period = %unit.period_id, attempt, "claimed unit");

        match self.run_claimed(&unit) {
            Ok(outcome) => Ok(outcome),
            Err(err) => self.release(&unit, err),
        }
    }

    fn run_claimed(&self, unit: &WorkUnit) -> Result<UnitOutcome, HandlerError> {
        let unit_id = unit.id;
        let skip = |reason| Ok(UnitOutcome::Skipped { unit_id, reason });

        let job = self
            .store
            .get_job(unit.job_id)?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", unit.job_id)))?;
        let key = ControlKey::new(job.definition.name.to_string(), unit.tile_id.clone(), unit.period_id.clone());
        let current = self
            .store
            .control(&key)?
            .unwrap_or_else(|| ControlEntry::empty(key.clone()));

        let composed = self
            .compute
            .compose(&unit.tile_id, &unit.period_id, &current)
            .map_err(|e| e.to_string())
            .and_then(|next| {
                if next.covers(&current) {
                    Ok(next)
                } else {
                    Err(format!("compose for {key} dropped previously merged inputs"))
                }
            });

        match composed {
            Ok(next) => {
                self.store_control(&key, current, next)?;
                if !self.store.transition(unit_id, UnitStatus::Running, UnitStatus::Done, TransitionUpdate::none())? {
                    warn!(unit_id = %unit_id, "unit left running state before it could complete");
                    return skip(SkipReason::LostRace);
                }
                debug!(unit_id = %unit_id, "unit done");
                let job = self.completion.check(unit.job_id)?;
                Ok(UnitOutcome::Completed { unit_id, job })
            }
            Err(reason) => {
                let failed = self.store.transition(
                    unit_id,
                    UnitStatus::Running,
                    UnitStatus::Failed,
                    TransitionUpdate::error(reason.clone()),
                )?;
                if !failed {
                    return skip(SkipReason::LostRace);
                }
                warn!(unit_id = %unit_id, job_id = %unit.job_id, error = %reason, "unit failed");
                // The dead-letter inspector re-runs the check when this one fails.
                if let Err(e) = self.completion.check(unit.job_id) {
                    warn!(job_id = %unit.job_id, error = %e, "completion check after failure did not finish");
                }
                Ok(UnitOutcome::Failed { unit_id, error: reason })
            }
        }
    }

    /// Give up a claimed unit after an infrastructure error: `running → failed`
    /// with the error recorded. If the unit already moved on, or the store is
    /// still failing, the original error is returned.
    fn release(&self, unit: &WorkUnit, err: HandlerError) -> Result<UnitOutcome, HandlerError> {
        let reason = format!("handler error: {err}");
        match self
            .store
            .transition(unit.id, UnitStatus::Running, UnitStatus::Failed, TransitionUpdate::error(reason.clone()))
        {
            Ok(true) => {
                warn!(unit_id = %unit.id, job_id = %unit.job_id, error = %err, "released claimed unit as failed");
                if let Err(e) = self.completion.check(unit.job_id) {
                    warn!(job_id = %unit.job_id, error = %e, "completion check after release failed");
                }
                Ok(UnitOutcome::Failed { unit_id: unit.id, error: reason })
            }
            Ok(false) => Err(err),
            Err(release_err) => {
                error!(unit_id = %unit.id, error = %release_err, "could not release claimed unit");
                Err(err)
            }
        }
    }

    /// Handle each message independently. One message's error does not stop the batch.
    pub fn handle_batch(&self, messages: &[DispatchMessage]) -> BatchReport {
        BatchReport {
            outcomes: messages.iter().map(|m| self.handle(m)).collect(),
        }
    }

    /// Job progress after handling, for callers that only hold a job id.
    pub fn check_job(&self, job_id: JobId) -> Result<CompletionOutcome, HandlerError> {
        Ok(self.completion.check(job_id)?)
    }

    fn store_control(&self, key: &ControlKey, current: ControlEntry, next: ControlEntry) -> Result<(), HandlerError> {
        let mut expected = current.version;
        let mut candidate = next;

        for _ in 0..MAX_CONTROL_ATTEMPTS {
            if self.store.swap_control(&candidate, expected)? {
                return Ok(());
            }
            let latest = self
                .store
                .control(key)?
                .unwrap_or_else(|| ControlEntry::empty(key.clone()));
            debug!(key = %key, version = latest.version, "control entry changed, merging");
            candidate = latest.union(&candidate);
            expected = latest.version;
        }

        Err(HandlerError::ControlContention {
            key: key.to_string(),
            attempts: MAX_CONTROL_ATTEMPTS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;
    use cubeflow_core::{CubeDefinition, Job, JobStatus, WorkUnit};

    use crate::activity_store::InMemoryActivityStore;
    use crate::collaborators::StaticRasterCompute;
    use crate::engine::notify::RecordingNotifier;
    use crate::faults::FlakyStore;

    type Handler = ContinuationHandler<Arc<InMemoryActivityStore>, Arc<StaticRasterCompute>, Arc<RecordingNotifier>>;

    fn fixture(periods: &[&str]) -> (Handler, Arc<InMemoryActivityStore>, Arc<StaticRasterCompute>, Vec<WorkUnit>) {
        let store = InMemoryActivityStore::arc();
        let compute = Arc::new(StaticRasterCompute::new(2));
        let def = CubeDefinition::new(
            "S2_10_1M_MED".parse().unwrap(),
            vec!["S2_MSI".to_string()],
            vec!["001".parse().unwrap()],
            periods.iter().map(|p| p.parse().unwrap()),
        )
        .unwrap();
        let job = Job::with_id(JobId::new(), def, Utc::now());
        let units = job.seed_units();
        store.create_job(&job, &units).unwrap();
        let handler = ContinuationHandler::new(store.clone(), compute.clone(), Arc::new(RecordingNotifier::new()));
        (handler, store, compute, units)
    }

    fn msg(unit: &WorkUnit) -> DispatchMessage {
        DispatchMessage::for_unit(unit, 1)
    }

    #[test]
    fn processes_a_unit_and_finalizes_single_unit_job() {
        let (handler, store, _, units) = fixture(&["2020-01-01_2020-01-31"]);

        let outcome = handler.handle(&msg(&units[0])).unwrap();
        assert!(matches!(
            outcome,
            UnitOutcome::Completed { job: CompletionOutcome::Finalized { status: JobStatus::Done, .. }, .. }
        ));

        let unit = store.get_unit(units[0].id).unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Done);
        assert_eq!(unit.attempt_count, 1);
    }

    #[test]
    fn duplicate_delivery_is_skipped_and_merges_once() {
        let (handler, _, compute, units) = fixture(&["2020-01-01_2020-01-31"]);

        handler.handle(&msg(&units[0])).unwrap();
        let again = handler.handle(&msg(&units[0])).unwrap();

        assert_eq!(
            again,
            UnitOutcome::Skipped { unit_id: units[0].id, reason: SkipReason::AlreadyTerminal(UnitStatus::Done) }
        );
        assert_eq!(compute.calls(), 1);
        assert_eq!(compute.merges_applied(), 2);
    }

    #[test]
    fn compute_failure_marks_unit_failed_with_reason() {
        let (handler, store, compute, units) = fixture(&["2020-01-01_2020-01-31", "2020-02-01_2020-02-29"]);
        compute.fail_on(units[0].tile_id.clone(), units[0].period_id.clone(), "no cloud-free scenes");

        let outcome = handler.handle(&msg(&units[0])).unwrap();
        assert!(matches!(outcome, UnitOutcome::Failed { ref error, .. } if error.contains("no cloud-free scenes")));
        assert!(!outcome.is_settled());

        let unit = store.get_unit(units[0].id).unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Failed);
        assert_eq!(unit.attempt_count, 1);
        assert!(unit.last_error.unwrap().contains("no cloud-free scenes"));
    }

    #[test]
    fn unknown_and_mismatched_units_are_skipped() {
        let (handler, _, _, units) = fixture(&["2020-01-01_2020-01-31"]);

        let mut unknown = msg(&units[0]);
        unknown.unit_id = UnitId::from_uuid(uuid::Uuid::now_v7());
        assert!(matches!(
            handler.handle(&unknown).unwrap(),
            UnitOutcome::Skipped { reason: SkipReason::UnknownUnit, .. }
        ));

        let mut other_job = msg(&units[0]);
        other_job.job_id = JobId::new();
        assert!(matches!(
            handler.handle(&other_job).unwrap(),
            UnitOutcome::Skipped { reason: SkipReason::Mismatch, .. }
        ));
    }

    #[test]
    fn running_unit_is_a_lost_race() {
        let (handler, store, compute, units) = fixture(&["2020-01-01_2020-01-31"]);
        store
            .transition(units[0].id, UnitStatus::Pending, UnitStatus::Running, TransitionUpdate::attempt(1))
            .unwrap();

        assert!(matches!(
            handler.handle(&msg(&units[0])).unwrap(),
            UnitOutcome::Skipped { reason: SkipReason::LostRace, .. }
        ));
        assert_eq!(compute.calls(), 0);
    }

    #[test]
    fn compose_builds_on_existing_control_entry() {
        let (handler, store, _, units) = fixture(&["2020-01-01_2020-01-31"]);
        let key = ControlKey::new("S2_10_1M_MED", units[0].tile_id.clone(), units[0].period_id.clone());

        let mut foreign = ControlEntry::empty(key.clone());
        foreign.fold("foreign-scene");
        assert!(store.swap_control(&foreign, 0).unwrap());

        handler.handle(&msg(&units[0])).unwrap();
        let stored = store.control(&key).unwrap().unwrap();
        assert!(stored.contains("foreign-scene"));
        assert_eq!(stored.len(), 3);
    }

    #[test]
    fn batch_reports_each_message() {
        let (handler, _, compute, units) = fixture(&["2020-01-01_2020-01-31", "2020-02-01_2020-02-29"]);
        compute.fail_on(units[1].tile_id.clone(), units[1].period_id.clone(), "boom");

        let report = handler.handle_batch(&[msg(&units[0]), msg(&units[1]), msg(&units[0])]);
        assert_eq!(report.completed(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.errors(), 0);
    }

    #[test]
    fn redelivered_failed_attempt_is_reported_failed_again() {
        let (handler, _, compute, units) = fixture(&["2020-01-01_2020-01-31"]);
        compute.fail_on(units[0].tile_id.clone(), units[0].period_id.clone(), "boom");
        handler.handle(&msg(&units[0])).unwrap();

        let again = handler.handle(&msg(&units[0])).unwrap();
        assert!(matches!(again, UnitOutcome::Failed { ref error, .. } if error.contains("boom")));
        assert_eq!(compute.calls(), 1);

        // A later attempt that never ran is a plain duplicate.
        let later = handler.handle(&DispatchMessage::for_unit(&units[0], 2)).unwrap();
        assert!(matches!(later, UnitOutcome::Skipped { reason: SkipReason::AlreadyTerminal(UnitStatus::Failed), .. }));
    }

    #[test]
    fn store_error_after_claim_releases_unit_as_failed() {
        let (_, inner, compute, units) = fixture(&["2020-01-01_2020-01-31"]);
        let store = FlakyStore::arc(inner.clone());
        let handler = ContinuationHandler::new(store.clone(), compute, Arc::new(RecordingNotifier::new()));
        store.fail_next("swap_control", 1);

        let outcome = handler.handle(&msg(&units[0])).unwrap();
        assert!(matches!(outcome, UnitOutcome::Failed { ref error, .. } if error.contains("injected failure in swap_control")));

        let unit = inner.get_unit(units[0].id).unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Failed);
        assert_eq!(inner.get_job(units[0].job_id).unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn store_error_after_completion_is_returned_and_unit_stays_done() {
        let (_, inner, compute, units) = fixture(&["2020-01-01_2020-01-31"]);
        let store = FlakyStore::arc(inner.clone());
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = ContinuationHandler::new(store.clone(), compute, notifier.clone());
        store.fail_next("record_cube_metadata", 1);

        assert!(handler.handle(&msg(&units[0])).is_err());
        assert_eq!(inner.get_unit(units[0].id).unwrap().unwrap().status, UnitStatus::Done);
        assert!(!inner.get_job(units[0].job_id).unwrap().unwrap().status.is_terminal());
        assert!(notifier.notifications().is_empty());

        // The redelivery finishes the job.
        handler.handle(&msg(&units[0])).unwrap();
        assert_eq!(inner.get_job(units[0].job_id).unwrap().unwrap().status, JobStatus::Done);
        assert!(inner.cube_metadata(units[0].job_id).unwrap().is_some());
        assert_eq!(notifier.notifications().len(), 1);
    }
}
