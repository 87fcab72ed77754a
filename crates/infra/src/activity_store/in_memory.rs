//! In-memory activity store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use cubeflow_core::{
    ControlEntry, ControlKey, CubeMetadata, DeadLetterId, Fingerprint, Job, JobId, JobStatus,
    UnitCounts, UnitId, UnitStatus, WorkUnit,
};

use super::store::{
    ActivityStore, DeadLetterEntry, JobProgress, StoreError, TransitionUpdate, check_job_transition,
    check_unit_transition,
};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    units: HashMap<UnitId, WorkUnit>,
    units_by_job: HashMap<JobId, Vec<UnitId>>,
    control: HashMap<ControlKey, ControlEntry>,
    metadata: HashMap<JobId, CubeMetadata>,
    dead_letters: HashMap<DeadLetterId, DeadLetterEntry>,
}

/// In-memory activity store.
///
/// A single lock guards all maps, so batch writes (job + units) are atomic and
/// every conditional write is checked and applied under the write lock.
#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    state: RwLock<State>,
}

impl InMemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("activity store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Storage("activity store lock poisoned".to_string()))
    }
}

impl ActivityStore for InMemoryActivityStore {
    fn create_job(&self, job: &Job, units: &[WorkUnit]) -> Result<(), StoreError> {
        let mut state = self.write()?;

        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }
        if state
            .jobs
            .values()
            .any(|j| j.fingerprint == job.fingerprint && j.status != JobStatus::Failed)
        {
            return Err(StoreError::Conflict(format!(
                "an active job with fingerprint {} already exists",
                job.fingerprint
            )));
        }
        if let Some(u) = units.iter().find(|u| u.job_id != job.id || state.units.contains_key(&u.id)) {
            return Err(StoreError::Conflict(format!("unit {} cannot be seeded", u.id)));
        }

        state.jobs.insert(job.id, job.clone());
        state
            .units_by_job
            .insert(job.id, units.iter().map(|u| u.id).collect());
        for unit in units {
            state.units.insert(unit.id, unit.clone());
        }
        Ok(())
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn find_active_by_fingerprint(&self, fingerprint: Fingerprint) -> Result<Option<Job>, StoreError> {
        let state = self.read()?;
        let found = state
            .jobs
            .values()
            .filter(|j| j.fingerprint == fingerprint && j.status != JobStatus::Failed)
            .max_by_key(|j| j.created_at)
            .cloned();
        Ok(found)
    }

    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    fn get_unit(&self, unit_id: UnitId) -> Result<Option<WorkUnit>, StoreError> {
        Ok(self.read()?.units.get(&unit_id).cloned())
    }

    fn list_units(&self, job_id: JobId) -> Result<Vec<WorkUnit>, StoreError> {
        let state = self.read()?;
        let units = state
            .units_by_job
            .get(&job_id)
            .map(|ids| ids.iter().filter_map(|id| state.units.get(id).cloned()).collect())
            .unwrap_or_default();
        Ok(units)
    }

    fn transition(
        &self,
        unit_id: UnitId,
        expected: UnitStatus,
        next: UnitStatus,
        update: TransitionUpdate,
    ) -> Result<bool, StoreError> {
        check_unit_transition(expected, next)?;

        let mut state = self.write()?;
        let unit = state
            .units
            .get_mut(&unit_id)
            .ok_or_else(|| StoreError::NotFound(format!("unit {unit_id}")))?;

        if unit.status != expected {
            return Ok(false);
        }
        unit.status = next;
        if let Some(attempts) = update.attempt_count {
            unit.attempt_count = attempts;
        }
        if let Some(err) = update.last_error {
            unit.last_error = Some(err);
        }
        unit.updated_at = Utc::now();
        Ok(true)
    }

    fn job_state(&self, job_id: JobId) -> Result<JobProgress, StoreError> {
        let state = self.read()?;
        let ids = state
            .units_by_job
            .get(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        let counts = UnitCounts::tally(ids.iter().filter_map(|id| state.units.get(id)).map(|u| u.status));
        Ok(JobProgress {
            job_id,
            counts,
            status: counts.derive_status(),
        })
    }

    fn transition_job(&self, job_id: JobId, expected: JobStatus, next: JobStatus) -> Result<bool, StoreError> {
        check_job_transition(expected, next)?;

        let mut state = self.write()?;
        let fingerprint = match state.jobs.get(&job_id) {
            Some(job) if job.status != expected => return Ok(false),
            Some(job) => job.fingerprint,
            None => return Err(StoreError::NotFound(format!("job {job_id}"))),
        };
        // Leaving `failed` makes the job active again; mirror the unique index.
        if expected == JobStatus::Failed
            && next != JobStatus::Failed
            && state
                .jobs
                .values()
                .any(|j| j.id != job_id && j.fingerprint == fingerprint && j.status != JobStatus::Failed)
        {
            return Err(StoreError::Conflict(format!(
                "an active job with fingerprint {fingerprint} already exists"
            )));
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.apply_status(next, Utc::now());
        }
        Ok(true)
    }

    fn control(&self, key: &ControlKey) -> Result<Option<ControlEntry>, StoreError> {
        Ok(self.read()?.control.get(key).cloned())
    }

    fn swap_control(&self, entry: &ControlEntry, expected_version: u64) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let current = state.control.get(&entry.key).map(|e| e.version).unwrap_or(0);
        if current != expected_version {
            return Ok(false);
        }

        let mut stored = entry.clone();
        stored.version = expected_version + 1;
        stored.updated_at = Some(Utc::now());
        state.control.insert(stored.key.clone(), stored);
        Ok(true)
    }

    fn record_cube_metadata(&self, metadata: &CubeMetadata) -> Result<(), StoreError> {
        self.write()?.metadata.insert(metadata.job_id, metadata.clone());
        Ok(())
    }

    fn cube_metadata(&self, job_id: JobId) -> Result<Option<CubeMetadata>, StoreError> {
        Ok(self.read()?.metadata.get(&job_id).cloned())
    }

    fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.write()?
            .dead_letters
            .entry(entry.id)
            .or_insert_with(|| entry.clone());
        Ok(())
    }

    fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.read()?.dead_letters.get(&id).cloned())
    }

    fn list_dead_letters(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let state = self.read()?;
        let mut entries: Vec<DeadLetterEntry> = state
            .dead_letters
            .values()
            .filter(|e| job_id.is_none_or(|j| e.job_id == j))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    fn mark_dead_letter_redriven(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        let entry = state
            .dead_letters
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;
        if entry.redriven_at.is_some() {
            return Ok(false);
        }
        entry.redriven_at = Some(at);
        Ok(true)
    }
}
