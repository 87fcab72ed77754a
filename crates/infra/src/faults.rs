//! Store and queue wrappers that fail chosen operations a set number of times.
//!
//! Tests arm a fault by operation name (`"swap_control"`, `"send"`, ...); the
//! next calls of that operation return a storage or transport error without
//! reaching the wrapped implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use cubeflow_channels::{
    ChannelError, DeadLetterRecord, Delivery, DispatchMessage, DispatchQueue, InMemoryDispatchQueue,
    QueueDepth, ReceiptHandle,
};
use cubeflow_core::{
    ControlEntry, ControlKey, CubeMetadata, DeadLetterId, Fingerprint, Job, JobId, JobStatus, UnitId,
    UnitStatus, WorkUnit,
};

use crate::activity_store::{
    ActivityStore, DeadLetterEntry, InMemoryActivityStore, JobProgress, StoreError, TransitionUpdate,
};

#[derive(Debug, Default)]
struct Faults(Mutex<HashMap<&'static str, u32>>);

impl Faults {
    fn arm(&self, op: &'static str, times: u32) {
        self.0.lock().unwrap().insert(op, times);
    }

    fn trip(&self, op: &'static str) -> bool {
        let mut armed = self.0.lock().unwrap();
        match armed.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<InMemoryActivityStore>,
    faults: Faults,
}

impl FlakyStore {
    pub fn arc(inner: Arc<InMemoryActivityStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Faults::default(),
        })
    }

    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.faults.arm(op, times);
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if self.faults.trip(op) {
            return Err(StoreError::Storage(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

impl ActivityStore for FlakyStore {
    fn create_job(&self, job: &Job, units: &[WorkUnit]) -> Result<(), StoreError> {
        self.check("create_job")?;
        self.inner.create_job(job, units)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.check("get_job")?;
        self.inner.get_job(job_id)
    }

    fn find_active_by_fingerprint(&self, fingerprint: Fingerprint) -> Result<Option<Job>, StoreError> {
        self.check("find_active_by_fingerprint")?;
        self.inner.find_active_by_fingerprint(fingerprint)
    }

    fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.check("list_jobs")?;
        self.inner.list_jobs(status, limit)
    }

    fn get_unit(&self, unit_id: UnitId) -> Result<Option<WorkUnit>, StoreError> {
        self.check("get_unit")?;
        self.inner.get_unit(unit_id)
    }

    fn list_units(&self, job_id: JobId) -> Result<Vec<WorkUnit>, StoreError> {
        self.check("list_units")?;
        self.inner.list_units(job_id)
    }

    fn transition(
        &self,
        unit_id: UnitId,
        expected: UnitStatus,
        next: UnitStatus,
        update: TransitionUpdate,
    ) -> Result<bool, StoreError> {
        self.check("transition")?;
        self.inner.transition(unit_id, expected, next, update)
    }

    fn job_state(&self, job_id: JobId) -> Result<JobProgress, StoreError> {
        self.check("job_state")?;
        self.inner.job_state(job_id)
    }

    fn transition_job(&self, job_id: JobId, expected: JobStatus, next: JobStatus) -> Result<bool, StoreError> {
        self.check("transition_job")?;
        self.inner.transition_job(job_id, expected, next)
    }

    fn control(&self, key: &ControlKey) -> Result<Option<ControlEntry>, StoreError> {
        self.check("control")?;
        self.inner.control(key)
    }

    fn swap_control(&self, entry: &ControlEntry, expected_version: u64) -> Result<bool, StoreError> {
        self.check("swap_control")?;
        self.inner.swap_control(entry, expected_version)
    }

    fn record_cube_metadata(&self, metadata: &CubeMetadata) -> Result<(), StoreError> {
        self.check("record_cube_metadata")?;
        self.inner.record_cube_metadata(metadata)
    }

    fn cube_metadata(&self, job_id: JobId) -> Result<Option<CubeMetadata>, StoreError> {
        self.check("cube_metadata")?;
        self.inner.cube_metadata(job_id)
    }

    fn record_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), StoreError> {
        self.check("record_dead_letter")?;
        self.inner.record_dead_letter(entry)
    }

    fn get_dead_letter(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        self.check("get_dead_letter")?;
        self.inner.get_dead_letter(id)
    }

    fn list_dead_letters(&self, job_id: Option<JobId>, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.check("list_dead_letters")?;
        self.inner.list_dead_letters(job_id, limit)
    }

    fn mark_dead_letter_redriven(&self, id: DeadLetterId, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check("mark_dead_letter_redriven")?;
        self.inner.mark_dead_letter_redriven(id, at)
    }
}

#[derive(Debug)]
pub struct FlakyQueue {
    inner: Arc<InMemoryDispatchQueue>,
    faults: Faults,
}

impl FlakyQueue {
    pub fn arc(inner: Arc<InMemoryDispatchQueue>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Faults::default(),
        })
    }

    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.faults.arm(op, times);
    }

    fn check(&self, op: &'static str) -> Result<(), ChannelError> {
        if self.faults.trip(op) {
            return Err(ChannelError::Transport(format!("injected failure in {op}")));
        }
        Ok(())
    }
}

impl DispatchQueue for FlakyQueue {
    fn send(&self, message: DispatchMessage) -> Result<(), ChannelError> {
        self.check("send")?;
        self.inner.send(message)
    }

    fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        self.check("receive")?;
        self.inner.receive(max)
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), ChannelError> {
        self.check("ack")?;
        self.inner.ack(receipt)
    }

    fn fail(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), ChannelError> {
        self.check("fail")?;
        self.inner.fail(receipt, reason)
    }

    fn dead_letter(&self, message: DispatchMessage, reason: &str) -> Result<DeadLetterRecord, ChannelError> {
        self.check("dead_letter")?;
        self.inner.dead_letter(message, reason)
    }

    fn drain_dead_letters(&self, max: usize) -> Result<Vec<DeadLetterRecord>, ChannelError> {
        self.check("drain_dead_letters")?;
        self.inner.drain_dead_letters(max)
    }

    fn restore_dead_letters(&self, records: Vec<DeadLetterRecord>) -> Result<(), ChannelError> {
        self.check("restore_dead_letters")?;
        self.inner.restore_dead_letters(records)
    }

    fn depth(&self) -> Result<QueueDepth, ChannelError> {
        self.inner.depth()
    }
}
