//! Completion notifications.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use cubeflow_core::{JobId, JobStatus, UnitCounts};

/// Emitted when a job reaches a terminal status, by whichever caller wins the
/// status write. A redriven job can be finalized (and notified) again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNotification {
    pub job_id: JobId,
    pub cube: String,
    pub status: JobStatus,
    pub units_total: usize,
    pub units_done: usize,
    pub units_failed: usize,
    pub units_skipped: usize,
    pub at: DateTime<Utc>,
}

impl JobNotification {
    pub fn new(job_id: JobId, cube: impl Into<String>, status: JobStatus, counts: &UnitCounts, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            cube: cube.into(),
            status,
            units_total: counts.total,
            units_done: counts.done,
            units_failed: counts.failed,
            units_skipped: counts.skipped,
            at,
        }
    }
}

/// Sink for job completion notifications.
///
/// Delivery is best-effort; a notifier must not fail the engine.
pub trait CompletionNotifier: Send + Sync {
    fn notify(&self, notification: &JobNotification);
}

impl<N> CompletionNotifier for Arc<N>
where
    N: CompletionNotifier + ?Sized,
{
    fn notify(&self, notification: &JobNotification) {
        (**self).notify(notification)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl CompletionNotifier for NoopNotifier {
    fn notify(&self, _notification: &JobNotification) {}
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<JobNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<JobNotification> {
        self.seen.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl CompletionNotifier for RecordingNotifier {
    fn notify(&self, notification: &JobNotification) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(notification.clone());
        }
    }
}
