//! Job and work-unit state machines.
//!
//! A job is decomposed into one [`WorkUnit`] per tile × period cell. Unit
//! status moves forward only; the job's status is always derivable from the
//! statuses of its units (see [`UnitCounts::derive_status`]).

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cube::{CompositeFunction, CubeDefinition, PeriodId, TileId};
use crate::error::DomainError;
use crate::id::{Fingerprint, JobId, UnitId};

/// Status of a single work unit.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// Terminal state for units that were never started because the job was cancelled.
    Skipped,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Forward moves of the unit lifecycle.
    ///
    /// `pending → running → {done | failed}`, plus `pending → failed` (dead-lettered
    /// before it ever ran) and `pending → skipped` (cancellation).
    pub fn advances_to(&self, next: UnitStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Skipped)
                | (Self::Running, Self::Done)
                | (Self::Running, Self::Failed)
        )
    }

    /// Every transition a store accepts: forward moves plus the explicit
    /// operator reopen of a failed unit (`failed → pending`) used by redrive.
    pub fn allows(&self, next: UnitStatus) -> bool {
        self.advances_to(next) || matches!((self, next), (Self::Failed, Self::Pending))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Aggregate status of a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Seeded; no unit has started.
    Pending,
    /// At least one unit has started and some are still outstanding.
    Running,
    /// Every unit is done.
    Done,
    /// Every unit is terminal, at least one failed and none is done.
    Failed,
    /// Every unit is terminal, at least one failed and at least one is done.
    Degraded,
    /// Every unit is terminal, some were skipped by cancellation and none failed.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Stored-status moves a store accepts.
    ///
    /// Non-terminal states may move to anything but `pending`; a `failed` or
    /// `degraded` job may be reopened to `running` when one of its units is redriven.
    pub fn allows(&self, next: JobStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next != Self::Pending && next != Self::Running,
            Self::Failed | Self::Degraded => next == Self::Running,
            Self::Done | Self::Cancelled => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Degraded => "degraded",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "degraded" => Ok(Self::Degraded),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// Per-status unit counts of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl UnitCounts {
    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = UnitStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.add(status);
        }
        counts
    }

    pub fn add(&mut self, status: UnitStatus) {
        self.add_n(status, 1);
    }

    pub fn add_n(&mut self, status: UnitStatus, n: usize) {
        self.total += n;
        let slot = match status {
            UnitStatus::Pending => &mut self.pending,
            UnitStatus::Running => &mut self.running,
            UnitStatus::Done => &mut self.done,
            UnitStatus::Failed => &mut self.failed,
            UnitStatus::Skipped => &mut self.skipped,
        };
        *slot += n;
    }

    pub fn active(&self) -> usize {
        self.pending + self.running
    }

    /// Job status implied by these counts.
    pub fn derive_status(&self) -> JobStatus {
        if self.active() > 0 {
            if self.pending == self.total {
                return JobStatus::Pending;
            }
            return JobStatus::Running;
        }

        if self.total > 0 && self.done == self.total {
            JobStatus::Done
        } else if self.failed > 0 {
            if self.done > 0 {
                JobStatus::Degraded
            } else {
                JobStatus::Failed
            }
        } else if self.skipped > 0 {
            JobStatus::Cancelled
        } else {
            JobStatus::Pending
        }
    }
}

/// A cube-build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub definition: CubeDefinition,
    pub fingerprint: Fingerprint,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(definition: CubeDefinition) -> Self {
        Self::with_id(JobId::new(), definition, Utc::now())
    }

    pub fn with_id(id: JobId, definition: CubeDefinition, now: DateTime<Utc>) -> Self {
        let fingerprint = definition.fingerprint();
        Self {
            id,
            definition,
            fingerprint,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// All units of this job, `pending`, in tile-major order.
    pub fn seed_units(&self) -> Vec<WorkUnit> {
        self.definition
            .cells()
            .map(|(tile, period)| WorkUnit::pending(self.id, tile.clone(), period.clone(), self.created_at))
            .collect()
    }

    /// Apply a status change, maintaining start/finish timestamps.
    pub fn apply_status(&mut self, next: JobStatus, now: DateTime<Utc>) {
        if next != JobStatus::Pending && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.finished_at = if next.is_terminal() { Some(now) } else { None };
        self.status = next;
        self.updated_at = now;
    }
}

/// One tile at one period of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub job_id: JobId,
    pub tile_id: TileId,
    pub period_id: PeriodId,
    pub status: UnitStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnit {
    pub fn pending(job_id: JobId, tile_id: TileId, period_id: PeriodId, now: DateTime<Utc>) -> Self {
        Self {
            id: UnitId::derive(job_id, &tile_id, &period_id),
            job_id,
            tile_id,
            period_id,
            status: UnitStatus::Pending,
            attempt_count: 0,
            last_error: None,
            updated_at: now,
        }
    }
}

/// One finished slice of a cube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceMetadata {
    pub tile_id: TileId,
    pub period_id: PeriodId,
    /// Number of raw inputs folded into the slice.
    pub inputs: usize,
}

/// Final metadata of a completed cube, written once at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeMetadata {
    pub job_id: JobId,
    pub cube: String,
    pub resolution: u32,
    pub composite_function: CompositeFunction,
    pub collections: Vec<String>,
    pub slices: Vec<SliceMetadata>,
    pub finalized_at: DateTime<Utc>,
}
