//! `cubeflow-core`: domain model of the cube-build orchestration engine.
//!
//! This crate contains **pure domain** types: identifiers, cube definitions,
//! timelines, work-unit/job state machines and merge bookkeeping. No storage
//! or transport concerns live here.

pub mod activity;
pub mod control;
pub mod cube;
pub mod error;
pub mod id;
pub mod timeline;

pub use activity::{CubeMetadata, Job, JobStatus, SliceMetadata, UnitCounts, UnitStatus, WorkUnit};
pub use control::{ControlEntry, ControlKey};
pub use cube::{CompositeFunction, CubeDefinition, CubeName, Period, PeriodId, TileId};
pub use error::{DomainError, DomainResult};
pub use id::{DeadLetterId, Fingerprint, JobId, UnitId};
pub use timeline::{TemporalSchema, Timeline};
