//! Durable engine state: jobs, work units, control entries, cube metadata and
//! the dead-letter ledger.
//!
//! Two implementations:
//!
//! - [`InMemoryActivityStore`] for tests and single-process dev runs
//! - [`PostgresActivityStore`] for persistent deployments

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryActivityStore;
pub use postgres::PostgresActivityStore;
pub use store::{ActivityStore, DeadLetterEntry, JobProgress, StoreError, TransitionUpdate};
