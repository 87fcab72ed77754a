//! Errors raised while building or parsing domain values.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A request or stored value that does not describe a valid cube job.
///
/// Every variant is deterministic: retrying the same input fails the same way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Tile, period or cube definition rejected.
    #[error("invalid cube definition: {0}")]
    Validation(String),

    #[error("invalid data cube name: {0}")]
    InvalidCubeName(String),

    /// The timeline cannot be expanded into periods.
    #[error("invalid timeline: {0}")]
    InvalidTimeline(String),

    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn cube_name(msg: impl Into<String>) -> Self {
        Self::InvalidCubeName(msg.into())
    }

    pub fn timeline(msg: impl Into<String>) -> Self {
        Self::InvalidTimeline(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
