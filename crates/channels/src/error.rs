//! Channel error model.

use thiserror::Error;

/// Error raised by a delivery channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// Internal lock poisoning (in-memory implementations).
    #[error("channel state poisoned")]
    Poisoned,

    /// The receipt does not match an in-flight delivery (already acked, or the lease expired).
    #[error("unknown or expired receipt: {0}")]
    UnknownReceipt(String),

    #[error("partition {partition} out of range (partitions: {partitions})")]
    PartitionOutOfRange { partition: u32, partitions: u32 },

    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),

    #[error("invalid channel configuration: {0}")]
    InvalidConfig(String),

    /// Transport/broker failure.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
