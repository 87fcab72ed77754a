//! Dispatch queue abstraction (lease + redrive mechanics).
//!
//! A dispatch queue hands out [`Delivery`]s under a **lease** (visibility
//! timeout). While leased, a message is invisible to other consumers. The
//! consumer then either acknowledges it or reports a failure.
//!
//! ## Redrive policy
//!
//! Every delivery increments the message's receive count. When a message is
//! failed, or its lease expires, the queue consults [`RedrivePolicy`]:
//!
//! - `receive_count < max_receive_count`: the message becomes visible again.
//! - otherwise: the message moves to the dead-letter path as a
//!   [`DeadLetterRecord`] carrying the failure reason.
//!
//! The default policy is **fail-fast** (`max_receive_count = 1`): a message
//! gets exactly one delivery; anything other than an ack dead-letters it.
//!
//! ## Delivery guarantees
//!
//! At-least-once. A consumer that crashes after doing the work but before the
//! ack will see the message again (or it will dead-letter); handlers must be
//! idempotent.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::ChannelError;
use crate::message::{DeadLetterRecord, Delivery, DispatchMessage, ReceiptHandle};

/// Lease and retry budget of a dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedrivePolicy {
    /// Deliveries allowed before a message is dead-lettered.
    pub max_receive_count: u32,
    /// Lease window. Should exceed worst-case unit processing latency.
    pub visibility_timeout: Duration,
}

impl Default for RedrivePolicy {
    fn default() -> Self {
        Self {
            max_receive_count: 1,
            visibility_timeout: Duration::from_secs(900),
        }
    }
}

impl RedrivePolicy {
    pub fn with_max_receive_count(mut self, max: u32) -> Self {
        self.max_receive_count = max;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.max_receive_count == 0 {
            return Err(ChannelError::InvalidConfig(
                "max_receive_count must be at least 1".to_string(),
            ));
        }
        if self.visibility_timeout.is_zero() {
            return Err(ChannelError::InvalidConfig(
                "visibility_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a message that has been received `receive_count` times is out of budget.
    pub fn exhausted(&self, receive_count: u32) -> bool {
        receive_count >= self.max_receive_count
    }
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
    pub dead_letters: usize,
}

/// At-least-once dispatch queue with a dead-letter path.
pub trait DispatchQueue: Send + Sync {
    /// Enqueue a message.
    fn send(&self, message: DispatchMessage) -> Result<(), ChannelError>;

    /// Lease up to `max` visible messages.
    ///
    /// Expired leases are resolved first (redelivered or dead-lettered per policy).
    fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError>;

    /// Acknowledge a delivery; the message is removed for good.
    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), ChannelError>;

    /// Report a failed delivery. Dead-letters the message if its budget is spent,
    /// otherwise makes it visible again.
    fn fail(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), ChannelError>;

    /// Route a message straight to the dead-letter path.
    fn dead_letter(&self, message: DispatchMessage, reason: &str) -> Result<DeadLetterRecord, ChannelError>;

    /// Remove and return up to `max` dead-letter records (oldest first).
    ///
    /// A drained record is never returned again.
    fn drain_dead_letters(&self, max: usize) -> Result<Vec<DeadLetterRecord>, ChannelError>;

    /// Return drained records to the dead-letter path with their ids unchanged,
    /// so a consumer that could not process them sees the same records again.
    fn restore_dead_letters(&self, records: Vec<DeadLetterRecord>) -> Result<(), ChannelError>;

    fn depth(&self) -> Result<QueueDepth, ChannelError>;
}

impl<Q> DispatchQueue for Arc<Q>
where
    Q: DispatchQueue + ?Sized,
{
    fn send(&self, message: DispatchMessage) -> Result<(), ChannelError> {
        (**self).send(message)
    }

    fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        (**self).receive(max)
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), ChannelError> {
        (**self).ack(receipt)
    }

    fn fail(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), ChannelError> {
        (**self).fail(receipt, reason)
    }

    fn dead_letter(&self, message: DispatchMessage, reason: &str) -> Result<DeadLetterRecord, ChannelError> {
        (**self).dead_letter(message, reason)
    }

    fn drain_dead_letters(&self, max: usize) -> Result<Vec<DeadLetterRecord>, ChannelError> {
        (**self).drain_dead_letters(max)
    }

    fn restore_dead_letters(&self, records: Vec<DeadLetterRecord>) -> Result<(), ChannelError> {
        (**self).restore_dead_letters(records)
    }

    fn depth(&self) -> Result<QueueDepth, ChannelError> {
        (**self).depth()
    }
}
