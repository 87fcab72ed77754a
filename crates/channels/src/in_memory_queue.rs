//! In-memory dispatch queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::ChannelError;
use crate::message::{DeadLetterRecord, Delivery, DispatchMessage, ReceiptHandle};
use crate::queue::{DispatchQueue, QueueDepth, RedrivePolicy};

#[derive(Debug, Clone)]
struct Stored {
    message_id: u64,
    message: DispatchMessage,
    receive_count: u32,
}

#[derive(Debug)]
struct Leased {
    stored: Stored,
    lease_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    visible: VecDeque<Stored>,
    in_flight: HashMap<ReceiptHandle, Leased>,
    dead_letters: VecDeque<DeadLetterRecord>,
}

/// In-memory queue with lease expiry and dead-lettering.
///
/// - No IO / no async
/// - Lease expiry is evaluated lazily on `receive`/`depth`, against the injected clock
#[derive(Debug)]
pub struct InMemoryDispatchQueue {
    policy: RedrivePolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl InMemoryDispatchQueue {
    pub fn new(policy: RedrivePolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: RedrivePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn arc(policy: RedrivePolicy) -> Arc<Self> {
        Arc::new(Self::new(policy))
    }

    pub fn policy(&self) -> RedrivePolicy {
        self.policy
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, ChannelError> {
        self.state.lock().map_err(|_| ChannelError::Poisoned)
    }

    fn reap_expired(&self, state: &mut QueueState, now: DateTime<Utc>) {
        let expired: Vec<ReceiptHandle> = state
            .in_flight
            .iter()
            .filter(|(_, leased)| leased.lease_until <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(leased) = state.in_flight.remove(&receipt) {
                let reason = format!(
                    "lease expired after {}s without acknowledgement",
                    self.policy.visibility_timeout.as_secs()
                );
                self.redrive_or_dead_letter(state, leased.stored, &reason, now);
            }
        }
    }

    fn redrive_or_dead_letter(&self, state: &mut QueueState, stored: Stored, reason: &str, now: DateTime<Utc>) {
        if self.policy.exhausted(stored.receive_count) {
            warn!(
                unit_id = %stored.message.unit_id,
                receive_count = stored.receive_count,
                reason = %reason,
                "message dead-lettered"
            );
            state.dead_letters.push_back(DeadLetterRecord::new(
                stored.message,
                reason,
                stored.receive_count,
                now,
            ));
        } else {
            debug!(
                unit_id = %stored.message.unit_id,
                receive_count = stored.receive_count,
                "message returned to queue"
            );
            state.visible.push_back(stored);
        }
    }
}

impl Default for InMemoryDispatchQueue {
    fn default() -> Self {
        Self::new(RedrivePolicy::default())
    }
}

impl DispatchQueue for InMemoryDispatchQueue {
    fn send(&self, message: DispatchMessage) -> Result<(), ChannelError> {
        let mut state = self.lock()?;
        let message_id = state.next_id;
        state.next_id += 1;
        state.visible.push_back(Stored {
            message_id,
            message,
            receive_count: 0,
        });
        Ok(())
    }

    fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.policy.visibility_timeout)
            .map_err(|e| ChannelError::InvalidConfig(e.to_string()))?;

        let mut state = self.lock()?;
        self.reap_expired(&mut state, now);

        let mut out = Vec::new();
        while out.len() < max {
            let Some(mut stored) = state.visible.pop_front() else {
                break;
            };
            stored.receive_count += 1;
            let receipt = ReceiptHandle::new(format!("{}-{}", stored.message_id, stored.receive_count));
            out.push(Delivery {
                receipt: receipt.clone(),
                message: stored.message.clone(),
                receive_count: stored.receive_count,
            });
            state.in_flight.insert(
                receipt,
                Leased {
                    stored,
                    lease_until: now + lease,
                },
            );
        }
        Ok(out)
    }

    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), ChannelError> {
        let mut state = self.lock()?;
        state
            .in_flight
            .remove(receipt)
            .map(|_| ())
            .ok_or_else(|| ChannelError::UnknownReceipt(receipt.to_string()))
    }

    fn fail(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), ChannelError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let leased = state
            .in_flight
            .remove(receipt)
            .ok_or_else(|| ChannelError::UnknownReceipt(receipt.to_string()))?;
        self.redrive_or_dead_letter(&mut state, leased.stored, reason, now);
        Ok(())
    }

    fn dead_letter(&self, message: DispatchMessage, reason: &str) -> Result<DeadLetterRecord, ChannelError> {
        let record = DeadLetterRecord::new(message, reason, 1, self.clock.now());
        let mut state = self.lock()?;
        state.dead_letters.push_back(record.clone());
        Ok(record)
    }

    fn drain_dead_letters(&self, max: usize) -> Result<Vec<DeadLetterRecord>, ChannelError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        self.reap_expired(&mut state, now);
        let n = max.min(state.dead_letters.len());
        let drained: Vec<DeadLetterRecord> = state.dead_letters.drain(..n).collect();
        Ok(drained)
    }

    fn restore_dead_letters(&self, records: Vec<DeadLetterRecord>) -> Result<(), ChannelError> {
        let mut state = self.lock()?;
        // Back at the head, in their original order.
        for record in records.into_iter().rev() {
            state.dead_letters.push_front(record);
        }
        Ok(())
    }

    fn depth(&self) -> Result<QueueDepth, ChannelError> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        self.reap_expired(&mut state, now);
        Ok(QueueDepth {
            visible: state.visible.len(),
            in_flight: state.in_flight.len(),
            dead_letters: state.dead_letters.len(),
        })
    }
}
