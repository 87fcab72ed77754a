//! Redis Streams dispatch queue.
//!
//! - **Stream key**: `cubeflow:dispatch`, one entry per message, field `payload`
//! - **Consumer group**: `cubeflow.handlers`; each process is a named consumer
//! - **Lease**: an entry read through the group sits in the pending entry list
//!   until `XACK`. Entries idle longer than the visibility timeout are
//!   reclaimed with `XCLAIM` (which bumps their delivery counter) or, once the
//!   counter reaches `max_receive_count`, moved to the dead-letter stream
//! - **Dead-letter stream**: `cubeflow:dispatch:dlq`, field `record` holding a
//!   serialized [`DeadLetterRecord`]

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use cubeflow_channels::{
    ChannelError, DeadLetterRecord, Delivery, DispatchMessage, DispatchQueue, QueueDepth, ReceiptHandle,
    RedrivePolicy,
};

use super::entry::{Entry, command_error, connect, parse_entries, parse_read_reply};

const DEFAULT_STREAM_KEY: &str = "cubeflow:dispatch";
const DEFAULT_DLQ_KEY: &str = "cubeflow:dispatch:dlq";
const DEFAULT_GROUP: &str = "cubeflow.handlers";

const EXPIRED_REASON: &str = "visibility timeout expired";

#[derive(Debug, Clone)]
pub struct RedisDispatchQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    policy: RedrivePolicy,
}

impl RedisDispatchQueue {
    pub fn new(redis_url: impl AsRef<str>, policy: RedrivePolicy) -> Result<Self, ChannelError> {
        policy.validate()?;
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ChannelError::Transport(format!("redis client: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            policy,
        })
    }

    /// Override stream, dead-letter and group names (tests, multi-tenant deployments).
    pub fn with_keys(mut self, stream_key: impl Into<String>, dlq_key: impl Into<String>, group: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self.dlq_key = dlq_key.into();
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Create the consumer group (and the stream) if missing.
    pub fn ensure_consumer_group(&self) -> Result<(), ChannelError> {
        let mut conn = connect(&self.client)?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command_error("XGROUP CREATE", e)),
        }
    }

    fn lease_ms(&self) -> u64 {
        self.policy.visibility_timeout.as_millis() as u64
    }

    fn message_of(entry: &Entry) -> Result<DispatchMessage, ChannelError> {
        DispatchMessage::from_json(entry.field("payload")?)
    }

    /// `(id, idle_ms, delivery_count)` of pending entries, oldest first.
    fn pending(&self, conn: &mut redis::Connection, start: &str, end: &str, count: usize) -> Result<Vec<(String, u64, u32)>, ChannelError> {
        let rows: Vec<(String, String, u64, u32)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(start)
            .arg(end)
            .arg(count)
            .query(conn)
            .map_err(|e| command_error("XPENDING", e))?;
        Ok(rows.into_iter().map(|(id, _, idle, count)| (id, idle, count)).collect())
    }

    fn entry_by_id(&self, conn: &mut redis::Connection, id: &str) -> Result<Option<Entry>, ChannelError> {
        let raw: redis::Value = redis::cmd("XRANGE")
            .arg(&self.stream_key)
            .arg(id)
            .arg(id)
            .query(conn)
            .map_err(|e| command_error("XRANGE", e))?;
        Ok(parse_entries(&raw)?.into_iter().next())
    }

    fn settle(&self, conn: &mut redis::Connection, id: &str) -> Result<u64, ChannelError> {
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .query(conn)
            .map_err(|e| command_error("XACK", e))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(id)
            .query(conn)
            .map_err(|e| command_error("XDEL", e))?;
        Ok(acked)
    }

    fn push_dead_letter(&self, conn: &mut redis::Connection, record: &DeadLetterRecord) -> Result<(), ChannelError> {
        let payload = serde_json::to_string(record).map_err(|e| ChannelError::Serialization(e.to_string()))?;
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("record")
            .arg(&payload)
            .query(conn)
            .map_err(|e| command_error("DLQ XADD", e))?;
        warn!(
            unit_id = %record.original_message.unit_id,
            receive_count = record.receive_count,
            reason = %record.failure_reason,
            "message dead-lettered"
        );
        Ok(())
    }

    /// Move a pending entry to the dead-letter stream and drop it from the group.
    fn dead_letter_pending(&self, conn: &mut redis::Connection, id: &str, receive_count: u32, reason: &str) -> Result<(), ChannelError> {
        if let Some(entry) = self.entry_by_id(conn, id)? {
            let record = DeadLetterRecord::new(Self::message_of(&entry)?, reason, receive_count, Utc::now());
            self.push_dead_letter(conn, &record)?;
        }
        self.settle(conn, id)?;
        Ok(())
    }

    /// Reclaim expired leases: dead-letter exhausted ones, re-deliver the rest.
    fn reclaim(&self, conn: &mut redis::Connection, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        let lease_ms = self.lease_ms();
        let expired: Vec<(String, u32)> = self
            .pending(conn, "-", "+", max.max(1) * 4)?
            .into_iter()
            .filter(|(_, idle, _)| *idle >= lease_ms)
            .map(|(id, _, count)| (id, count))
            .collect();

        let mut claim = Vec::new();
        for (id, count) in expired {
            if self.policy.exhausted(count) {
                self.dead_letter_pending(conn, &id, count, EXPIRED_REASON)?;
            } else if claim.len() < max {
                claim.push((id, count));
            }
        }
        if claim.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = claim.iter().map(|(id, _)| id.as_str()).collect();
        let raw: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(lease_ms)
            .arg(&ids[..])
            .query(conn)
            .map_err(|e| command_error("XCLAIM", e))?;

        let mut deliveries = Vec::new();
        for entry in parse_entries(&raw)? {
            let previous = claim.iter().find(|(id, _)| *id == entry.id).map_or(0, |(_, c)| *c);
            deliveries.push(Delivery {
                receipt: ReceiptHandle::new(entry.id.clone()),
                message: Self::message_of(&entry)?,
                receive_count: previous + 1,
            });
        }
        debug!(reclaimed = deliveries.len(), "reclaimed expired leases");
        Ok(deliveries)
    }
}

impl DispatchQueue for RedisDispatchQueue {
    #[instrument(skip(self, message), fields(stream_key = %self.stream_key, unit_id = %message.unit_id), err)]
    fn send(&self, message: DispatchMessage) -> Result<(), ChannelError> {
        let payload = message.to_json()?;
        let mut conn = connect(&self.client)?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("unit_id")
            .arg(message.unit_id.to_string())
            .arg("payload")
            .arg(&payload)
            .query(&mut conn)
            .map_err(|e| command_error("XADD", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key, consumer = %self.consumer), err)]
    fn receive(&self, max: usize) -> Result<Vec<Delivery>, ChannelError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let mut conn = connect(&self.client)?;
        let mut deliveries = self.reclaim(&mut conn, max)?;

        let remaining = max - deliveries.len();
        if remaining > 0 {
            let raw: redis::Value = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(&self.group)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(remaining)
                .arg("STREAMS")
                .arg(&self.stream_key)
                .arg(">")
                .query(&mut conn)
                .map_err(|e| command_error("XREADGROUP", e))?;

            for entry in parse_read_reply(&raw)? {
                deliveries.push(Delivery {
                    receipt: ReceiptHandle::new(entry.id.clone()),
                    message: Self::message_of(&entry)?,
                    receive_count: 1,
                });
            }
        }
        Ok(deliveries)
    }

    #[instrument(skip(self), fields(stream_key = %self.stream_key), err)]
    fn ack(&self, receipt: &ReceiptHandle) -> Result<(), ChannelError> {
        let mut conn = connect(&self.client)?;
        if self.settle(&mut conn, receipt.as_str())? == 0 {
            return Err(ChannelError::UnknownReceipt(receipt.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, reason), fields(stream_key = %self.stream_key), err)]
    fn fail(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), ChannelError> {
        let mut conn = connect(&self.client)?;
        let id = receipt.as_str();
        let Some((_, _, count)) = self.pending(&mut conn, id, id, 1)?.into_iter().next() else {
            return Err(ChannelError::UnknownReceipt(receipt.to_string()));
        };

        if self.policy.exhausted(count) {
            return self.dead_letter_pending(&mut conn, id, count, reason);
        }

        // Mark the entry as long idle so the next receive reclaims it.
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(0)
            .arg(id)
            .arg("IDLE")
            .arg(self.lease_ms())
            .arg("JUSTID")
            .query(&mut conn)
            .map_err(|e| command_error("XCLAIM", e))?;
        debug!(receipt = %receipt, receive_count = count, "delivery failed, released for redelivery");
        Ok(())
    }

    #[instrument(skip(self, message, reason), fields(dlq_key = %self.dlq_key, unit_id = %message.unit_id), err)]
    fn dead_letter(&self, message: DispatchMessage, reason: &str) -> Result<DeadLetterRecord, ChannelError> {
        let record = DeadLetterRecord::new(message, reason, 1, Utc::now());
        let mut conn = connect(&self.client)?;
        self.push_dead_letter(&mut conn, &record)?;
        Ok(record)
    }

    #[instrument(skip(self), fields(dlq_key = %self.dlq_key), err)]
    fn drain_dead_letters(&self, max: usize) -> Result<Vec<DeadLetterRecord>, ChannelError> {
        let mut conn = connect(&self.client)?;
        let raw: redis::Value = redis::cmd("XRANGE")
            .arg(&self.dlq_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(max)
            .query(&mut conn)
            .map_err(|e| command_error("DLQ XRANGE", e))?;

        let mut records = Vec::new();
        for entry in parse_entries(&raw)? {
            let record: DeadLetterRecord = serde_json::from_str(entry.field("record")?)
                .map_err(|e| ChannelError::Serialization(e.to_string()))?;
            let _: u64 = redis::cmd("XDEL")
                .arg(&self.dlq_key)
                .arg(&entry.id)
                .query(&mut conn)
                .map_err(|e| command_error("DLQ XDEL", e))?;
            records.push(record);
        }
        Ok(records)
    }

    #[instrument(skip(self, records), fields(dlq_key = %self.dlq_key, count = records.len()), err)]
    fn restore_dead_letters(&self, records: Vec<DeadLetterRecord>) -> Result<(), ChannelError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = connect(&self.client)?;
        // Appended at the tail; consumers must not rely on dead-letter order.
        for record in &records {
            self.push_dead_letter(&mut conn, record)?;
        }
        Ok(())
    }

    fn depth(&self) -> Result<QueueDepth, ChannelError> {
        let mut conn = connect(&self.client)?;
        let len: usize = redis::cmd("XLEN")
            .arg(&self.stream_key)
            .query(&mut conn)
            .map_err(|e| command_error("XLEN", e))?;
        let dead_letters: usize = redis::cmd("XLEN")
            .arg(&self.dlq_key)
            .query(&mut conn)
            .map_err(|e| command_error("XLEN", e))?;

        // Summary form: [count, min-id, max-id, consumers]
        let summary: redis::Value = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .query(&mut conn)
            .map_err(|e| command_error("XPENDING", e))?;
        let in_flight = match summary {
            redis::Value::Bulk(parts) => match parts.first() {
                Some(redis::Value::Int(n)) => *n as usize,
                _ => 0,
            },
            _ => 0,
        };

        Ok(QueueDepth {
            visible: len.saturating_sub(in_flight),
            in_flight,
            dead_letters,
        })
    }
}
