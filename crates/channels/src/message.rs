//! Wire types carried by the channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cubeflow_core::{DeadLetterId, JobId, PeriodId, TileId, UnitId, WorkUnit};

/// Request to process one work unit.
///
/// Serialized as `{jobId, unitId, tileId, periodId, attempt}`. `attempt` is the
/// dispatch generation: `1` for the initial emission, incremented by every
/// redrive. It is informational; the handler keys off the stored unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    pub job_id: JobId,
    pub unit_id: UnitId,
    pub tile_id: TileId,
    pub period_id: PeriodId,
    pub attempt: u32,
}

impl DispatchMessage {
    pub fn for_unit(unit: &WorkUnit, attempt: u32) -> Self {
        Self {
            job_id: unit.job_id,
            unit_id: unit.id,
            tile_id: unit.tile_id.clone(),
            period_id: unit.period_id.clone(),
            attempt,
        }
    }

    pub fn to_json(&self) -> Result<String, crate::ChannelError> {
        serde_json::to_string(self).map_err(|e| crate::ChannelError::Serialization(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, crate::ChannelError> {
        serde_json::from_str(raw).map_err(|e| crate::ChannelError::Serialization(e.to_string()))
    }
}

/// A message that exhausted its delivery budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub id: DeadLetterId,
    pub original_message: DispatchMessage,
    pub failure_reason: String,
    pub timestamp: DateTime<Utc>,
    /// Deliveries consumed before dead-lettering.
    #[serde(default)]
    pub receive_count: u32,
}

impl DeadLetterRecord {
    pub fn new(
        original_message: DispatchMessage,
        failure_reason: impl Into<String>,
        receive_count: u32,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeadLetterId::for_attempt(original_message.unit_id, original_message.attempt),
            original_message,
            failure_reason: failure_reason.into(),
            timestamp,
            receive_count,
        }
    }
}

/// Opaque token identifying one leased delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message leased from a [`crate::DispatchQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: ReceiptHandle,
    pub message: DispatchMessage,
    /// How many times this message has been handed out, including this one.
    pub receive_count: u32,
}

/// Position of a record in a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamPosition {
    pub partition: u32,
    pub sequence: u64,
}

/// A record read from a [`crate::FanoutStream`] partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRecord {
    pub position: StreamPosition,
    pub message: DispatchMessage,
    pub published_at: DateTime<Utc>,
}
