//! Redis Streams fan-out channel.
//!
//! - **Partition streams**: `{prefix}:{partition}`; entry ids are `0-{sequence + 1}`
//!   so the stream id encodes the partition sequence
//! - **Sequence counter**: `{prefix}:{partition}:seq` (records published)
//! - **Checkpoint**: `{prefix}:{partition}:checkpoint` (next sequence to read)
//!
//! Publishing and checkpointing are Lua scripts so the counter and stream (or
//! the monotonic checkpoint) change atomically.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use cubeflow_channels::{
    ChannelError, DispatchMessage, FanoutStream, StreamConfig, StreamPosition, StreamRecord, partition_for,
};

use super::entry::{Entry, command_error, connect, parse_entries};

const DEFAULT_PREFIX: &str = "cubeflow:fanout";

const PUBLISH_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[2]) - 1
redis.call('XADD', KEYS[1], '0-' .. (seq + 1), 'payload', ARGV[1], 'published_at', ARGV[2])
return seq
"#;

const CHECKPOINT_SCRIPT: &str = r#"
local published = tonumber(redis.call('GET', KEYS[2]) or '0')
local next = tonumber(ARGV[1]) + 1
if next > published then
  return -1
end
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if next > current then
  redis.call('SET', KEYS[1], next)
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisFanoutStream {
    client: Arc<redis::Client>,
    prefix: String,
    config: StreamConfig,
}

impl RedisFanoutStream {
    pub fn new(redis_url: impl AsRef<str>, config: StreamConfig) -> Result<Self, ChannelError> {
        config.validate()?;
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| ChannelError::Transport(format!("redis client: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: DEFAULT_PREFIX.to_string(),
            config,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn check_partition(&self, partition: u32) -> Result<(), ChannelError> {
        if partition >= self.config.partitions {
            return Err(ChannelError::PartitionOutOfRange {
                partition,
                partitions: self.config.partitions,
            });
        }
        Ok(())
    }

    fn stream_key(&self, partition: u32) -> String {
        format!("{}:{partition}", self.prefix)
    }

    fn seq_key(&self, partition: u32) -> String {
        format!("{}:{partition}:seq", self.prefix)
    }

    fn checkpoint_key(&self, partition: u32) -> String {
        format!("{}:{partition}:checkpoint", self.prefix)
    }

    fn counter(&self, conn: &mut redis::Connection, key: &str) -> Result<u64, ChannelError> {
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query(conn)
            .map_err(|e| command_error("GET", e))?;
        Ok(value.unwrap_or(0))
    }

    fn record_of(partition: u32, entry: &Entry) -> Result<StreamRecord, ChannelError> {
        let sequence = entry
            .id
            .split_once('-')
            .and_then(|(_, seq)| seq.parse::<u64>().ok())
            .and_then(|seq| seq.checked_sub(1))
            .ok_or_else(|| ChannelError::Serialization(format!("unexpected stream id {}", entry.id)))?;
        let published_at = DateTime::parse_from_rfc3339(entry.field("published_at")?)
            .map_err(|e| ChannelError::Serialization(e.to_string()))?
            .with_timezone(&Utc);

        Ok(StreamRecord {
            position: StreamPosition { partition, sequence },
            message: DispatchMessage::from_json(entry.field("payload")?)?,
            published_at,
        })
    }
}

impl FanoutStream for RedisFanoutStream {
    fn partitions(&self) -> u32 {
        self.config.partitions
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    #[instrument(skip(self, message), fields(unit_id = %message.unit_id), err)]
    fn publish(&self, partition_key: &str, message: DispatchMessage) -> Result<StreamPosition, ChannelError> {
        let partition = partition_for(partition_key, self.config.partitions);
        let payload = message.to_json()?;
        let mut conn = connect(&self.client)?;

        let sequence: u64 = redis::cmd("EVAL")
            .arg(PUBLISH_SCRIPT)
            .arg(2)
            .arg(self.stream_key(partition))
            .arg(self.seq_key(partition))
            .arg(&payload)
            .arg(Utc::now().to_rfc3339())
            .query(&mut conn)
            .map_err(|e| command_error("publish script", e))?;

        Ok(StreamPosition { partition, sequence })
    }

    #[instrument(skip(self), err)]
    fn read_batch(&self, partition: u32, max: usize) -> Result<Vec<StreamRecord>, ChannelError> {
        self.check_partition(partition)?;
        let limit = max.min(self.config.max_batch_size);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = connect(&self.client)?;
        let next = self.counter(&mut conn, &self.checkpoint_key(partition))?;

        let raw: redis::Value = redis::cmd("XRANGE")
            .arg(self.stream_key(partition))
            .arg(format!("0-{}", next + 1))
            .arg("+")
            .arg("COUNT")
            .arg(limit)
            .query(&mut conn)
            .map_err(|e| command_error("XRANGE", e))?;

        parse_entries(&raw)?
            .iter()
            .map(|entry| Self::record_of(partition, entry))
            .collect()
    }

    #[instrument(skip(self), err)]
    fn checkpoint(&self, partition: u32, sequence: u64) -> Result<(), ChannelError> {
        self.check_partition(partition)?;
        let mut conn = connect(&self.client)?;
        let status: i64 = redis::cmd("EVAL")
            .arg(CHECKPOINT_SCRIPT)
            .arg(2)
            .arg(self.checkpoint_key(partition))
            .arg(self.seq_key(partition))
            .arg(sequence)
            .query(&mut conn)
            .map_err(|e| command_error("checkpoint script", e))?;

        if status < 0 {
            return Err(ChannelError::InvalidCheckpoint(format!(
                "sequence {sequence} not yet published on partition {partition}"
            )));
        }
        Ok(())
    }

    fn lag(&self, partition: u32) -> Result<u64, ChannelError> {
        self.check_partition(partition)?;
        let mut conn = connect(&self.client)?;
        let published = self.counter(&mut conn, &self.seq_key(partition))?;
        let committed = self.counter(&mut conn, &self.checkpoint_key(partition))?;
        Ok(published.saturating_sub(committed))
    }
}
