//! In-memory fan-out stream for tests/dev.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::error::ChannelError;
use crate::message::{DispatchMessage, StreamPosition, StreamRecord};
use crate::stream::{FanoutStream, StreamConfig, partition_for};

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<StreamRecord>,
    /// Sequence of the next record to hand out after a checkpoint.
    committed: u64,
}

#[derive(Debug)]
pub struct InMemoryFanoutStream {
    config: StreamConfig,
    clock: Arc<dyn Clock>,
    partitions: Vec<Mutex<PartitionLog>>,
}

impl InMemoryFanoutStream {
    pub fn new(config: StreamConfig) -> Result<Self, ChannelError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StreamConfig, clock: Arc<dyn Clock>) -> Result<Self, ChannelError> {
        config.validate()?;
        let partitions = (0..config.partitions)
            .map(|_| Mutex::new(PartitionLog::default()))
            .collect();
        Ok(Self {
            config,
            clock,
            partitions,
        })
    }

    fn partition(&self, partition: u32) -> Result<MutexGuard<'_, PartitionLog>, ChannelError> {
        self.partitions
            .get(partition as usize)
            .ok_or(ChannelError::PartitionOutOfRange {
                partition,
                partitions: self.config.partitions,
            })?
            .lock()
            .map_err(|_| ChannelError::Poisoned)
    }
}

impl FanoutStream for InMemoryFanoutStream {
    fn partitions(&self) -> u32 {
        self.config.partitions
    }

    fn max_batch_size(&self) -> usize {
        self.config.max_batch_size
    }

    fn publish(&self, partition_key: &str, message: DispatchMessage) -> Result<StreamPosition, ChannelError> {
        let partition = partition_for(partition_key, self.config.partitions);
        let mut log = self.partition(partition)?;
        let position = StreamPosition {
            partition,
            sequence: log.records.len() as u64,
        };
        log.records.push(StreamRecord {
            position,
            message,
            published_at: self.clock.now(),
        });
        Ok(position)
    }

    fn read_batch(&self, partition: u32, max: usize) -> Result<Vec<StreamRecord>, ChannelError> {
        let limit = max.min(self.config.max_batch_size);
        let log = self.partition(partition)?;
        let batch: Vec<StreamRecord> = log
            .records
            .iter()
            .skip(log.committed as usize)
            .take(limit)
            .cloned()
            .collect();
        Ok(batch)
    }

    fn checkpoint(&self, partition: u32, sequence: u64) -> Result<(), ChannelError> {
        let mut log = self.partition(partition)?;
        if sequence >= log.records.len() as u64 {
            return Err(ChannelError::InvalidCheckpoint(format!(
                "sequence {sequence} not yet published on partition {partition}"
            )));
        }
        log.committed = log.committed.max(sequence + 1);
        Ok(())
    }

    fn lag(&self, partition: u32) -> Result<u64, ChannelError> {
        let log = self.partition(partition)?;
        Ok(log.records.len() as u64 - log.committed)
    }
}
