use std::sync::Arc;

use tracing::{error, warn};

use cubeflow_channels::{ChannelError, DispatchMessage, DispatchQueue, FanoutStream};

use crate::activity_store::ActivityStore;
use crate::collaborators::RasterCompute;
use crate::engine::{CompletionNotifier, ContinuationHandler, UnitOutcome};

use super::{TickReport, WorkerConfig, WorkerHandle, spawn_worker};

/// Consumes every partition of a fan-out stream in bounded batches.
///
/// Failed units are routed to the dispatch queue's dead-letter path, and so
/// are records whose handler returned an error: the inspector then fails the
/// unit, the same as an expired lease on the queue path. The partition
/// checkpoint advances past every record that was settled or dead-lettered.
/// If the dead-letter path itself is down, the checkpoint stops before that
/// record and the rest of the batch is read again on the next pass.
pub struct StreamWorker<S, R, N, F, Q> {
    handler: Arc<ContinuationHandler<S, R, N>>,
    stream: F,
    dead_letters: Q,
}

impl<S, R, N, F, Q> StreamWorker<S, R, N, F, Q>
where
    S: ActivityStore + Clone + 'static,
    R: RasterCompute + 'static,
    N: CompletionNotifier + 'static,
    F: FanoutStream + 'static,
    Q: DispatchQueue + 'static,
{
    pub fn new(handler: Arc<ContinuationHandler<S, R, N>>, stream: F, dead_letters: Q) -> Self {
        Self {
            handler,
            stream,
            dead_letters,
        }
    }

    pub fn run_once(&self) -> Result<TickReport, ChannelError> {
        let mut report = TickReport::default();
        for partition in 0..self.stream.partitions() {
            report.merge(self.run_partition(partition)?);
        }
        Ok(report)
    }

    fn run_partition(&self, partition: u32) -> Result<TickReport, ChannelError> {
        let records = self.stream.read_batch(partition, self.stream.max_batch_size())?;
        let mut report = TickReport {
            received: records.len(),
            ..TickReport::default()
        };
        if records.is_empty() {
            return Ok(report);
        }

        let messages: Vec<DispatchMessage> = records.iter().map(|r| r.message.clone()).collect();
        let batch = self.handler.handle_batch(&messages);

        let mut committed = None;
        let mut halted = None;
        for (record, outcome) in records.iter().zip(batch.outcomes) {
            let reason = match outcome {
                Ok(UnitOutcome::Failed { error, .. }) => error,
                Ok(_) => {
                    report.settled += 1;
                    committed = Some(record.position.sequence);
                    continue;
                }
                Err(e) => {
                    error!(
                        partition,
                        sequence = record.position.sequence,
                        unit_id = %record.message.unit_id,
                        error = %e,
                        "handler error, dead-lettering record"
                    );
                    report.errors += 1;
                    format!("handler error: {e}")
                }
            };
            if let Err(e) = self.dead_letters.dead_letter(record.message.clone(), &reason) {
                error!(partition, sequence = record.position.sequence, error = %e, "dead-letter path unavailable, partition stops at this record");
                halted = Some(e);
                break;
            }
            report.dead_lettered += 1;
            committed = Some(record.position.sequence);
        }

        if let Some(sequence) = committed {
            self.stream.checkpoint(partition, sequence)?;
        } else {
            warn!(partition, "no progress on partition");
        }
        match halted {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerHandle> {
        spawn_worker(config, move || self.run_once())
    }
}
