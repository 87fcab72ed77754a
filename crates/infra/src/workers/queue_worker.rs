use std::sync::Arc;

use tracing::{error, warn};

use cubeflow_channels::{ChannelError, DispatchQueue};

use crate::activity_store::ActivityStore;
use crate::collaborators::RasterCompute;
use crate::engine::{CompletionNotifier, ContinuationHandler, UnitOutcome};

use super::{TickReport, WorkerConfig, WorkerHandle, spawn_worker};

/// Consumes the dispatch queue.
///
/// Completed and skipped outcomes are acknowledged. Failed outcomes are
/// reported with `fail`, which dead-letters them under the fail-fast policy.
/// On a handler error the delivery is left alone and its lease runs out.
pub struct QueueWorker<S, R, N, Q> {
    handler: Arc<ContinuationHandler<S, R, N>>,
    queue: Q,
    batch_size: usize,
}

impl<S, R, N, Q> QueueWorker<S, R, N, Q>
where
    S: ActivityStore + Clone + 'static,
    R: RasterCompute + 'static,
    N: CompletionNotifier + 'static,
    Q: DispatchQueue + 'static,
{
    pub fn new(handler: Arc<ContinuationHandler<S, R, N>>, queue: Q, batch_size: usize) -> Self {
        Self {
            handler,
            queue,
            batch_size: batch_size.max(1),
        }
    }

    pub fn run_once(&self) -> Result<TickReport, ChannelError> {
        let deliveries = self.queue.receive(self.batch_size)?;
        let mut report = TickReport {
            received: deliveries.len(),
            ..TickReport::default()
        };

        for delivery in deliveries {
            let settle = match self.handler.handle(&delivery.message) {
                Ok(UnitOutcome::Failed { error, .. }) => {
                    report.dead_lettered += 1;
                    self.queue.fail(&delivery.receipt, &error)
                }
                Ok(_) => {
                    report.settled += 1;
                    self.queue.ack(&delivery.receipt)
                }
                Err(e) => {
                    error!(
                        unit_id = %delivery.message.unit_id,
                        receive_count = delivery.receive_count,
                        error = %e,
                        "handler error, leaving delivery to expire"
                    );
                    report.errors += 1;
                    continue;
                }
            };

            if let Err(e) = settle {
                // Lease already expired; the queue has redriven or dead-lettered it.
                warn!(unit_id = %delivery.message.unit_id, receipt = %delivery.receipt, error = %e, "could not settle delivery");
            }
        }

        Ok(report)
    }

    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerHandle> {
        spawn_worker(config, move || self.run_once())
    }
}
