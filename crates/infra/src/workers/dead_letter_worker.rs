use std::sync::Arc;

use cubeflow_channels::DispatchQueue;

use crate::activity_store::ActivityStore;
use crate::engine::{CompletionNotifier, DeadLetterInspector, InspectorError};

use super::{TickReport, WorkerConfig, WorkerHandle, spawn_worker};

/// Periodically drains the dead-letter path through the inspector.
pub struct DeadLetterWorker<S, Q, N> {
    inspector: Arc<DeadLetterInspector<S, Q, N>>,
    batch_size: usize,
}

impl<S, Q, N> DeadLetterWorker<S, Q, N>
where
    S: ActivityStore + Clone + 'static,
    Q: DispatchQueue + 'static,
    N: CompletionNotifier + 'static,
{
    pub fn new(inspector: Arc<DeadLetterInspector<S, Q, N>>, batch_size: usize) -> Self {
        Self {
            inspector,
            batch_size: batch_size.max(1),
        }
    }

    pub fn run_once(&self) -> Result<TickReport, InspectorError> {
        let inspected = self.inspector.drain(self.batch_size)?;
        Ok(TickReport {
            received: inspected.len(),
            settled: inspected.len(),
            ..TickReport::default()
        })
    }

    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerHandle> {
        spawn_worker(config, move || self.run_once())
    }
}
