//! Long-running pollers around the stateless engine components.
//!
//! - [`QueueWorker`]: dispatch queue → continuation handler → ack / fail
//! - [`StreamWorker`]: fan-out partitions → batch handler → checkpoint
//! - [`DeadLetterWorker`]: dead-letter path → inspector
//!
//! Every worker exposes `run_once` for a single synchronous pass, and `spawn`
//! to run that pass on a background thread until shut down.

pub mod dead_letter_worker;
pub mod queue_worker;
pub mod stream_worker;

use std::fmt::Display;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

pub use dead_letter_worker::DeadLetterWorker;
pub use queue_worker::QueueWorker;
pub use stream_worker::StreamWorker;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name, also used in logs.
    pub name: String,
    /// Wait between passes that found nothing to do.
    pub poll_interval: Duration,
    /// Messages requested per pass.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "cubeflow-worker".to_string(),
            poll_interval: Duration::from_millis(100),
            batch_size: 10,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Result of one worker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Messages taken off the channel.
    pub received: usize,
    /// Messages settled (acknowledged, checkpointed or inspected).
    pub settled: usize,
    /// Messages routed to the dead-letter path.
    pub dead_lettered: usize,
    /// Messages left for redelivery after an infrastructure error.
    pub errors: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.received == 0
    }

    fn merge(&mut self, other: TickReport) {
        self.received += other.received;
        self.settled += other.settled;
        self.dead_lettered += other.dead_lettered;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub ticks: u64,
    pub received: u64,
    pub settled: u64,
    pub dead_lettered: u64,
    pub errors: u64,
    pub failed_ticks: u64,
    pub uptime_secs: u64,
}

/// Handle to a background worker thread.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Request shutdown and wait for the current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Run `tick` on a named thread until the returned handle is shut down.
///
/// After an idle or failed pass the loop waits `poll_interval` (or until
/// shutdown); after a productive pass it goes again immediately.
pub fn spawn_worker<F, E>(config: WorkerConfig, mut tick: F) -> std::io::Result<WorkerHandle>
where
    F: FnMut() -> Result<TickReport, E> + Send + 'static,
    E: Display,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
    let stats = Arc::new(Mutex::new(WorkerStats::default()));
    let loop_stats = stats.clone();
    let name = config.name.clone();

    let join = thread::Builder::new().name(name.clone()).spawn(move || {
        info!(worker = %config.name, "worker started");
        let started = Instant::now();

        loop {
            let result = tick();
            let wait = {
                let mut s = loop_stats.lock().unwrap_or_else(|p| p.into_inner());
                s.ticks += 1;
                s.uptime_secs = started.elapsed().as_secs();
                match &result {
                    Ok(report) => {
                        s.received += report.received as u64;
                        s.settled += report.settled as u64;
                        s.dead_lettered += report.dead_lettered as u64;
                        s.errors += report.errors as u64;
                        report.is_idle()
                    }
                    Err(_) => {
                        s.failed_ticks += 1;
                        true
                    }
                }
            };

            match result {
                Ok(report) if !report.is_idle() => {
                    debug!(worker = %config.name, received = report.received, settled = report.settled, "worker pass");
                }
                Ok(_) => {}
                Err(e) => error!(worker = %config.name, error = %e, "worker pass failed"),
            }

            let timeout = if wait { config.poll_interval } else { Duration::ZERO };
            match shutdown_rx.recv_timeout(timeout) {
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                _ => break,
            }
        }

        info!(worker = %config.name, "worker stopped");
    })?;

    Ok(WorkerHandle {
        name,
        shutdown: shutdown_tx,
        join: Some(join),
        stats,
    })
}
