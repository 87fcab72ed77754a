use std::{convert::Infallible, sync::{Arc, Mutex}, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use cubeflow_channels::{
    DispatchQueue, Dispatcher, FanoutStream, InMemoryDispatchQueue, InMemoryFanoutStream, QueueDispatcher,
    StreamDispatcher,
};
use cubeflow_infra::{
    activity_store::{ActivityStore, InMemoryActivityStore},
    collaborators::{CatalogStore, InMemoryCatalog, RasterCompute, StaticRasterCompute},
    config::{ChannelKind, EngineConfig},
    engine::{CompletionNotifier, ContinuationHandler, DeadLetterInspector, JobNotification, JobSubmitter},
    workers::{DeadLetterWorker, QueueWorker, StreamWorker, WorkerConfig, WorkerHandle},
};

#[cfg(feature = "redis")]
use anyhow::Context;
#[cfg(feature = "redis")]
use cubeflow_infra::{
    activity_store::PostgresActivityStore,
    channels::{RedisDispatchQueue, RedisFanoutStream},
};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// Collections the built-in catalog accepts.
pub const CATALOG_COLLECTIONS: &[&str] = &["S2_L2A", "S2_MSI", "LANDSAT_OLI", "CBERS4_WFI"];

pub type Store = Arc<dyn ActivityStore>;
pub type Compute = Arc<dyn RasterCompute>;
pub type Catalog = Arc<dyn CatalogStore>;
pub type Queue = Arc<dyn DispatchQueue>;
pub type Stream = Arc<dyn FanoutStream>;
pub type Notifier = Arc<BroadcastNotifier>;

pub type Handler = ContinuationHandler<Store, Compute, Notifier>;
pub type Submitter = JobSubmitter<Store, Catalog, Arc<dyn Dispatcher>, Notifier>;
pub type Inspector = DeadLetterInspector<Store, Queue, Notifier>;

/// Forwards job notifications to SSE subscribers.
///
/// Lossy: with no subscriber, or a lagging one, notifications are dropped.
#[derive(Debug)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<JobNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.tx.subscribe()
    }
}

impl CompletionNotifier for BroadcastNotifier {
    fn notify(&self, notification: &JobNotification) {
        let _ = self.tx.send(notification.clone());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    InMemory,
    Persistent,
}

pub struct AppServices {
    pub config: EngineConfig,
    pub backend: Backend,
    pub store: Store,
    pub queue: Queue,
    pub handler: Arc<Handler>,
    pub submitter: Arc<Submitter>,
    pub inspector: Arc<Inspector>,
    notifier: Notifier,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl AppServices {
    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.notifier.subscribe()
    }

    pub fn worker_names(&self) -> Vec<String> {
        self.workers
            .lock()
            .map(|w| w.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    /// Stop every background worker, waiting for in-flight passes.
    pub fn shutdown_workers(&self) {
        let handles = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            let name = handle.name().to_string();
            handle.shutdown();
            tracing::info!(worker = %name, "worker shut down");
        }
    }
}

/// Build the engine per `config`: in-memory by default, Postgres + Redis with
/// `USE_PERSISTENT_STORES=true`.
pub async fn build_services(config: EngineConfig) -> anyhow::Result<AppServices> {
    config.validate()?;

    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_services(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            anyhow::bail!("USE_PERSISTENT_STORES=true requires the `redis` feature");
        }
    }

    build_in_memory_services(config)
}

fn build_in_memory_services(config: EngineConfig) -> anyhow::Result<AppServices> {
    let store: Store = InMemoryActivityStore::arc();
    let queue: Queue = Arc::new(InMemoryDispatchQueue::new(config.redrive_policy()));
    let stream: Stream = Arc::new(InMemoryFanoutStream::new(config.stream_config())?);

    assemble(config, Backend::InMemory, store, queue, stream)
}

#[cfg(feature = "redis")]
async fn build_persistent_services(config: EngineConfig) -> anyhow::Result<AppServices> {
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;

    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresActivityStore::new(pool)?;
    store.ensure_schema().await?;

    let queue = RedisDispatchQueue::new(&config.redis_url, config.redrive_policy())?;
    let stream = RedisFanoutStream::new(&config.redis_url, config.stream_config())?;

    // Redis calls are blocking; keep them off the async workers.
    let queue = tokio::task::spawn_blocking(move || queue.ensure_consumer_group().map(|()| queue))
        .await?
        .context("failed to create dispatch consumer group")?;

    assemble(config, Backend::Persistent, Arc::new(store), Arc::new(queue), Arc::new(stream))
}

fn assemble(config: EngineConfig, backend: Backend, store: Store, queue: Queue, stream: Stream) -> anyhow::Result<AppServices> {
    let notifier: Notifier = Arc::new(BroadcastNotifier::new(256));
    // No raster backend is bundled; the static compute stands in for it.
    let static_compute = StaticRasterCompute::default();
    for tile in &config.failing_tiles {
        static_compute.fail_tile(tile.clone());
    }
    let compute: Compute = Arc::new(static_compute);
    let catalog: Catalog = Arc::new(InMemoryCatalog::new(CATALOG_COLLECTIONS.iter().copied()));

    let dispatcher: Arc<dyn Dispatcher> = match config.channel {
        ChannelKind::Queue => Arc::new(QueueDispatcher::new(queue.clone())),
        ChannelKind::Stream => Arc::new(StreamDispatcher::new(stream.clone())),
    };

    let handler = Arc::new(ContinuationHandler::new(store.clone(), compute, notifier.clone()));
    let submitter = Arc::new(JobSubmitter::new(store.clone(), catalog, dispatcher, notifier.clone()));
    let inspector = Arc::new(
        DeadLetterInspector::new(store.clone(), queue.clone(), notifier.clone())
            .with_auto_redrive_limit(config.auto_redrive_limit),
    );

    let worker_config = |name: &str, batch: usize| {
        WorkerConfig::default()
            .with_name(name)
            .with_poll_interval(config.poll_interval)
            .with_batch_size(batch)
    };

    let mut workers = Vec::new();
    match config.channel {
        ChannelKind::Queue => {
            let batch = config.fanout_batch_size;
            workers.push(
                QueueWorker::new(handler.clone(), queue.clone(), batch).spawn(worker_config("cubeflow-queue", batch))?,
            );
        }
        ChannelKind::Stream => {
            workers.push(
                StreamWorker::new(handler.clone(), stream, queue.clone())
                    .spawn(worker_config("cubeflow-stream", config.fanout_batch_size))?,
            );
        }
    }
    workers.push(
        DeadLetterWorker::new(inspector.clone(), config.dead_letter_batch)
            .spawn(worker_config("cubeflow-dead-letters", config.dead_letter_batch))?,
    );

    tracing::info!(
        backend = ?backend,
        channel = ?config.channel,
        max_receive_count = config.max_receive_count,
        workers = workers.len(),
        "engine services ready"
    );

    Ok(AppServices {
        config,
        backend,
        store,
        queue,
        handler,
        submitter,
        inspector,
        notifier,
        workers: Mutex::new(workers),
    })
}

/// SSE stream of job notifications, optionally for a single job.
pub fn notification_sse_stream(
    services: Arc<AppServices>,
    job_filter: Option<cubeflow_core::JobId>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(n) if job_filter.is_none_or(|id| id == n.job_id) => {
            let data = serde_json::to_string(&n).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event("job.finalized").data(data)))
        }
        _ => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
