//! Pipeline startup, recovery and ordered shutdown.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use catalogsync_shared::{AppConfig, CatalogError, EnrichedDocument, IngestRecord, Result};
use catalogsync_sink::{
    BreakerState, CircuitBreaker, CircuitBreakingSink, IndexTransport, RetryPolicy, SinkRequest,
    SolrClient,
};
use catalogsync_storage::Storage;
use catalogsync_transform::Transformer;

use crate::batching::{BatchingQueue, QueueOptions};
use crate::fetcher::Fetcher;
use crate::indexing::{IndexFlush, StoreFlush, acknowledge_replays};
use crate::submit::{self, SubmitOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time view of the running pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub state: PipelineState,
    pub index_backlog: usize,
    pub ingest_backlog: usize,
    /// Requests waiting in the sink's retry queue.
    pub parked: usize,
    pub breaker: BreakerState,
    pub indexed_items: u64,
    pub ingested_items: u64,
}

type IndexQueue<T> = BatchingQueue<EnrichedDocument, IndexFlush<T>>;
type IngestQueue = BatchingQueue<IngestRecord, StoreFlush>;

/// Loops built by [`Pipeline::new`] and spawned by [`Pipeline::start`].
struct Idle<T: IndexTransport> {
    fetcher: Arc<Fetcher<IndexFlush<T>>>,
    replay_rx: mpsc::UnboundedReceiver<SinkRequest>,
}

struct Tasks {
    fetcher: JoinHandle<()>,
    retry_worker: JoinHandle<Result<()>>,
    acknowledger: JoinHandle<()>,
}

/// The ingestion and indexing pipeline.
///
/// Owns both queues, the circuit-breaking sink and the background loops.
/// Built with [`Pipeline::new`] (or [`Pipeline::launch`]), started with
/// [`Pipeline::start`] and stopped with [`Pipeline::shutdown`].
pub struct Pipeline<T: IndexTransport = SolrClient> {
    state: Mutex<PipelineState>,
    /// Serializes `start` and `shutdown`.
    transition: tokio::sync::Mutex<()>,
    storage: Arc<Storage>,
    sink: Arc<CircuitBreakingSink<T>>,
    index_queue: Arc<IndexQueue<T>>,
    ingest_queue: Arc<IngestQueue>,
    idle: Mutex<Option<Idle<T>>>,
    tasks: Mutex<Option<Tasks>>,
    fetch_cancel: CancellationToken,
    sink_cancel: CancellationToken,
    ack_cancel: CancellationToken,
    grace_period: Duration,
}

impl Pipeline<SolrClient> {
    /// Open the configured store and start a pipeline publishing to Solr.
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let db_path = config.store.resolve_path()?;
        let storage = Arc::new(Storage::open(&db_path).await?);
        let transport = SolrClient::new(&config.solr)?;
        let transformer =
            Transformer::from_config(&config.transform, config.concurrency.transform_permits())?;
        Self::launch(config, storage, transport, transformer).await
    }
}

impl<T: IndexTransport> Pipeline<T> {
    /// Validate `config` and wire the queues, the sink and the fetcher. The
    /// pipeline is `Stopped` until [`Pipeline::start`].
    pub fn new(
        config: &AppConfig,
        storage: Arc<Storage>,
        transport: T,
        transformer: Transformer,
    ) -> Result<Self> {
        config.validate()?;

        let sink_cancel = CancellationToken::new();
        let (replay_tx, replay_rx) = mpsc::unbounded_channel();
        let sink = Arc::new(
            CircuitBreakingSink::new(
                transport,
                CircuitBreaker::from_config(&config.breaker),
                RetryPolicy::from(&config.retry),
                sink_cancel.clone(),
            )
            .with_replay_notifier(replay_tx),
        );

        let flush_permits = config.concurrency.flush_permits();
        let index_queue = Arc::new(BatchingQueue::start(
            "index",
            QueueOptions::from_config(&config.index_queue, flush_permits),
            IndexFlush::new(
                Arc::clone(&sink),
                Arc::clone(&storage),
                config.solr.cores.clone(),
                config.solr.chunk_size,
            ),
        ));
        let ingest_queue = Arc::new(BatchingQueue::start(
            "ingest",
            QueueOptions::from_config(&config.ingest_queue, flush_permits),
            StoreFlush::new(Arc::clone(&storage)),
        ));

        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&storage),
            transformer,
            Arc::clone(&index_queue),
            &config.fetcher,
        ));

        Ok(Self {
            state: Mutex::new(PipelineState::Stopped),
            transition: tokio::sync::Mutex::new(()),
            storage,
            sink,
            index_queue,
            ingest_queue,
            idle: Mutex::new(Some(Idle { fetcher, replay_rx })),
            tasks: Mutex::new(None),
            fetch_cancel: CancellationToken::new(),
            sink_cancel,
            ack_cancel: CancellationToken::new(),
            grace_period: config.shutdown.grace_period(),
        })
    }

    /// [`Pipeline::new`] followed by [`Pipeline::start`].
    pub async fn launch(
        config: &AppConfig,
        storage: Arc<Storage>,
        transport: T,
        transformer: Transformer,
    ) -> Result<Self> {
        let pipeline = Self::new(config, storage, transport, transformer)?;
        pipeline.start().await?;
        Ok(pipeline)
    }

    /// Recover in-flight documents, then start the sink's retry worker, the
    /// replay acknowledger and finally the fetcher.
    ///
    /// The pipeline is `Starting` during recovery. A failed recovery returns
    /// it to `Stopped` so `start` can be retried. A pipeline starts at most
    /// once.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        let state = self.state();
        let idle = if state == PipelineState::Stopped {
            lock(&self.idle).take()
        } else {
            None
        };
        let Some(Idle { fetcher, replay_rx }) = idle else {
            return Err(CatalogError::config(format!(
                "pipeline cannot start: already started or shut down ({state:?})"
            )));
        };
        self.set_state(PipelineState::Starting);
        info!("pipeline starting");

        let recovered = match self.storage.reset_queued_to_new().await {
            Ok(recovered) => recovered,
            Err(e) => {
                *lock(&self.idle) = Some(Idle { fetcher, replay_rx });
                self.set_state(PipelineState::Stopped);
                return Err(e);
            }
        };
        info!(recovered, "startup recovery complete");

        let retry_worker = tokio::spawn(Arc::clone(&self.sink).run_retry_worker());
        let acknowledger = tokio::spawn(acknowledge_replays(
            Arc::clone(&self.storage),
            replay_rx,
            self.ack_cancel.clone(),
        ));
        let fetcher = tokio::spawn(fetcher.run(self.fetch_cancel.clone()));

        *lock(&self.tasks) = Some(Tasks {
            fetcher,
            retry_worker,
            acknowledger,
        });
        self.set_state(PipelineState::Running);
        info!("pipeline running");
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        *lock(&self.state)
    }

    fn set_state(&self, state: PipelineState) {
        *lock(&self.state) = state;
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Validate a record and queue it for storage as `NEW`.
    pub async fn submit(&self, record: IngestRecord) -> Result<SubmitOutcome> {
        submit::submit(&self.ingest_queue, record).await
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            state: self.state(),
            index_backlog: self.index_queue.len(),
            ingest_backlog: self.ingest_queue.len(),
            parked: self.sink.pending(),
            breaker: self.sink.breaker().state(),
            indexed_items: self.index_queue.flushed_items(),
            ingested_items: self.ingest_queue.flushed_items(),
        }
    }

    /// Stop the fetcher, flush the ingest queue, flush the index queue, then
    /// stop the sink's retry worker and the replay acknowledger.
    ///
    /// Each step waits for completion; past the grace period a warning is
    /// logged and the wait continues. Only the first call does any work.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        let _transition = self.transition.lock().await;
        let tasks = {
            let state = self.state();
            // A never-started pipeline still owns idle loops and running queues.
            let never_started = lock(&self.idle).take().is_some();
            if !never_started
                && matches!(state, PipelineState::Stopping | PipelineState::Stopped)
            {
                return;
            }
            self.set_state(PipelineState::Stopping);
            lock(&self.tasks).take()
        };
        info!("pipeline stopping");

        self.fetch_cancel.cancel();
        let (retry_worker, acknowledger) = match tasks {
            Some(Tasks {
                fetcher,
                retry_worker,
                acknowledger,
            }) => {
                log_join("fetcher", with_grace("fetcher", self.grace_period, fetcher).await);
                (Some(retry_worker), Some(acknowledger))
            }
            None => (None, None),
        };

        with_grace("ingest queue", self.grace_period, self.ingest_queue.shutdown()).await;
        with_grace("index queue", self.grace_period, self.index_queue.shutdown()).await;

        self.sink_cancel.cancel();
        if let Some(retry_worker) = retry_worker {
            match with_grace("retry worker", self.grace_period, retry_worker).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "retry worker failed"),
                Err(e) => error!(error = %e, "retry worker task failed"),
            }
        }

        self.ack_cancel.cancel();
        if let Some(acknowledger) = acknowledger {
            log_join(
                "replay acknowledger",
                with_grace("replay acknowledger", self.grace_period, acknowledger).await,
            );
        }

        self.set_state(PipelineState::Stopped);
        info!(parked = self.sink.pending(), "pipeline stopped");
    }
}

/// Await `fut`, warning once if it outlives `grace`.
async fn with_grace<F: Future>(component: &str, grace: Duration, fut: F) -> F::Output {
    tokio::pin!(fut);
    match tokio::time::timeout(grace, &mut fut).await {
        Ok(output) => output,
        Err(_) => {
            warn!(
                component,
                grace_secs = grace.as_secs(),
                "slow to stop, still waiting"
            );
            fut.await
        }
    }
}

fn lock<V>(mutex: &Mutex<V>) -> std::sync::MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn log_join(component: &str, result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(component, error = %e, "task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingTransport, ingest, test_storage, transformer};
    use catalogsync_shared::{CollectionType, DocumentStatus};

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        for queue in [&mut config.index_queue, &mut config.ingest_queue] {
            queue.max_queue_size = 100;
            queue.batch_size = 10;
            queue.batch_interval_ms = 20;
            queue.enqueue_poll_ms = 5;
            queue.drain_timeout_ms = 10;
        }
        config.fetcher.interval_ms = 20;
        config.fetcher.fetch_limit = 10;
        config.breaker.failure_threshold = 1;
        config.breaker.recovery_timeout_secs = 1;
        config.retry.max_retries = 1;
        config.retry.retry_delay_ms = 10;
        config.retry.worker_interval_ms = 20;
        config.shutdown.grace_period_secs = 1;
        config
    }

    /// Poll until `status` holds `expected` documents or give up after 5s.
    async fn wait_for(storage: &Storage, status: DocumentStatus, expected: u64) -> bool {
        for _ in 0..250 {
            if storage.count_by_status(status).await.unwrap() == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn submitted_documents_become_indexed() {
        let storage = Arc::new(test_storage().await);
        let transport = RecordingTransport::healthy();
        let pipeline = Pipeline::launch(&fast_config(), storage.clone(), transport.clone(), transformer())
            .await
            .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);

        for _ in 0..5 {
            let outcome = pipeline.submit(ingest(CollectionType::Grocery)).await.unwrap();
            assert!(outcome.is_ack());
        }

        assert!(wait_for(&storage, DocumentStatus::Indexed, 5).await);
        pipeline.shutdown().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(transport.delivered_ids().len(), 5);
    }

    #[tokio::test]
    async fn startup_recovers_in_flight_documents() {
        let storage = Arc::new(test_storage().await);
        let records: Vec<_> = (0..3).map(|_| ingest(CollectionType::Fnb)).collect();
        storage.upsert_many(&records).await.unwrap();
        // Claimed by a previous process that died before indexing.
        storage.claim_new(10).await.unwrap();

        let pipeline = Pipeline::launch(
            &fast_config(),
            storage.clone(),
            RecordingTransport::healthy(),
            transformer(),
        )
        .await
        .unwrap();

        assert!(wait_for(&storage, DocumentStatus::Indexed, 3).await);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn outage_parks_then_replays() {
        let storage = Arc::new(test_storage().await);
        let transport = RecordingTransport::failing();
        let pipeline = Pipeline::launch(&fast_config(), storage.clone(), transport.clone(), transformer())
            .await
            .unwrap();

        for _ in 0..3 {
            pipeline.submit(ingest(CollectionType::Electronics)).await.unwrap();
        }
        assert!(wait_for(&storage, DocumentStatus::Queued, 3).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let metrics = pipeline.metrics();
        assert!(metrics.parked > 0);
        assert_eq!(metrics.breaker, BreakerState::Open);

        transport.set_failing(false);
        assert!(wait_for(&storage, DocumentStatus::Indexed, 3).await);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_and_rejected_documents() {
        let storage = Arc::new(test_storage().await);
        let pipeline = Pipeline::launch(
            &fast_config(),
            storage.clone(),
            RecordingTransport::healthy(),
            transformer(),
        )
        .await
        .unwrap();

        let mut invalid = ingest(CollectionType::Grocery);
        invalid.record.item_selling_price = 0.0;
        assert!(!pipeline.submit(invalid).await.unwrap().is_ack());

        let mut markup_only = ingest(CollectionType::Grocery);
        markup_only.record.item_name = "<br/>".into();
        assert!(pipeline.submit(markup_only).await.unwrap().is_ack());

        assert!(wait_for(&storage, DocumentStatus::Errored, 1).await);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_final() {
        let storage = Arc::new(test_storage().await);
        let pipeline = Pipeline::launch(
            &fast_config(),
            storage,
            RecordingTransport::healthy(),
            transformer(),
        )
        .await
        .unwrap();

        pipeline.shutdown().await;
        pipeline.shutdown().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        let err = pipeline.submit(ingest(CollectionType::Fnb)).await.unwrap_err();
        assert!(matches!(err, CatalogError::ShuttingDown { .. }));
    }

    #[tokio::test]
    async fn start_moves_through_states_once() {
        let storage = Arc::new(test_storage().await);
        let pipeline = Pipeline::new(
            &fast_config(),
            storage,
            RecordingTransport::healthy(),
            transformer(),
        )
        .unwrap();
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        pipeline.start().await.unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(matches!(pipeline.start().await, Err(CatalogError::Config { .. })));

        pipeline.shutdown().await;
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(matches!(pipeline.start().await, Err(CatalogError::Config { .. })));
    }

    #[tokio::test]
    async fn failed_recovery_returns_to_stopped() {
        let tmp = std::env::temp_dir().join(format!("catalogsync_ro_{}.db", uuid::Uuid::now_v7()));
        drop(Storage::open(&tmp).await.unwrap());
        let storage = Arc::new(Storage::open_readonly(&tmp).await.unwrap());
        let pipeline = Pipeline::new(
            &fast_config(),
            storage,
            RecordingTransport::healthy(),
            transformer(),
        )
        .unwrap();

        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // A pipeline that never ran still shuts its queues down.
        pipeline.shutdown().await;
        let err = pipeline.submit(ingest(CollectionType::Fnb)).await.unwrap_err();
        assert!(matches!(err, CatalogError::ShuttingDown { .. }));
    }

    #[tokio::test]
    async fn invalid_config_fails_fast() {
        let storage = Arc::new(test_storage().await);
        let mut config = fast_config();
        config.index_queue.batch_size = 0;

        let result = Pipeline::launch(&config, storage, RecordingTransport::healthy(), transformer()).await;
        assert!(matches!(result, Err(CatalogError::Config { .. })));
    }
}
