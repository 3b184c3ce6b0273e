//! Bounded FIFO plus an accumulating batch that flushes on size or on a timer.
//!
//! One [`BatchingQueue`] sits between each producer and consumer in the
//! pipeline. `enqueue` applies backpressure when the FIFO is full; a drain
//! task moves items into the batch and a timer task flushes partial batches.
//! Flushes run on their own tasks, bounded by a semaphore.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use catalogsync_shared::{CatalogError, QueueConfig, Result};

/// Consumes one flushed batch. Errors are logged and counted by the queue;
/// the batch is not requeued.
pub trait FlushHandler<T>: Send + Sync + 'static {
    fn flush(&self, batch: Vec<T>) -> impl Future<Output = Result<()>> + Send;
}

/// Sizing and timing for one queue.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub enqueue_poll: Duration,
    pub drain_timeout: Duration,
    pub flush_concurrency: usize,
}

impl QueueOptions {
    pub fn from_config(config: &QueueConfig, flush_concurrency: usize) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            batch_size: config.batch_size,
            batch_interval: config.batch_interval(),
            enqueue_poll: config.enqueue_poll(),
            drain_timeout: config.drain_timeout(),
            flush_concurrency,
        }
    }
}

struct Shared<T, F> {
    name: String,
    handler: Arc<F>,
    batch: Mutex<Vec<T>>,
    batch_size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    flushed: AtomicU64,
    failed: AtomicU64,
}

struct Loops<T> {
    drain: JoinHandle<mpsc::Receiver<T>>,
    timer: JoinHandle<()>,
}

pub struct BatchingQueue<T, F> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared<T, F>>,
    loops: StdMutex<Option<Loops<T>>>,
    cancel: CancellationToken,
    max_queue_size: usize,
    enqueue_poll: Duration,
}

impl<T, F> BatchingQueue<T, F>
where
    T: Send + 'static,
    F: FlushHandler<T>,
{
    /// Create the queue and spawn its drain and timer tasks.
    pub fn start(name: impl Into<String>, options: QueueOptions, handler: F) -> Self {
        let name = name.into();
        let max_queue_size = options.max_queue_size.max(1);
        let (tx, rx) = mpsc::channel(max_queue_size);
        let cancel = CancellationToken::new();

        let shared = Arc::new(Shared {
            name: name.clone(),
            handler: Arc::new(handler),
            batch: Mutex::new(Vec::with_capacity(options.batch_size)),
            batch_size: options.batch_size.max(1),
            permits: Arc::new(Semaphore::new(options.flush_concurrency.max(1))),
            tracker: TaskTracker::new(),
            flushed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let drain = tokio::spawn(drain_loop(
            Arc::clone(&shared),
            rx,
            options.drain_timeout,
            cancel.clone(),
        ));
        let timer = tokio::spawn(timer_loop(
            Arc::clone(&shared),
            options.batch_interval,
            cancel.clone(),
        ));

        info!(
            queue = %name,
            max_queue_size,
            batch_size = options.batch_size,
            flush_concurrency = options.flush_concurrency,
            "batching queue started"
        );

        Self {
            tx,
            shared,
            loops: StdMutex::new(Some(Loops { drain, timer })),
            cancel,
            max_queue_size,
            enqueue_poll: options.enqueue_poll,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Add an item, waiting while the FIFO is full.
    ///
    /// Fails with [`CatalogError::ShuttingDown`] once the queue has been shut
    /// down, and while waiting for space if shutdown begins.
    pub async fn enqueue(&self, item: T) -> Result<()> {
        let mut item = item;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CatalogError::shutting_down(&self.shared.name));
            }
            match self.tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Full(back)) => {
                    item = back;
                    debug!(queue = %self.shared.name, "queue full, waiting for space");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.enqueue_poll) => {}
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(CatalogError::shutting_down(&self.shared.name));
                }
            }
        }
    }

    /// Items waiting in the FIFO (not counting the batch being built).
    pub fn len(&self) -> usize {
        self.max_queue_size - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.tx.capacity() == 0
    }

    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }

    /// Items handed to the flush handler so far, whatever its outcome.
    pub fn flushed_items(&self) -> u64 {
        self.shared.flushed.load(Ordering::Acquire)
    }

    /// Items in batches whose handler returned an error.
    pub fn failed_items(&self) -> u64 {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// Stop the loops, flush everything still buffered, and wait for every
    /// in-flight flush. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        let loops = self
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(Loops { drain, timer }) = loops else {
            return;
        };

        self.cancel.cancel();
        if let Err(e) = timer.await {
            warn!(queue = %self.shared.name, error = %e, "timer task failed");
        }

        match drain.await {
            Ok(mut rx) => {
                rx.close();
                let mut leftover = 0usize;
                let mut batch = self.shared.batch.lock().await;
                while let Ok(item) = rx.try_recv() {
                    batch.push(item);
                    leftover += 1;
                }
                drop(batch);
                if leftover > 0 {
                    debug!(queue = %self.shared.name, leftover, "drained buffered items");
                }
            }
            Err(e) => warn!(queue = %self.shared.name, error = %e, "drain task failed"),
        }

        self.shared.flush().await;
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        info!(
            queue = %self.shared.name,
            flushed = self.flushed_items(),
            failed = self.failed_items(),
            "batching queue stopped"
        );
    }
}

impl<T, F> Shared<T, F>
where
    T: Send + 'static,
    F: FlushHandler<T>,
{
    /// Swap the live batch for an empty one and hand the snapshot to the
    /// handler on a tracked task. Waits for a flush permit first.
    async fn flush(self: &Arc<Self>) {
        // The semaphore is never closed.
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };

        let snapshot = {
            let mut batch = self.batch.lock().await;
            if batch.is_empty() {
                return;
            }
            std::mem::replace(&mut *batch, Vec::with_capacity(self.batch_size))
        };

        let shared = Arc::clone(self);
        self.tracker.spawn(async move {
            let _permit = permit;
            let size = snapshot.len();
            debug!(queue = %shared.name, size, "flushing batch");
            if let Err(e) = shared.handler.flush(snapshot).await {
                warn!(queue = %shared.name, size, error = %e, "batch flush failed");
                shared.failed.fetch_add(size as u64, Ordering::AcqRel);
            }
            shared.flushed.fetch_add(size as u64, Ordering::AcqRel);
        });
    }
}

async fn drain_loop<T, F>(
    shared: Arc<Shared<T, F>>,
    mut rx: mpsc::Receiver<T>,
    wait: Duration,
    cancel: CancellationToken,
) -> mpsc::Receiver<T>
where
    T: Send + 'static,
    F: FlushHandler<T>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(wait, rx.recv()) => next,
        };

        match next {
            Ok(Some(item)) => {
                let full = {
                    let mut batch = shared.batch.lock().await;
                    batch.push(item);
                    batch.len() >= shared.batch_size
                };
                if full {
                    shared.flush().await;
                }
            }
            Ok(None) => break,
            // Nothing arrived; go round and re-check for shutdown.
            Err(_) => {}
        }
    }
    rx
}

async fn timer_loop<T, F>(shared: Arc<Shared<T, F>>, every: Duration, cancel: CancellationToken)
where
    T: Send + 'static,
    F: FlushHandler<T>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.flush().await,
        }
    }
}
