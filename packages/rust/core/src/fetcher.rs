//! Periodic claim → transform → enqueue loop feeding the index queue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use catalogsync_shared::{DocumentStatus, EnrichedDocument, FetcherConfig, Result};
use catalogsync_storage::Storage;
use catalogsync_transform::{TransformOutcome, Transformer};

use crate::batching::{BatchingQueue, FlushHandler};

/// Counts from one fetch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub enqueued: usize,
    pub rejected: usize,
}

pub struct Fetcher<F> {
    storage: Arc<Storage>,
    transformer: Transformer,
    queue: Arc<BatchingQueue<EnrichedDocument, F>>,
    fetch_limit: usize,
    interval: Duration,
    permits: Arc<Semaphore>,
}

impl<F> Fetcher<F>
where
    F: FlushHandler<EnrichedDocument>,
{
    pub fn new(
        storage: Arc<Storage>,
        transformer: Transformer,
        queue: Arc<BatchingQueue<EnrichedDocument, F>>,
        config: &FetcherConfig,
    ) -> Self {
        Self {
            storage,
            transformer,
            queue,
            fetch_limit: config.fetch_limit.max(1),
            interval: config.interval(),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
        }
    }

    /// Claim up to `fetch_limit` NEW documents (never more than the index
    /// queue can take), transform them, record rejections and enqueue the rest.
    ///
    /// Documents left behind when the queue shuts down mid-cycle stay `QUEUED`
    /// and are recovered on the next startup.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let capacity = self.queue.remaining_capacity();
        if capacity == 0 {
            debug!("index queue full, skipping cycle");
            return Ok(CycleReport::default());
        }

        let claimed = self.storage.claim_new(self.fetch_limit.min(capacity)).await?;
        let mut report = CycleReport {
            claimed: claimed.len(),
            ..CycleReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut enriched = Vec::with_capacity(claimed.len());
        let mut rejected: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for outcome in self.transformer.transform_batch(claimed).await {
            match outcome {
                TransformOutcome::Enriched(doc) => enriched.push(doc),
                TransformOutcome::Rejected { id, reason } => {
                    rejected.entry(reason).or_default().push(id)
                }
            }
        }

        for (reason, ids) in &rejected {
            report.rejected += self
                .storage
                .set_status(ids, DocumentStatus::Errored, Some(reason))
                .await? as usize;
        }

        for doc in enriched {
            self.queue.enqueue(doc).await?;
            report.enqueued += 1;
        }

        info!(
            claimed = report.claimed,
            enqueued = report.enqueued,
            rejected = report.rejected,
            "fetch cycle complete"
        );
        Ok(report)
    }

    /// Run a cycle every `interval` until `cancel` fires, then wait for the
    /// cycles in flight. A tick is skipped while every fetch permit is taken.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.interval.as_millis() as u64,
            fetch_limit = self.fetch_limit,
            "fetcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                debug!("previous fetch cycle still running");
                continue;
            };

            let this = Arc::clone(&self);
            tracker.spawn(async move {
                let _permit = permit;
                if let Err(e) = this.run_cycle().await {
                    warn!(error = %e, "fetch cycle failed");
                }
            });
        }

        tracker.close();
        tracker.wait().await;
        info!("fetcher stopped");
    }
}
