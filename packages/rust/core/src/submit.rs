//! Ingress: validate records and hand them to the ingest queue.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, instrument};

use catalogsync_shared::{CatalogError, IngestRecord, Result};

use crate::batching::{BatchingQueue, FlushHandler};

/// Answer to one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Accepted into the ingest queue; it will be stored as `NEW`.
    Ack { id: String },
    /// Rejected before entering the pipeline.
    Nack { id: Option<String>, reason: String },
}

impl SubmitOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack { .. })
    }
}

/// Validate `record` and enqueue it.
///
/// Invalid records are answered with `Nack` and never retried. The only error
/// is [`CatalogError::ShuttingDown`] from the queue.
pub async fn submit<F>(
    queue: &BatchingQueue<IngestRecord, F>,
    record: IngestRecord,
) -> Result<SubmitOutcome>
where
    F: FlushHandler<IngestRecord>,
{
    let id = record.id().to_string();
    if let Err(e) = record.record.validate() {
        let reason = match e {
            CatalogError::Validation { message } => message,
            other => other.to_string(),
        };
        debug!(%id, %reason, "submission rejected");
        return Ok(SubmitOutcome::Nack {
            id: Some(id),
            reason,
        });
    }

    queue.enqueue(record).await?;
    Ok(SubmitOutcome::Ack { id })
}

/// Progress callback for bulk submissions.
pub trait SubmitProgress: Send + Sync {
    /// Called once per non-blank input line.
    fn submitted(&self, line: usize, outcome: &SubmitOutcome);
}

/// No-op progress reporter.
pub struct SilentProgress;

impl SubmitProgress for SilentProgress {
    fn submitted(&self, _line: usize, _outcome: &SubmitOutcome) {}
}

/// Totals from a bulk submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub acked: usize,
    /// `(line number, reason)` for every rejected line.
    pub nacked: Vec<(usize, String)>,
}

/// Submit one JSON record per line. Blank lines are skipped; lines that do
/// not parse are answered with `Nack`.
#[instrument(skip_all)]
pub async fn submit_ndjson<R, F>(
    reader: R,
    queue: &BatchingQueue<IngestRecord, F>,
    progress: &dyn SubmitProgress,
) -> Result<SubmitReport>
where
    R: AsyncBufRead + Unpin,
    F: FlushHandler<IngestRecord>,
{
    let mut lines = reader.lines();
    let mut report = SubmitReport::default();
    let mut line_no = 0usize;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| CatalogError::io("<input>", e))?
    {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<IngestRecord>(&line) {
            Ok(record) => submit(queue, record).await?,
            Err(e) => SubmitOutcome::Nack {
                id: None,
                reason: format!("invalid JSON: {e}"),
            },
        };

        match &outcome {
            SubmitOutcome::Ack { .. } => report.acked += 1,
            SubmitOutcome::Nack { reason, .. } => report.nacked.push((line_no, reason.clone())),
        }
        progress.submitted(line_no, &outcome);
    }

    info!(
        acked = report.acked,
        nacked = report.nacked.len(),
        "submission complete"
    );
    Ok(report)
}

/// Fail if any accepted record did not reach the store. Call after the
/// ingest queue has shut down, once every flush has finished.
pub fn confirm_stored<F>(queue: &BatchingQueue<IngestRecord, F>) -> Result<()>
where
    F: FlushHandler<IngestRecord>,
{
    match queue.failed_items() {
        0 => Ok(()),
        failed => Err(CatalogError::storage(format!(
            "{failed} accepted records were not stored"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batching::QueueOptions;
    use crate::indexing::StoreFlush;
    use crate::test_support::{ingest, test_storage};
    use catalogsync_shared::{CollectionType, DocumentStatus};
    use catalogsync_storage::Storage;
    use std::sync::Arc;
    use std::time::Duration;

    fn options() -> QueueOptions {
        QueueOptions {
            max_queue_size: 100,
            batch_size: 10,
            batch_interval: Duration::from_millis(20),
            enqueue_poll: Duration::from_millis(5),
            drain_timeout: Duration::from_millis(10),
            flush_concurrency: 1,
        }
    }

    #[tokio::test]
    async fn valid_record_is_acked_and_stored() {
        let storage = Arc::new(test_storage().await);
        let queue = BatchingQueue::start("ingest", options(), StoreFlush::new(storage.clone()));
        let record = ingest(CollectionType::Grocery);

        let outcome = submit(&queue, record.clone()).await.unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Ack {
                id: record.id().to_string()
            }
        );

        queue.shutdown().await;
        assert_eq!(storage.count_by_status(DocumentStatus::New).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_record_is_nacked() {
        let storage = Arc::new(test_storage().await);
        let queue = BatchingQueue::start("ingest", options(), StoreFlush::new(storage.clone()));
        let mut record = ingest(CollectionType::Fnb);
        record.record.id = "not-a-uuid".into();

        let outcome = submit(&queue, record).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Nack { id: Some(ref id), .. } if id == "not-a-uuid"));

        queue.shutdown().await;
        assert_eq!(queue.flushed_items(), 0);
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_an_error() {
        let storage = Arc::new(test_storage().await);
        let queue = BatchingQueue::start("ingest", options(), StoreFlush::new(storage));
        queue.shutdown().await;

        let err = submit(&queue, ingest(CollectionType::Grocery)).await.unwrap_err();
        assert!(matches!(err, CatalogError::ShuttingDown { .. }));
    }

    #[tokio::test]
    async fn failed_store_write_is_surfaced() {
        let tmp = std::env::temp_dir().join(format!("catalogsync_ro_{}.db", uuid::Uuid::now_v7()));
        drop(Storage::open(&tmp).await.unwrap());
        let storage = Arc::new(Storage::open_readonly(&tmp).await.unwrap());
        let queue = BatchingQueue::start("ingest", options(), StoreFlush::new(storage));

        let line = serde_json::to_string(&ingest(CollectionType::Grocery)).unwrap();
        let report = submit_ndjson(line.as_bytes(), &queue, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(report.acked, 1);

        queue.shutdown().await;
        assert_eq!(queue.failed_items(), 1);
        let err = confirm_stored(&queue).unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));
    }

    #[tokio::test]
    async fn ndjson_reports_per_line() {
        let storage = Arc::new(test_storage().await);
        let queue = BatchingQueue::start("ingest", options(), StoreFlush::new(storage.clone()));

        let good = serde_json::to_string(&ingest(CollectionType::Electronics)).unwrap();
        let input = format!("{good}\n\n{{\"oops\": 1}}\n{good}\n");

        let report = submit_ndjson(input.as_bytes(), &queue, &SilentProgress)
            .await
            .unwrap();
        queue.shutdown().await;
        confirm_stored(&queue).unwrap();

        assert_eq!(report.acked, 2);
        assert_eq!(report.nacked.len(), 1);
        assert_eq!(report.nacked[0].0, 3);
        // Same id twice: one stored document.
        assert_eq!(storage.count_by_status(DocumentStatus::New).await.unwrap(), 1);
    }
}
