//! Flush handlers that connect the batching queues to the store and the index.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use catalogsync_shared::{
    CollectionType, CoreNames, DocumentStatus, EnrichedDocument, IndexDocument, IngestRecord,
    Result,
};
use catalogsync_sink::{CircuitBreakingSink, IndexTransport, SinkRequest};
use catalogsync_storage::Storage;

use crate::batching::FlushHandler;

// ---------------------------------------------------------------------------
// IndexFlush
// ---------------------------------------------------------------------------

/// Publishes enriched documents to the core for their collection.
///
/// Documents are grouped per core and sent in chunks. A delivered chunk is
/// marked `INDEXED`; a parked chunk stays `QUEUED` until the sink replays it.
pub struct IndexFlush<T: IndexTransport> {
    sink: Arc<CircuitBreakingSink<T>>,
    storage: Arc<Storage>,
    cores: CoreNames,
    chunk_size: usize,
}

impl<T: IndexTransport> IndexFlush<T> {
    pub fn new(
        sink: Arc<CircuitBreakingSink<T>>,
        storage: Arc<Storage>,
        cores: CoreNames,
        chunk_size: usize,
    ) -> Self {
        Self {
            sink,
            storage,
            cores,
            chunk_size: chunk_size.max(1),
        }
    }

    async fn deliver(&self, req: SinkRequest) -> Result<()> {
        let core = req.core.clone();
        // Kept for the status update; the request itself moves into the sink.
        let docs = req.docs.clone();

        match self.sink.request(req).await {
            Ok(_) => {
                let indexed = mark_indexed(&self.storage, &docs).await?;
                debug!(%core, indexed, "chunk indexed");
                Ok(())
            }
            Err(e) if e.is_parked() => {
                debug!(%core, docs = docs.len(), "chunk parked, documents stay QUEUED");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl<T: IndexTransport> FlushHandler<EnrichedDocument> for IndexFlush<T> {
    #[instrument(skip_all, fields(batch = batch.len()))]
    async fn flush(&self, batch: Vec<EnrichedDocument>) -> Result<()> {
        let mut by_collection: BTreeMap<CollectionType, Vec<IndexDocument>> = BTreeMap::new();
        for enriched in batch {
            by_collection
                .entry(enriched.collection_type)
                .or_default()
                .push(enriched.doc);
        }

        let mut first_error = None;
        for (collection, docs) in by_collection {
            let core = self.cores.for_collection(collection);
            for chunk in docs.chunks(self.chunk_size) {
                let req = SinkRequest {
                    core: core.to_string(),
                    docs: chunk.to_vec(),
                };
                // One failing core must not hold back the others.
                if let Err(e) = self.deliver(req).await {
                    warn!(%core, error = %e, "failed to record indexed chunk");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Mark `docs` as `INDEXED` and persist their vectors.
///
/// A vector write failure is logged per document; the status update is the
/// part that must succeed.
pub async fn mark_indexed(storage: &Storage, docs: &[IndexDocument]) -> Result<u64> {
    let ids: Vec<String> = docs.iter().map(|d| d.id.clone()).collect();
    let updated = storage
        .set_status(&ids, DocumentStatus::Indexed, None)
        .await?;

    for doc in docs {
        if let Err(e) = storage.save_vectors(&doc.id, &doc.vectors()).await {
            warn!(id = %doc.id, error = %e, "failed to save vectors");
        }
    }
    Ok(updated)
}

/// Mark documents from replayed requests as `INDEXED` until `cancel` fires,
/// then drain whatever replays are already buffered.
pub async fn acknowledge_replays(
    storage: Arc<Storage>,
    mut replays: mpsc::UnboundedReceiver<SinkRequest>,
    cancel: CancellationToken,
) {
    info!("replay acknowledger started");
    loop {
        let req = tokio::select! {
            _ = cancel.cancelled() => break,
            req = replays.recv() => match req {
                Some(req) => req,
                None => break,
            },
        };
        acknowledge(&storage, &req).await;
    }

    while let Ok(req) = replays.try_recv() {
        acknowledge(&storage, &req).await;
    }
    info!("replay acknowledger stopped");
}

async fn acknowledge(storage: &Storage, req: &SinkRequest) {
    match mark_indexed(storage, &req.docs).await {
        Ok(indexed) => info!(core = %req.core, indexed, "replayed chunk indexed"),
        // The documents stay QUEUED and are picked up again after a restart.
        Err(e) => warn!(core = %req.core, error = %e, "failed to mark replayed chunk"),
    }
}

// ---------------------------------------------------------------------------
// StoreFlush
// ---------------------------------------------------------------------------

/// Writes submitted records to the store as `NEW`.
pub struct StoreFlush {
    storage: Arc<Storage>,
}

impl StoreFlush {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl FlushHandler<IngestRecord> for StoreFlush {
    async fn flush(&self, batch: Vec<IngestRecord>) -> Result<()> {
        let written = self.storage.upsert_many(&batch).await?;
        debug!(written, "ingest batch stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingTransport, enriched, test_storage};
    use catalogsync_shared::{CatalogError, Projection};
    use catalogsync_sink::{CircuitBreaker, RetryPolicy};
    use std::time::Duration;

    fn sink(transport: RecordingTransport) -> Arc<CircuitBreakingSink<RecordingTransport>> {
        Arc::new(CircuitBreakingSink::new(
            transport,
            CircuitBreaker::new(3, Duration::from_secs(20)),
            RetryPolicy {
                max_attempts: 1,
                delay: Duration::from_millis(1),
                worker_interval: Duration::from_millis(10),
            },
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn flush_groups_by_core_and_marks_indexed() {
        let storage = Arc::new(test_storage().await);
        let (docs, records) = enriched(&[
            CollectionType::Grocery,
            CollectionType::Electronics,
            CollectionType::Grocery,
        ]).await;
        storage.upsert_many(&records).await.unwrap();
        storage.claim_new(10).await.unwrap();

        let transport = RecordingTransport::healthy();
        let flush = IndexFlush::new(sink(transport.clone()), storage.clone(), CoreNames::default(), 500);
        flush.flush(docs).await.unwrap();

        let mut cores = transport.cores();
        cores.sort();
        assert_eq!(cores, vec!["electronics", "grocery"]);
        assert_eq!(storage.count_by_status(DocumentStatus::Indexed).await.unwrap(), 3);

        let stored = storage
            .get(records[0].id(), Projection::WithVectors)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.vectors.is_some());
    }

    #[tokio::test]
    async fn flush_splits_into_chunks() {
        let storage = Arc::new(test_storage().await);
        let (docs, records) = enriched(&[CollectionType::Fnb; 5]).await;
        storage.upsert_many(&records).await.unwrap();

        let transport = RecordingTransport::healthy();
        let flush = IndexFlush::new(sink(transport.clone()), storage, CoreNames::default(), 2);
        flush.flush(docs).await.unwrap();

        assert_eq!(transport.chunk_sizes(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn parked_chunk_stays_queued() {
        let storage = Arc::new(test_storage().await);
        let (docs, records) = enriched(&[CollectionType::Grocery, CollectionType::Grocery]).await;
        storage.upsert_many(&records).await.unwrap();
        storage.claim_new(10).await.unwrap();

        let sink = sink(RecordingTransport::failing());
        let flush = IndexFlush::new(sink.clone(), storage.clone(), CoreNames::default(), 500);
        flush.flush(docs).await.unwrap();

        assert_eq!(storage.count_by_status(DocumentStatus::Queued).await.unwrap(), 2);
        assert_eq!(sink.pending(), 1);
    }

    #[tokio::test]
    async fn acknowledger_marks_replays_indexed() {
        let storage = Arc::new(test_storage().await);
        let (docs, records) = enriched(&[CollectionType::Grocery, CollectionType::Fnb]).await;
        storage.upsert_many(&records).await.unwrap();
        storage.claim_new(10).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(acknowledge_replays(storage.clone(), rx, cancel.clone()));

        tx.send(SinkRequest {
            core: "grocery".into(),
            docs: vec![docs[0].doc.clone()],
        })
        .unwrap();
        tx.send(SinkRequest {
            core: "fnb".into(),
            docs: vec![docs[1].doc.clone()],
        })
        .unwrap();
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(storage.count_by_status(DocumentStatus::Indexed).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn store_flush_upserts_as_new() {
        let storage = Arc::new(test_storage().await);
        let (_, records) = enriched(&[CollectionType::Electronics; 3]).await;

        StoreFlush::new(storage.clone()).flush(records).await.unwrap();
        assert_eq!(storage.count_by_status(DocumentStatus::New).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn store_flush_propagates_storage_errors() {
        let tmp = std::env::temp_dir().join(format!("catalogsync_ro_{}.db", uuid::Uuid::now_v7()));
        drop(Storage::open(&tmp).await.unwrap());
        let storage = Arc::new(Storage::open_readonly(&tmp).await.unwrap());
        let (_, records) = enriched(&[CollectionType::Grocery]).await;

        let err = StoreFlush::new(storage).flush(records).await.unwrap_err();
        assert!(matches!(err, CatalogError::Storage(_)));
    }
}
