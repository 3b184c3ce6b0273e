//! Fixtures shared by this crate's unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use catalogsync_shared::testing::sample_record;
use catalogsync_shared::{
    CatalogError, CollectionType, DocumentStatus, EnrichedDocument, IngestRecord, Result,
    StoredDocument,
};
use catalogsync_sink::{IndexTransport, SinkRequest, SinkResponse};
use catalogsync_storage::Storage;
use catalogsync_transform::{HashEmbedder, TransformOutcome, Transformer};

/// Create a temp file storage for testing.
pub async fn test_storage() -> Storage {
    let tmp = std::env::temp_dir().join(format!("catalogsync_test_{}.db", Uuid::now_v7()));
    Storage::open(&tmp).await.expect("open test db")
}

pub fn ingest(collection: CollectionType) -> IngestRecord {
    IngestRecord {
        collection_type: collection,
        record: sample_record(&Uuid::new_v4().to_string()),
    }
}

pub fn transformer() -> Transformer {
    Transformer::new(Arc::new(HashEmbedder::new(16).unwrap()), None, 4)
}

/// One enriched document per collection, plus the ingest records they came from.
pub async fn enriched(collections: &[CollectionType]) -> (Vec<EnrichedDocument>, Vec<IngestRecord>) {
    let records: Vec<IngestRecord> = collections.iter().map(|c| ingest(*c)).collect();
    let now = Utc::now();
    let stored = records
        .iter()
        .map(|r| StoredDocument {
            id: r.id().to_string(),
            collection_type: r.collection_type,
            record: r.record.clone(),
            status: DocumentStatus::Queued,
            error: None,
            created_at: now,
            updated_at: now,
            vectors: None,
        })
        .collect();

    let docs = transformer()
        .transform_batch(stored)
        .await
        .into_iter()
        .map(|outcome| match outcome {
            TransformOutcome::Enriched(doc) => doc,
            TransformOutcome::Rejected { reason, .. } => panic!("fixture rejected: {reason}"),
        })
        .collect();
    (docs, records)
}

/// Transport that records every request and can be switched between healthy
/// and failing.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    failing: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<SinkRequest>>>,
}

impl RecordingTransport {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Cores of the delivered requests, in delivery order.
    pub fn cores(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.core.clone()).collect()
    }

    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.requests.lock().unwrap().iter().map(|r| r.docs.len()).collect()
    }

    pub fn delivered_ids(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|r| r.doc_ids())
            .collect()
    }
}

impl IndexTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, req: &SinkRequest) -> Result<SinkResponse> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CatalogError::Network("HTTP 503".into()));
        }
        self.requests.lock().unwrap().push(req.clone());
        Ok(SinkResponse {
            status: 200,
            body: String::new(),
        })
    }
}
