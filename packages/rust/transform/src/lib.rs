//! Document enrichment between the status store and the search index.
//!
//! This crate provides:
//! - [`cleanup`]: markup/whitespace normalization for free-text fields
//! - [`embed`]: the [`Embedder`] seam, a hash embedder and a SHA-256 keyed cache
//! - [`url_check`]: HEAD-based liveness checks for symbol URLs
//! - [`Transformer`]: turns a claimed [`StoredDocument`] into an [`EnrichedDocument`]

pub mod cleanup;
pub mod embed;
pub mod url_check;

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use catalogsync_shared::{
    CatalogError, EnrichedDocument, IndexDocument, Result, StoredDocument, TransformConfig,
};

pub use cleanup::{clean_optional, clean_text};
pub use embed::{CacheStats, CachedEmbedder, Embedder, HashEmbedder};
pub use url_check::UrlChecker;

/// Rejection reason recorded when a symbol URL does not resolve.
pub const INVALID_SYMBOL_REASON: &str = "invalid item_symbol or provider_symbol";

/// Result of transforming one document.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    Enriched(EnrichedDocument),
    Rejected { id: String, reason: String },
}

impl TransformOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Enriched(doc) => doc.id(),
            Self::Rejected { id, .. } => id,
        }
    }
}

/// Cleans, embeds and verifies documents. Cheap to clone.
#[derive(Clone)]
pub struct Transformer {
    embedder: Arc<dyn Embedder>,
    url_checker: Option<UrlChecker>,
    permits: Arc<Semaphore>,
}

impl Transformer {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        url_checker: Option<UrlChecker>,
        concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            url_checker,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Build a transformer from config: cached hash embeddings, and URL
    /// checks when enabled.
    pub fn from_config(config: &TransformConfig, concurrency: usize) -> Result<Self> {
        let hash = Arc::new(HashEmbedder::new(config.embedding_dims)?);
        let embedder = Arc::new(CachedEmbedder::new(hash, config.embedding_cache_size));
        let url_checker = if config.check_urls {
            Some(UrlChecker::new(config.url_timeout())?)
        } else {
            None
        };
        Ok(Self::new(embedder, url_checker, concurrency))
    }

    /// Transform a single document.
    #[instrument(skip_all, fields(id = %doc.id))]
    pub async fn transform(&self, doc: StoredDocument) -> TransformOutcome {
        let id = doc.id.clone();
        match self.try_transform(doc).await {
            Ok(enriched) => TransformOutcome::Enriched(enriched),
            Err(reason) => {
                debug!(%id, %reason, "document rejected");
                TransformOutcome::Rejected { id, reason }
            }
        }
    }

    /// Transform documents concurrently, bounded by the transformer's permits.
    /// Outcomes are returned in input order.
    pub async fn transform_batch(&self, docs: Vec<StoredDocument>) -> Vec<TransformOutcome> {
        let mut handles = Vec::with_capacity(docs.len());

        for doc in docs {
            let id = doc.id.clone();
            let this = self.clone();
            let permits = self.permits.clone();
            handles.push((
                id,
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    this.transform(doc).await
                }),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(%id, error = %e, "transform task failed");
                    outcomes.push(TransformOutcome::Rejected {
                        id,
                        reason: format!("transform task failed: {e}"),
                    });
                }
            }
        }
        outcomes
    }

    async fn try_transform(&self, doc: StoredDocument) -> std::result::Result<EnrichedDocument, String> {
        let collection_type = doc.collection_type;
        let record = doc.record;

        let item_name = clean_text(&record.item_name);
        if item_name.is_empty() {
            return Err("item_name is empty after cleanup".into());
        }
        let item_short_desc = clean_optional(record.item_short_description.as_deref());
        let item_long_desc = clean_optional(record.item_long_description.as_deref());
        let provider_name = clean_text(&record.provider_name);
        if provider_name.is_empty() {
            return Err("provider_name is empty after cleanup".into());
        }

        let vectors = self
            .embed_fields(
                item_name.clone(),
                item_short_desc.clone(),
                item_long_desc.clone(),
                provider_name.clone(),
            )
            .await
            .map_err(|e| e.to_string())?;

        if let Some(checker) = &self.url_checker {
            let (item_ok, provider_ok) = tokio::join!(
                checker.is_reachable(&record.item_symbol),
                checker.is_reachable(&record.provider_symbol),
            );
            if !item_ok || !provider_ok {
                return Err(INVALID_SYMBOL_REASON.into());
            }
        }

        let provider_geo = record.provider_geo();
        let doc = IndexDocument {
            item_name_suggester_payload: format!("{} | {}", record.item_symbol, item_name),
            provider_name_suggester_payload: format!(
                "{} | {}",
                record.provider_symbol, provider_name
            ),
            id: record.id,
            code: record.code,
            domain: record.domain,
            bpp_id: record.bpp_id,
            bpp_name: record.bpp_name,
            bpp_uri: record.bpp_uri,
            city: record.city,
            item_id: record.item_id,
            item_offers: record.item_offers,
            parent_item_id: record.parent_item_id,
            item_category_id: record.item_category_id,
            item_currency: record.item_currency,
            item_measure_quantity: record.item_measure_quantity,
            item_measure_value: record.item_measure_value,
            item_name,
            item_name_vector: vectors.0,
            item_short_desc,
            item_short_desc_vector: vectors.1,
            item_long_desc,
            item_long_desc_vector: vectors.2,
            item_selling_price: record.item_selling_price,
            item_mrp_price: record.item_mrp_price,
            item_discount_percentage: record.item_discount_percentage,
            item_status: record.item_status,
            item_timestamp: record.item_timestamp,
            provider_timestamp: record.provider_timestamp,
            item_symbol: record.item_symbol,
            item_veg: record.item_veg,
            item_nonveg: record.item_nonveg,
            item_available_count: record.item_available_count,
            item_maximum_count: record.item_maximum_count,
            item_cancellable_status: record.item_cancellable_status,
            item_returnable_status: record.item_returnable_status,
            provider_name,
            provider_name_vector: vectors.3,
            provider_symbol: record.provider_symbol,
            provider_status: record.provider_status,
            provider_geo,
            provider_id: record.provider_id,
            provider_location_id: record.provider_location_id,
            provider_location_city: record.provider_location_city,
            provider_location_area_code: record.provider_location_area_code,
            provider_location_street: record.provider_location_street,
            provider_min_order_value: record.provider_min_order_value,
            provider_start_time_day: record.provider_start_time_day,
            provider_end_time_day: record.provider_end_time_day,
            provider_days: record.provider_days,
            provider_service_location_distance: record.provider_service_location_distance,
            provider_service_type: record.provider_service_type,
        };

        Ok(EnrichedDocument {
            collection_type,
            doc,
        })
    }

    /// Embed the four text fields on the blocking pool.
    async fn embed_fields(
        &self,
        item_name: String,
        short_desc: Option<String>,
        long_desc: Option<String>,
        provider_name: String,
    ) -> Result<(Vec<f32>, Option<Vec<f32>>, Option<Vec<f32>>, Vec<f32>)> {
        let embedder = self.embedder.clone();
        tokio::task::spawn_blocking(move || {
            let name = embedder.embed(&item_name)?;
            let short = short_desc.map(|t| embedder.embed(&t)).transpose()?;
            let long = long_desc.map(|t| embedder.embed(&t)).transpose()?;
            let provider = embedder.embed(&provider_name)?;
            Ok((name, short, long, provider))
        })
        .await
        .map_err(|e| CatalogError::Embedding(format!("embedding task failed: {e}")))?
    }
}
