//! Shared types, error model, and configuration for catalogsync.
//!
//! This crate is the foundation depended on by all other catalogsync crates.
//! It provides:
//! - [`CatalogError`]: the unified error type
//! - Domain types ([`ProductRecord`], [`StoredDocument`], [`IndexDocument`], [`DocumentStatus`])
//! - Configuration ([`AppConfig`] and its sections, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BreakerConfig, ConcurrencyConfig, CoreNames, FetcherConfig, QueueConfig,
    RetryConfig, ShutdownConfig, SolrConfig, StoreConfig, TransformConfig, config_dir,
    config_file_path, cpu_count, init_config, load_config, load_config_from,
};
pub use error::{CatalogError, Result};
pub use types::{
    CollectionType, DocumentStatus, DocumentVectors, EnrichedDocument, IndexDocument,
    IngestRecord, ProductRecord, Projection, StatusCount, StoredDocument, TimeRange,
    parse_iso_timestamp,
};

/// Test fixtures shared by downstream crates' unit tests.
#[doc(hidden)]
pub mod testing {
    use crate::types::ProductRecord;

    /// A product record that passes validation, with the given id.
    pub fn sample_record(id: &str) -> ProductRecord {
        let mut record = crate::types::sample_record_base();
        record.id = id.to_string();
        record
    }
}
