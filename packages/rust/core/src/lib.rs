//! Core pipeline orchestration for catalogsync.
//!
//! This crate ties the status store, the transform stage and the index sink
//! together:
//! - [`batching`]: the bounded batching queue shared by every stage
//! - [`indexing`]: flush handlers for the store and the index
//! - [`fetcher`]: the periodic claim → transform → enqueue loop
//! - [`lifecycle`]: startup recovery and ordered shutdown ([`Pipeline`])
//! - [`submit`] and [`export`]: the operator-facing ingress and reports

pub mod batching;
pub mod export;
pub mod fetcher;
pub mod indexing;
pub mod lifecycle;
pub mod submit;

#[cfg(test)]
mod test_support;

pub use batching::{BatchingQueue, FlushHandler, QueueOptions};
pub use export::{StatusReport, export_csv, status_report};
pub use fetcher::{CycleReport, Fetcher};
pub use indexing::{IndexFlush, StoreFlush, mark_indexed};
pub use lifecycle::{Pipeline, PipelineMetrics, PipelineState};
pub use submit::{
    SilentProgress, SubmitOutcome, SubmitProgress, SubmitReport, confirm_stored, submit_ndjson,
};
