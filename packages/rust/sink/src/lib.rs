//! Delivery of enriched documents to the search index.
//!
//! This crate provides:
//! - [`IndexTransport`]: the seam to the index's bulk-update endpoint
//! - [`SolrClient`]: the reqwest-backed transport, plus search and optimize
//! - [`CircuitBreakingSink`]: per-call retries, a circuit breaker, and a
//!   retry queue that replays parked requests once the index recovers
//! - [`search`]: typed search queries and type-ahead suggestions

pub mod breaker;
pub mod client;
pub mod search;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use catalogsync_shared::{CatalogError, IndexDocument, Result, RetryConfig};

pub use breaker::{Admission, BreakerState, CircuitBreaker};
pub use client::{OptimizeReport, SolrClient};
pub use search::{
    GeoRadius, SearchFilter, SearchQuery, SearchResults, SortOrder, SuggestField, SuggestQuery,
    Suggestion, Suggestions,
};

// ---------------------------------------------------------------------------
// Requests and transport
// ---------------------------------------------------------------------------

/// One bulk upsert into one index core.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRequest {
    pub core: String,
    pub docs: Vec<IndexDocument>,
}

impl SinkRequest {
    /// Ids of the documents carried by this request.
    pub fn doc_ids(&self) -> Vec<String> {
        self.docs.iter().map(|d| d.id.clone()).collect()
    }
}

/// A successful answer from the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
    pub body: String,
}

/// Sends bulk requests to the index. Any error counts as a failed attempt.
pub trait IndexTransport: Send + Sync + 'static {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    fn send(&self, req: &SinkRequest) -> impl Future<Output = Result<SinkResponse>> + Send;
}

/// Per-call retry settings and the retry worker's polling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub worker_interval: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            delay: config.retry_delay(),
            worker_interval: config.worker_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakingSink
// ---------------------------------------------------------------------------

/// Wraps an [`IndexTransport`] so that no request is silently dropped.
///
/// A call is retried up to `max_attempts` times. When every attempt fails, or
/// when the circuit rejects the call outright, the request is parked in the
/// retry queue and the caller gets [`CatalogError::Deferred`] or
/// [`CatalogError::CircuitOpen`]. The retry worker replays parked requests
/// while the circuit is closed, and uses the oldest one as the half-open
/// probe once the cooldown has passed.
pub struct CircuitBreakingSink<T: IndexTransport> {
    transport: T,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    parked_tx: mpsc::UnboundedSender<SinkRequest>,
    parked_rx: Mutex<Option<mpsc::UnboundedReceiver<SinkRequest>>>,
    pending: AtomicUsize,
    replayed: Option<mpsc::UnboundedSender<SinkRequest>>,
    cancel: CancellationToken,
}

impl<T: IndexTransport> CircuitBreakingSink<T> {
    pub fn new(
        transport: T,
        breaker: CircuitBreaker,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let (parked_tx, parked_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            breaker,
            policy,
            parked_tx,
            parked_rx: Mutex::new(Some(parked_rx)),
            pending: AtomicUsize::new(0),
            replayed: None,
            cancel,
        }
    }

    /// Report every request that succeeds on replay to `tx`.
    pub fn with_replay_notifier(mut self, tx: mpsc::UnboundedSender<SinkRequest>) -> Self {
        self.replayed = Some(tx);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Requests currently parked in the retry queue.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Deliver `req`, parking it for later replay if delivery is not possible now.
    #[instrument(skip_all, fields(core = %req.core, docs = req.docs.len()))]
    pub async fn request(&self, req: SinkRequest) -> Result<SinkResponse> {
        match self.try_deliver(&req).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(error = %e, "delivery parked for retry");
                self.park(req);
                Err(e)
            }
        }
    }

    async fn try_deliver(&self, req: &SinkRequest) -> Result<SinkResponse> {
        match self.breaker.admit() {
            Admission::Rejected => Err(CatalogError::CircuitOpen {
                sink: self.transport.name().to_string(),
            }),
            Admission::Probe => match self.transport.send(req).await {
                Ok(response) => {
                    self.breaker.record_success();
                    Ok(response)
                }
                Err(e) => {
                    self.breaker.record_failure();
                    Err(CatalogError::Deferred {
                        attempts: 1,
                        last_error: e.to_string(),
                    })
                }
            },
            Admission::Allowed => {
                let mut attempts = 0;
                let mut last_error = String::new();

                while attempts < self.policy.max_attempts {
                    attempts += 1;
                    match self.transport.send(req).await {
                        Ok(response) => {
                            self.breaker.record_success();
                            if attempts > 1 {
                                debug!(attempts, "delivered after retry");
                            }
                            return Ok(response);
                        }
                        Err(e) => {
                            debug!(attempt = attempts, error = %e, "delivery attempt failed");
                            last_error = e.to_string();
                        }
                    }
                    if attempts < self.policy.max_attempts {
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(self.policy.delay) => {}
                        }
                    }
                }

                self.breaker.record_failure();
                Err(CatalogError::Deferred {
                    attempts,
                    last_error,
                })
            }
        }
    }

    fn park(&self, req: SinkRequest) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(req)) = self.parked_tx.send(req) {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            warn!(
                core = %req.core,
                docs = req.docs.len(),
                "retry worker gone; request left for startup recovery"
            );
        }
    }

    async fn replay(&self, req: SinkRequest) {
        match self.try_deliver(&req).await {
            Ok(_) => {
                debug!(core = %req.core, docs = req.docs.len(), "parked request delivered");
                if let Some(tx) = &self.replayed {
                    let _ = tx.send(req);
                }
            }
            Err(e) => {
                debug!(error = %e, "replay failed, re-parking");
                self.park(req);
            }
        }
    }

    /// Run the retry worker until the sink's cancellation token fires.
    ///
    /// Each interval: while the circuit is closed, replay the requests parked
    /// at that moment; while it is open and the cooldown has elapsed, replay
    /// only the oldest as the probe. Only one worker may run per sink.
    pub async fn run_retry_worker(self: Arc<Self>) -> Result<()> {
        let mut rx = self
            .parked_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| CatalogError::config("retry worker is already running"))?;

        info!(
            interval_ms = self.policy.worker_interval.as_millis() as u64,
            "retry worker started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.policy.worker_interval) => {}
            }

            match self.breaker.state() {
                BreakerState::Closed => {
                    let backlog = self.pending();
                    if backlog > 0 {
                        info!(backlog, "circuit closed, replaying parked requests");
                    }
                    for _ in 0..backlog {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        let Ok(req) = rx.try_recv() else { break };
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                        self.replay(req).await;
                    }
                }
                BreakerState::Open if self.breaker.probe_ready() => {
                    if let Ok(req) = rx.try_recv() {
                        self.pending.fetch_sub(1, Ordering::AcqRel);
                        self.replay(req).await;
                    }
                }
                _ => {}
            }
        }

        let parked = self.pending();
        if parked > 0 {
            warn!(parked, "retry worker stopped with parked requests");
        } else {
            info!("retry worker stopped");
        }
        Ok(())
    }
}
