//! Application configuration for catalogsync.
//!
//! User config lives at `~/.catalogsync/catalogsync.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CatalogError, Result};
use crate::types::CollectionType;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "catalogsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".catalogsync";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "catalogsync.db";

// ---------------------------------------------------------------------------
// Config structs (matching catalogsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub solr: SolrConfig,

    /// Queue between the fetcher and the index sink.
    #[serde(default)]
    pub index_queue: QueueConfig,

    /// Queue between `submit` and the store.
    #[serde(default)]
    pub ingest_queue: QueueConfig,

    #[serde(default)]
    pub fetcher: FetcherConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// `[store]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. Defaults to `~/.catalogsync/catalogsync.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join(DB_FILE_NAME)),
        }
    }
}

/// `[solr]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolrConfig {
    /// Base URL of the Solr server, e.g. `http://localhost:8983/solr/`.
    #[serde(default = "default_solr_url")]
    pub base_url: String,

    #[serde(default)]
    pub cores: CoreNames,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Documents per bulk update request.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_optimize_retries")]
    pub optimize_retries: u32,

    #[serde(default = "default_optimize_retry_delay")]
    pub optimize_retry_delay_secs: u64,
}

impl Default for SolrConfig {
    fn default() -> Self {
        Self {
            base_url: default_solr_url(),
            cores: CoreNames::default(),
            request_timeout_secs: default_request_timeout(),
            chunk_size: default_chunk_size(),
            optimize_retries: default_optimize_retries(),
            optimize_retry_delay_secs: default_optimize_retry_delay(),
        }
    }
}

impl SolrConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn optimize_retry_delay(&self) -> Duration {
        Duration::from_secs(self.optimize_retry_delay_secs)
    }
}

fn default_solr_url() -> String {
    "http://localhost:8983/solr/".into()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_chunk_size() -> usize {
    500
}
fn default_optimize_retries() -> u32 {
    2
}
fn default_optimize_retry_delay() -> u64 {
    30
}

/// `[solr.cores]`: index core per collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreNames {
    #[serde(default = "default_grocery_core")]
    pub grocery: String,
    #[serde(default = "default_fnb_core")]
    pub fnb: String,
    #[serde(default = "default_electronics_core")]
    pub electronics: String,
}

impl Default for CoreNames {
    fn default() -> Self {
        Self {
            grocery: default_grocery_core(),
            fnb: default_fnb_core(),
            electronics: default_electronics_core(),
        }
    }
}

impl CoreNames {
    pub fn for_collection(&self, collection: CollectionType) -> &str {
        match collection {
            CollectionType::Grocery => &self.grocery,
            CollectionType::Fnb => &self.fnb,
            CollectionType::Electronics => &self.electronics,
        }
    }

    /// Every configured core, in collection order.
    pub fn all(&self) -> Vec<&str> {
        CollectionType::ALL
            .iter()
            .map(|c| self.for_collection(*c))
            .collect()
    }
}

fn default_grocery_core() -> String {
    "grocery".into()
}
fn default_fnb_core() -> String {
    "fnb".into()
}
fn default_electronics_core() -> String {
    "electronics".into()
}

/// `[index_queue]` / `[ingest_queue]` sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Capacity of the bounded FIFO; `enqueue` blocks beyond this.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Flush as soon as the batch holds this many items.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush a non-empty batch at least this often.
    #[serde(default = "default_batch_interval")]
    pub batch_interval_ms: u64,

    /// Sleep between attempts while the FIFO is full.
    #[serde(default = "default_enqueue_poll")]
    pub enqueue_poll_ms: u64,

    /// How long the drain loop waits for the next item before re-checking shutdown.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            batch_size: default_batch_size(),
            batch_interval_ms: default_batch_interval(),
            enqueue_poll_ms: default_enqueue_poll(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl QueueConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    pub fn enqueue_poll(&self) -> Duration {
        Duration::from_millis(self.enqueue_poll_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(CatalogError::config(format!(
                "[{section}] max_queue_size must be greater than zero"
            )));
        }
        if self.batch_size == 0 {
            return Err(CatalogError::config(format!(
                "[{section}] batch_size must be greater than zero"
            )));
        }
        if self.batch_size > self.max_queue_size {
            return Err(CatalogError::config(format!(
                "[{section}] batch_size ({}) exceeds max_queue_size ({})",
                self.batch_size, self.max_queue_size
            )));
        }
        if self.batch_interval_ms == 0 || self.enqueue_poll_ms == 0 || self.drain_timeout_ms == 0 {
            return Err(CatalogError::config(format!(
                "[{section}] intervals must be greater than zero"
            )));
        }
        Ok(())
    }
}

fn default_max_queue_size() -> usize {
    10_000
}
fn default_batch_size() -> usize {
    500
}
fn default_batch_interval() -> u64 {
    5_000
}
fn default_enqueue_poll() -> u64 {
    2_000
}
fn default_drain_timeout() -> u64 {
    1_000
}

/// `[fetcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
    /// Delay between fetch cycles.
    #[serde(default = "default_fetch_interval")]
    pub interval_ms: u64,

    /// Maximum documents claimed per cycle.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,

    /// Concurrent fetch cycles allowed.
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_fetch_interval(),
            fetch_limit: default_fetch_limit(),
            concurrency: default_fetch_concurrency(),
        }
    }
}

impl FetcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_fetch_interval() -> u64 {
    5_000
}
fn default_fetch_limit() -> usize {
    500
}
fn default_fetch_concurrency() -> usize {
    1
}

/// `[breaker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the circuit stays open before a half-open probe is allowed.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_timeout() -> u64 {
    20
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call before the request is parked.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// How often the retry worker checks the parked queue.
    #[serde(default = "default_worker_interval")]
    pub worker_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            worker_interval_ms: default_worker_interval(),
        }
    }
}

impl RetryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn worker_interval(&self) -> Duration {
        Duration::from_millis(self.worker_interval_ms)
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    5_000
}
fn default_worker_interval() -> u64 {
    1_000
}

/// `[transform]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Verify item/provider symbol URLs with a HEAD request.
    #[serde(default = "default_true")]
    pub check_urls: bool,

    #[serde(default = "default_url_timeout")]
    pub url_timeout_secs: u64,

    /// Length of every embedding vector.
    #[serde(default = "default_embedding_dims")]
    pub embedding_dims: usize,

    /// Maximum number of cached embeddings.
    #[serde(default = "default_embedding_cache")]
    pub embedding_cache_size: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            check_urls: true,
            url_timeout_secs: default_url_timeout(),
            embedding_dims: default_embedding_dims(),
            embedding_cache_size: default_embedding_cache(),
        }
    }
}

impl TransformConfig {
    pub fn url_timeout(&self) -> Duration {
        Duration::from_secs(self.url_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_url_timeout() -> u64 {
    5
}
fn default_embedding_dims() -> usize {
    384
}
fn default_embedding_cache() -> usize {
    10_000
}

/// `[concurrency]` section. Pools are sized as CPU count × multiplier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_flush_multiplier")]
    pub flush_multiplier: usize,

    #[serde(default = "default_transform_multiplier")]
    pub transform_multiplier: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            flush_multiplier: default_flush_multiplier(),
            transform_multiplier: default_transform_multiplier(),
        }
    }
}

impl ConcurrencyConfig {
    /// Permits for concurrent batch flushes.
    pub fn flush_permits(&self) -> usize {
        cpu_count() * self.flush_multiplier
    }

    /// Permits for concurrent per-document transform work.
    pub fn transform_permits(&self) -> usize {
        cpu_count() * self.transform_multiplier
    }
}

fn default_flush_multiplier() -> usize {
    1
}
fn default_transform_multiplier() -> usize {
    4
}

/// Number of CPUs available to this process (at least 1).
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `[shutdown]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for a loop before warning that it is slow to stop.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
        }
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

fn default_grace_period() -> u64 {
    3
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let base = Url::parse(&self.solr.base_url).map_err(|e| {
            CatalogError::config(format!(
                "[solr] base_url '{}' is not a valid URL: {e}",
                self.solr.base_url
            ))
        })?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(CatalogError::config(format!(
                "[solr] base_url must be http or https, got '{}'",
                base.scheme()
            )));
        }
        for core in self.solr.cores.all() {
            if core.trim().is_empty() {
                return Err(CatalogError::config("[solr.cores] core names must not be empty"));
            }
        }
        if self.solr.chunk_size == 0 {
            return Err(CatalogError::config("[solr] chunk_size must be greater than zero"));
        }

        self.index_queue.validate("index_queue")?;
        self.ingest_queue.validate("ingest_queue")?;

        if self.fetcher.fetch_limit == 0 || self.fetcher.concurrency == 0 {
            return Err(CatalogError::config(
                "[fetcher] fetch_limit and concurrency must be greater than zero",
            ));
        }
        if self.fetcher.interval_ms == 0 {
            return Err(CatalogError::config("[fetcher] interval_ms must be greater than zero"));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(CatalogError::config(
                "[breaker] failure_threshold must be greater than zero",
            ));
        }
        if self.retry.max_retries == 0 {
            return Err(CatalogError::config("[retry] max_retries must be greater than zero"));
        }
        if self.retry.worker_interval_ms == 0 {
            return Err(CatalogError::config(
                "[retry] worker_interval_ms must be greater than zero",
            ));
        }
        if self.transform.embedding_dims == 0 {
            return Err(CatalogError::config(
                "[transform] embedding_dims must be greater than zero",
            ));
        }
        if self.concurrency.flush_multiplier == 0 || self.concurrency.transform_multiplier == 0 {
            return Err(CatalogError::config(
                "[concurrency] multipliers must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.catalogsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| CatalogError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.catalogsync/catalogsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CatalogError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Write a default config file to `path` (or the default location).
/// Refuses to overwrite an existing file unless `force` is set.
pub fn init_config(path: Option<&Path>, force: bool) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if path.exists() && !force {
        return Err(CatalogError::config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| CatalogError::io(dir, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| CatalogError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CatalogError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("base_url"));
        assert!(toml_str.contains("failure_threshold"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.breaker.failure_threshold, 3);
        assert_eq!(parsed.retry.max_retries, 5);
        assert_eq!(parsed.solr.cores.fnb, "fnb");
        parsed.validate().expect("defaults are valid");
    }

    #[test]
    fn partial_sections_fill_defaults() {
        let toml_str = r#"
[index_queue]
batch_size = 50

[solr.cores]
grocery = "grocery_v2"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.index_queue.batch_size, 50);
        assert_eq!(config.index_queue.max_queue_size, 10_000);
        assert_eq!(
            config.solr.cores.for_collection(CollectionType::Grocery),
            "grocery_v2"
        );
        assert_eq!(config.solr.cores.for_collection(CollectionType::Fnb), "fnb");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.index_queue.batch_size = 0;
        assert!(config.validate().unwrap_err().to_string().contains("index_queue"));

        let mut config = AppConfig::default();
        config.ingest_queue.batch_size = config.ingest_queue.max_queue_size + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.solr.base_url = "not a url".into();
        assert!(config.validate().unwrap_err().to_string().contains("base_url"));

        let mut config = AppConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn permits_scale_with_cpus() {
        let concurrency = ConcurrencyConfig {
            flush_multiplier: 2,
            transform_multiplier: 3,
        };
        assert_eq!(concurrency.flush_permits(), cpu_count() * 2);
        assert_eq!(concurrency.transform_permits(), cpu_count() * 3);
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn init_config_refuses_overwrite() {
        let path = std::env::temp_dir()
            .join(format!("catalogsync_cfg_{}", uuid::Uuid::now_v7()))
            .join("catalogsync.toml");
        init_config(Some(&path), false).expect("first init");
        assert!(init_config(Some(&path), false).is_err());
        init_config(Some(&path), true).expect("forced init");
        let loaded = load_config_from(&path).expect("load");
        assert_eq!(loaded.shutdown.grace_period_secs, 3);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
