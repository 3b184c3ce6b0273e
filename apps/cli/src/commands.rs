//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use catalogsync_core::{
    BatchingQueue, Pipeline, QueueOptions, StoreFlush, SubmitOutcome, SubmitProgress,
    confirm_stored, export_csv, status_report, submit_ndjson,
};
use catalogsync_shared::{
    AppConfig, CollectionType, DocumentStatus, Projection, TimeRange, init_config, load_config,
    load_config_from, parse_iso_timestamp,
};
use catalogsync_sink::{GeoRadius, SearchFilter, SearchQuery, SolrClient, SortOrder};
use catalogsync_storage::Storage;
use catalogsync_transform::{Embedder, HashEmbedder};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// catalogsync: ingest product records and publish them to the search index.
#[derive(Parser)]
#[command(
    name = "catalogsync",
    version,
    about = "Ingest product records, enrich them, and publish them to Solr.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.catalogsync/catalogsync.toml).
    #[arg(long, env = "CATALOGSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the pipeline until interrupted (Ctrl-C).
    Run {
        /// Log pipeline metrics this often, in seconds.
        #[arg(long, default_value = "30")]
        metrics_every: u64,
    },

    /// Submit records from a newline-delimited JSON file ("-" for stdin).
    Submit {
        /// NDJSON file, one record per line.
        file: String,
    },

    /// List documents in a status.
    List {
        /// Status to list: NEW, QUEUED, ERRORED or INDEXED.
        #[arg(short, long, default_value = "NEW")]
        status: DocumentStatus,

        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Documents to skip (for paging).
        #[arg(long, default_value = "0")]
        skip: usize,

        /// Print full documents as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Show document counts per status and collection.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Export documents in a status as CSV.
    Export {
        #[arg(short, long, default_value = "ERRORED")]
        status: DocumentStatus,

        /// Earliest createdAt (ISO-8601), inclusive.
        #[arg(long)]
        from: Option<String>,

        /// Latest createdAt (ISO-8601), inclusive.
        #[arg(long)]
        to: Option<String>,

        /// Output file (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Search one collection's core.
    Search {
        /// Free-text query.
        text: String,

        #[arg(short, long)]
        collection: CollectionType,

        #[arg(long)]
        provider_status: Option<String>,

        #[arg(long)]
        item_status: Option<String>,

        /// Restrict to these domains (repeatable).
        #[arg(long = "domain")]
        domains: Vec<String>,

        /// Restrict to these category ids (repeatable).
        #[arg(long = "category")]
        categories: Vec<String>,

        /// Restrict to these provider names (repeatable).
        #[arg(long = "provider")]
        providers: Vec<String>,

        /// Selling price range as MIN,MAX.
        #[arg(long, value_parser = parse_range)]
        price: Option<(f64, f64)>,

        /// Discount percentage range as MIN,MAX.
        #[arg(long, value_parser = parse_range)]
        discount: Option<(f64, f64)>,

        /// Location filter as LAT,LON,RADIUS_KM.
        #[arg(long, value_parser = parse_geo)]
        near: Option<GeoRadius>,

        /// relevance, distance-low-to-high, distance-high-to-low,
        /// price-low-to-high or price-high-to-low.
        #[arg(long, default_value = "relevance")]
        sort: SortOrder,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "10")]
        rows: u32,

        /// Skip the vector clauses and search text only.
        #[arg(long)]
        no_vector: bool,
    },

    /// Type-ahead suggestions for item and provider names.
    Suggest {
        /// Prefix or partial name.
        text: String,

        #[arg(short, long)]
        collection: CollectionType,

        /// Location filter as LAT,LON,RADIUS_KM.
        #[arg(long, value_parser = parse_geo)]
        near: Option<GeoRadius>,
    },

    /// Merge every core down to a single segment.
    Optimize,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show resolved configuration.
    Show,
}

fn parse_range(s: &str) -> std::result::Result<(f64, f64), String> {
    let (min, max) = s
        .split_once(',')
        .ok_or_else(|| format!("expected MIN,MAX, got '{s}'"))?;
    let min = min.trim().parse().map_err(|e| format!("invalid minimum: {e}"))?;
    let max = max.trim().parse().map_err(|e| format!("invalid maximum: {e}"))?;
    Ok((min, max))
}

fn parse_geo(s: &str) -> std::result::Result<GeoRadius, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [lat, lon, radius] = parts.as_slice() else {
        return Err(format!("expected LAT,LON,RADIUS_KM, got '{s}'"));
    };
    Ok(GeoRadius {
        lat: lat.parse().map_err(|e| format!("invalid latitude: {e}"))?,
        lon: lon.parse().map_err(|e| format!("invalid longitude: {e}"))?,
        radius_km: radius.parse().map_err(|e| format!("invalid radius: {e}"))?,
    })
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "catalogsync=info",
        1 => "catalogsync=debug",
        _ => "catalogsync=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { metrics_every } => {
            cmd_run(&load(config_path)?, Duration::from_secs(metrics_every.max(1))).await
        }
        Command::Submit { file } => cmd_submit(&load(config_path)?, &file).await,
        Command::List {
            status,
            limit,
            skip,
            json,
        } => cmd_list(&load(config_path)?, status, limit, skip, json).await,
        Command::Status { json } => cmd_status(&load(config_path)?, json).await,
        Command::Export {
            status,
            from,
            to,
            out,
        } => {
            let range = TimeRange {
                from: from.as_deref().map(parse_bound).transpose()?,
                to: to.as_deref().map(parse_bound).transpose()?,
            };
            cmd_export(&load(config_path)?, status, range, out.as_deref()).await
        }
        Command::Search {
            text,
            collection,
            provider_status,
            item_status,
            domains,
            categories,
            providers,
            price,
            discount,
            near,
            sort,
            page,
            rows,
            no_vector,
        } => {
            let mut query = SearchQuery::new(text);
            query.filters.extend(provider_status.map(SearchFilter::ProviderStatus));
            query.filters.extend(item_status.map(SearchFilter::ItemStatus));
            if !domains.is_empty() {
                query.filters.push(SearchFilter::Domains(domains));
            }
            if !categories.is_empty() {
                query.filters.push(SearchFilter::Categories(categories));
            }
            if !providers.is_empty() {
                query.filters.push(SearchFilter::ProviderNames(providers));
            }
            if let Some((min, max)) = price {
                query.filters.push(SearchFilter::SellingPrice { min, max });
            }
            if let Some((min, max)) = discount {
                query.filters.push(SearchFilter::DiscountPercentage { min, max });
            }
            query.geo = near;
            query.sort = sort;
            query.page = page;
            query.rows = rows;
            cmd_search(&load(config_path)?, collection, &query, !no_vector).await
        }
        Command::Suggest {
            text,
            collection,
            near,
        } => cmd_suggest(&load(config_path)?, collection, &text, near).await,
        Command::Optimize => cmd_optimize(&load(config_path)?).await,
        Command::Config { action } => match action {
            ConfigAction::Init { force } => cmd_config_init(config_path, force),
            ConfigAction::Show => cmd_config_show(&load(config_path)?),
        },
    }
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    config.validate()?;
    Ok(config)
}

fn parse_bound(value: &str) -> Result<chrono::DateTime<chrono::Utc>> {
    parse_iso_timestamp(value).ok_or_else(|| eyre!("invalid ISO-8601 timestamp '{value}'"))
}

async fn open_readonly(config: &AppConfig) -> Result<Storage> {
    let path = config.store.resolve_path()?;
    Storage::open_readonly(&path)
        .await
        .wrap_err("no document store yet; run `catalogsync submit` or `catalogsync run` first")
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, metrics_every: Duration) -> Result<()> {
    info!(
        solr = %config.solr.base_url,
        store = %config.store.resolve_path()?.display(),
        "starting pipeline"
    );
    let pipeline = Pipeline::from_config(config).await?;

    let mut ticker = tokio::time::interval(metrics_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
                }
                break;
            }
            _ = ticker.tick() => {
                let m = pipeline.metrics();
                info!(
                    index_backlog = m.index_backlog,
                    ingest_backlog = m.ingest_backlog,
                    parked = m.parked,
                    breaker = m.breaker.as_str(),
                    indexed = m.indexed_items,
                    ingested = m.ingested_items,
                    "pipeline metrics"
                );
            }
        }
    }

    info!("interrupt received, shutting down");
    pipeline.shutdown().await;
    Ok(())
}

async fn cmd_submit(config: &AppConfig, file: &str) -> Result<()> {
    let storage = Arc::new(Storage::open(&config.store.resolve_path()?).await?);
    let queue = BatchingQueue::start(
        "ingest",
        QueueOptions::from_config(&config.ingest_queue, config.concurrency.flush_permits()),
        StoreFlush::new(Arc::clone(&storage)),
    );

    let progress = CliProgress::new();
    let result = if file == "-" {
        submit_ndjson(BufReader::new(tokio::io::stdin()), &queue, &progress).await
    } else {
        let input = tokio::fs::File::open(file)
            .await
            .wrap_err_with(|| format!("cannot open '{file}'"))?;
        submit_ndjson(BufReader::new(input), &queue, &progress).await
    };
    // Flush whatever was accepted even if reading failed part-way.
    queue.shutdown().await;
    progress.finish();
    let report = result?;
    confirm_stored(&queue).wrap_err("submission was accepted but not fully stored")?;

    println!();
    println!("  Accepted: {}", report.acked);
    println!("  Rejected: {}", report.nacked.len());
    for (line, reason) in report.nacked.iter().take(20) {
        println!("    line {line}: {reason}");
    }
    if report.nacked.len() > 20 {
        println!("    ... and {} more", report.nacked.len() - 20);
    }
    println!();
    Ok(())
}

async fn cmd_list(
    config: &AppConfig,
    status: DocumentStatus,
    limit: usize,
    skip: usize,
    json: bool,
) -> Result<()> {
    let storage = open_readonly(config).await?;
    let docs = storage
        .fetch_page(status, limit, skip, Projection::Summary)
        .await?;

    if json {
        for doc in &docs {
            println!("{}", serde_json::to_string(doc)?);
        }
        return Ok(());
    }

    if docs.is_empty() {
        println!("No {status} documents.");
        return Ok(());
    }
    for doc in &docs {
        println!(
            "{}  {:<11}  {:<8}  {}  {}",
            doc.id,
            doc.collection_type,
            doc.status,
            doc.updated_at.format("%Y-%m-%d %H:%M:%S"),
            doc.error.as_deref().unwrap_or(&doc.record.item_name),
        );
    }
    Ok(())
}

async fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let storage = open_readonly(config).await?;
    let report = status_report(&storage).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    for (status, count) in &report.totals {
        println!("  {:<8} {count}", status.as_str());
    }
    if !report.by_collection.is_empty() {
        println!();
        for c in &report.by_collection {
            println!("  {:<8} {:<11} {}", c.status.as_str(), c.collection_type, c.count);
        }
    }
    println!();
    Ok(())
}

async fn cmd_export(
    config: &AppConfig,
    status: DocumentStatus,
    range: TimeRange,
    out: Option<&Path>,
) -> Result<()> {
    let storage = open_readonly(config).await?;

    let rows = match out {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .wrap_err_with(|| format!("cannot create '{}'", path.display()))?;
            let mut writer = BufWriter::new(file);
            let rows = export_csv(&storage, status, range, &mut writer).await?;
            writer.shutdown().await?;
            rows
        }
        None => {
            let mut writer = BufWriter::new(tokio::io::stdout());
            export_csv(&storage, status, range, &mut writer).await?
        }
    };

    info!(rows, %status, "exported");
    if let Some(path) = out {
        eprintln!("Exported {rows} {status} documents to {}", path.display());
    }
    Ok(())
}

async fn cmd_search(
    config: &AppConfig,
    collection: CollectionType,
    query: &SearchQuery,
    with_vector: bool,
) -> Result<()> {
    query.validate()?;
    let client = SolrClient::new(&config.solr)?;

    let vector = if with_vector {
        let embedder = HashEmbedder::new(config.transform.embedding_dims)?;
        Some(embedder.embed(&query.text)?)
    } else {
        None
    };

    let results = client.search(collection, query, vector.as_deref()).await?;
    println!(
        "{} matches (page {}, {} per page)",
        results.num_found, query.page, query.rows
    );
    for doc in &results.docs {
        println!("{}", serde_json::to_string(doc)?);
    }
    Ok(())
}

async fn cmd_suggest(
    config: &AppConfig,
    collection: CollectionType,
    text: &str,
    near: Option<GeoRadius>,
) -> Result<()> {
    let client = SolrClient::new(&config.solr)?;
    let (items, providers) = client.suggest_names(collection, text, near).await?;

    for (label, suggestions) in [("Items", &items), ("Providers", &providers)] {
        println!("{label} ({} matches)", suggestions.matches);
        for s in &suggestions.docs {
            match &s.payload {
                Some(payload) => println!("  {}  [{payload}]", s.suggest),
                None => println!("  {}", s.suggest),
            }
        }
    }
    Ok(())
}

async fn cmd_optimize(config: &AppConfig) -> Result<()> {
    let client = SolrClient::new(&config.solr)?;
    let cancel = CancellationToken::new();

    let spinner = spinner("Optimizing cores");
    let report = tokio::select! {
        report = client.optimize_all(
            config.solr.optimize_retries,
            config.solr.optimize_retry_delay(),
            &cancel,
        ) => report,
        _ = tokio::signal::ctrl_c() => {
            spinner.finish_and_clear();
            return Err(eyre!("interrupted"));
        }
    };
    spinner.finish_and_clear();

    println!("  Optimized: {}", report.optimized.join(", "));
    if !report.failed.is_empty() {
        return Err(eyre!(
            "optimization failed for {} after {} attempts",
            report.failed.join(", "),
            report.attempts
        ));
    }
    Ok(())
}

fn cmd_config_init(path: Option<&Path>, force: bool) -> Result<()> {
    let path = init_config(path, force)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(
            style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Submission progress on an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        Self {
            spinner: spinner("Submitting records"),
        }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl SubmitProgress for CliProgress {
    fn submitted(&self, line: usize, outcome: &SubmitOutcome) {
        match outcome {
            SubmitOutcome::Ack { id } => self
                .spinner
                .set_message(format!("Submitting [line {line}] {id}")),
            SubmitOutcome::Nack { reason, .. } => self
                .spinner
                .set_message(format!("Rejected [line {line}] {reason}")),
        }
    }
}
