//! Biblio Ingest - PubMed crawler with identity resolution

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use biblio_common::logging::{init_logging, LogConfig, LogLevel};
use biblio_ingest::db;
use biblio_ingest::fetch::{EutilsSource, RateLimitedFetchClient};
use biblio_ingest::mapping::PubmedXmlMapper;
use biblio_ingest::orchestrator::SeedSummary;
use biblio_ingest::progress::StatusCounts;
use biblio_ingest::search::parse_keyword_list;
use biblio_ingest::{CrawlSeed, IngestConfig, IngestEvent, IngestionOrchestrator, ProgressTracker, RunStats, SearchQuery};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "biblio-ingest")]
#[command(author, version, about = "Resumable PubMed ingestion with identity resolution")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQLite database URL (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search and ingest records, resuming any earlier progress
    Crawl(CrawlArgs),

    /// Show checkpoint counts, or one identifier's checkpoint
    Status {
        /// Identifier to inspect
        #[arg(long)]
        identifier: Option<String>,
    },
}

#[derive(Args, Debug)]
struct CrawlArgs {
    /// Search keywords; each gets its own resumable search
    keywords: Vec<String>,

    /// File with one keyword per line (`#` starts a comment)
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Explicit identifiers, comma separated
    #[arg(long, value_delimiter = ',')]
    ids: Vec<String>,

    /// Publication date lower bound (YYYY, YYYY/MM or YYYY/MM/DD)
    #[arg(long)]
    date_from: Option<String>,

    /// Publication date upper bound
    #[arg(long)]
    date_to: Option<String>,

    #[arg(long = "language")]
    languages: Vec<String>,

    #[arg(long = "publication-type")]
    publication_types: Vec<String>,

    #[arg(long = "journal")]
    journals: Vec<String>,

    #[arg(long = "author")]
    authors: Vec<String>,

    #[arg(long = "mesh")]
    mesh_terms: Vec<String>,

    /// Stop seeding after this many search hits
    #[arg(long)]
    max_results: Option<u64>,

    /// Directory for run_stats.json and events.jsonl
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Discard saved progress for this seed and reprocess it
    #[arg(long)]
    restart: bool,

    /// Fetch citation links for records without a reference list
    #[arg(long)]
    fetch_references: Option<bool>,

    /// Download PubMed Central full text for records with a PMC id
    #[arg(long)]
    fetch_fulltext: bool,

    /// Requeue identifiers that failed in earlier runs
    #[arg(long)]
    retry_failed: bool,

    /// Requeue records completed more than this many days ago
    #[arg(long, value_name = "DAYS")]
    refresh_older_than: Option<u32>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    batch_size: Option<u32>,
}

impl CrawlArgs {
    async fn seeds(&self) -> Result<Vec<CrawlSeed>> {
        let mut seeds = Vec::new();
        if !self.ids.is_empty() {
            seeds.push(CrawlSeed::Identifiers(self.ids.clone()));
        }

        let mut keywords: Vec<String> = Vec::new();
        for keyword in self.keywords.iter().map(|k| k.trim()).filter(|k| !k.is_empty()) {
            if !keywords.iter().any(|k| k == keyword) {
                keywords.push(keyword.to_string());
            }
        }
        if let Some(file) = &self.file {
            let text = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read keyword file {}", file.display()))?;
            for keyword in parse_keyword_list(&text) {
                if !keywords.contains(&keyword) {
                    keywords.push(keyword);
                }
            }
        }

        let filters = SearchQuery {
            keyword: String::new(),
            date_from: self.date_from.clone(),
            date_to: self.date_to.clone(),
            languages: self.languages.clone(),
            publication_types: self.publication_types.clone(),
            journals: self.journals.clone(),
            authors: self.authors.clone(),
            mesh_terms: self.mesh_terms.clone(),
        };
        if keywords.is_empty() {
            if !filters.is_empty() {
                seeds.push(CrawlSeed::Query(filters));
            }
        } else {
            seeds.extend(keywords.iter().map(|k| CrawlSeed::Query(filters.with_keyword(k.as_str()))));
        }

        if seeds.is_empty() {
            bail!("Provide keywords, --file, search filters, or --ids");
        }
        Ok(seeds)
    }

    fn apply(&self, config: &mut IngestConfig) {
        if let Some(max_results) = self.max_results {
            config.max_results = Some(max_results);
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(fetch_references) = self.fetch_references {
            config.fetch_references = fetch_references;
        }
        if self.fetch_fulltext {
            config.fetch_fulltext = true;
        }
        if self.retry_failed {
            config.retry_failed = true;
        }
        if let Some(days) = self.refresh_older_than {
            config.refresh_older_than_days = Some(days);
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
    }
}

/// Contents of `run_stats.json`.
#[derive(Debug, Serialize)]
struct RunReport {
    /// Checkpoints requeued by the staleness refresh
    refreshed: u64,
    seeds: Vec<SeedSummary>,
    stats: RunStats,
    queue: StatusCounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("biblio-ingest")
        .filter_directives("sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    let mut config = IngestConfig::from_env()?;
    if let Some(url) = &cli.database_url {
        config.db.url = url.clone();
    }

    match &cli.command {
        Command::Crawl(args) => {
            args.apply(&mut config);
            config.validate()?;
            crawl(&config, args).await
        }
        Command::Status { identifier } => status(&config, identifier.as_deref()).await,
    }
}

async fn crawl(config: &IngestConfig, args: &CrawlArgs) -> Result<()> {
    let seeds = args.seeds().await?;
    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("Failed to create output directory {}", config.output_dir.display()))?;

    let pool = db::connect(&config.db).await?;
    let source = EutilsSource::new(config.eutils.clone())?;
    if !source.has_api_key() {
        info!("No NCBI_API_KEY set, using the anonymous request budget");
    }
    let requests_per_second = NonZeroU32::new(config.requests_per_second)
        .context("BIBLIO_REQUESTS_PER_SECOND must be greater than 0")?;
    let client = RateLimitedFetchClient::new(Arc::new(source), requests_per_second, config.retry_policy());

    let mut orchestrator_config = config.orchestrator_config();
    orchestrator_config.restart = args.restart;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let events_task = tokio::spawn(write_events(config.output_dir.join("events.jsonl"), events_rx));

    let mut orchestrator = IngestionOrchestrator::new(
        pool.clone(),
        client,
        Arc::new(PubmedXmlMapper),
        config.resolution_settings(),
        orchestrator_config,
    )?
    .with_events(events_tx);

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current batch");
            cancel.cancel();
        }
    });

    let refreshed = match config.refresh_older_than_days {
        Some(days) => orchestrator.refresh_stale(chrono::Duration::days(i64::from(days))).await?,
        None => 0,
    };
    let mut seed_summaries = Vec::with_capacity(seeds.len());
    for seed in &seeds {
        seed_summaries.push(orchestrator.seed(seed).await?);
    }
    let stats = orchestrator.run().await?;
    let queue = orchestrator.tracker().counts().await?;

    // Closing the channel ends the event writer
    drop(orchestrator);
    events_task.await??;

    let report = RunReport {
        refreshed,
        seeds: seed_summaries,
        stats,
        queue,
    };
    let path = config.output_dir.join("run_stats.json");
    tokio::fs::write(&path, serde_json::to_string_pretty(&report)?)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Run {} finished", report.stats.run_id);
    println!(
        "  processed {}  completed {}  failed {}  skipped {}",
        report.stats.processed, report.stats.completed, report.stats.failed, report.stats.skipped
    );
    if config.fetch_fulltext {
        println!(
            "  full text stored {}  unavailable {}",
            report.stats.fulltext_stored, report.stats.fulltext_failed
        );
    }
    if report.refreshed > 0 {
        println!("  requeued {} stale records", report.refreshed);
    }
    println!(
        "  references resolved {}  stubs {}  back-filled {}  conflicts {}",
        report.stats.references_resolved,
        report.stats.reference_stubs,
        report.stats.stubs_backfilled,
        report.stats.conflicts
    );
    println!("  pending {}  failed in queue {}", report.queue.pending, report.queue.failed);
    if report.stats.cancelled {
        println!("  interrupted; rerun the same command to resume");
    }
    println!("Report written to {}", path.display());

    pool.close().await;
    Ok(())
}

async fn write_events(path: PathBuf, mut events: mpsc::UnboundedReceiver<IngestEvent>) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        file.write_all(&line).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn status(config: &IngestConfig, identifier: Option<&str>) -> Result<()> {
    let pool = db::connect(&config.db).await?;
    let tracker = ProgressTracker::new(pool.clone());

    match identifier {
        Some(identifier) => match tracker.checkpoint(identifier).await? {
            Some(checkpoint) => {
                println!("{}: {} (attempts {})", checkpoint.identifier, checkpoint.status, checkpoint.attempts);
                if let Some(error) = checkpoint.last_error {
                    println!("  last error: {}", error);
                }
                if let Some(completed_at) = checkpoint.completed_at {
                    println!("  completed at: {}", completed_at);
                }
            }
            None => println!("{}: not queued", identifier),
        },
        None => {
            let counts = tracker.counts().await?;
            println!("pending     {}", counts.pending);
            println!("in progress {}", counts.in_progress);
            println!("completed   {}", counts.completed);
            println!("failed      {}", counts.failed);
            println!("total       {}", counts.total());
        }
    }

    pool.close().await;
    Ok(())
}
