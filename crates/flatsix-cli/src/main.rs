use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use flatsix_adapters::{load_registry, FetchMode, FetchStrategy, SourceRegistry};
use flatsix_core::Source;
use flatsix_db::{ListingStore, MemoryListingStore, PostgresListingStore};
use flatsix_ingest::{AppConfig, IngestPipeline, RunOptions, RunOutcome, SourceSelector};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flatsix")]
#[command(about = "Porsche auction listing ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print the report path
    Ingest(IngestArgs),
    /// Apply database migrations
    Migrate,
    /// Keep running ingestion passes on the configured cron schedule
    Schedule(IngestArgs),
}

#[derive(Debug, Clone, Args)]
struct IngestArgs {
    /// One tracked source key, or "all"
    #[arg(long, default_value = "all")]
    source: String,

    /// sample | incremental | backfill
    #[arg(long, default_value = "incremental")]
    mode: String,

    /// Cap on raw records per source
    #[arg(long, default_value_t = 100)]
    limit: usize,

    /// Run the whole pipeline without writing anywhere
    #[arg(long)]
    dry_run: bool,

    /// Abort the entire run on the first per-source error
    #[arg(long)]
    fail_fast: bool,

    /// Keep only listings that actually sold
    #[arg(long)]
    sold_only: bool,

    /// Keep only listings sold within the last N months
    #[arg(long)]
    sold_within_months: Option<u32>,

    /// Keep only listings still live
    #[arg(long)]
    active_only: bool,

    /// Lower date bound for fetching (RFC3339 or YYYY-MM-DD)
    #[arg(long)]
    since: Option<String>,

    /// Resume the source list from this source key
    #[arg(long)]
    from: Option<String>,

    /// Reuse a prior run id for report artifacts
    #[arg(long)]
    resume: Option<String>,
}

fn parse_since(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }
    bail!("unparseable --since value {input:?}, expected RFC3339 or YYYY-MM-DD");
}

fn run_options(args: &IngestArgs) -> Result<RunOptions> {
    let selector = SourceSelector::parse(&args.source)
        .with_context(|| format!("unknown source {:?}", args.source))?;
    let mode = FetchMode::parse(&args.mode)
        .with_context(|| format!("unknown mode {:?}, expected sample|incremental|backfill", args.mode))?;
    let since = args.since.as_deref().map(parse_since).transpose()?;
    let from = args
        .from
        .as_deref()
        .map(|key| Source::parse(key).with_context(|| format!("unknown --from source {key:?}")))
        .transpose()?;

    Ok(RunOptions {
        selector,
        mode,
        limit: args.limit,
        dry_run: args.dry_run,
        fail_fast: args.fail_fast,
        sold_only: args.sold_only,
        sold_within_months: args.sold_within_months,
        active_only: args.active_only,
        since,
        from,
        resume: args.resume.clone(),
    })
}

/// Missing credentials fail before any source is processed. Dry-run
/// tolerates a missing database URL; nothing tolerates a missing scrape
/// token when a scrape-job source is selected.
fn validate_credentials(
    config: &AppConfig,
    registry: &SourceRegistry,
    opts: &RunOptions,
) -> Result<()> {
    let needs_scrape_token = registry.sources.iter().any(|source| {
        source.enabled
            && source.strategy == FetchStrategy::ScrapeJob
            && match &opts.selector {
                SourceSelector::All => true,
                SourceSelector::One(wanted) => source.source == *wanted,
            }
    });
    if needs_scrape_token && config.scrape_token.is_none() {
        bail!("FLATSIX_SCRAPE_TOKEN is required for the selected scrape-job sources");
    }
    if config.database_url.is_none() && !opts.dry_run {
        bail!("FLATSIX_DATABASE_URL is required outside --dry-run");
    }
    Ok(())
}

async fn select_store(config: &AppConfig, dry_run: bool) -> Result<Arc<dyn ListingStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresListingStore::connect(url)
                .await
                .context("connecting to the listings database")?;
            Ok(Arc::new(store))
        }
        None if dry_run => Ok(Arc::new(MemoryListingStore::new())),
        None => bail!("FLATSIX_DATABASE_URL is required outside --dry-run"),
    }
}

async fn run_ingest(config: &AppConfig, opts: &RunOptions) -> Result<RunOutcome> {
    let registry = load_registry(&config.sources_file)?;
    validate_credentials(config, &registry, opts)?;
    let store = select_store(config, opts.dry_run).await?;
    let pipeline = IngestPipeline::new(config.clone(), registry, store)?;
    pipeline.run(opts).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Ingest(args) => {
            let opts = run_options(&args)?;
            let outcome = run_ingest(&config, &opts).await?;
            println!("{}", outcome.report_path.display());
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .clone()
                .context("FLATSIX_DATABASE_URL is required for migrate")?;
            let store = PostgresListingStore::connect(&url)
                .await
                .context("connecting to the listings database")?;
            store.run_migrations().await.context("applying migrations")?;
            eprintln!("migrations applied");
        }
        Commands::Schedule(args) => {
            let opts = run_options(&args)?;
            let config = Arc::new(config);
            let opts = Arc::new(opts);
            let cron = config.sync_cron.clone();

            let scheduler = JobScheduler::new().await.context("creating scheduler")?;
            let job = Job::new_async(cron.as_str(), move |_id, _lock| {
                let config = config.clone();
                let opts = opts.clone();
                Box::pin(async move {
                    match run_ingest(&config, &opts).await {
                        Ok(outcome) => {
                            info!(report = %outcome.report_path.display(), "scheduled run finished");
                        }
                        Err(err) => {
                            error!(error = %format!("{err:#}"), "scheduled run failed");
                        }
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            scheduler.add(job).await.context("adding scheduler job")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
