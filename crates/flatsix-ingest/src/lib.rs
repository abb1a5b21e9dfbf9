//! Ingestion pipeline: canonicalization, dedup, sold-window filtering, the
//! per-source run orchestrator and the run reporter.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Months, NaiveDate, NaiveDateTime, Utc};
use flatsix_adapters::{
    build_adapter, field_map, FetchMode, FetchParams, RawRecord, ScrapeServiceConfig,
    SourceConfig, SourceRegistry,
};
use flatsix_core::{
    is_well_formed_url, latest_model_year, CanonicalListing, ListingStatus, NormalizeReject,
    RejectReason, Source, EARLIEST_MODEL_YEAR, TRACKED_MAKE,
};
use flatsix_db::ListingStore;
use flatsix_storage::{CheckpointEnvelope, CheckpointStore, HttpClientConfig, HttpFetcher};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flatsix-ingest";

/// Immutable process configuration, constructed once at startup and passed
/// explicitly into every component. Nothing else reads the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub scrape_base_url: String,
    pub scrape_token: Option<String>,
    pub checkpoint_path: PathBuf,
    pub reports_dir: PathBuf,
    pub sources_file: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("FLATSIX_DATABASE_URL").ok(),
            scrape_base_url: std::env::var("FLATSIX_SCRAPE_BASE_URL")
                .unwrap_or_else(|_| "https://api.apify.com".to_string()),
            scrape_token: std::env::var("FLATSIX_SCRAPE_TOKEN").ok(),
            checkpoint_path: std::env::var("FLATSIX_CHECKPOINT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state/checkpoint.json")),
            reports_dir: std::env::var("FLATSIX_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            sources_file: std::env::var("FLATSIX_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("FLATSIX_USER_AGENT")
                .unwrap_or_else(|_| "flatsix-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("FLATSIX_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sync_cron: std::env::var("FLATSIX_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn scrape_service(&self) -> Option<ScrapeServiceConfig> {
        self.scrape_token.as_ref().map(|token| ScrapeServiceConfig {
            base_url: self.scrape_base_url.clone(),
            token: token.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    All,
    One(Source),
}

impl SourceSelector {
    pub fn parse(input: &str) -> Option<SourceSelector> {
        if input.trim().eq_ignore_ascii_case("all") {
            return Some(SourceSelector::All);
        }
        Source::parse(input).map(SourceSelector::One)
    }

    pub fn label(&self) -> String {
        match self {
            SourceSelector::All => "all".to_string(),
            SourceSelector::One(source) => source.key().to_string(),
        }
    }

    fn matches(&self, source: Source) -> bool {
        match self {
            SourceSelector::All => true,
            SourceSelector::One(wanted) => *wanted == source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub selector: SourceSelector,
    pub mode: FetchMode,
    pub limit: usize,
    pub dry_run: bool,
    pub fail_fast: bool,
    pub sold_only: bool,
    pub sold_within_months: Option<u32>,
    pub active_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub from: Option<Source>,
    pub resume: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            selector: SourceSelector::All,
            mode: FetchMode::Incremental,
            limit: 100,
            dry_run: false,
            fail_fast: false,
            sold_only: false,
            sold_within_months: None,
            active_only: false,
            since: None,
            from: None,
            resume: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunTotals {
    pub fetched: u64,
    pub normalized: u64,
    pub deduped: u64,
    pub inserted: u64,
    pub updated: u64,
    pub rejected: u64,
    pub errors: u64,
}

/// Aggregate record of one run, written once and never mutated after.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: FetchMode,
    pub sources: String,
    pub dry_run: bool,
    pub totals: RunTotals,
    pub rejection_reasons: BTreeMap<RejectReason, u64>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub report_path: PathBuf,
    pub rejects_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Canonicalization

fn year_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").expect("static regex"))
}

/// Probes ordered field aliases; dotted aliases descend into nested objects.
fn lookup<'a>(payload: &'a JsonValue, aliases: &[&str]) -> Option<&'a JsonValue> {
    for alias in aliases {
        let mut current = payload;
        let mut found = true;
        for segment in alias.split('.') {
            match current.get(segment) {
                Some(next) => current = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found && !current.is_null() {
            return Some(current);
        }
    }
    None
}

fn string_field(payload: &JsonValue, aliases: &[&str]) -> Option<String> {
    let value = lookup(payload, aliases)?;
    match value {
        JsonValue::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn int_field(payload: &JsonValue, aliases: &[&str]) -> Option<i64> {
    let value = lookup(payload, aliases)?;
    match value {
        JsonValue::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|f| f as i64)),
        JsonValue::String(text) => {
            let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    None
}

fn plausible_year(candidate: i64, now: DateTime<Utc>) -> Option<i32> {
    let year = i32::try_from(candidate).ok()?;
    (EARLIEST_MODEL_YEAR..=latest_model_year(now))
        .contains(&year)
        .then_some(year)
}

fn year_from_title(title: &str, now: DateTime<Utc>) -> Option<i32> {
    year_regex()
        .find_iter(title)
        .filter_map(|m| m.as_str().parse::<i64>().ok())
        .find_map(|candidate| plausible_year(candidate, now))
}

/// First word of the title after any leading year token and marque token.
fn model_from_title(title: &str, year: i32) -> Option<String> {
    let year_token = year.to_string();
    let mut tokens = title.split_whitespace().peekable();
    while let Some(&token) = tokens.peek() {
        if token == year_token || token.eq_ignore_ascii_case(TRACKED_MAKE) {
            tokens.next();
        } else {
            break;
        }
    }
    tokens.next().map(str::to_string)
}

/// Deterministic identifier for sources that publish none: repeat runs
/// against the same URL collapse to the same id.
fn derived_source_id(source: Source, source_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.key().as_bytes());
    hasher.update(b":");
    hasher.update(source_url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", source.key(), &digest[..16])
}

/// Maps free-text marketplace status vocabulary onto the canonical enum.
fn map_status(text: Option<&str>) -> ListingStatus {
    let Some(text) = text else {
        return ListingStatus::Draft;
    };
    let lower = text.to_ascii_lowercase();
    // "no sale" must win over the bare "sale"/"sold" substrings.
    if lower.contains("no sale") || lower.contains("reserve not met") || lower.contains("unsold") {
        return ListingStatus::Unsold;
    }
    if lower.contains("withdraw") || lower.contains("cancel") || lower.contains("delist") {
        return ListingStatus::Delisted;
    }
    if lower.contains("sold")
        || lower.contains("ended")
        || lower.contains("complete")
        || lower.contains("closed")
    {
        return ListingStatus::Sold;
    }
    if lower.contains("live") || lower.contains("active") || lower.contains("open") {
        return ListingStatus::Active;
    }
    ListingStatus::Draft
}

fn normalize_vin(raw: &str) -> Option<String> {
    let vin: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    (!vin.is_empty()).then_some(vin)
}

fn image_urls(payload: &JsonValue, aliases: &[&str]) -> Vec<String> {
    let Some(value) = lookup(payload, aliases) else {
        return Vec::new();
    };
    let candidates: Vec<String> = match value {
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        JsonValue::String(single) => vec![single.clone()],
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .filter(|url| is_well_formed_url(url))
        .collect()
}

/// Maps one raw record into the canonical schema or rejects it with a
/// structured reason. Expected-malformed input never produces an error
/// through any other channel than the returned reject.
pub fn normalize(
    source: Source,
    payload: &JsonValue,
    now: DateTime<Utc>,
) -> Result<CanonicalListing, NormalizeReject> {
    let map = field_map(source);
    let reject = |reason: RejectReason| NormalizeReject::new(source, reason, payload.clone());

    let title = string_field(payload, map.title);
    let source_url = string_field(payload, map.url);
    let (Some(title), Some(source_url)) = (title, source_url) else {
        return Err(reject(RejectReason::MissingRequiredFields)
            .with_details("no usable title or source_url field"));
    };

    // Domain scope: an explicit make field is authoritative; otherwise the
    // marque token must appear somewhere in the combined text.
    let explicit_make = string_field(payload, map.make);
    let marque = TRACKED_MAKE.to_ascii_lowercase();
    match &explicit_make {
        Some(make) => {
            if !make.to_ascii_lowercase().contains(&marque) {
                return Err(reject(RejectReason::NonDomainMatch)
                    .with_details(format!("make is {make:?}")));
            }
        }
        None => {
            let combined = format!(
                "{title} {}",
                string_field(payload, map.model).unwrap_or_default()
            );
            if !combined.to_ascii_lowercase().contains(&marque) {
                return Err(reject(RejectReason::NonDomainMatch)
                    .with_details("marque token absent from title/model text"));
            }
        }
    }

    let year = int_field(payload, map.year)
        .and_then(|candidate| plausible_year(candidate, now))
        .or_else(|| year_from_title(&title, now));
    let Some(year) = year else {
        return Err(reject(RejectReason::MissingYearOrModel).with_details("no plausible year"));
    };

    let model = string_field(payload, map.model).or_else(|| model_from_title(&title, year));
    let Some(model) = model else {
        return Err(reject(RejectReason::MissingYearOrModel).with_details("no model"));
    };

    let source_id =
        string_field(payload, map.id).unwrap_or_else(|| derived_source_id(source, &source_url));

    let status = map_status(string_field(payload, map.status).as_deref());
    let sale_date = string_field(payload, map.sale_date).and_then(|s| parse_date(&s));
    let scraped_at = string_field(payload, map.scraped_at)
        .and_then(|s| parse_date(&s))
        .unwrap_or(now);

    let candidate = CanonicalListing {
        source,
        source_id,
        source_url,
        make: TRACKED_MAKE.to_string(),
        model,
        year,
        title,
        status,
        sale_date,
        vin: string_field(payload, map.vin).and_then(|v| normalize_vin(&v)),
        hammer_price_usd: int_field(payload, map.hammer_price),
        current_bid_usd: int_field(payload, map.current_bid),
        final_price_usd: int_field(payload, map.final_price),
        bid_count: int_field(payload, map.bid_count),
        currency: string_field(payload, map.currency),
        mileage: int_field(payload, map.mileage),
        mileage_unit: string_field(payload, map.mileage_unit),
        city: string_field(payload, map.city),
        region: string_field(payload, map.region),
        country: string_field(payload, map.country),
        auction_house: string_field(payload, map.auction_house),
        description: string_field(payload, map.description),
        image_urls: image_urls(payload, map.images),
        raw: Some(payload.clone()),
        scraped_at,
    };

    let violations = candidate.validate(now);
    if !violations.is_empty() {
        return Err(reject(RejectReason::SchemaValidationFailed)
            .with_details(violations.join(", ")));
    }
    Ok(candidate)
}

// ---------------------------------------------------------------------------
// Dedup + sold-window filter

/// Collapses records sharing an identity key, keeping the first occurrence
/// per key in input order. Pure, no I/O.
pub fn dedupe(listings: Vec<CanonicalListing>) -> Vec<CanonicalListing> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|listing| {
            seen.insert((
                listing.source,
                listing.source_id.clone(),
                listing.source_url.clone(),
            ))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SoldWindow {
    pub sold_only: bool,
    pub sold_within_months: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    Reject(RejectReason),
}

const SOLD_TEXT_HINTS: [&str; 4] = ["sold", "ended", "complete", "closed"];
const RAW_STATUS_ALIASES: [&str; 4] = ["auctionStatus", "auction_status", "status", "state"];
const RAW_SALE_DATE_ALIASES: [&str; 7] = [
    "sale_date",
    "sold_at",
    "end_date",
    "ended_at",
    "auction_end",
    "endDate",
    "sold_date",
];
const RAW_SCRAPED_AT_ALIASES: [&str; 3] = ["scraped_at", "scrapedAt", "fetched_at"];

/// Marketplaces that never made it past canonical `draft` can still carry
/// sold-equivalent wording in the raw payload.
fn raw_status_is_sold(listing: &CanonicalListing) -> bool {
    let Some(raw) = &listing.raw else {
        return false;
    };
    let Some(text) = string_field(raw, &RAW_STATUS_ALIASES) else {
        return false;
    };
    let lower = text.to_ascii_lowercase();
    !lower.contains("no sale") && SOLD_TEXT_HINTS.iter().any(|hint| lower.contains(hint))
}

/// Resolution order: canonical sale date, raw date aliases, raw scrape
/// timestamp. The canonical `scraped_at` is deliberately not a fallback —
/// it always exists and would make `missing_sale_date` unreachable.
fn resolve_sale_date(listing: &CanonicalListing) -> Option<DateTime<Utc>> {
    if let Some(date) = listing.sale_date {
        return Some(date);
    }
    let raw = listing.raw.as_ref()?;
    string_field(raw, &RAW_SALE_DATE_ALIASES)
        .and_then(|s| parse_date(&s))
        .or_else(|| string_field(raw, &RAW_SCRAPED_AT_ALIASES).and_then(|s| parse_date(&s)))
}

/// Business-window predicate: "only sold" and "sold within the last N
/// months". With neither flag set everything is kept.
pub fn evaluate(listing: &CanonicalListing, window: &SoldWindow, now: DateTime<Utc>) -> Verdict {
    if !window.sold_only && window.sold_within_months.is_none() {
        return Verdict::Keep;
    }

    if window.sold_only
        && listing.status != ListingStatus::Sold
        && !raw_status_is_sold(listing)
    {
        return Verdict::Reject(RejectReason::NotSold);
    }

    if let Some(months) = window.sold_within_months {
        let Some(sale_date) = resolve_sale_date(listing) else {
            return Verdict::Reject(RejectReason::MissingSaleDate);
        };
        let cutoff = now.checked_sub_months(Months::new(months)).unwrap_or(now);
        if sale_date < cutoff {
            return Verdict::Reject(RejectReason::OutsideSoldWindow);
        }
    }

    Verdict::Keep
}

pub fn active_only_verdict(listing: &CanonicalListing) -> Verdict {
    if listing.status == ListingStatus::Active {
        Verdict::Keep
    } else {
        Verdict::Reject(RejectReason::NotActive)
    }
}

// ---------------------------------------------------------------------------
// Orchestrator

#[derive(Default)]
struct RunState {
    totals: RunTotals,
    histogram: BTreeMap<RejectReason, u64>,
    rejects: Vec<NormalizeReject>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl RunState {
    fn record_reject(&mut self, reject: NormalizeReject) {
        self.totals.rejected += 1;
        *self.histogram.entry(reject.reason).or_default() += 1;
        self.rejects.push(reject);
    }
}

fn filter_reject(listing: &CanonicalListing, reason: RejectReason) -> NormalizeReject {
    let raw = listing.raw.clone().unwrap_or_else(|| {
        json!({
            "source_id": listing.source_id,
            "source_url": listing.source_url,
        })
    });
    NormalizeReject::new(listing.source, reason, raw)
}

/// Drives the pipeline per source, accumulates totals, enforces fail-fast,
/// and hands the result to the reporter.
pub struct IngestPipeline {
    config: AppConfig,
    registry: SourceRegistry,
    http: HttpFetcher,
    store: Arc<dyn ListingStore>,
    checkpoints: CheckpointStore,
}

impl IngestPipeline {
    pub fn new(
        config: AppConfig,
        registry: SourceRegistry,
        store: Arc<dyn ListingStore>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let checkpoints = CheckpointStore::new(config.checkpoint_path.clone());
        Ok(Self {
            config,
            registry,
            http,
            store,
            checkpoints,
        })
    }

    pub async fn run(&self, opts: &RunOptions) -> Result<RunOutcome> {
        let run_id = opts
            .resume
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let started_at = Utc::now();
        let checkpoint = self.checkpoints.load().await;
        let scrape_service = self.config.scrape_service();

        let selected: Vec<&SourceConfig> = self
            .registry
            .sources
            .iter()
            .filter(|config| config.enabled && opts.selector.matches(config.source))
            .skip_while(|config| match opts.from {
                Some(from) => config.source != from,
                None => false,
            })
            .collect();
        info!(run_id = %run_id, sources = selected.len(), mode = %opts.mode, "run starting");

        let mut state = RunState::default();
        for config in selected {
            let result = self
                .ingest_source(
                    config,
                    opts,
                    &run_id,
                    &checkpoint,
                    scrape_service.as_ref(),
                    &mut state,
                )
                .instrument(info_span!("ingest_source", source = %config.source))
                .await;

            if let Err(err) = result {
                state.totals.errors += 1;
                error!(source = %config.source, error = %err, "source ingestion failed");
                state.errors.push(format!("{}: {err:#}", config.source));
                if opts.fail_fast {
                    return Err(err)
                        .with_context(|| format!("ingesting {} (fail-fast)", config.source));
                }
            }
        }

        let report = RunReport {
            run_id: run_id.clone(),
            started_at,
            finished_at: Utc::now(),
            mode: opts.mode,
            sources: opts.selector.label(),
            dry_run: opts.dry_run,
            totals: state.totals,
            rejection_reasons: state.histogram,
            errors: state.errors,
            warnings: state.warnings,
        };
        let (report_path, rejects_path) =
            write_report(&self.config.reports_dir, &report, &state.rejects)?;
        info!(run_id = %run_id, report = %report_path.display(), "run finished");

        Ok(RunOutcome {
            report,
            report_path,
            rejects_path,
        })
    }

    async fn ingest_source(
        &self,
        config: &SourceConfig,
        opts: &RunOptions,
        run_id: &str,
        checkpoint: &CheckpointEnvelope,
        scrape_service: Option<&ScrapeServiceConfig>,
        state: &mut RunState,
    ) -> Result<()> {
        let adapter = build_adapter(config, scrape_service)?;

        // Incremental runs without an explicit --since resume from the
        // checkpointed high-water mark.
        let since = opts.since.or_else(|| {
            (opts.mode == FetchMode::Incremental)
                .then(|| {
                    checkpoint
                        .sources
                        .get(config.source.key())
                        .map(|entry| entry.last_seen_at)
                })
                .flatten()
        });
        let params = FetchParams {
            mode: opts.mode,
            limit: opts.limit,
            since,
        };

        let raws = adapter
            .fetch(&self.http, &params)
            .await
            .with_context(|| format!("fetching {}", config.source))?;
        state.totals.fetched += raws.len() as u64;
        info!(source = %config.source, fetched = raws.len(), "fetch complete");

        self.process_records(config.source, &raws, opts, run_id, state)
            .await
    }

    async fn process_records(
        &self,
        source: Source,
        raws: &[RawRecord],
        opts: &RunOptions,
        run_id: &str,
        state: &mut RunState,
    ) -> Result<()> {
        let now = Utc::now();

        let mut listings = Vec::new();
        for raw in raws {
            match normalize(raw.source, &raw.payload, now) {
                Ok(listing) => listings.push(listing),
                Err(reject) => state.record_reject(reject),
            }
        }
        state.totals.normalized += listings.len() as u64;

        let before = listings.len();
        let listings = dedupe(listings);
        state.totals.deduped += (before - listings.len()) as u64;

        let window = SoldWindow {
            sold_only: opts.sold_only,
            sold_within_months: opts.sold_within_months,
        };

        for listing in listings {
            if opts.active_only {
                if let Verdict::Reject(reason) = active_only_verdict(&listing) {
                    state.record_reject(filter_reject(&listing, reason));
                    continue;
                }
            }
            if let Verdict::Reject(reason) = evaluate(&listing, &window, now) {
                state.record_reject(filter_reject(&listing, reason));
                continue;
            }

            let outcome = self
                .store
                .upsert(&listing, opts.dry_run)
                .await
                .with_context(|| format!("writing {}/{}", listing.source, listing.source_id))?;
            state.totals.inserted += u64::from(outcome.inserted);
            state.totals.updated += u64::from(outcome.updated);
            for warning in outcome.warnings {
                warn!(source = %source, source_id = %listing.source_id, %warning, "child write warning");
                state
                    .warnings
                    .push(format!("{}/{}: {warning}", source, listing.source_id));
            }

            // The cursor must never reference an unwritten record, so the
            // checkpoint moves only after a successful write. Dry runs leave
            // no durable trace.
            if !opts.dry_run {
                self.checkpoints
                    .update(source.key(), run_id, &listing.source_id, listing.scraped_at)
                    .await
                    .context("updating checkpoint")?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reporter

/// Serializes the aggregate report and the reject log to durable artifacts,
/// once per run.
pub fn write_report(
    root: &Path,
    report: &RunReport,
    rejects: &[NormalizeReject],
) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    let report_path = root.join(format!("{}.json", report.run_id));
    let report_json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    std::fs::write(&report_path, report_json)
        .with_context(|| format!("writing {}", report_path.display()))?;

    let rejects_dir = root.join("rejects");
    std::fs::create_dir_all(&rejects_dir)
        .with_context(|| format!("creating {}", rejects_dir.display()))?;
    let rejects_path = rejects_dir.join(format!("{}.jsonl", report.run_id));
    let mut lines = String::new();
    for reject in rejects {
        lines.push_str(&serde_json::to_string(reject).context("serializing reject")?);
        lines.push('\n');
    }
    std::fs::write(&rejects_path, lines)
        .with_context(|| format!("writing {}", rejects_path.display()))?;

    Ok((report_path, rejects_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flatsix_db::MemoryListingStore;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn bat_payload() -> JsonValue {
        json!({
            "id": 123,
            "title": "2004 Porsche 911 GT3",
            "url": "https://bringatrailer.com/listing/2004-porsche-911-gt3",
            "brand": "Porsche",
            "auctionStatus": "sold",
            "currentBid": 156000,
        })
    }

    #[test]
    fn bat_shaped_record_normalizes() {
        let listing = normalize(Source::BringATrailer, &bat_payload(), now()).expect("normalizes");
        assert_eq!(listing.source_id, "123");
        assert_eq!(listing.year, 2004);
        assert_eq!(listing.model, "911");
        assert_eq!(listing.make, "Porsche");
        assert_eq!(listing.status, ListingStatus::Sold);
        assert_eq!(listing.current_bid_usd, Some(156_000));
        assert!(listing.raw.is_some());
    }

    #[test]
    fn explicit_off_marque_make_rejects_regardless_of_title() {
        let mut payload = bat_payload();
        payload["brand"] = json!("Ferrari");
        let reject = normalize(Source::BringATrailer, &payload, now()).unwrap_err();
        assert_eq!(reject.reason, RejectReason::NonDomainMatch);
    }

    #[test]
    fn missing_marque_token_rejects_when_no_make_field() {
        let payload = json!({
            "title": "1994 Toyota Supra Twin Turbo",
            "url": "https://bringatrailer.com/listing/supra",
        });
        let reject = normalize(Source::BringATrailer, &payload, now()).unwrap_err();
        assert_eq!(reject.reason, RejectReason::NonDomainMatch);
    }

    #[test]
    fn missing_title_or_url_rejects() {
        let reject = normalize(Source::BringATrailer, &json!({"id": 5}), now()).unwrap_err();
        assert_eq!(reject.reason, RejectReason::MissingRequiredFields);
    }

    #[test]
    fn year_falls_back_to_the_title_token() {
        let payload = json!({
            "title": "2004 Porsche 911 GT3",
            "url": "https://bringatrailer.com/listing/gt3",
        });
        let listing = normalize(Source::BringATrailer, &payload, now()).expect("normalizes");
        assert_eq!(listing.year, 2004);
    }

    #[test]
    fn no_plausible_year_anywhere_rejects() {
        let payload = json!({
            "title": "Porsche 911 GT3 Clubsport",
            "url": "https://bringatrailer.com/listing/gt3-clubsport",
        });
        let reject = normalize(Source::BringATrailer, &payload, now()).unwrap_err();
        assert_eq!(reject.reason, RejectReason::MissingYearOrModel);
    }

    #[test]
    fn model_comes_from_title_after_year_and_marque() {
        let payload = json!({
            "title": "1987 Porsche 944 Turbo",
            "url": "https://bringatrailer.com/listing/944-turbo",
        });
        let listing = normalize(Source::BringATrailer, &payload, now()).expect("normalizes");
        assert_eq!(listing.model, "944");
    }

    #[test]
    fn derived_source_id_is_deterministic_and_namespaced() {
        let payload = json!({
            "title": "1973 Porsche 911 Carrera RS",
            "url": "https://www.pcarmarket.com/auction/carrera-rs/",
        });
        let first = normalize(Source::Pcarmarket, &payload, now()).expect("normalizes");
        let second = normalize(Source::Pcarmarket, &payload, now()).expect("normalizes");
        assert_eq!(first.source_id, second.source_id);
        assert!(first.source_id.starts_with("pcarmarket-"));
    }

    #[test]
    fn status_vocabulary_maps_by_substring() {
        assert_eq!(map_status(Some("Auction ended")), ListingStatus::Sold);
        assert_eq!(map_status(Some("Bidding complete")), ListingStatus::Sold);
        assert_eq!(map_status(Some("closed")), ListingStatus::Sold);
        assert_eq!(map_status(Some("No sale — reserve not met")), ListingStatus::Unsold);
        assert_eq!(map_status(Some("Withdrawn by seller")), ListingStatus::Delisted);
        assert_eq!(map_status(Some("cancelled")), ListingStatus::Delisted);
        assert_eq!(map_status(Some("Live auction")), ListingStatus::Active);
        assert_eq!(map_status(Some("???")), ListingStatus::Draft);
        assert_eq!(map_status(None), ListingStatus::Draft);
    }

    #[test]
    fn schema_violation_rejects_instead_of_erroring() {
        let payload = json!({
            "title": "2004 Porsche 911 GT3",
            "url": "javascript:void(0)",
        });
        let reject = normalize(Source::BringATrailer, &payload, now()).unwrap_err();
        assert_eq!(reject.reason, RejectReason::SchemaValidationFailed);
        assert!(reject.details.as_deref().unwrap().contains("source_url"));
    }

    #[test]
    fn vin_is_uppercased_and_stripped() {
        let mut payload = bat_payload();
        payload["vin"] = json!(" wp0ac299 74s692718 ");
        let listing = normalize(Source::BringATrailer, &payload, now()).expect("normalizes");
        assert_eq!(listing.vin.as_deref(), Some("WP0AC29974S692718"));
    }

    #[test]
    fn images_are_filtered_to_well_formed_urls() {
        let mut payload = bat_payload();
        payload["images"] = json!([
            "https://cdn.bringatrailer.com/gt3-1.jpg",
            "not-a-url",
            "https://cdn.bringatrailer.com/gt3-2.jpg",
        ]);
        let listing = normalize(Source::BringATrailer, &payload, now()).expect("normalizes");
        assert_eq!(listing.image_urls.len(), 2);
    }

    #[test]
    fn string_prices_lose_their_formatting() {
        let mut payload = bat_payload();
        payload["currentBid"] = json!("$156,000");
        let listing = normalize(Source::BringATrailer, &payload, now()).expect("normalizes");
        assert_eq!(listing.current_bid_usd, Some(156_000));
    }

    fn listing_with(source_id: &str, url: &str) -> CanonicalListing {
        let payload = json!({
            "id": source_id,
            "title": "2004 Porsche 911 GT3",
            "url": url,
            "brand": "Porsche",
        });
        normalize(Source::BringATrailer, &payload, now()).expect("normalizes")
    }

    #[test]
    fn dedupe_keeps_first_occurrence_and_order() {
        let a = listing_with("1", "https://bringatrailer.com/listing/a");
        let b = listing_with("2", "https://bringatrailer.com/listing/b");
        let mut a_dup = a.clone();
        a_dup.current_bid_usd = Some(1);

        let out = dedupe(vec![a.clone(), b.clone(), a_dup]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source_id, "1");
        assert_eq!(out[0].current_bid_usd, a.current_bid_usd);
        assert_eq!(out[1].source_id, "2");
    }

    #[test]
    fn sold_only_rejects_active_listings() {
        let mut listing = listing_with("1", "https://bringatrailer.com/listing/a");
        listing.status = ListingStatus::Active;
        listing.raw = None;
        let window = SoldWindow {
            sold_only: true,
            sold_within_months: None,
        };
        assert_eq!(
            evaluate(&listing, &window, now()),
            Verdict::Reject(RejectReason::NotSold)
        );
    }

    #[test]
    fn stale_sale_date_falls_outside_the_window() {
        let mut listing = listing_with("1", "https://bringatrailer.com/listing/a");
        listing.status = ListingStatus::Sold;
        listing.sale_date = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap());
        let window = SoldWindow {
            sold_only: true,
            sold_within_months: Some(12),
        };
        assert_eq!(
            evaluate(&listing, &window, now()),
            Verdict::Reject(RejectReason::OutsideSoldWindow)
        );
    }

    #[test]
    fn raw_ended_text_counts_as_sold_with_recent_scrape_timestamp() {
        let mut listing = listing_with("1", "https://bringatrailer.com/listing/a");
        listing.status = ListingStatus::Draft;
        listing.sale_date = None;
        listing.raw = Some(json!({
            "status": "ended",
            "scraped_at": "2026-02-20T10:00:00Z",
        }));
        let window = SoldWindow {
            sold_only: true,
            sold_within_months: Some(12),
        };
        assert_eq!(evaluate(&listing, &window, now()), Verdict::Keep);
    }

    #[test]
    fn unresolvable_sale_date_rejects() {
        let mut listing = listing_with("1", "https://bringatrailer.com/listing/a");
        listing.status = ListingStatus::Sold;
        listing.sale_date = None;
        listing.raw = Some(json!({"status": "sold"}));
        let window = SoldWindow {
            sold_only: false,
            sold_within_months: Some(6),
        };
        assert_eq!(
            evaluate(&listing, &window, now()),
            Verdict::Reject(RejectReason::MissingSaleDate)
        );
    }

    #[test]
    fn no_window_flags_keeps_everything() {
        let mut listing = listing_with("1", "https://bringatrailer.com/listing/a");
        listing.status = ListingStatus::Draft;
        assert_eq!(evaluate(&listing, &SoldWindow::default(), now()), Verdict::Keep);
    }

    #[test]
    fn active_only_rejects_terminal_listings() {
        let mut listing = listing_with("1", "https://bringatrailer.com/listing/a");
        listing.status = ListingStatus::Sold;
        assert_eq!(
            active_only_verdict(&listing),
            Verdict::Reject(RejectReason::NotActive)
        );
        listing.status = ListingStatus::Active;
        assert_eq!(active_only_verdict(&listing), Verdict::Keep);
    }

    #[test]
    fn report_and_reject_log_land_under_the_run_id() {
        let dir = tempdir().expect("tempdir");
        let report = RunReport {
            run_id: "run-test".into(),
            started_at: now(),
            finished_at: now(),
            mode: FetchMode::Sample,
            sources: "all".into(),
            dry_run: false,
            totals: RunTotals::default(),
            rejection_reasons: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        };
        let rejects = vec![NormalizeReject::new(
            Source::BringATrailer,
            RejectReason::NonDomainMatch,
            json!({"title": "Ferrari"}),
        )];

        let (report_path, rejects_path) =
            write_report(dir.path(), &report, &rejects).expect("write");
        assert_eq!(report_path, dir.path().join("run-test.json"));
        assert_eq!(rejects_path, dir.path().join("rejects/run-test.jsonl"));

        let text = std::fs::read_to_string(&rejects_path).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("non_domain_match"));
    }

    fn test_config(dir: &Path) -> AppConfig {
        AppConfig {
            database_url: None,
            scrape_base_url: "https://api.scrape.invalid".into(),
            scrape_token: None,
            checkpoint_path: dir.join("state/checkpoint.json"),
            reports_dir: dir.join("reports"),
            sources_file: dir.join("sources.yaml"),
            user_agent: "flatsix-test/0".into(),
            http_timeout_secs: 5,
            sync_cron: "0 0 6 * * *".into(),
        }
    }

    fn empty_registry() -> SourceRegistry {
        flatsix_adapters::parse_registry("sources: []").expect("registry")
    }

    #[tokio::test]
    async fn bat_record_flows_end_to_end_into_the_store() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryListingStore::new());
        let pipeline = IngestPipeline::new(
            test_config(dir.path()),
            empty_registry(),
            store.clone(),
        )
        .expect("pipeline");

        let raws = vec![RawRecord {
            source: Source::BringATrailer,
            payload: bat_payload(),
        }];
        let opts = RunOptions {
            sold_only: true,
            ..RunOptions::default()
        };
        let mut state = RunState::default();
        pipeline
            .process_records(Source::BringATrailer, &raws, &opts, "run-e2e", &mut state)
            .await
            .expect("process");

        assert_eq!(state.totals.inserted, 1);
        assert_eq!(state.totals.rejected, 0);
        assert!(store.get(Source::BringATrailer, "123").is_some());

        let envelope = CheckpointStore::new(dir.path().join("state/checkpoint.json"))
            .load()
            .await;
        assert_eq!(
            envelope.sources["bring-a-trailer"].last_cursor,
            "123"
        );
        assert_eq!(envelope.sources["bring-a-trailer"].run_id, "run-e2e");
    }

    #[tokio::test]
    async fn duplicate_raw_records_collapse_before_writing() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryListingStore::new());
        let pipeline =
            IngestPipeline::new(test_config(dir.path()), empty_registry(), store.clone())
                .expect("pipeline");

        let raws = vec![
            RawRecord {
                source: Source::BringATrailer,
                payload: bat_payload(),
            },
            RawRecord {
                source: Source::BringATrailer,
                payload: bat_payload(),
            },
        ];
        let mut state = RunState::default();
        pipeline
            .process_records(
                Source::BringATrailer,
                &raws,
                &RunOptions::default(),
                "run-dup",
                &mut state,
            )
            .await
            .expect("process");

        assert_eq!(state.totals.fetched, 0); // fetched is counted by the adapter path
        assert_eq!(state.totals.normalized, 2);
        assert_eq!(state.totals.deduped, 1);
        assert_eq!(state.totals.inserted, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_store_or_checkpoint() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryListingStore::new());
        let pipeline =
            IngestPipeline::new(test_config(dir.path()), empty_registry(), store.clone())
                .expect("pipeline");

        let raws = vec![RawRecord {
            source: Source::BringATrailer,
            payload: bat_payload(),
        }];
        let opts = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let mut state = RunState::default();
        pipeline
            .process_records(Source::BringATrailer, &raws, &opts, "run-dry", &mut state)
            .await
            .expect("process");

        assert_eq!(state.totals.inserted, 0);
        assert_eq!(state.totals.updated, 0);
        assert!(store.is_empty());
        assert!(!dir.path().join("state/checkpoint.json").exists());
    }

    #[tokio::test]
    async fn run_with_no_enabled_sources_still_writes_a_report() {
        let dir = tempdir().expect("tempdir");
        let pipeline = IngestPipeline::new(
            test_config(dir.path()),
            empty_registry(),
            Arc::new(MemoryListingStore::new()),
        )
        .expect("pipeline");

        let outcome = pipeline.run(&RunOptions::default()).await.expect("run");
        assert!(outcome.report_path.exists());
        assert!(outcome.rejects_path.exists());
        assert_eq!(outcome.report.totals, RunTotals::default());
    }

    #[tokio::test]
    async fn resume_reuses_the_given_run_id_for_artifacts() {
        let dir = tempdir().expect("tempdir");
        let pipeline = IngestPipeline::new(
            test_config(dir.path()),
            empty_registry(),
            Arc::new(MemoryListingStore::new()),
        )
        .expect("pipeline");

        let opts = RunOptions {
            resume: Some("run-resumed".into()),
            ..RunOptions::default()
        };
        let outcome = pipeline.run(&opts).await.expect("run");
        assert_eq!(outcome.report.run_id, "run-resumed");
        assert!(outcome.report_path.ends_with("run-resumed.json"));
    }

    #[tokio::test]
    async fn broken_source_is_skipped_unless_fail_fast() {
        // A scrape-job source with no credentials cannot build its adapter,
        // which exercises the per-source error path without any network.
        let registry = flatsix_adapters::parse_registry(
            r#"
sources:
  - source: bring-a-trailer
    display_name: Bring a Trailer
    enabled: true
    strategy: scrape-job
    actor_id: bat-porsche-listings
"#,
        )
        .expect("registry");

        let dir = tempdir().expect("tempdir");
        let pipeline = IngestPipeline::new(
            test_config(dir.path()),
            registry,
            Arc::new(MemoryListingStore::new()),
        )
        .expect("pipeline");

        let outcome = pipeline.run(&RunOptions::default()).await.expect("run");
        assert_eq!(outcome.report.totals.errors, 1);
        assert_eq!(outcome.report.errors.len(), 1);

        let opts = RunOptions {
            fail_fast: true,
            ..RunOptions::default()
        };
        assert!(pipeline.run(&opts).await.is_err());
    }

    #[test]
    fn selector_parses_all_and_single_sources() {
        assert_eq!(SourceSelector::parse("all"), Some(SourceSelector::All));
        assert_eq!(
            SourceSelector::parse("bring-a-trailer"),
            Some(SourceSelector::One(Source::BringATrailer))
        );
        assert_eq!(SourceSelector::parse("craigslist"), None);
    }
}
