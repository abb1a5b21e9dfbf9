//! Source adapter contracts + the two interchangeable fetch strategies:
//! delegated scrape-job fetch and direct HTML fetch+parse.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flatsix_core::Source;
use flatsix_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "flatsix-adapters";

/// Fetch mode changes pagination depth and date range, never record shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Sample,
    Incremental,
    Backfill,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Sample => "sample",
            FetchMode::Incremental => "incremental",
            FetchMode::Backfill => "backfill",
        }
    }

    pub fn parse(input: &str) -> Option<FetchMode> {
        match input.trim().to_ascii_lowercase().as_str() {
            "sample" => Some(FetchMode::Sample),
            "incremental" => Some(FetchMode::Incremental),
            "backfill" => Some(FetchMode::Backfill),
            _ => None,
        }
    }

    fn page_depth(self) -> usize {
        match self {
            FetchMode::Sample => 1,
            FetchMode::Incremental => 3,
            FetchMode::Backfill => 25,
        }
    }
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchParams {
    pub mode: FetchMode,
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
}

/// Raw, untyped upstream record tagged with its origin. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: Source,
    pub payload: JsonValue,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("scrape job failed: {0}")]
    Job(String),
    #[error("{0}")]
    Message(String),
}

/// One external marketplace under the fetch contract. Empty results are
/// `Ok`; errors mean unrecoverable transport failure and are left to the
/// orchestrator's fail-fast decision.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        params: &FetchParams,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    ScrapeJob,
    Html,
}

fn default_page_param() -> String {
    "page".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    pub display_name: String,
    pub enabled: bool,
    pub strategy: FetchStrategy,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub detail_path_prefixes: Vec<String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn config_for(&self, source: Source) -> Option<&SourceConfig> {
        self.sources.iter().find(|c| c.source == source)
    }
}

pub fn load_registry(path: impl AsRef<Path>) -> anyhow::Result<SourceRegistry> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_registry(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn parse_registry(text: &str) -> anyhow::Result<SourceRegistry> {
    Ok(serde_yaml::from_str(text)?)
}

/// Connection details for the managed scraping service.
#[derive(Debug, Clone)]
pub struct ScrapeServiceConfig {
    pub base_url: String,
    pub token: String,
}

/// Builds the adapter for one configured source. Scrape-job sources need
/// service credentials; missing ones are a startup error, not a fetch error.
pub fn build_adapter(
    config: &SourceConfig,
    scrape_service: Option<&ScrapeServiceConfig>,
) -> anyhow::Result<Box<dyn SourceAdapter>> {
    match config.strategy {
        FetchStrategy::ScrapeJob => {
            let service = scrape_service.with_context(|| {
                format!("source {} requires scrape service credentials", config.source)
            })?;
            let actor_id = config.actor_id.clone().with_context(|| {
                format!("source {} uses scrape-job strategy but has no actor_id", config.source)
            })?;
            Ok(Box::new(ScrapeJobAdapter::new(
                config.source,
                actor_id,
                service.clone(),
            )))
        }
        FetchStrategy::Html => {
            if config.listing_urls.is_empty() {
                anyhow::bail!("source {} uses html strategy but has no listing_urls", config.source);
            }
            Ok(Box::new(HtmlScrapeAdapter {
                source: config.source,
                listing_urls: config.listing_urls.clone(),
                detail_path_prefixes: config.detail_path_prefixes.clone(),
                page_param: config.page_param.clone(),
            }))
        }
    }
}

const JOB_SUBMIT_ATTEMPTS: usize = 3;
const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
const JOB_MAX_POLLS: usize = 120;

/// Delegated-fetch strategy: submit a job to the managed scraping actor,
/// wait for it to finish, read its output dataset.
pub struct ScrapeJobAdapter {
    source: Source,
    actor_id: String,
    service: ScrapeServiceConfig,
    poll_interval: Duration,
    max_polls: usize,
}

impl ScrapeJobAdapter {
    pub fn new(source: Source, actor_id: String, service: ScrapeServiceConfig) -> Self {
        Self {
            source,
            actor_id,
            service,
            poll_interval: JOB_POLL_INTERVAL,
            max_polls: JOB_MAX_POLLS,
        }
    }

    fn job_input(&self, params: &FetchParams) -> JsonValue {
        json!({
            "make": flatsix_core::TRACKED_MAKE,
            "mode": params.mode.as_str(),
            "limit": params.limit,
            "since": params.since.map(|t| t.to_rfc3339()),
        })
    }

    fn job_backoff() -> flatsix_storage::BackoffPolicy {
        flatsix_storage::BackoffPolicy {
            max_retries: JOB_SUBMIT_ATTEMPTS - 1,
            jitter: true,
            ..Default::default()
        }
    }

    async fn submit(&self, http: &HttpFetcher, params: &FetchParams) -> Result<JobHandle, AdapterError> {
        let url = format!("{}/v2/acts/{}/runs", self.service.base_url, self.actor_id);
        let input = self.job_input(params);
        let body = http
            .post_json(&url, &input, Some(&self.service.token))
            .await?;
        JobHandle::from_response(&body)
            .ok_or_else(|| AdapterError::Job(format!("malformed run response from {url}")))
    }

    async fn wait_for_completion(
        &self,
        http: &HttpFetcher,
        handle: &JobHandle,
    ) -> Result<(), AdapterError> {
        let url = format!("{}/v2/actor-runs/{}", self.service.base_url, handle.run_id);
        for _ in 0..self.max_polls {
            let body = http.get_json(&url, Some(&self.service.token)).await?;
            let status = body
                .pointer("/data/status")
                .and_then(JsonValue::as_str)
                .unwrap_or("UNKNOWN");
            match status {
                "SUCCEEDED" => return Ok(()),
                "FAILED" | "ABORTED" | "TIMED-OUT" => {
                    return Err(AdapterError::Job(format!(
                        "run {} ended with status {status}",
                        handle.run_id
                    )));
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(AdapterError::Job(format!(
            "run {} still not finished after {} polls",
            handle.run_id, self.max_polls
        )))
    }

    async fn read_dataset(
        &self,
        http: &HttpFetcher,
        handle: &JobHandle,
        limit: usize,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let url = format!(
            "{}/v2/datasets/{}/items?limit={limit}",
            self.service.base_url, handle.dataset_id
        );
        let body = http.get_json(&url, Some(&self.service.token)).await?;
        let items = body
            .as_array()
            .ok_or_else(|| AdapterError::Job(format!("dataset {} is not an array", handle.dataset_id)))?;
        Ok(items
            .iter()
            .take(limit)
            .map(|payload| RawRecord {
                source: self.source,
                payload: payload.clone(),
            })
            .collect())
    }
}

struct JobHandle {
    run_id: String,
    dataset_id: String,
}

impl JobHandle {
    fn from_response(body: &JsonValue) -> Option<Self> {
        let run_id = body.pointer("/data/id")?.as_str()?.to_string();
        let dataset_id = body.pointer("/data/defaultDatasetId")?.as_str()?.to_string();
        Some(Self { run_id, dataset_id })
    }
}

#[async_trait]
impl SourceAdapter for ScrapeJobAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        params: &FetchParams,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let backoff = Self::job_backoff();

        let mut handle = None;
        let mut last_err = None;
        for attempt in 0..JOB_SUBMIT_ATTEMPTS {
            match self.submit(http, params).await {
                Ok(h) => {
                    handle = Some(h);
                    break;
                }
                Err(err) => {
                    warn!(source = %self.source, attempt, error = %err, "scrape job submission failed");
                    last_err = Some(err);
                    if attempt + 1 < JOB_SUBMIT_ATTEMPTS {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        let Some(handle) = handle else {
            return Err(last_err.expect("submission loop stores an error before exhausting"));
        };
        info!(source = %self.source, run = %handle.run_id, "scrape job submitted");

        self.wait_for_completion(http, &handle).await?;

        let mut last_err = None;
        for attempt in 0..JOB_SUBMIT_ATTEMPTS {
            match self.read_dataset(http, &handle, params.limit).await {
                Ok(records) => {
                    info!(source = %self.source, records = records.len(), "scrape job dataset read");
                    return Ok(records);
                }
                Err(err) => {
                    warn!(source = %self.source, attempt, error = %err, "dataset read failed");
                    last_err = Some(err);
                    if attempt + 1 < JOB_SUBMIT_ATTEMPTS {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.expect("dataset loop stores an error before exhausting"))
    }
}

/// Direct-fetch strategy: paginate search result pages, extract candidate
/// detail-page links, fetch each for one raw record.
pub struct HtmlScrapeAdapter {
    source: Source,
    listing_urls: Vec<String>,
    detail_path_prefixes: Vec<String>,
    page_param: String,
}

impl HtmlScrapeAdapter {
    fn paged_url(&self, base: &str, page: usize) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        format!("{base}{separator}{}={page}", self.page_param)
    }
}

#[async_trait]
impl SourceAdapter for HtmlScrapeAdapter {
    fn source(&self) -> Source {
        self.source
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        params: &FetchParams,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        // Try candidates in order until one responds.
        let mut base_url = None;
        for candidate in &self.listing_urls {
            match http.get_text(candidate).await {
                Ok(body) => {
                    base_url = Some((candidate.clone(), body));
                    break;
                }
                Err(err) => {
                    warn!(source = %self.source, url = %candidate, error = %err, "candidate listing url failed");
                }
            }
        }
        let Some((base_url, first_page)) = base_url else {
            return Err(AdapterError::Message(format!(
                "no candidate listing url responded for {}",
                self.source
            )));
        };

        let mut seen = HashSet::new();
        let mut detail_urls = Vec::new();
        for page in 1..=params.mode.page_depth() {
            let body = if page == 1 {
                first_page.clone()
            } else {
                http.get_text(&self.paged_url(&base_url, page)).await?
            };
            let links = extract_detail_links(&base_url, &body, &self.detail_path_prefixes);
            let mut fresh = 0usize;
            for link in links {
                if seen.insert(link.clone()) {
                    fresh += 1;
                    detail_urls.push(link);
                }
            }
            debug!(source = %self.source, page, fresh, "listing page scanned");
            // Zero previously-unseen links is the end-of-results signal.
            if fresh == 0 {
                break;
            }
            if detail_urls.len() >= params.limit {
                break;
            }
        }
        detail_urls.truncate(params.limit);

        let mut records = Vec::with_capacity(detail_urls.len());
        for url in detail_urls {
            match http.get_text(&url).await {
                Ok(body) => records.push(RawRecord {
                    source: self.source,
                    payload: detail_payload(&url, &body, Utc::now()),
                }),
                Err(err) => {
                    warn!(source = %self.source, %url, error = %err, "detail page fetch failed, skipping");
                }
            }
        }
        Ok(records)
    }
}

const TRACKING_PARAMS: [&str; 4] = ["ref", "fbclid", "gclid", "mc_cid"];

pub fn strip_tracking_params(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| {
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_ref())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }
    parsed.to_string()
}

/// Extracts absolute detail-page URLs whose path matches a known prefix,
/// with tracking parameters removed.
pub fn extract_detail_links(page_url: &str, html: &str, prefixes: &[String]) -> Vec<String> {
    let Ok(base) = Url::parse(page_url) else {
        return Vec::new();
    };
    let selector = Selector::parse("a[href]").expect("static selector");
    let document = Html::parse_document(html);

    let mut links = Vec::new();
    let mut seen = HashSet::new();
    for anchor in document.select(&selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        if !prefixes.is_empty() && !prefixes.iter().any(|p| resolved.path().starts_with(p.as_str())) {
            continue;
        }
        let cleaned = strip_tracking_params(resolved.as_str());
        if seen.insert(cleaned.clone()) {
            links.push(cleaned);
        }
    }
    links
}

/// Minimal raw record shape for one detail page; the canonicalizer derives
/// year/model/status from the title downstream.
pub fn detail_payload(url: &str, html: &str, scraped_at: DateTime<Utc>) -> JsonValue {
    let document = Html::parse_document(html);

    let h1 = Selector::parse("h1").expect("static selector");
    let title_tag = Selector::parse("title").expect("static selector");
    let title = document
        .select(&h1)
        .next()
        .map(|n| n.text().collect::<String>())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| {
            document
                .select(&title_tag)
                .next()
                .map(|n| n.text().collect::<String>())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        });

    let og_image = Selector::parse(r#"meta[property="og:image"]"#).expect("static selector");
    let image = document
        .select(&og_image)
        .next()
        .and_then(|n| n.value().attr("content"))
        .map(str::to_string);

    json!({
        "url": url,
        "title": title,
        "image": image,
        "scraped_at": scraped_at.to_rfc3339(),
    })
}

/// Ordered field-name aliases per canonical field; first non-empty wins.
/// New sources add a table here, not new control flow.
#[derive(Debug, Clone, Copy)]
pub struct FieldMap {
    pub id: &'static [&'static str],
    pub title: &'static [&'static str],
    pub url: &'static [&'static str],
    pub make: &'static [&'static str],
    pub model: &'static [&'static str],
    pub year: &'static [&'static str],
    pub status: &'static [&'static str],
    pub sale_date: &'static [&'static str],
    pub scraped_at: &'static [&'static str],
    pub hammer_price: &'static [&'static str],
    pub current_bid: &'static [&'static str],
    pub final_price: &'static [&'static str],
    pub bid_count: &'static [&'static str],
    pub currency: &'static [&'static str],
    pub mileage: &'static [&'static str],
    pub mileage_unit: &'static [&'static str],
    pub vin: &'static [&'static str],
    pub city: &'static [&'static str],
    pub region: &'static [&'static str],
    pub country: &'static [&'static str],
    pub auction_house: &'static [&'static str],
    pub description: &'static [&'static str],
    pub images: &'static [&'static str],
}

static BRING_A_TRAILER_FIELDS: FieldMap = FieldMap {
    id: &["id", "lot_id", "listing_id"],
    title: &["title", "name"],
    url: &["url", "source_url", "permalink", "link"],
    make: &["brand", "make"],
    model: &["model"],
    year: &["year", "model_year"],
    status: &["auctionStatus", "auction_status", "status"],
    sale_date: &["sale_date", "sold_at", "end_date", "endDate", "auction_end"],
    scraped_at: &["scraped_at", "scrapedAt", "fetched_at"],
    hammer_price: &["hammer_price", "hammerPrice"],
    current_bid: &["currentBid", "current_bid", "high_bid"],
    final_price: &["final_price", "sold_price", "salePrice", "price"],
    bid_count: &["bid_count", "bids"],
    currency: &["currency"],
    mileage: &["mileage", "odometer"],
    mileage_unit: &["mileage_unit", "odometer_unit"],
    vin: &["vin", "chassis"],
    city: &["city", "location_city"],
    region: &["region", "state", "province"],
    country: &["country", "country_code"],
    auction_house: &["auction_house", "seller_name", "seller"],
    description: &["description", "summary", "excerpt"],
    images: &["images", "image_urls", "photos", "image"],
};

static CARS_AND_BIDS_FIELDS: FieldMap = FieldMap {
    id: &["id", "auctionId", "slug"],
    title: &["title", "headline", "name"],
    url: &["url", "auctionUrl", "link"],
    make: &["make", "brand"],
    model: &["model"],
    year: &["year", "modelYear"],
    status: &["status", "auctionStatus"],
    sale_date: &["endDate", "soldAt", "auctionEnd", "sale_date"],
    scraped_at: &["scrapedAt", "scraped_at", "fetched_at"],
    hammer_price: &["hammerPrice", "hammer_price"],
    current_bid: &["currentBid", "highBid"],
    final_price: &["soldPrice", "finalPrice", "price"],
    bid_count: &["bidCount", "numBids"],
    currency: &["currency"],
    mileage: &["mileage", "odometer"],
    mileage_unit: &["mileageUnit", "odometerUnit"],
    vin: &["vin"],
    city: &["city"],
    region: &["state", "region"],
    country: &["country"],
    auction_house: &["sellerName", "seller"],
    description: &["description", "dougsTake", "summary"],
    images: &["images", "photoUrls", "mainImage"],
};

// Detail pages scraped directly carry the minimal payload shape of
// `detail_payload`, so one table serves every html-strategy source.
static HTML_DETAIL_FIELDS: FieldMap = FieldMap {
    id: &["id", "lot", "lot_number"],
    title: &["title", "name", "heading"],
    url: &["url", "link"],
    make: &["make", "brand"],
    model: &["model"],
    year: &["year"],
    status: &["status", "state"],
    sale_date: &["sale_date", "sold_at", "end_date", "ended_at"],
    scraped_at: &["scraped_at", "fetched_at"],
    hammer_price: &["hammer_price"],
    current_bid: &["current_bid", "high_bid"],
    final_price: &["final_price", "price", "sold_price"],
    bid_count: &["bid_count", "bids"],
    currency: &["currency"],
    mileage: &["mileage", "odometer"],
    mileage_unit: &["mileage_unit"],
    vin: &["vin", "chassis"],
    city: &["city"],
    region: &["region", "state"],
    country: &["country"],
    auction_house: &["auction_house", "seller"],
    description: &["description", "summary"],
    images: &["images", "image", "photos"],
};

pub fn field_map(source: Source) -> &'static FieldMap {
    match source {
        Source::BringATrailer => &BRING_A_TRAILER_FIELDS,
        Source::CarsAndBids => &CARS_AND_BIDS_FIELDS,
        Source::Pcarmarket | Source::CollectingCars => &HTML_DETAIL_FIELDS,
    }
}
