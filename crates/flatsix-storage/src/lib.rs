//! Outbound HTTP plumbing (per-domain pacing, retry with backoff) and the
//! durable per-source checkpoint store.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "flatsix-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_request_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff schedule. `jitter` spreads retries of bulk jobs so
/// they do not land on the upstream in lockstep.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let doubling = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(doubling).min(self.max_delay);
        if !self.jitter {
            return delay;
        }
        let half = delay.as_millis() as u64 / 2;
        if half == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=half))
    }
}

/// Paces outbound requests per network domain: one mutable "next allowed
/// time" map, read and written only by the calling flow.
#[derive(Debug)]
pub struct DomainRateLimiter {
    min_interval: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl DomainRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_allowed: Mutex::new(HashMap::new()),
        }
    }

    /// Waits until the domain's slot opens, then books the next one.
    pub async fn acquire(&self, domain: &str) {
        let wait_until = {
            let mut map = self.next_allowed.lock().await;
            let now = Instant::now();
            let slot = map.get(domain).copied().unwrap_or(now).max(now);
            map.insert(domain.to_string(), slot + self.min_interval);
            slot
        };
        sleep_until(wait_until).await;
    }
}

pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub per_domain_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            per_domain_interval: Duration::from_millis(1_000),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone, Copy)]
enum Payload<'a> {
    None,
    Json(&'a JsonValue),
}

/// Shared HTTP entry point: every outbound call passes through the rate
/// limiter keyed by target domain and the retry wrapper.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: DomainRateLimiter,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limiter: DomainRateLimiter::new(config.per_domain_interval),
            backoff: config.backoff,
        })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self
            .execute(reqwest::Method::GET, url, Payload::None, None)
            .await?;
        Ok(resp.text().await?)
    }

    pub async fn get_json(&self, url: &str, bearer: Option<&str>) -> Result<JsonValue, FetchError> {
        let resp = self
            .execute(reqwest::Method::GET, url, Payload::None, bearer)
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        bearer: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let resp = self
            .execute(reqwest::Method::POST, url, Payload::Json(body), bearer)
            .await?;
        Ok(resp.json().await?)
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        url: &str,
        payload: Payload<'_>,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, FetchError> {
        let domain = domain_of(url);
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            self.limiter.acquire(&domain).await;

            let mut request = self.client.request(method.clone(), url);
            if let Payload::Json(body) = payload {
                request = request.json(body);
            }
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let final_url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, %status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_request_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, error = %err, attempt, "retrying after request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop exits early unless a request error was stored"),
        ))
    }
}

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCheckpoint {
    pub last_cursor: String,
    pub last_seen_at: DateTime<Utc>,
    pub run_id: String,
}

/// Versioned envelope around all per-source cursors. Created on first
/// write, mutated on every subsequent one, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEnvelope {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub sources: BTreeMap<String, SourceCheckpoint>,
}

impl CheckpointEnvelope {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            updated_at: now,
            sources: BTreeMap::new(),
        }
    }
}

/// Durable per-source cursor state, one JSON file per pipeline deployment.
/// Read-modify-write with no locking: callers run one ingestion process per
/// checkpoint path at a time.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best-effort load: a missing file, unreadable JSON or a version
    /// mismatch all yield a fresh envelope rather than an error.
    pub async fn load(&self) -> CheckpointEnvelope {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(_) => return CheckpointEnvelope::fresh(Utc::now()),
        };
        match serde_json::from_str::<CheckpointEnvelope>(&text) {
            Ok(envelope) if envelope.version == CHECKPOINT_VERSION => envelope,
            Ok(envelope) => {
                warn!(
                    path = %self.path.display(),
                    found = envelope.version,
                    expected = CHECKPOINT_VERSION,
                    "checkpoint version mismatch, starting fresh"
                );
                CheckpointEnvelope::fresh(Utc::now())
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable checkpoint, starting fresh");
                CheckpointEnvelope::fresh(Utc::now())
            }
        }
    }

    /// Read-modify-write of the whole envelope, creating parent directories
    /// on first use. Returns the envelope as written.
    pub async fn update(
        &self,
        source_key: &str,
        run_id: &str,
        cursor: &str,
        seen_at: DateTime<Utc>,
    ) -> anyhow::Result<CheckpointEnvelope> {
        let mut envelope = self.load().await;
        envelope.updated_at = Utc::now();
        envelope.sources.insert(
            source_key.to_string(),
            SourceCheckpoint {
                last_cursor: cursor.to_string(),
                last_seen_at: seen_at,
                run_id: run_id.to_string(),
            },
        );

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&envelope).context("serializing checkpoint")?;
        fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("writing checkpoint {}", self.path.display()))?;
        Ok(envelope)
    }
}
