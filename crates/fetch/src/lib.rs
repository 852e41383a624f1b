use std::net::{IpAddr, Ipv4Addr};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use core_model::{NormalizeError, StatusRecord};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use scraper::Html;
use serde_json::Value;
use tracing::warn;

/// Per-source page budget: 12 pages of 40 posts = 480 posts per instance.
/// Remote instances are untrusted and rate-limited, so the budget stays
/// explicit and bounded.
pub const PAGES_PER_SOURCE: u32 = 12;
pub const PAGE_SIZE: u32 = 40;
/// Minimum pause between paginated requests to the same instance.
pub const MIN_PAGE_DELAY: Duration = Duration::from_millis(100);
/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts per page request before the whole source is declared
/// unavailable.
const PAGE_ATTEMPTS: u32 = 3;

/// Knobs for one snapshot pass. Tests shrink the budget and zero the
/// delays; production uses the defaults.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub pages: u32,
    pub page_size: u32,
    pub page_delay: Duration,
    pub retry_backoff: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            pages: PAGES_PER_SOURCE,
            page_size: PAGE_SIZE,
            page_delay: MIN_PAGE_DELAY,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// One source of trending posts failing. Recovered per source: the cycle
/// logs it and moves on with zero posts from that instance.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request to {host} failed: {source}")]
    Request {
        host: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{host} answered {status}")]
    Status { host: String, status: StatusCode },
    #[error("{host} returned a non-array trends payload")]
    MalformedListing { host: String },
}

/// One page of raw trending-post payloads from one instance. The HTTP
/// implementation lives behind this seam so the pipeline can be exercised
/// with fake sources.
pub trait TrendSource {
    fn fetch_page(&self, host: &str, limit: u32, offset: u32) -> Result<Vec<Value>, SourceError>;
}

pub struct HttpTrendSource {
    client: Client,
}

impl HttpTrendSource {
    pub fn new() -> anyhow::Result<Self> {
        // Binding the local address to 0.0.0.0 forces IPv4 connections.
        // Deployment workaround, not a business rule: several fediverse
        // hosts publish AAAA records with broken v6 routing and the
        // dual-stack connect stalls until the timeout.
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .build()?;
        Ok(Self { client })
    }
}

impl TrendSource for HttpTrendSource {
    fn fetch_page(&self, host: &str, limit: u32, offset: u32) -> Result<Vec<Value>, SourceError> {
        let url = format!("https://{host}/api/v1/trends/statuses");
        let response = self
            .client
            .get(&url)
            .query(&[("limit", limit), ("offset", offset)])
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .map_err(|source| SourceError::Request {
                host: host.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                host: host.to_string(),
                status,
            });
        }
        let body: Value = response.json().map_err(|source| SourceError::Request {
            host: host.to_string(),
            source,
        })?;
        match body {
            Value::Array(items) => Ok(items),
            _ => Err(SourceError::MalformedListing {
                host: host.to_string(),
            }),
        }
    }
}

/// Pull the full paginated budget from one instance, pacing requests and
/// retrying each page a bounded number of times. Exhausting the retries on
/// any page fails the whole source.
pub fn fetch_trending(
    source: &dyn TrendSource,
    host: &str,
    cfg: &FetchConfig,
) -> Result<Vec<Value>, SourceError> {
    let mut statuses = Vec::new();
    for page in 0..cfg.pages {
        let offset = page * cfg.page_size;
        let batch = fetch_page_with_retry(source, host, offset, cfg)?;
        statuses.extend(batch);
        if !cfg.page_delay.is_zero() {
            thread::sleep(cfg.page_delay);
        }
    }
    Ok(statuses)
}

fn fetch_page_with_retry(
    source: &dyn TrendSource,
    host: &str,
    offset: u32,
    cfg: &FetchConfig,
) -> Result<Vec<Value>, SourceError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match source.fetch_page(host, cfg.page_size, offset) {
            Ok(batch) => return Ok(batch),
            Err(err) if attempt < PAGE_ATTEMPTS => {
                warn!(host, offset, attempt, error = %err, "page request failed, retrying");
                if !cfg.retry_backoff.is_zero() {
                    thread::sleep(cfg.retry_backoff * attempt);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Turn one raw post payload into a canonical record. Failure skips the
/// record, never the run; the original payload is kept verbatim.
pub fn normalize_status(payload: &Value) -> Result<StatusRecord, NormalizeError> {
    let url = payload
        .get("url")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("url"))?;
    let created_raw = payload
        .get("created_at")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("created_at"))?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(created_raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| NormalizeError::InvalidTimestamp {
            field: "created_at",
            value: created_raw.to_string(),
        })?;
    let content = payload
        .get("content")
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingField("content"))?;
    let reblogs_count = coerce_count(payload, "reblogs_count")?;
    let favourites_count = coerce_count(payload, "favourites_count")?;
    Ok(StatusRecord {
        url: url.to_string(),
        created_at,
        content_text: html_to_text(content),
        reblogs_count,
        favourites_count,
        status_json: payload.clone(),
    })
}

/// Counts arrive as JSON numbers from well-behaved instances and as
/// numeric strings from a few others; anything else is malformed.
fn coerce_count(payload: &Value, field: &'static str) -> Result<i64, NormalizeError> {
    let value = payload
        .get(field)
        .ok_or(NormalizeError::MissingField(field))?;
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n >= 0 => Ok(n),
        _ => Err(NormalizeError::InvalidCount { field }),
    }
}

/// Strip markup and decode entities, collapsing whitespace runs so the
/// FTS tokenizer sees clean text.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
