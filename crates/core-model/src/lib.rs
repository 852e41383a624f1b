use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lookback in hours kept by aggregation. Records older than this are
/// evicted at each cycle and never carried forward.
pub const RETENTION_HOURS: i64 = 24;

/// One trending post as observed on some instance, in canonical form.
/// Identity is the post URL; the same URL typically shows up on several
/// instances and again on every run, so the append store holds many
/// `StatusRecord`s per URL until the aggregator picks a winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub url: String,
    /// Source-reported creation time, normalized to UTC.
    pub created_at: DateTime<Utc>,
    /// Plain text derived from the HTML `content` field.
    pub content_text: String,
    pub reblogs_count: i64,
    pub favourites_count: i64,
    /// The original payload, verbatim. The query layer returns this, not
    /// the derived columns.
    pub status_json: Value,
}

impl StatusRecord {
    /// Ranking key for both the dedup tie-break and the popularity sort.
    pub fn engagement(&self) -> i64 {
        self.reblogs_count + self.favourites_count
    }
}

/// Why a single fetched post could not be turned into a `StatusRecord`.
/// These never abort a run; the record is skipped and logged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid RFC3339 timestamp: {value:?}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("field `{field}` is not a non-negative integer count")]
    InvalidCount { field: &'static str },
}
