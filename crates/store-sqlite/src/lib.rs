use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use core_model::{RETENTION_HOURS, StatusRecord};
use rusqlite::{Connection, params};
use serde_json::Value;
use tracing::debug;

/// The single storage file shared by the pipeline (sole writer) and the
/// query service (readers). WAL mode keeps readers off the writer's back.
pub struct SqliteStore {
    conn: Connection,
}

/// Ordering modes for the query-side read. The ORDER BY clause is selected
/// from this enum, never assembled from user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOrder {
    Popularity,
    Recency,
}

/// A validated read against the search projection.
#[derive(Debug, Clone)]
pub struct StatusQuery {
    pub order: QueryOrder,
    pub hours: i64,
    /// `None` means no text filtering at all.
    pub token: Option<String>,
    pub limit: i64,
}

pub fn default_db_path() -> PathBuf {
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("trendmill").join("trendmill.db")
}

impl SqliteStore {
    pub fn open_default() -> anyhow::Result<Self> {
        let path = default_db_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating parent dir for {}", path.display()))?;
        }
        Self::open(path)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("opening sqlite db {}", path.as_ref().display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(Self { conn })
    }

    /// Create the append store and an empty search projection if absent, so
    /// the query service has a surface before the first completed cycle.
    pub fn init_schema(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS statuses (
              url TEXT NOT NULL,
              created_at TEXT NOT NULL,
              content_text TEXT NOT NULL,
              reblogs_count INTEGER NOT NULL,
              favourites_count INTEGER NOT NULL,
              status_json TEXT NOT NULL
            );
            CREATE VIRTUAL TABLE IF NOT EXISTS statuses_fts USING fts5(
              content_text,
              url UNINDEXED,
              created_at UNINDEXED,
              reblogs_count UNINDEXED,
              favourites_count UNINDEXED,
              status_json UNINDEXED
            );
            "#,
        )?;
        Ok(())
    }

    /// Append one normalized record. No dedup, no business validation;
    /// that is the aggregator's job. Commits immediately so a crash later
    /// in the cycle keeps everything fetched so far.
    pub fn append_status(&self, record: &StatusRecord) -> anyhow::Result<()> {
        self.conn.execute(
            r#"INSERT INTO statuses
               (url, created_at, content_text, reblogs_count, favourites_count, status_json)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                record.url,
                record.created_at.to_rfc3339(),
                record.content_text,
                record.reblogs_count,
                record.favourites_count,
                serde_json::to_string(&record.status_json)?,
            ],
        )?;
        Ok(())
    }

    pub fn count_statuses(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM statuses", [], |r| r.get(0))
            .map_err(Into::into)
    }

    /// Collapse the append store to one record per URL and evict anything
    /// outside the retention window, all against a single snapshot.
    ///
    /// Per URL the winner is the row with the highest engagement total;
    /// ties go to the most recent `created_at`, then to the latest arrival
    /// (rowid). The window filter runs on the winners, not before ranking:
    /// a URL whose best record has aged out disappears entirely, even if a
    /// weaker record of it is still fresh.
    ///
    /// Materializes the result as `statuses_agg` and returns it.
    pub fn aggregate(&mut self, now: DateTime<Utc>) -> anyhow::Result<Vec<StatusRecord>> {
        let cutoff = (now - Duration::hours(RETENTION_HOURS)).to_rfc3339();
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            r#"
            DROP TABLE IF EXISTS statuses_agg;
            CREATE TABLE statuses_agg (
              url TEXT NOT NULL,
              created_at TEXT NOT NULL,
              content_text TEXT NOT NULL,
              reblogs_count INTEGER NOT NULL,
              favourites_count INTEGER NOT NULL,
              status_json TEXT NOT NULL
            );
            "#,
        )?;
        tx.execute(
            r#"INSERT INTO statuses_agg
               SELECT url, created_at, content_text, reblogs_count, favourites_count, status_json
               FROM (
                 SELECT *,
                        row_number() OVER (
                          PARTITION BY url
                          ORDER BY (reblogs_count + favourites_count) DESC,
                                   datetime(created_at) DESC,
                                   rowid DESC
                        ) AS rn
                 FROM statuses
               ) ranked
               WHERE ranked.rn = 1
               AND datetime(created_at) >= datetime(?1)"#,
            params![cutoff],
        )?;
        let records = {
            let mut stmt = tx.prepare(
                r#"SELECT url, created_at, content_text, reblogs_count, favourites_count, status_json
                   FROM statuses_agg ORDER BY url"#,
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, String>(5)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (url, created_at, content_text, reblogs_count, favourites_count, raw_json) =
                    row?;
                out.push(StatusRecord {
                    url,
                    created_at: parse_ts(created_at),
                    content_text,
                    reblogs_count,
                    favourites_count,
                    status_json: serde_json::from_str(&raw_json)
                        .with_context(|| "decoding stored status_json")?,
                });
            }
            out
        };
        tx.commit()?;
        debug!(aggregated = records.len(), "aggregate table materialized");
        Ok(records)
    }

    /// Rebuild the search projection over exactly the given set. The new
    /// projection is fully built and durable under a shadow name before a
    /// single transaction swaps it into place, so concurrent readers see
    /// either the old projection or the new one, never a partial rebuild.
    pub fn rebuild_index(&mut self, records: &[StatusRecord]) -> anyhow::Result<()> {
        self.conn.execute_batch(
            r#"
            DROP TABLE IF EXISTS statuses_fts_new;
            CREATE VIRTUAL TABLE statuses_fts_new USING fts5(
              content_text,
              url UNINDEXED,
              created_at UNINDEXED,
              reblogs_count UNINDEXED,
              favourites_count UNINDEXED,
              status_json UNINDEXED
            );
            "#,
        )?;
        {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    r#"INSERT INTO statuses_fts_new
                       (content_text, url, created_at, reblogs_count, favourites_count, status_json)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                )?;
                for record in records {
                    stmt.execute(params![
                        record.content_text,
                        record.url,
                        record.created_at.to_rfc3339(),
                        record.reblogs_count,
                        record.favourites_count,
                        serde_json::to_string(&record.status_json)?,
                    ])?;
                }
            }
            tx.commit()?;
        }
        self.conn.execute_batch(
            r#"
            BEGIN;
            DROP TABLE IF EXISTS statuses_fts;
            ALTER TABLE statuses_fts_new RENAME TO statuses_fts;
            COMMIT;
            "#,
        )?;
        debug!(indexed = records.len(), "search projection swapped in");
        Ok(())
    }

    /// Replace the append store with the aggregated set and reclaim the
    /// space the old, larger table held. Next cycle appends onto a baseline
    /// that already carries prior-run survivors. Must run only after the
    /// aggregate and the rebuilt projection are durable.
    pub fn promote(&mut self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            r#"
            BEGIN;
            DROP TABLE IF EXISTS statuses;
            ALTER TABLE statuses_agg RENAME TO statuses;
            COMMIT;
            "#,
        )?;
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    /// Query-side read over the search projection. All user input is bound
    /// as parameters; the cutoff is computed here rather than assembled as
    /// a SQL interval expression.
    pub fn query_statuses(
        &self,
        query: &StatusQuery,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Value>> {
        let cutoff = (now - Duration::hours(query.hours)).to_rfc3339();
        let order = match query.order {
            QueryOrder::Popularity => "(reblogs_count + favourites_count) DESC",
            QueryOrder::Recency => "datetime(created_at) DESC",
        };
        let raw_rows = match &query.token {
            Some(token) => {
                let sql = format!(
                    "SELECT status_json FROM statuses_fts \
                     WHERE datetime(created_at) >= datetime(?1) \
                     AND statuses_fts MATCH ?2 \
                     ORDER BY {order} LIMIT ?3"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt.query_map(params![cutoff, token, query.limit], |r| {
                    r.get::<_, String>(0)
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let sql = format!(
                    "SELECT status_json FROM statuses_fts \
                     WHERE datetime(created_at) >= datetime(?1) \
                     ORDER BY {order} LIMIT ?2"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows =
                    stmt.query_map(params![cutoff, query.limit], |r| r.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        raw_rows
            .into_iter()
            .map(|raw| serde_json::from_str(&raw).with_context(|| "decoding stored status_json"))
            .collect()
    }

    pub fn indexed_count(&self) -> anyhow::Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM statuses_fts", [], |r| r.get(0))
            .map_err(Into::into)
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        self.conn
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(Into::into)
    }
}

fn parse_ts(ts: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&ts)
        .map(|v| v.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store() -> SqliteStore {
        let store = SqliteStore::open(":memory:").expect("open");
        store.init_schema().expect("schema");
        store
    }

    fn mk(url: &str, reblogs: i64, favourites: i64, age_hours: i64, now: DateTime<Utc>) -> StatusRecord {
        StatusRecord {
            url: url.to_string(),
            created_at: now - Duration::hours(age_hours),
            content_text: format!("post about rust from {url}"),
            reblogs_count: reblogs,
            favourites_count: favourites,
            status_json: json!({"url": url, "reblogs_count": reblogs}),
        }
    }

    #[test]
    fn schema_and_integrity() {
        let store = open_store();
        assert_eq!(store.integrity_check().unwrap(), "ok");
        store.init_schema().unwrap();
        assert_eq!(store.count_statuses().unwrap(), 0);
        assert_eq!(store.indexed_count().unwrap(), 0);
    }

    #[test]
    fn append_does_not_dedup() {
        let store = open_store();
        let now = Utc::now();
        store.append_status(&mk("https://a/1", 1, 1, 0, now)).unwrap();
        store.append_status(&mk("https://a/1", 2, 2, 0, now)).unwrap();
        assert_eq!(store.count_statuses().unwrap(), 2);
    }

    #[test]
    fn aggregate_one_record_per_url() {
        let mut store = open_store();
        let now = Utc::now();
        store.append_status(&mk("https://a/1", 1, 0, 1, now)).unwrap();
        store.append_status(&mk("https://a/1", 2, 0, 2, now)).unwrap();
        store.append_status(&mk("https://b/2", 5, 0, 1, now)).unwrap();
        let agg = store.aggregate(now).unwrap();
        assert_eq!(agg.len(), 2);
        let mut urls: Vec<&str> = agg.iter().map(|r| r.url.as_str()).collect();
        urls.dedup();
        assert_eq!(urls.len(), 2);
    }

    #[test]
    fn aggregate_picks_highest_engagement_regardless_of_order() {
        let now = Utc::now();
        for flipped in [false, true] {
            let mut store = open_store();
            let low = mk("https://a/1", 3, 4, 1, now);
            let high = mk("https://a/1", 6, 4, 2, now);
            if flipped {
                store.append_status(&high).unwrap();
                store.append_status(&low).unwrap();
            } else {
                store.append_status(&low).unwrap();
                store.append_status(&high).unwrap();
            }
            let agg = store.aggregate(now).unwrap();
            assert_eq!(agg.len(), 1);
            assert_eq!(agg[0].engagement(), 10);
        }
    }

    #[test]
    fn aggregate_tie_break_prefers_most_recent() {
        let mut store = open_store();
        let now = Utc::now();
        let older = mk("https://a/1", 5, 5, 6, now);
        let newer = mk("https://a/1", 5, 5, 2, now);
        store.append_status(&newer).unwrap();
        store.append_status(&older).unwrap();
        let agg = store.aggregate(now).unwrap();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].created_at, newer.created_at);
    }

    #[test]
    fn aggregate_evicts_outside_window() {
        let mut store = open_store();
        let now = Utc::now();
        store.append_status(&mk("https://a/1", 9, 9, 48, now)).unwrap();
        store.append_status(&mk("https://b/2", 1, 1, 1, now)).unwrap();
        let agg = store.aggregate(now).unwrap();
        assert_eq!(agg.len(), 1);
        assert_eq!(agg[0].url, "https://b/2");
    }

    #[test]
    fn aggregate_window_filters_winners_not_candidates() {
        // The winner is picked before the window filter: if the best record
        // of a URL has aged out, the URL drops entirely even though a
        // weaker, fresher record of it exists.
        let mut store = open_store();
        let now = Utc::now();
        store.append_status(&mk("https://a/1", 9, 9, 30, now)).unwrap();
        store.append_status(&mk("https://a/1", 1, 0, 1, now)).unwrap();
        let agg = store.aggregate(now).unwrap();
        assert!(agg.is_empty());
    }

    #[test]
    fn aggregate_idempotent_on_unchanged_store() {
        let mut store = open_store();
        let now = Utc::now();
        store.append_status(&mk("https://a/1", 1, 2, 1, now)).unwrap();
        store.append_status(&mk("https://a/1", 3, 4, 2, now)).unwrap();
        store.append_status(&mk("https://b/2", 5, 6, 3, now)).unwrap();
        let first = store.aggregate(now).unwrap();
        let second = store.aggregate(now).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.url, b.url);
            assert_eq!(a.engagement(), b.engagement());
            assert_eq!(a.created_at, b.created_at);
        }
    }

    #[test]
    fn promote_replaces_baseline_and_drops_agg() {
        let mut store = open_store();
        let now = Utc::now();
        store.append_status(&mk("https://a/1", 1, 0, 1, now)).unwrap();
        store.append_status(&mk("https://a/1", 2, 0, 1, now)).unwrap();
        store.append_status(&mk("https://b/2", 1, 0, 1, now)).unwrap();
        let agg = store.aggregate(now).unwrap();
        store.promote().unwrap();
        assert_eq!(store.count_statuses().unwrap(), agg.len() as i64);
        let agg_gone: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='statuses_agg'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(agg_gone, 0);
    }

    #[test]
    fn rebuild_index_replaces_previous_projection() {
        let mut store = open_store();
        let now = Utc::now();
        let first = vec![mk("https://a/1", 1, 0, 1, now)];
        store.rebuild_index(&first).unwrap();
        assert_eq!(store.indexed_count().unwrap(), 1);
        let second = vec![
            mk("https://b/2", 1, 0, 1, now),
            mk("https://c/3", 1, 0, 1, now),
        ];
        store.rebuild_index(&second).unwrap();
        assert_eq!(store.indexed_count().unwrap(), 2);
        let hits = store
            .query_statuses(
                &StatusQuery {
                    order: QueryOrder::Popularity,
                    hours: 24,
                    token: None,
                    limit: 100,
                },
                now,
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn query_popularity_orders_by_engagement() {
        let mut store = open_store();
        let now = Utc::now();
        let records = vec![
            mk("https://a/1", 1, 1, 1, now),
            mk("https://b/2", 10, 5, 2, now),
            mk("https://c/3", 4, 0, 1, now),
        ];
        store.rebuild_index(&records).unwrap();
        let hits = store
            .query_statuses(
                &StatusQuery {
                    order: QueryOrder::Popularity,
                    hours: 24,
                    token: None,
                    limit: 100,
                },
                now,
            )
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0]["url"], "https://b/2");
        assert_eq!(hits[1]["url"], "https://c/3");
        assert_eq!(hits[2]["url"], "https://a/1");
    }

    #[test]
    fn query_recency_orders_by_created_at() {
        let mut store = open_store();
        let now = Utc::now();
        let records = vec![
            mk("https://a/1", 99, 99, 5, now),
            mk("https://b/2", 0, 0, 1, now),
        ];
        store.rebuild_index(&records).unwrap();
        let hits = store
            .query_statuses(
                &StatusQuery {
                    order: QueryOrder::Recency,
                    hours: 24,
                    token: None,
                    limit: 100,
                },
                now,
            )
            .unwrap();
        assert_eq!(hits[0]["url"], "https://b/2");
        assert_eq!(hits[1]["url"], "https://a/1");
    }

    #[test]
    fn query_hours_filter_excludes_older_records() {
        let mut store = open_store();
        let now = Utc::now();
        let records = vec![
            mk("https://fresh/1", 5, 5, 1, now),
            mk("https://stale/2", 50, 50, 6, now),
        ];
        store.rebuild_index(&records).unwrap();
        let hits = store
            .query_statuses(
                &StatusQuery {
                    order: QueryOrder::Popularity,
                    hours: 3,
                    token: None,
                    limit: 100,
                },
                now,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["url"], "https://fresh/1");
    }

    #[test]
    fn query_token_matches_content_text() {
        let mut store = open_store();
        let now = Utc::now();
        let mut cats = mk("https://a/1", 1, 0, 1, now);
        cats.content_text = "a post about cats".to_string();
        let mut dogs = mk("https://b/2", 1, 0, 1, now);
        dogs.content_text = "a post about dogs".to_string();
        store.rebuild_index(&[cats, dogs]).unwrap();
        let hits = store
            .query_statuses(
                &StatusQuery {
                    order: QueryOrder::Popularity,
                    hours: 24,
                    token: Some("cats".to_string()),
                    limit: 100,
                },
                now,
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["url"], "https://a/1");
    }

    #[test]
    fn query_without_token_returns_everything_in_window() {
        let mut store = open_store();
        let now = Utc::now();
        let records = vec![
            mk("https://a/1", 1, 0, 1, now),
            mk("https://b/2", 1, 0, 2, now),
        ];
        store.rebuild_index(&records).unwrap();
        let hits = store
            .query_statuses(
                &StatusQuery {
                    order: QueryOrder::Recency,
                    hours: 24,
                    token: None,
                    limit: 100,
                },
                now,
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn query_limit_caps_results() {
        let mut store = open_store();
        let now = Utc::now();
        let records: Vec<StatusRecord> = (0..5)
            .map(|i| mk(&format!("https://a/{i}"), i, 0, 1, now))
            .collect();
        store.rebuild_index(&records).unwrap();
        let hits = store
            .query_statuses(
                &StatusQuery {
                    order: QueryOrder::Popularity,
                    hours: 24,
                    token: None,
                    limit: 3,
                },
                now,
            )
            .unwrap();
        assert_eq!(hits.len(), 3);
    }
}
