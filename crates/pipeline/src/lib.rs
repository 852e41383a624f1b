use chrono::{DateTime, Utc};
use fetch::{FetchConfig, TrendSource, fetch_trending, normalize_status};
use store_sqlite::SqliteStore;
use tracing::{error, warn};

/// Progress of one cycle, reported through the `on_progress` callback so
/// the caller can log timings without the pipeline knowing about output.
#[derive(Debug, Clone)]
pub enum CyclePhase {
    Snapshotting { host: String },
    SourceDone { host: String, inserted: usize, skipped: usize },
    Aggregating { appended: i64 },
    Indexing { aggregated: usize },
    Promoting,
    Done { aggregated: usize },
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub skipped_records: usize,
    pub aggregated: usize,
}

/// One complete cycle: snapshot every source into the append store, then
/// aggregate, rebuild the search projection, and promote the aggregated
/// set as the next baseline.
///
/// Source and record failures are contained to their own scope. Storage
/// errors propagate immediately; promotion only runs once the aggregate
/// and the rebuilt projection are durable, so an aborted cycle leaves the
/// previous cycle's state authoritative.
pub fn run_cycle(
    hosts: &[String],
    source: &dyn TrendSource,
    cfg: &FetchConfig,
    store: &mut SqliteStore,
    now: DateTime<Utc>,
    on_progress: impl Fn(CyclePhase),
) -> anyhow::Result<CycleSummary> {
    let mut summary = CycleSummary::default();

    for host in hosts {
        on_progress(CyclePhase::Snapshotting { host: host.clone() });
        let payloads = match fetch_trending(source, host, cfg) {
            Ok(payloads) => payloads,
            Err(err) => {
                // One unreachable instance must not sink the rest of the cycle.
                error!(host = %host, error = %err, "source unavailable, skipping");
                summary.sources_failed += 1;
                continue;
            }
        };
        summary.fetched += payloads.len();

        let mut inserted = 0usize;
        let mut skipped = 0usize;
        for payload in &payloads {
            match normalize_status(payload) {
                Ok(record) => {
                    store.append_status(&record)?;
                    inserted += 1;
                }
                Err(err) => {
                    warn!(host = %host, error = %err, "skipping malformed status");
                    skipped += 1;
                }
            }
        }
        summary.sources_ok += 1;
        summary.inserted += inserted;
        summary.skipped_records += skipped;
        on_progress(CyclePhase::SourceDone {
            host: host.clone(),
            inserted,
            skipped,
        });
    }

    let appended = store.count_statuses()?;
    on_progress(CyclePhase::Aggregating { appended });
    let aggregated = store.aggregate(now)?;

    on_progress(CyclePhase::Indexing {
        aggregated: aggregated.len(),
    });
    store.rebuild_index(&aggregated)?;

    on_progress(CyclePhase::Promoting);
    store.promote()?;

    summary.aggregated = aggregated.len();
    on_progress(CyclePhase::Done {
        aggregated: aggregated.len(),
    });
    Ok(summary)
}
