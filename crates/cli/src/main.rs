use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fetch::{FetchConfig, HttpTrendSource, MIN_PAGE_DELAY};
use pipeline::CyclePhase;
use store_sqlite::SqliteStore;
use tracing::info;

#[derive(Parser)]
#[command(name = "trendmill")]
#[command(about = "Polls fediverse instances for trending posts and serves a searchable rollup")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot every configured instance, then aggregate, reindex and
    /// promote. Meant to be invoked on a schedule, e.g. from cron.
    Run {
        /// Newline-delimited list of instance hosts.
        #[arg(long, default_value = "instances.txt")]
        instances: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
        /// Pause between page requests to the same instance. Values below
        /// 100ms are raised to the floor.
        #[arg(long, default_value = "100ms")]
        page_delay: String,
    },
    /// Serve the query API over the search projection.
    Serve {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long, default_value = "127.0.0.1:5000")]
        bind: SocketAddr,
    },
    /// Integrity check and row counts.
    Doctor {
        #[arg(long)]
        db: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let t = Instant::now();

    match cli.command {
        Commands::Run {
            instances,
            db,
            page_delay,
        } => {
            let hosts = load_instances(&instances)?;
            let delay = humantime::parse_duration(&page_delay)
                .with_context(|| "invalid --page-delay")?;
            let cfg = FetchConfig {
                page_delay: delay.max(MIN_PAGE_DELAY),
                ..FetchConfig::default()
            };
            let mut store = open_store(db.as_deref())?;
            store.init_schema()?;
            let source = HttpTrendSource::new()?;

            info!(instances = hosts.len(), "beginning cycle");
            let summary = pipeline::run_cycle(
                &hosts,
                &source,
                &cfg,
                &mut store,
                chrono::Utc::now(),
                |phase| match phase {
                    CyclePhase::Snapshotting { host } => {
                        info!(host = %host, elapsed = ?t.elapsed(), "processing source");
                    }
                    CyclePhase::SourceDone {
                        host,
                        inserted,
                        skipped,
                    } => {
                        info!(host = %host, inserted, skipped, elapsed = ?t.elapsed(), "source done");
                    }
                    CyclePhase::Aggregating { appended } => {
                        info!(appended, elapsed = ?t.elapsed(), "aggregating");
                    }
                    CyclePhase::Indexing { aggregated } => {
                        info!(aggregated, elapsed = ?t.elapsed(), "rebuilding search projection");
                    }
                    CyclePhase::Promoting => {
                        info!(elapsed = ?t.elapsed(), "promoting aggregated set");
                    }
                    CyclePhase::Done { aggregated } => {
                        info!(aggregated, elapsed = ?t.elapsed(), "cycle done");
                    }
                },
            )?;
            info!(
                sources_ok = summary.sources_ok,
                sources_failed = summary.sources_failed,
                fetched = summary.fetched,
                inserted = summary.inserted,
                skipped = summary.skipped_records,
                aggregated = summary.aggregated,
                elapsed = ?t.elapsed(),
                "cycle complete"
            );
        }
        Commands::Serve { db, bind } => {
            let db_path = db.unwrap_or_else(store_sqlite::default_db_path);
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating parent dir for {}", db_path.display()))?;
            }
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(query_api::serve(db_path, bind))?;
        }
        Commands::Doctor { db } => {
            let store = open_store(db.as_deref())?;
            store.init_schema()?;
            let check = store.integrity_check()?;
            let statuses = store.count_statuses()?;
            let indexed = store.indexed_count()?;
            info!(elapsed = ?t.elapsed(), "integrity check done");
            println!("integrity_check={check}");
            println!("statuses={statuses}");
            println!("indexed={indexed}");
        }
    }

    Ok(())
}

fn open_store(db: Option<&Path>) -> anyhow::Result<SqliteStore> {
    match db {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_default(),
    }
}

/// Load the newline-delimited instance list. An unreadable or empty list
/// is fatal before any network activity.
fn load_instances(path: &Path) -> anyhow::Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading instance list {}", path.display()))?;
    let hosts: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToOwned::to_owned)
        .collect();
    if hosts.is_empty() {
        anyhow::bail!("instance list {} is empty", path.display());
    }
    Ok(hosts)
}
