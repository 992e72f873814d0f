//! Price Ingestor Service
//!
//! Polls marketplace sources (TCGplayer, Cardmarket) for every tracked card
//! and appends price snapshots to PostgreSQL.

mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{
    AdapterRegistry, Config, Database, IngestionOrchestrator, ItemCatalog, MemoryCache,
    MemoryStore, PgStore, RecencyCache, SnapshotStore, Source,
};

use crate::metrics::Metrics;

/// Price Ingestor - captures marketplace price snapshots
#[derive(Parser, Debug)]
#[command(name = "price-ingestor")]
#[command(about = "Fetches card prices from marketplace sources and stores snapshots")]
struct Args {
    /// Run once and exit (instead of continuous polling)
    #[arg(long)]
    once: bool,

    /// Poll interval in seconds (defaults to INGEST_INTERVAL_SECS)
    #[arg(long)]
    interval: Option<u64>,

    /// Sources to ingest from (comma-separated, defaults to all enabled)
    #[arg(long)]
    sources: Option<String>,

    /// Keep snapshots in memory instead of writing them
    #[arg(long)]
    dry_run: bool,

    /// Create tables before starting
    #[arg(long)]
    apply_schema: bool,

    /// Load this many days of price history for every tracked card, then exit
    #[arg(long, value_name = "DAYS")]
    backfill: Option<u32>,

    /// Look a card up on every source that supports search, then exit
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    info!("Price Ingestor starting...");

    let mut config = Config::from_env()?;
    if let Some(list) = &args.sources {
        restrict_sources(&mut config, list)?;
    }

    if let Some(query) = &args.search {
        let registry = AdapterRegistry::with_defaults(&config);
        for (source, keys) in registry.search(query).await {
            info!("{}: {} matches", source.as_str(), keys.len());
            for key in keys {
                info!("  {}", key);
            }
        }
        return Ok(());
    }

    let interval_secs = args.interval.unwrap_or(config.cadence.ingest_secs);
    info!(
        "Mode: {}",
        if args.once {
            "single run"
        } else {
            "continuous"
        }
    );
    info!("Interval: {}s", interval_secs);

    info!("Connecting to database...");
    let db = Database::connect(&config).await?;
    db.health_check().await?;
    if args.apply_schema {
        db.apply_schema().await?;
        info!("Schema applied");
    }
    info!("Database connected successfully");

    let pg = Arc::new(PgStore::new(db.pool().clone()).with_batch_size(config.ingest.snapshot_batch_size));
    let snapshots: Arc<dyn SnapshotStore> = if args.dry_run {
        warn!("Dry run: snapshots are kept in memory only");
        Arc::new(MemoryStore::new())
    } else {
        pg.clone()
    };

    let registry = Arc::new(AdapterRegistry::with_defaults(&config));
    let marketplaces = registry.marketplace_sources();
    if marketplaces.is_empty() {
        bail!("No marketplace sources enabled");
    }
    info!(
        "Sources: {}",
        marketplaces
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let recency = RecencyCache::new(
        Arc::new(MemoryCache::new()),
        config.ingest.freshness_window_mins,
    );
    let orchestrator = IngestionOrchestrator::new(
        registry,
        snapshots,
        recency,
        config.ingest.items_per_task,
    );

    let mut metrics = Metrics::new();

    if let Some(days) = args.backfill {
        info!("Backfilling {} days of history", days);
        match orchestrator
            .backfill_catalog(pg.as_ref(), days, Utc::now())
            .await
        {
            Ok(report) => metrics.record_run(&report),
            Err(e) => {
                error!("Failed to load tracked items: {}", e);
                metrics.record_catalog_error();
            }
        }
        metrics.print_summary();
        return Ok(());
    }

    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                ingest_once(&orchestrator, pg.as_ref(), &mut metrics).await;
                if args.once {
                    info!("Single run mode - exiting");
                    break;
                }
            }
        }
    }

    metrics.print_summary();
    Ok(())
}

/// Run one ingestion pass over the catalog and fold it into `metrics`.
async fn ingest_once(
    orchestrator: &IngestionOrchestrator,
    catalog: &dyn ItemCatalog,
    metrics: &mut Metrics,
) {
    match orchestrator.run_catalog(catalog, Utc::now()).await {
        Ok(report) => {
            for s in &report.sources {
                match &s.error {
                    Some(err) => error!(
                        source = s.source.as_str(),
                        fetched = s.fetched,
                        inserted = s.inserted,
                        "Source run failed: {}",
                        err
                    ),
                    None => info!(
                        source = s.source.as_str(),
                        state = %s.state,
                        fetched = s.fetched,
                        inserted = s.inserted,
                        fresh = s.skipped_fresh,
                        elapsed_ms = s.elapsed_ms,
                        "Source run finished"
                    ),
                }
            }
            metrics.record_run(&report);
        }
        Err(e) => {
            error!("Failed to load tracked items: {}", e);
            metrics.record_catalog_error();
        }
    }
}

/// Disable every source not named in `list`.
fn restrict_sources(config: &mut Config, list: &str) -> Result<()> {
    let mut wanted = Vec::new();
    for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match Source::from_str(name) {
            Some(source) => wanted.push(source),
            None => bail!("Unknown source: {}", name),
        }
    }

    for (source, settings) in config.sources.iter_mut() {
        if !wanted.contains(source) {
            settings.enabled = false;
        }
    }
    Ok(())
}
