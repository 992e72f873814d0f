//! Run counters for the price ingestor.

use std::collections::BTreeMap;
use std::time::Instant;

use common::{RunReport, RunState, Source};
use tracing::info;

#[derive(Default)]
struct SourceTotals {
    runs: u32,
    failed_runs: u32,
    fetched: usize,
    inserted: u64,
    not_found: usize,
    retries: u32,
}

/// Totals across ingestion runs since startup.
pub struct Metrics {
    start_time: Instant,
    runs: u32,
    catalog_errors: u32,
    per_source: BTreeMap<Source, SourceTotals>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            runs: 0,
            catalog_errors: 0,
            per_source: BTreeMap::new(),
        }
    }

    /// Fold one run's report into the totals.
    pub fn record_run(&mut self, report: &RunReport) {
        self.runs += 1;
        for s in &report.sources {
            let totals = self.per_source.entry(s.source).or_default();
            totals.runs += 1;
            if s.state == RunState::Failed {
                totals.failed_runs += 1;
            }
            totals.fetched += s.fetched;
            totals.inserted += s.inserted;
            totals.not_found += s.not_found;
            totals.retries += s.retries;
        }
    }

    /// Record a failure to load the item catalog.
    pub fn record_catalog_error(&mut self) {
        self.catalog_errors += 1;
    }

    pub fn total_inserted(&self) -> u64 {
        self.per_source.values().map(|t| t.inserted).sum()
    }

    pub fn failed_runs(&self, source: Source) -> u32 {
        self.per_source.get(&source).map_or(0, |t| t.failed_runs)
    }

    /// Print metrics summary.
    pub fn print_summary(&self) {
        let elapsed = self.start_time.elapsed();

        info!("╔════════════════════════════════════════════════════════════╗");
        info!("║              PRICE INGESTOR METRICS                        ║");
        info!("╠════════════════════════════════════════════════════════════╣");
        info!(
            "║  Uptime:            {:>8.1} minutes                       ║",
            elapsed.as_secs_f64() / 60.0
        );
        info!(
            "║  Runs:              {:>8}                                 ║",
            self.runs
        );
        info!(
            "║  Snapshots written: {:>8}                                 ║",
            self.total_inserted()
        );
        info!(
            "║  Catalog errors:    {:>8}                                 ║",
            self.catalog_errors
        );
        info!("╠════════════════════════════════════════════════════════════╣");
        info!("║  Per Source:                                               ║");

        for (source, t) in &self.per_source {
            info!(
                "║    {:<10} {:>6} fetched {:>6} new {:>3} failed runs      ║",
                source.as_str(),
                t.fetched,
                t.inserted,
                t.failed_runs
            );
            if t.not_found > 0 || t.retries > 0 {
                info!(
                    "║               {:>6} not found {:>5} retries                ║",
                    t.not_found, t.retries
                );
            }
        }

        info!("╚════════════════════════════════════════════════════════════╝");
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
