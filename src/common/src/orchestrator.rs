//! Ingestion orchestrator.
//!
//! One task per source per run, all sources in parallel. Within a source,
//! items are fetched sequentially (the adapter paces requests) in chunks of
//! `items_per_task`; each chunk is written before the next is fetched. A
//! source that exhausts its retries is marked failed without affecting the
//! others. The same loop serves live runs and history backfills
//! ([`IngestMode`]).

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::adapters::{AdapterError, Capability, PriceSource};
use crate::cache::RecencyCache;
use crate::models::{DataOrigin, ItemKey, NewSnapshot, TrackedItem};
use crate::rate_limit::RetryPolicy;
use crate::registry::AdapterRegistry;
use crate::source::Source;
use crate::store::{ItemCatalog, SnapshotStore, StoreError};

/// Per-source run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Fetching,
    Writing,
    /// Nothing to fetch: every item was fresh, or the source cannot fetch prices
    Skipped,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Fetching => "fetching",
            RunState::Writing => "writing",
            RunState::Skipped => "skipped",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Pending, Skipped)
                | (Pending, Failed)
                | (Fetching, Writing)
                | (Fetching, Skipped)
                | (Fetching, Failed)
                | (Writing, Fetching)
                | (Writing, Done)
                | (Writing, Failed)
                | (Skipped, Done)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one source's part of a run.
#[derive(Debug, Clone)]
pub struct SourceRunReport {
    pub source: Source,
    pub state: RunState,
    /// True when the run passed through `Skipped`
    pub skipped: bool,
    /// Items handed to the source after the freshness filter
    pub attempted: usize,
    pub skipped_fresh: usize,
    pub fetched: usize,
    pub not_found: usize,
    pub rejected: usize,
    pub inserted: u64,
    pub retries: u32,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl SourceRunReport {
    fn new(source: Source) -> Self {
        Self {
            source,
            state: RunState::Pending,
            skipped: false,
            attempted: 0,
            skipped_fresh: 0,
            fetched: 0,
            not_found: 0,
            rejected: 0,
            inserted: 0,
            retries: 0,
            error: None,
            elapsed_ms: 0,
        }
    }

    fn transition(&mut self, next: RunState) {
        if !self.state.can_transition_to(next) {
            warn!(source = %self.source, from = %self.state, to = %next, "Unexpected run state transition");
        }
        debug!(source = %self.source, from = %self.state, to = %next, "Run state");
        if next == RunState::Skipped {
            self.skipped = true;
        }
        self.state = next;
    }

    fn fail(&mut self, reason: String) {
        self.transition(RunState::Failed);
        self.error = Some(reason);
    }
}

/// Result of one ingestion run across sources.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub items: usize,
    pub sources: Vec<SourceRunReport>,
}

impl RunReport {
    pub fn total_inserted(&self) -> u64 {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn total_fetched(&self) -> usize {
        self.sources.iter().map(|s| s.fetched).sum()
    }

    pub fn failed_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.state == RunState::Failed)
            .map(|s| s.source)
            .collect()
    }

    pub fn source(&self, source: Source) -> Option<&SourceRunReport> {
        self.sources.iter().find(|s| s.source == source)
    }
}

/// What an ingestion run fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Current price per item, skipping items the recency cache says are fresh
    Live,
    /// Daily history over the last `days` days, stored as bulk imports
    Backfill { days: u32 },
}

impl IngestMode {
    fn capability(&self) -> Capability {
        match self {
            IngestMode::Live => Capability::FetchPrice,
            IngestMode::Backfill { .. } => Capability::FetchPriceHistory,
        }
    }
}

/// Drives adapters and writes their observations.
pub struct IngestionOrchestrator {
    registry: Arc<AdapterRegistry>,
    snapshots: Arc<dyn SnapshotStore>,
    recency: RecencyCache,
    items_per_task: usize,
}

impl IngestionOrchestrator {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        snapshots: Arc<dyn SnapshotStore>,
        recency: RecencyCache,
        items_per_task: usize,
    ) -> Self {
        Self {
            registry,
            snapshots,
            recency,
            items_per_task: items_per_task.max(1),
        }
    }

    /// Run over every tracked item in the catalog.
    pub async fn run_catalog(
        &self,
        catalog: &dyn ItemCatalog,
        now: DateTime<Utc>,
    ) -> Result<RunReport, StoreError> {
        let items = catalog.tracked_items().await?;
        Ok(self.run(&items, now).await)
    }

    /// Backfill history for every tracked item in the catalog.
    pub async fn backfill_catalog(
        &self,
        catalog: &dyn ItemCatalog,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<RunReport, StoreError> {
        let items = catalog.tracked_items().await?;
        Ok(self.backfill(&items, days, now).await)
    }

    /// Run every enabled marketplace source over `items` in parallel.
    pub async fn run(&self, items: &[TrackedItem], now: DateTime<Utc>) -> RunReport {
        self.run_mode(IngestMode::Live, items, now).await
    }

    /// Load up to `days` of daily history from every enabled source that
    /// offers it. Points are tagged as bulk imports and deduplicated by the
    /// store like any other snapshot, so a repeated backfill is a no-op.
    pub async fn backfill(&self, items: &[TrackedItem], days: u32, now: DateTime<Utc>) -> RunReport {
        self.run_mode(IngestMode::Backfill { days }, items, now).await
    }

    async fn run_mode(&self, mode: IngestMode, items: &[TrackedItem], now: DateTime<Utc>) -> RunReport {
        let sources = self.registry.marketplace_sources();
        info!(?mode, items = items.len(), sources = sources.len(), "Starting ingestion run");

        let reports = join_all(
            sources
                .iter()
                .map(|source| self.run_source(*source, mode, items, now)),
        )
        .await;

        let report = RunReport {
            started_at: now,
            items: items.len(),
            sources: reports,
        };
        info!(
            ?mode,
            fetched = report.total_fetched(),
            inserted = report.total_inserted(),
            failed = report.failed_sources().len(),
            "Ingestion run complete"
        );
        report
    }

    /// One source's unit of work. Never returns an error: failures are
    /// recorded in the report.
    pub async fn run_source(
        &self,
        source: Source,
        mode: IngestMode,
        items: &[TrackedItem],
        now: DateTime<Utc>,
    ) -> SourceRunReport {
        let started = Instant::now();
        let mut report = SourceRunReport::new(source);

        self.drive_source(source, mode, items, now, &mut report).await;

        if report.state == RunState::Skipped {
            report.transition(RunState::Done);
        }
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        if report.state == RunState::Failed {
            warn!(
                %source,
                attempted = report.attempted,
                fetched = report.fetched,
                inserted = report.inserted,
                reason = report.error.as_deref().unwrap_or("unknown"),
                "Source run failed"
            );
        } else {
            info!(
                %source,
                attempted = report.attempted,
                fresh = report.skipped_fresh,
                fetched = report.fetched,
                not_found = report.not_found,
                inserted = report.inserted,
                elapsed_ms = report.elapsed_ms,
                "Source run done"
            );
        }
        report
    }

    async fn drive_source(
        &self,
        source: Source,
        mode: IngestMode,
        items: &[TrackedItem],
        now: DateTime<Utc>,
        report: &mut SourceRunReport,
    ) {
        let adapter = match self.registry.get(source).await {
            Ok(adapter) => adapter,
            Err(e) => {
                report.fail(e.to_string());
                return;
            }
        };

        let capability = mode.capability();
        if !adapter.capabilities().supports(capability) {
            debug!(%source, %capability, "Source lacks capability, skipping");
            report.transition(RunState::Skipped);
            return;
        }

        let retry = self
            .registry
            .settings(source)
            .map(|s| s.retry.clone())
            .unwrap_or_default();

        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            if mode == IngestMode::Live && self.recency.is_fresh(item.id, source, now).await {
                report.skipped_fresh += 1;
            } else {
                pending.push(item);
            }
        }
        report.attempted = pending.len();

        if pending.is_empty() {
            report.transition(RunState::Skipped);
            return;
        }

        for chunk in pending.chunks(self.items_per_task) {
            report.transition(RunState::Fetching);
            let (batch, outcome) =
                fetch_chunk(adapter.as_ref(), source, mode, chunk, &retry, report).await;

            // Persist whatever was captured, even when the chunk stopped early.
            report.transition(RunState::Writing);
            if let Err(e) = self.write_batch(source, mode, &batch, report).await {
                report.fail(format!("snapshot write failed: {}", e));
                return;
            }

            if let Err(e) = outcome {
                report.fail(format!("retries exhausted: {}", e));
                return;
            }
        }

        report.transition(RunState::Done);
    }

    async fn write_batch(
        &self,
        source: Source,
        mode: IngestMode,
        batch: &[NewSnapshot],
        report: &mut SourceRunReport,
    ) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let inserted = self.snapshots.bulk_upsert(batch).await?;
        report.inserted += inserted;

        // History points are old; recording them would not make an item fresh
        if mode == IngestMode::Live {
            for snap in batch {
                self.recency
                    .mark_captured(snap.item_id, source, snap.snapshot_time)
                    .await;
            }
        }
        Ok(())
    }
}

/// Fetch one chunk with per-item retries. Returns the snapshots captured so
/// far and whether the chunk completed.
async fn fetch_chunk(
    adapter: &dyn PriceSource,
    source: Source,
    mode: IngestMode,
    chunk: &[&TrackedItem],
    retry: &RetryPolicy,
    report: &mut SourceRunReport,
) -> (Vec<NewSnapshot>, Result<(), AdapterError>) {
    let mut batch = Vec::with_capacity(chunk.len());

    for item in chunk {
        let key = item.key_for(source);
        let fetched = match mode {
            IngestMode::Live => {
                fetch_with_retry(source, &key, retry, report, || adapter.fetch_price(&key))
                    .await
                    .map(|obs| {
                        obs.map(|o| vec![NewSnapshot::from_observation(item.id, &o, o.origin)])
                    })
            }
            IngestMode::Backfill { days } => fetch_with_retry(source, &key, retry, report, || {
                adapter.fetch_price_history(&key, days)
            })
            .await
            .map(|history| {
                history.map(|h| {
                    h.iter()
                        .map(|o| NewSnapshot::from_observation(item.id, o, DataOrigin::BulkImport))
                        .collect()
                })
            }),
        };

        match fetched {
            Ok(Some(snapshots)) => {
                report.fetched += 1;
                batch.extend(snapshots);
            }
            Ok(None) => {}
            Err(e) => return (batch, Err(e)),
        }
    }

    (batch, Ok(()))
}

/// Call the adapter for one item. Ok(None) for terminal per-item outcomes
/// (not found, unparseable); Err only when retries are exhausted.
async fn fetch_with_retry<T, F, Fut>(
    source: Source,
    key: &ItemKey,
    retry: &RetryPolicy,
    report: &mut SourceRunReport,
    mut call: F,
) -> Result<Option<T>, AdapterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AdapterError>>,
{
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(Some(value)),
            Err(AdapterError::NotFound(what)) => {
                debug!(%source, item = %key, what, "Item not found, omitting");
                report.not_found += 1;
                return Ok(None);
            }
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for(attempt);
                debug!(
                    %source,
                    item = %key,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying after backoff"
                );
                report.retries += 1;
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(%source, item = %key, error = %e, "Dropping item");
                report.rejected += 1;
                return Ok(None);
            }
        }
    }
}
