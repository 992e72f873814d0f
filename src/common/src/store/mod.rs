//! Persistence traits for snapshots and derived analytics.
//!
//! Two implementations share these contracts: [`PgStore`] for production and
//! [`MemoryStore`] for tests and dry runs. Uniqueness is enforced by the store
//! itself (a database constraint, or the memory store's lock), never by a
//! read-then-write check in the caller.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    DailyMetrics, NewSnapshot, Recommendation, RecommendationFilter, RecommendationOutcome,
    Signal, SignalType, Snapshot, TrackedItem,
};
use crate::source::Source;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Append-only snapshot time series.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert every snapshot whose (item_id, source, snapshot_time) key is not
    /// present yet. Conflicting keys are skipped silently. Returns the number
    /// of rows actually inserted.
    async fn bulk_upsert(&self, snapshots: &[NewSnapshot]) -> Result<u64, StoreError>;

    /// Snapshots for an item with `from <= snapshot_time < to`, oldest first.
    async fn snapshots_between(
        &self,
        item_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError>;

    /// Items with at least one snapshot in `[from, to)`.
    async fn items_with_snapshots_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Row count, optionally narrowed to one source.
    async fn count_snapshots(&self, source: Option<Source>) -> Result<i64, StoreError>;
}

/// Daily metrics, one row per (item_id, metric_date).
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Insert or overwrite the row for (item_id, metric_date).
    async fn upsert_daily(&self, metrics: &DailyMetrics) -> Result<(), StoreError>;

    async fn daily_for(
        &self,
        item_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<DailyMetrics>, StoreError>;

    /// Rows with `from <= metric_date <= to`, oldest first.
    async fn daily_range(
        &self,
        item_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyMetrics>, StoreError>;

    async fn latest_daily(&self, item_id: Uuid) -> Result<Option<DailyMetrics>, StoreError>;

    async fn items_with_metrics_on(&self, date: NaiveDate) -> Result<Vec<Uuid>, StoreError>;
}

/// Signals, unique per (item_id, signal_date, signal_type).
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Make `signals` the complete set for (item_id, date): upsert each one
    /// and drop types from an earlier run that no longer fire. Atomic.
    async fn replace_signals(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        signals: &[Signal],
    ) -> Result<(), StoreError>;

    async fn signals_for(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        signal_type: Option<SignalType>,
    ) -> Result<Vec<Signal>, StoreError>;
}

/// Recommendations and their outcomes.
#[async_trait]
pub trait RecommendationStore: Send + Sync {
    /// Insert a recommendation and deactivate the item's previous active ones.
    async fn insert_recommendation(&self, rec: &Recommendation) -> Result<(), StoreError>;

    async fn get_recommendation(&self, id: Uuid) -> Result<Option<Recommendation>, StoreError>;

    /// Active recommendations, most confident first.
    async fn active_recommendations(
        &self,
        filter: &RecommendationFilter,
    ) -> Result<Vec<Recommendation>, StoreError>;

    /// Recommendations whose horizon has elapsed and that have no outcome yet.
    async fn due_for_evaluation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recommendation>, StoreError>;

    /// Write outcome fields if none are present. Returns false when the
    /// recommendation was already evaluated (or does not exist).
    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: &RecommendationOutcome,
    ) -> Result<bool, StoreError>;

    /// Deactivate recommendations whose validity window has ended.
    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Catalog of items the pipeline tracks.
#[async_trait]
pub trait ItemCatalog: Send + Sync {
    async fn tracked_items(&self) -> Result<Vec<TrackedItem>, StoreError>;
}

/// Day boundaries `[start, end)` in UTC.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}
