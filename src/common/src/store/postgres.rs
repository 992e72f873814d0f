//! PostgreSQL store.
//!
//! Dedup relies on the table constraints declared in the schema:
//! snapshot inserts use `ON CONFLICT ... DO NOTHING`, derived rows use
//! `ON CONFLICT ... DO UPDATE`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ItemCatalog, MetricsStore, RecommendationStore, SignalStore, SnapshotStore, StoreError,
};
use crate::models::{
    Action, DailyMetrics, DataOrigin, Finish, NewSnapshot, PriceAggregates, Recommendation,
    RecommendationFilter, RecommendationOutcome, Signal, SignalRef, SignalType, Snapshot,
    TrackedItem,
};
use crate::source::Source;

const DEFAULT_BATCH_SIZE: usize = 500;

const SNAPSHOT_COLUMNS: &str = "id, item_id, source_id, snapshot_time, price, currency, \
     min_price, max_price, avg_price, median_price, listing_count, total_quantity, \
     data_origin, created_at";

const METRICS_COLUMNS: &str = "item_id, metric_date, avg_price, min_price, max_price, \
     median_price, spread, spread_pct, listing_count, total_quantity, source_count, \
     snapshot_count, price_change_1d, price_change_pct_1d, price_change_7d, \
     price_change_pct_7d, price_change_30d, price_change_pct_30d, ma_7d, ma_30d, \
     volatility_7d, volatility_30d, computed_at";

const RECOMMENDATION_COLUMNS: &str = "id, item_id, action, confidence, rationale, \
     target_price, current_price, potential_profit_pct, horizon_days, signal_refs, \
     valid_from, valid_until, is_active, created_at, outcome_evaluated_at, \
     outcome_price_end, outcome_price_peak, outcome_price_peak_at, accuracy_score_end, \
     accuracy_score_peak, actual_profit_pct_end, actual_profit_pct_peak";

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    batch_size: usize,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Rows per multi-row INSERT.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_snapshot_chunk(&self, chunk: &[NewSnapshot]) -> Result<u64, sqlx::Error> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO price_snapshots (item_id, source_id, snapshot_time, price, currency, \
             min_price, max_price, avg_price, median_price, listing_count, total_quantity, \
             data_origin) ",
        );
        qb.push_values(chunk, |mut row, s| {
            row.push_bind(s.item_id)
                .push_bind(s.source.as_str())
                .push_bind(s.snapshot_time)
                .push_bind(s.price)
                .push_bind(&s.currency)
                .push_bind(s.aggregates.min_price)
                .push_bind(s.aggregates.max_price)
                .push_bind(s.aggregates.avg_price)
                .push_bind(s.aggregates.median_price)
                .push_bind(s.aggregates.listing_count)
                .push_bind(s.aggregates.total_quantity)
                .push_bind(s.origin.as_str());
        });
        qb.push(" ON CONFLICT (item_id, source_id, snapshot_time) DO NOTHING");

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

/// Errors that mean the store itself is unreachable, as opposed to a bad row.
fn is_connection_error(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    id: i64,
    item_id: Uuid,
    source_id: String,
    snapshot_time: DateTime<Utc>,
    price: Decimal,
    currency: String,
    min_price: Option<Decimal>,
    max_price: Option<Decimal>,
    avg_price: Option<Decimal>,
    median_price: Option<Decimal>,
    listing_count: Option<i32>,
    total_quantity: Option<i32>,
    data_origin: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        let source = Source::from_str(&row.source_id)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown source {}", row.source_id)))?;
        let origin = DataOrigin::from_str(&row.data_origin).ok_or_else(|| {
            StoreError::CorruptRow(format!("unknown data origin {}", row.data_origin))
        })?;

        Ok(Snapshot {
            id: row.id,
            item_id: row.item_id,
            source,
            snapshot_time: row.snapshot_time,
            price: row.price,
            currency: row.currency,
            aggregates: PriceAggregates {
                min_price: row.min_price,
                max_price: row.max_price,
                avg_price: row.avg_price,
                median_price: row.median_price,
                listing_count: row.listing_count,
                total_quantity: row.total_quantity,
            },
            origin,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn bulk_upsert(&self, snapshots: &[NewSnapshot]) -> Result<u64, StoreError> {
        let mut inserted = 0;

        for chunk in snapshots.chunks(self.batch_size) {
            match self.insert_snapshot_chunk(chunk).await {
                Ok(n) => inserted += n,
                Err(e) if is_connection_error(&e) => return Err(e.into()),
                Err(e) => {
                    // One bad row fails the whole statement; isolate it.
                    warn!(rows = chunk.len(), error = %e, "Batch insert failed, retrying row by row");
                    for snap in chunk {
                        match self.insert_snapshot_chunk(std::slice::from_ref(snap)).await {
                            Ok(n) => inserted += n,
                            Err(e) if is_connection_error(&e) => return Err(e.into()),
                            Err(e) => warn!(
                                item_id = %snap.item_id,
                                source = %snap.source,
                                snapshot_time = %snap.snapshot_time,
                                error = %e,
                                "Dropping snapshot the store rejected"
                            ),
                        }
                    }
                }
            }
        }

        debug!(offered = snapshots.len(), inserted, "Snapshot upsert complete");
        Ok(inserted)
    }

    async fn snapshots_between(
        &self,
        item_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let sql = format!(
            "SELECT {} FROM price_snapshots \
             WHERE item_id = $1 AND snapshot_time >= $2 AND snapshot_time < $3 \
             ORDER BY snapshot_time ASC, id ASC",
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query_as::<_, SnapshotRow>(&sql)
            .bind(item_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Snapshot::try_from).collect()
    }

    async fn items_with_snapshots_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT item_id FROM price_snapshots \
             WHERE snapshot_time >= $1 AND snapshot_time < $2 ORDER BY item_id",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn count_snapshots(&self, source: Option<Source>) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM price_snapshots WHERE ($1::varchar IS NULL OR source_id = $1)",
        )
        .bind(source.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl MetricsStore for PgStore {
    async fn upsert_daily(&self, m: &DailyMetrics) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_metrics (
                item_id, metric_date, avg_price, min_price, max_price, median_price,
                spread, spread_pct, listing_count, total_quantity, source_count, snapshot_count,
                price_change_1d, price_change_pct_1d, price_change_7d, price_change_pct_7d,
                price_change_30d, price_change_pct_30d, ma_7d, ma_30d,
                volatility_7d, volatility_30d, computed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            ON CONFLICT (item_id, metric_date) DO UPDATE SET
                avg_price = EXCLUDED.avg_price,
                min_price = EXCLUDED.min_price,
                max_price = EXCLUDED.max_price,
                median_price = EXCLUDED.median_price,
                spread = EXCLUDED.spread,
                spread_pct = EXCLUDED.spread_pct,
                listing_count = EXCLUDED.listing_count,
                total_quantity = EXCLUDED.total_quantity,
                source_count = EXCLUDED.source_count,
                snapshot_count = EXCLUDED.snapshot_count,
                price_change_1d = EXCLUDED.price_change_1d,
                price_change_pct_1d = EXCLUDED.price_change_pct_1d,
                price_change_7d = EXCLUDED.price_change_7d,
                price_change_pct_7d = EXCLUDED.price_change_pct_7d,
                price_change_30d = EXCLUDED.price_change_30d,
                price_change_pct_30d = EXCLUDED.price_change_pct_30d,
                ma_7d = EXCLUDED.ma_7d,
                ma_30d = EXCLUDED.ma_30d,
                volatility_7d = EXCLUDED.volatility_7d,
                volatility_30d = EXCLUDED.volatility_30d,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(m.item_id)
        .bind(m.metric_date)
        .bind(m.avg_price)
        .bind(m.min_price)
        .bind(m.max_price)
        .bind(m.median_price)
        .bind(m.spread)
        .bind(m.spread_pct)
        .bind(m.listing_count)
        .bind(m.total_quantity)
        .bind(m.source_count)
        .bind(m.snapshot_count)
        .bind(m.price_change_1d)
        .bind(m.price_change_pct_1d)
        .bind(m.price_change_7d)
        .bind(m.price_change_pct_7d)
        .bind(m.price_change_30d)
        .bind(m.price_change_pct_30d)
        .bind(m.ma_7d)
        .bind(m.ma_30d)
        .bind(m.volatility_7d)
        .bind(m.volatility_30d)
        .bind(m.computed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn daily_for(
        &self,
        item_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<DailyMetrics>, StoreError> {
        let sql = format!(
            "SELECT {} FROM daily_metrics WHERE item_id = $1 AND metric_date = $2",
            METRICS_COLUMNS
        );
        let row = sqlx::query_as::<_, DailyMetrics>(&sql)
            .bind(item_id)
            .bind(date)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn daily_range(
        &self,
        item_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyMetrics>, StoreError> {
        let sql = format!(
            "SELECT {} FROM daily_metrics \
             WHERE item_id = $1 AND metric_date >= $2 AND metric_date <= $3 \
             ORDER BY metric_date ASC",
            METRICS_COLUMNS
        );
        let rows = sqlx::query_as::<_, DailyMetrics>(&sql)
            .bind(item_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn latest_daily(&self, item_id: Uuid) -> Result<Option<DailyMetrics>, StoreError> {
        let sql = format!(
            "SELECT {} FROM daily_metrics WHERE item_id = $1 ORDER BY metric_date DESC LIMIT 1",
            METRICS_COLUMNS
        );
        let row = sqlx::query_as::<_, DailyMetrics>(&sql)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn items_with_metrics_on(&self, date: NaiveDate) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT item_id FROM daily_metrics WHERE metric_date = $1 ORDER BY item_id",
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[derive(Debug, FromRow)]
struct SignalRow {
    item_id: Uuid,
    signal_date: NaiveDate,
    signal_type: String,
    value: Decimal,
    confidence: f64,
    details: serde_json::Value,
    explanation: Option<String>,
    detected_at: DateTime<Utc>,
}

impl TryFrom<SignalRow> for Signal {
    type Error = StoreError;

    fn try_from(row: SignalRow) -> Result<Self, Self::Error> {
        let signal_type = SignalType::from_str(&row.signal_type).ok_or_else(|| {
            StoreError::CorruptRow(format!("unknown signal type {}", row.signal_type))
        })?;
        Ok(Signal {
            item_id: row.item_id,
            signal_date: row.signal_date,
            signal_type,
            value: row.value,
            confidence: row.confidence,
            details: row.details,
            explanation: row.explanation,
            detected_at: row.detected_at,
        })
    }
}

#[async_trait]
impl SignalStore for PgStore {
    async fn replace_signals(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        signals: &[Signal],
    ) -> Result<(), StoreError> {
        let types: Vec<String> = signals
            .iter()
            .map(|s| s.signal_type.as_str().to_string())
            .collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM signals \
             WHERE item_id = $1 AND signal_date = $2 AND NOT (signal_type = ANY($3))",
        )
        .bind(item_id)
        .bind(date)
        .bind(&types)
        .execute(&mut *tx)
        .await?;

        for signal in signals {
            sqlx::query(
                r#"
                INSERT INTO signals (item_id, signal_date, signal_type, value, confidence,
                                     details, explanation, detected_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (item_id, signal_date, signal_type) DO UPDATE SET
                    value = EXCLUDED.value,
                    confidence = EXCLUDED.confidence,
                    details = EXCLUDED.details,
                    explanation = EXCLUDED.explanation,
                    detected_at = EXCLUDED.detected_at
                "#,
            )
            .bind(item_id)
            .bind(date)
            .bind(signal.signal_type.as_str())
            .bind(signal.value)
            .bind(signal.confidence)
            .bind(&signal.details)
            .bind(&signal.explanation)
            .bind(signal.detected_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn signals_for(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        signal_type: Option<SignalType>,
    ) -> Result<Vec<Signal>, StoreError> {
        let rows = sqlx::query_as::<_, SignalRow>(
            "SELECT item_id, signal_date, signal_type, value, confidence, details, \
                    explanation, detected_at \
             FROM signals \
             WHERE item_id = $1 AND signal_date = $2 \
               AND ($3::varchar IS NULL OR signal_type = $3) \
             ORDER BY signal_type",
        )
        .bind(item_id)
        .bind(date)
        .bind(signal_type.map(|t| t.as_str()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Signal::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct RecommendationRow {
    id: Uuid,
    item_id: Uuid,
    action: String,
    confidence: f64,
    rationale: String,
    target_price: Decimal,
    current_price: Decimal,
    potential_profit_pct: Decimal,
    horizon_days: i32,
    signal_refs: serde_json::Value,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    is_active: bool,
    created_at: DateTime<Utc>,
    outcome_evaluated_at: Option<DateTime<Utc>>,
    outcome_price_end: Option<Decimal>,
    outcome_price_peak: Option<Decimal>,
    outcome_price_peak_at: Option<DateTime<Utc>>,
    accuracy_score_end: Option<f64>,
    accuracy_score_peak: Option<f64>,
    actual_profit_pct_end: Option<Decimal>,
    actual_profit_pct_peak: Option<Decimal>,
}

impl TryFrom<RecommendationRow> for Recommendation {
    type Error = StoreError;

    fn try_from(row: RecommendationRow) -> Result<Self, Self::Error> {
        let action = Action::from_str(&row.action)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown action {}", row.action)))?;
        let signal_refs: Vec<SignalRef> = serde_json::from_value(row.signal_refs)?;

        let outcome = match (
            row.outcome_evaluated_at,
            row.outcome_price_end,
            row.outcome_price_peak,
            row.outcome_price_peak_at,
        ) {
            (Some(evaluated_at), Some(end_price), Some(peak_price), Some(peak_at)) => {
                Some(RecommendationOutcome {
                    end_price,
                    peak_price,
                    peak_at,
                    accuracy_score_end: row.accuracy_score_end.unwrap_or(0.0),
                    accuracy_score_peak: row.accuracy_score_peak.unwrap_or(0.0),
                    actual_profit_pct_end: row.actual_profit_pct_end.unwrap_or_default(),
                    actual_profit_pct_peak: row.actual_profit_pct_peak.unwrap_or_default(),
                    evaluated_at,
                })
            }
            (None, ..) => None,
            _ => {
                return Err(StoreError::CorruptRow(format!(
                    "recommendation {} has partial outcome fields",
                    row.id
                )))
            }
        };

        Ok(Recommendation {
            id: row.id,
            item_id: row.item_id,
            action,
            confidence: row.confidence,
            rationale: row.rationale,
            target_price: row.target_price,
            current_price: row.current_price,
            potential_profit_pct: row.potential_profit_pct,
            horizon_days: row.horizon_days,
            signal_refs,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            is_active: row.is_active,
            created_at: row.created_at,
            outcome,
        })
    }
}

#[async_trait]
impl RecommendationStore for PgStore {
    async fn insert_recommendation(&self, rec: &Recommendation) -> Result<(), StoreError> {
        let signal_refs = serde_json::to_value(&rec.signal_refs)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE recommendations SET is_active = false \
             WHERE item_id = $1 AND is_active = true AND id <> $2",
        )
        .bind(rec.item_id)
        .bind(rec.id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO recommendations (
                id, item_id, action, confidence, rationale, target_price, current_price,
                potential_profit_pct, horizon_days, signal_refs, valid_from, valid_until,
                is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(rec.id)
        .bind(rec.item_id)
        .bind(rec.action.as_str())
        .bind(rec.confidence)
        .bind(&rec.rationale)
        .bind(rec.target_price)
        .bind(rec.current_price)
        .bind(rec.potential_profit_pct)
        .bind(rec.horizon_days)
        .bind(signal_refs)
        .bind(rec.valid_from)
        .bind(rec.valid_until)
        .bind(rec.is_active)
        .bind(rec.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_recommendation(&self, id: Uuid) -> Result<Option<Recommendation>, StoreError> {
        let sql = format!(
            "SELECT {} FROM recommendations WHERE id = $1",
            RECOMMENDATION_COLUMNS
        );
        let row = sqlx::query_as::<_, RecommendationRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Recommendation::try_from).transpose()
    }

    async fn active_recommendations(
        &self,
        filter: &RecommendationFilter,
    ) -> Result<Vec<Recommendation>, StoreError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        qb.push(RECOMMENDATION_COLUMNS);
        qb.push(" FROM recommendations WHERE is_active = true");
        if let Some(action) = filter.action {
            qb.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(min_confidence) = filter.min_confidence {
            qb.push(" AND confidence >= ").push_bind(min_confidence);
        }
        qb.push(" ORDER BY confidence DESC, created_at DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit.max(0));
        }

        let rows = qb
            .build_query_as::<RecommendationRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Recommendation::try_from).collect()
    }

    async fn due_for_evaluation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recommendation>, StoreError> {
        let sql = format!(
            "SELECT {} FROM recommendations \
             WHERE outcome_evaluated_at IS NULL AND valid_until <= $1 \
             ORDER BY valid_until ASC",
            RECOMMENDATION_COLUMNS
        );
        let rows = sqlx::query_as::<_, RecommendationRow>(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Recommendation::try_from).collect()
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: &RecommendationOutcome,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE recommendations SET
                outcome_evaluated_at = $2,
                outcome_price_end = $3,
                outcome_price_peak = $4,
                outcome_price_peak_at = $5,
                accuracy_score_end = $6,
                accuracy_score_peak = $7,
                actual_profit_pct_end = $8,
                actual_profit_pct_peak = $9
            WHERE id = $1 AND outcome_evaluated_at IS NULL
            "#,
        )
        .bind(id)
        .bind(outcome.evaluated_at)
        .bind(outcome.end_price)
        .bind(outcome.peak_price)
        .bind(outcome.peak_at)
        .bind(outcome.accuracy_score_end)
        .bind(outcome.accuracy_score_peak)
        .bind(outcome.actual_profit_pct_end)
        .bind(outcome.actual_profit_pct_peak)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE recommendations SET is_active = false \
             WHERE is_active = true AND valid_until < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: Uuid,
    name: String,
    set_code: String,
    collector_number: Option<String>,
    finish: String,
    external_ids: serde_json::Value,
}

impl From<ItemRow> for TrackedItem {
    fn from(row: ItemRow) -> Self {
        let raw: BTreeMap<String, String> =
            serde_json::from_value(row.external_ids).unwrap_or_default();
        let external_ids = raw
            .into_iter()
            .filter_map(|(source, id)| Source::from_str(&source).map(|s| (s, id)))
            .collect();

        TrackedItem {
            id: row.id,
            name: row.name,
            set_code: row.set_code,
            collector_number: row.collector_number,
            finish: Finish::from_str(&row.finish),
            external_ids,
        }
    }
}

#[async_trait]
impl ItemCatalog for PgStore {
    async fn tracked_items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        let rows = sqlx::query_as::<_, ItemRow>(
            "SELECT id, name, set_code, collector_number, finish, external_ids \
             FROM tracked_items WHERE is_tracked = true ORDER BY name, set_code",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(TrackedItem::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Database};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn test_partial_outcome_is_corrupt() {
        let row = RecommendationRow {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            action: "BUY".to_string(),
            confidence: 0.6,
            rationale: "r".to_string(),
            target_price: dec!(12),
            current_price: dec!(10),
            potential_profit_pct: dec!(20),
            horizon_days: 7,
            signal_refs: serde_json::json!([]),
            valid_from: Utc::now(),
            valid_until: Utc::now(),
            is_active: true,
            created_at: Utc::now(),
            outcome_evaluated_at: Some(Utc::now()),
            outcome_price_end: None,
            outcome_price_peak: None,
            outcome_price_peak_at: None,
            accuracy_score_end: None,
            accuracy_score_peak: None,
            actual_profit_pct_end: None,
            actual_profit_pct_peak: None,
        };
        assert!(matches!(
            Recommendation::try_from(row),
            Err(StoreError::CorruptRow(_))
        ));
    }

    #[test]
    fn test_item_row_ignores_unknown_sources() {
        let row = ItemRow {
            id: Uuid::new_v4(),
            name: "Sheoldred, the Apocalypse".to_string(),
            set_code: "DMU".to_string(),
            collector_number: Some("107".to_string()),
            finish: "foil".to_string(),
            external_ids: serde_json::json!({"tcgplayer": "270752", "ebay": "x"}),
        };
        let item = TrackedItem::from(row);
        assert_eq!(item.finish, Finish::Foil);
        assert_eq!(item.external_ids.len(), 1);
        assert_eq!(item.external_ids.get(&Source::TcgPlayer).map(String::as_str), Some("270752"));
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_bulk_upsert_against_postgres() {
        dotenvy::dotenv().ok();
        let config = Config::from_env().expect("Config should load");
        let db = Database::connect(&config).await.expect("connect");
        db.apply_schema().await.expect("schema");
        let store = PgStore::new(db.pool().clone()).with_batch_size(3);

        let item_id = Uuid::new_v4();
        let batch: Vec<NewSnapshot> = (0..7)
            .map(|h| NewSnapshot {
                item_id,
                source: Source::TcgPlayer,
                snapshot_time: Utc.with_ymd_and_hms(2024, 5, 1, h, 0, 0).unwrap(),
                price: dec!(10.5),
                currency: "USD".to_string(),
                aggregates: PriceAggregates::default(),
                origin: DataOrigin::LiveApi,
            })
            .collect();

        assert_eq!(store.bulk_upsert(&batch).await.unwrap(), 7);
        assert_eq!(store.bulk_upsert(&batch).await.unwrap(), 0);

        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let rows = store
            .snapshots_between(item_id, from, from + chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 7);
    }
}
