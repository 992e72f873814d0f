//! In-memory store.
//!
//! Same contracts as the PostgreSQL store. Each operation runs under one
//! lock acquisition, which plays the role of the database's uniqueness
//! constraint and transaction.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ItemCatalog, MetricsStore, RecommendationStore, SignalStore, SnapshotStore, StoreError,
};
use crate::models::{
    DailyMetrics, NewSnapshot, Recommendation, RecommendationFilter, RecommendationOutcome,
    Signal, SignalType, Snapshot, TrackedItem,
};
use crate::source::Source;

type SnapshotKey = (Uuid, Source, DateTime<Utc>);

#[derive(Default)]
struct Inner {
    next_snapshot_id: i64,
    snapshots: BTreeMap<SnapshotKey, Snapshot>,
    metrics: BTreeMap<(Uuid, NaiveDate), DailyMetrics>,
    signals: BTreeMap<(Uuid, NaiveDate, SignalType), Signal>,
    recommendations: HashMap<Uuid, Recommendation>,
    items: Vec<TrackedItem>,
}

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with a catalog.
    pub fn with_items(items: Vec<TrackedItem>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                items,
                ..Default::default()
            }),
        }
    }

    pub async fn add_item(&self, item: TrackedItem) {
        self.inner.write().await.items.push(item);
    }

    /// Every snapshot, ordered by key. For assertions and dry-run reports.
    pub async fn all_snapshots(&self) -> Vec<Snapshot> {
        self.inner.read().await.snapshots.values().cloned().collect()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn bulk_upsert(&self, snapshots: &[NewSnapshot]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        let now = Utc::now();

        for snap in snapshots {
            if inner.snapshots.contains_key(&snap.key()) {
                continue;
            }
            inner.next_snapshot_id += 1;
            let id = inner.next_snapshot_id;
            inner.snapshots.insert(
                snap.key(),
                Snapshot {
                    id,
                    item_id: snap.item_id,
                    source: snap.source,
                    snapshot_time: snap.snapshot_time,
                    price: snap.price,
                    currency: snap.currency.clone(),
                    aggregates: snap.aggregates.clone(),
                    origin: snap.origin,
                    created_at: now,
                },
            );
            inserted += 1;
        }

        Ok(inserted)
    }

    async fn snapshots_between(
        &self,
        item_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<Snapshot> = inner
            .snapshots
            .values()
            .filter(|s| s.item_id == item_id && s.snapshot_time >= from && s.snapshot_time < to)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.snapshot_time.cmp(&b.snapshot_time).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn items_with_snapshots_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<Uuid> = inner
            .snapshots
            .values()
            .filter(|s| s.snapshot_time >= from && s.snapshot_time < to)
            .map(|s| s.item_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn count_snapshots(&self, source: Option<Source>) -> Result<i64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .snapshots
            .values()
            .filter(|s| source.map_or(true, |src| s.source == src))
            .count() as i64)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn upsert_daily(&self, metrics: &DailyMetrics) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .metrics
            .insert((metrics.item_id, metrics.metric_date), metrics.clone());
        Ok(())
    }

    async fn daily_for(
        &self,
        item_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<DailyMetrics>, StoreError> {
        Ok(self.inner.read().await.metrics.get(&(item_id, date)).cloned())
    }

    async fn daily_range(
        &self,
        item_id: Uuid,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<DailyMetrics>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let inner = self.inner.read().await;
        Ok(inner
            .metrics
            .range((item_id, from)..=(item_id, to))
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn latest_daily(&self, item_id: Uuid) -> Result<Option<DailyMetrics>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .metrics
            .range((item_id, NaiveDate::MIN)..=(item_id, NaiveDate::MAX))
            .next_back()
            .map(|(_, m)| m.clone()))
    }

    async fn items_with_metrics_on(&self, date: NaiveDate) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .metrics
            .keys()
            .filter(|(_, d)| *d == date)
            .map(|(id, _)| *id)
            .collect())
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn replace_signals(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        signals: &[Signal],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .signals
            .retain(|(id, d, _), _| !(*id == item_id && *d == date));
        for signal in signals {
            inner
                .signals
                .insert((item_id, date, signal.signal_type), signal.clone());
        }
        Ok(())
    }

    async fn signals_for(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        signal_type: Option<SignalType>,
    ) -> Result<Vec<Signal>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .signals
            .iter()
            .filter(|((id, d, t), _)| {
                *id == item_id && *d == date && signal_type.map_or(true, |st| st == *t)
            })
            .map(|(_, s)| s.clone())
            .collect())
    }
}

#[async_trait]
impl RecommendationStore for MemoryStore {
    async fn insert_recommendation(&self, rec: &Recommendation) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for existing in inner.recommendations.values_mut() {
            if existing.item_id == rec.item_id && existing.is_active {
                existing.is_active = false;
            }
        }
        inner.recommendations.insert(rec.id, rec.clone());
        Ok(())
    }

    async fn get_recommendation(&self, id: Uuid) -> Result<Option<Recommendation>, StoreError> {
        Ok(self.inner.read().await.recommendations.get(&id).cloned())
    }

    async fn active_recommendations(
        &self,
        filter: &RecommendationFilter,
    ) -> Result<Vec<Recommendation>, StoreError> {
        let inner = self.inner.read().await;
        let mut recs: Vec<Recommendation> = inner
            .recommendations
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        recs.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(b.created_at.cmp(&a.created_at))
        });
        if let Some(limit) = filter.limit {
            recs.truncate(limit.max(0) as usize);
        }
        Ok(recs)
    }

    async fn due_for_evaluation(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Recommendation>, StoreError> {
        let inner = self.inner.read().await;
        let mut due: Vec<Recommendation> = inner
            .recommendations
            .values()
            .filter(|r| r.outcome.is_none() && r.valid_until <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.valid_until.cmp(&b.valid_until));
        Ok(due)
    }

    async fn record_outcome(
        &self,
        id: Uuid,
        outcome: &RecommendationOutcome,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.recommendations.get_mut(&id) {
            Some(rec) if rec.outcome.is_none() => {
                rec.outcome = Some(outcome.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for rec in inner.recommendations.values_mut() {
            if rec.is_active && rec.valid_until < now {
                rec.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl ItemCatalog for MemoryStore {
    async fn tracked_items(&self) -> Result<Vec<TrackedItem>, StoreError> {
        Ok(self.inner.read().await.items.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataOrigin, PriceAggregates};
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn snap(item_id: Uuid, source: Source, hour: u32, price: Decimal) -> NewSnapshot {
        NewSnapshot {
            item_id,
            source,
            snapshot_time: Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap(),
            price,
            currency: "USD".to_string(),
            aggregates: PriceAggregates::default(),
            origin: DataOrigin::LiveApi,
        }
    }

    #[tokio::test]
    async fn test_bulk_upsert_is_idempotent() {
        let store = MemoryStore::new();
        let item = Uuid::new_v4();
        let batch: Vec<_> = (0..5).map(|h| snap(item, Source::TcgPlayer, h, dec!(10))).collect();

        assert_eq!(store.bulk_upsert(&batch).await.unwrap(), 5);
        for _ in 0..3 {
            assert_eq!(store.bulk_upsert(&batch).await.unwrap(), 0);
        }
        assert_eq!(store.count_snapshots(None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_conflicting_key_keeps_first_write() {
        let store = MemoryStore::new();
        let item = Uuid::new_v4();
        store
            .bulk_upsert(&[snap(item, Source::TcgPlayer, 1, dec!(10))])
            .await
            .unwrap();
        // Same key, different price: a correction must be a new snapshot time
        let inserted = store
            .bulk_upsert(&[snap(item, Source::TcgPlayer, 1, dec!(99))])
            .await
            .unwrap();
        assert_eq!(inserted, 0);
        assert_eq!(store.all_snapshots().await[0].price, dec!(10));
    }

    #[tokio::test]
    async fn test_concurrent_overlapping_batches() {
        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        let a: Vec<_> = (0..10).map(|h| snap(item, Source::TcgPlayer, h, dec!(1))).collect();
        let b: Vec<_> = (5..15).map(|h| snap(item, Source::TcgPlayer, h, dec!(1))).collect();

        let (s1, s2) = (Arc::clone(&store), Arc::clone(&store));
        let h1 = tokio::spawn(async move { s1.bulk_upsert(&a).await.unwrap() });
        let h2 = tokio::spawn(async move { s2.bulk_upsert(&b).await.unwrap() });
        let total = h1.await.unwrap() + h2.await.unwrap();

        // Union of distinct keys is hours 0..15
        assert_eq!(total, 15);
        assert_eq!(store.count_snapshots(Some(Source::TcgPlayer)).await.unwrap(), 15);
    }

    #[tokio::test]
    async fn test_replace_signals_drops_stale_types() {
        let store = MemoryStore::new();
        let item = Uuid::new_v4();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let signal = |t: SignalType| Signal {
            item_id: item,
            signal_date: date,
            signal_type: t,
            value: dec!(0),
            confidence: 0.5,
            details: serde_json::json!({}),
            explanation: None,
            detected_at: Utc::now(),
        };

        store.replace_signals(item, date, &[signal(SignalType::Stable)]).await.unwrap();
        store
            .replace_signals(item, date, &[signal(SignalType::MomentumUp), signal(SignalType::SpikeUp)])
            .await
            .unwrap();

        let all = store.signals_for(item, date, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store
            .signals_for(item, date, Some(SignalType::Stable))
            .await
            .unwrap()
            .is_empty());
    }
}
