//! Daily metrics aggregation.
//!
//! [`compute_daily_metrics`] is a pure function of one day's snapshots and the
//! item's prior daily rows. [`MetricsAggregator`] loads those inputs from the
//! stores and upserts the result, so recomputing a date replaces the row.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{DailyMetrics, Snapshot};
use crate::stats::{mean, median, pct_change, round_stat, sample_std_dev};
use crate::store::{day_bounds, MetricsStore, SnapshotStore, StoreError};

/// Longest trailing window any metric looks at.
const HISTORY_DAYS: i64 = 30;

/// Distinct currencies quoted in `snapshots`. Prices are combined as plain
/// numbers, so more than one entry means the figures mix currencies.
pub fn currencies(snapshots: &[Snapshot]) -> BTreeSet<&str> {
    snapshots.iter().map(|s| s.currency.as_str()).collect()
}

/// Compute the metrics row for `date` from that day's snapshots (all sources)
/// and the item's earlier daily rows. Returns None when there are no
/// snapshots for the date.
pub fn compute_daily_metrics(
    item_id: Uuid,
    date: NaiveDate,
    snapshots: &[Snapshot],
    history: &[DailyMetrics],
    computed_at: DateTime<Utc>,
) -> Option<DailyMetrics> {
    let quoted = currencies(snapshots);
    if quoted.len() > 1 {
        debug!(%item_id, %date, currencies = ?quoted, "Combining prices across currencies without conversion");
    }

    let prices: Vec<Decimal> = snapshots.iter().map(|s| s.price).collect();
    let avg = mean(&prices)?;
    let min = prices.iter().copied().min()?;
    let max = prices.iter().copied().max()?;
    let med = median(&prices)?;
    let spread = max - min;

    let listing_count: i32 = snapshots
        .iter()
        .filter_map(|s| s.aggregates.listing_count)
        .sum();
    let total_quantity: i32 = snapshots
        .iter()
        .filter_map(|s| s.aggregates.total_quantity)
        .sum();
    let source_count = snapshots
        .iter()
        .map(|s| s.source)
        .collect::<BTreeSet<_>>()
        .len();

    let prior: HashMap<NaiveDate, &DailyMetrics> = history
        .iter()
        .filter(|m| m.item_id == item_id && m.metric_date < date)
        .map(|m| (m.metric_date, m))
        .collect();

    let change_vs = |days: i64| -> (Option<Decimal>, Option<Decimal>) {
        match prior.get(&(date - Duration::days(days))) {
            Some(row) => (
                Some(round_stat(avg - row.avg_price)),
                pct_change(avg, row.avg_price).map(round_stat),
            ),
            None => (None, None),
        }
    };
    let (change_1d, pct_1d) = change_vs(1);
    let (change_7d, pct_7d) = change_vs(7);
    let (change_30d, pct_30d) = change_vs(30);

    // Trailing window of daily averages ending on (and including) `date`.
    let window = |days: i64| -> Vec<Decimal> {
        let start = date - Duration::days(days - 1);
        let mut values: Vec<(NaiveDate, Decimal)> = prior
            .values()
            .filter(|m| m.metric_date >= start)
            .map(|m| (m.metric_date, m.avg_price))
            .collect();
        values.sort_by_key(|(d, _)| *d);
        values.push((date, avg));
        values.into_iter().map(|(_, v)| v).collect()
    };
    let window_7 = window(7);
    let window_30 = window(30);

    Some(DailyMetrics {
        item_id,
        metric_date: date,
        avg_price: round_stat(avg),
        min_price: round_stat(min),
        max_price: round_stat(max),
        median_price: round_stat(med),
        spread: round_stat(spread),
        spread_pct: pct_change(max, min).map(round_stat),
        listing_count,
        total_quantity,
        source_count: source_count as i32,
        snapshot_count: snapshots.len() as i32,
        price_change_1d: change_1d,
        price_change_pct_1d: pct_1d,
        price_change_7d: change_7d,
        price_change_pct_7d: pct_7d,
        price_change_30d: change_30d,
        price_change_pct_30d: pct_30d,
        ma_7d: mean(&window_7).map(round_stat),
        ma_30d: mean(&window_30).map(round_stat),
        volatility_7d: sample_std_dev(&window_7).map(round_stat),
        volatility_30d: sample_std_dev(&window_30).map(round_stat),
        computed_at,
    })
}

/// Counters for one aggregation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AggregationStats {
    pub dates: usize,
    pub items_seen: usize,
    pub rows_written: usize,
}

/// Loads snapshots and prior rows, writes daily metrics.
pub struct MetricsAggregator {
    snapshots: Arc<dyn SnapshotStore>,
    metrics: Arc<dyn MetricsStore>,
}

impl MetricsAggregator {
    pub fn new(snapshots: Arc<dyn SnapshotStore>, metrics: Arc<dyn MetricsStore>) -> Self {
        Self { snapshots, metrics }
    }

    /// Recompute and upsert one item's row for `date`.
    pub async fn aggregate_item(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        computed_at: DateTime<Utc>,
    ) -> Result<Option<DailyMetrics>, StoreError> {
        let (from, to) = day_bounds(date);
        let snapshots = self.snapshots.snapshots_between(item_id, from, to).await?;
        if snapshots.is_empty() {
            debug!(%item_id, %date, "No snapshots for date, skipping");
            return Ok(None);
        }

        let history = self
            .metrics
            .daily_range(
                item_id,
                date - Duration::days(HISTORY_DAYS),
                date - Duration::days(1),
            )
            .await?;

        let Some(row) = compute_daily_metrics(item_id, date, &snapshots, &history, computed_at)
        else {
            return Ok(None);
        };
        self.metrics.upsert_daily(&row).await?;
        Ok(Some(row))
    }

    /// Aggregate every item with snapshots on `date`.
    pub async fn aggregate_date(
        &self,
        date: NaiveDate,
        computed_at: DateTime<Utc>,
    ) -> Result<AggregationStats, StoreError> {
        let (from, to) = day_bounds(date);
        let items = self.snapshots.items_with_snapshots_between(from, to).await?;

        let mut stats = AggregationStats {
            dates: 1,
            items_seen: items.len(),
            ..Default::default()
        };
        for item_id in items {
            if self.aggregate_item(item_id, date, computed_at).await?.is_some() {
                stats.rows_written += 1;
            }
        }

        info!(%date, items = stats.items_seen, rows = stats.rows_written, "Aggregated daily metrics");
        Ok(stats)
    }

    /// Aggregate the trailing `lookback_days` dates ending at `through`,
    /// oldest first so each day sees its predecessor's fresh row.
    pub async fn run(
        &self,
        through: NaiveDate,
        lookback_days: i64,
        computed_at: DateTime<Utc>,
    ) -> Result<AggregationStats, StoreError> {
        let mut total = AggregationStats::default();
        for offset in (0..lookback_days.max(1)).rev() {
            let date = through - Duration::days(offset);
            let stats = self.aggregate_date(date, computed_at).await?;
            total.dates += stats.dates;
            total.items_seen += stats.items_seen;
            total.rows_written += stats.rows_written;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataOrigin, NewSnapshot, PriceAggregates};
    use crate::source::Source;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, n).unwrap()
    }

    fn snapshot_on(item_id: Uuid, source: Source, date: NaiveDate, hour: u32, price: Decimal) -> NewSnapshot {
        NewSnapshot {
            item_id,
            source,
            snapshot_time: date.and_hms_opt(hour, 0, 0).unwrap().and_utc(),
            price,
            currency: source.currency().to_string(),
            aggregates: PriceAggregates {
                listing_count: Some(4),
                total_quantity: Some(9),
                ..Default::default()
            },
            origin: DataOrigin::LiveApi,
        }
    }

    fn aggregator(store: &Arc<MemoryStore>) -> MetricsAggregator {
        MetricsAggregator::new(store.clone(), store.clone())
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_five_day_series() {
        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        let prices = [dec!(10.00), dec!(10.00), dec!(12.50), dec!(12.50), dec!(15.00)];
        let batch: Vec<_> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| snapshot_on(item, Source::TcgPlayer, day(i as u32 + 1), 12, *p))
            .collect();
        store.bulk_upsert(&batch).await.unwrap();

        let agg = aggregator(&store);
        agg.run(day(5), 5, fixed_now()).await.unwrap();

        let m = store.daily_for(item, day(5)).await.unwrap().unwrap();
        assert_eq!(m.avg_price, dec!(15.00));
        assert_eq!(m.price_change_1d, Some(dec!(2.50)));
        assert_eq!(m.price_change_pct_1d, Some(dec!(20.00)));
        // No row seven days back
        assert_eq!(m.price_change_pct_7d, None);
        assert_eq!(m.ma_7d, Some(dec!(12.00)));
        assert!(m.volatility_7d.is_some());
    }

    #[tokio::test]
    async fn test_five_day_series_feeds_spike_signal() {
        use crate::models::SignalType;
        use crate::signals::{SignalDetector, SignalThresholds};
        use crate::store::SignalStore;

        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        let prices = [dec!(10.00), dec!(10.00), dec!(12.50), dec!(12.50), dec!(15.00)];
        let batch: Vec<_> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| snapshot_on(item, Source::TcgPlayer, day(i as u32 + 1), 12, *p))
            .collect();
        store.bulk_upsert(&batch).await.unwrap();

        aggregator(&store).run(day(5), 5, fixed_now()).await.unwrap();
        let detector = SignalDetector::new(store.clone(), store.clone(), SignalThresholds::default());
        let stats = detector.run(day(5), fixed_now()).await.unwrap();
        assert_eq!(stats.items, 1);

        let spikes = store
            .signals_for(item, day(5), Some(SignalType::SpikeUp))
            .await
            .unwrap();
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].value, dec!(0.20));
        assert!(spikes[0].confidence > 0.5);
    }

    #[tokio::test]
    async fn test_single_day_has_null_volatility() {
        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        store
            .bulk_upsert(&[snapshot_on(item, Source::TcgPlayer, day(1), 9, dec!(4))])
            .await
            .unwrap();

        let m = aggregator(&store)
            .aggregate_item(item, day(1), fixed_now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.volatility_7d, None);
        assert_eq!(m.volatility_30d, None);
        assert_eq!(m.price_change_1d, None);
        assert_eq!(m.ma_7d, Some(dec!(4)));
    }

    #[tokio::test]
    async fn test_cross_source_day_statistics() {
        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        store
            .bulk_upsert(&[
                snapshot_on(item, Source::TcgPlayer, day(2), 8, dec!(8)),
                snapshot_on(item, Source::TcgPlayer, day(2), 20, dec!(10)),
                snapshot_on(item, Source::Cardmarket, day(2), 12, dec!(12)),
            ])
            .await
            .unwrap();

        let m = aggregator(&store)
            .aggregate_item(item, day(2), fixed_now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m.min_price, dec!(8));
        assert_eq!(m.max_price, dec!(12));
        assert_eq!(m.median_price, dec!(10));
        assert_eq!(m.spread, dec!(4));
        assert_eq!(m.spread_pct, Some(dec!(50)));
        assert_eq!(m.source_count, 2);
        assert_eq!(m.snapshot_count, 3);
        assert_eq!(m.listing_count, 12);
        assert_eq!(m.total_quantity, 27);
    }

    #[test]
    fn test_zero_min_leaves_spread_pct_null() {
        let item = Uuid::new_v4();
        let snaps: Vec<Snapshot> = [dec!(0), dec!(2)]
            .iter()
            .enumerate()
            .map(|(i, p)| Snapshot {
                id: i as i64,
                item_id: item,
                source: Source::TcgPlayer,
                snapshot_time: day(1).and_hms_opt(i as u32, 0, 0).unwrap().and_utc(),
                price: *p,
                currency: "USD".to_string(),
                aggregates: PriceAggregates::default(),
                origin: DataOrigin::LiveApi,
                created_at: fixed_now(),
            })
            .collect();

        let m = compute_daily_metrics(item, day(1), &snaps, &[], fixed_now()).unwrap();
        assert_eq!(m.spread, dec!(2));
        assert_eq!(m.spread_pct, None);
    }

    #[test]
    fn test_currencies_flags_mixed_quotes() {
        let item = Uuid::new_v4();
        let snap = |source: Source, currency: &str| Snapshot {
            id: 0,
            item_id: item,
            source,
            snapshot_time: day(1).and_hms_opt(12, 0, 0).unwrap().and_utc(),
            price: dec!(10),
            currency: currency.to_string(),
            aggregates: PriceAggregates::default(),
            origin: DataOrigin::LiveApi,
            created_at: fixed_now(),
        };

        let single = [snap(Source::TcgPlayer, "USD"), snap(Source::TcgPlayer, "USD")];
        assert_eq!(currencies(&single).len(), 1);

        let mixed = [snap(Source::TcgPlayer, "USD"), snap(Source::Cardmarket, "EUR")];
        assert_eq!(currencies(&mixed).into_iter().collect::<Vec<_>>(), vec!["EUR", "USD"]);
        // Still computed; the mix is only reported
        assert!(compute_daily_metrics(item, day(1), &mixed, &[], fixed_now()).is_some());
    }

    #[test]
    fn test_no_snapshots_produces_nothing() {
        assert!(compute_daily_metrics(Uuid::new_v4(), day(1), &[], &[], fixed_now()).is_none());
    }

    #[tokio::test]
    async fn test_recompute_is_deterministic() {
        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        let batch: Vec<_> = (1..=10)
            .map(|d| snapshot_on(item, Source::Cardmarket, day(d), 6, Decimal::from(d * 3)))
            .collect();
        store.bulk_upsert(&batch).await.unwrap();

        let agg = aggregator(&store);
        agg.run(day(10), 10, fixed_now()).await.unwrap();
        let first = store.daily_range(item, day(1), day(10)).await.unwrap();

        agg.run(day(10), 10, fixed_now()).await.unwrap();
        let second = store.daily_range(item, day(1), day(10)).await.unwrap();

        assert_eq!(first.len(), 10);
        assert_eq!(first, second);
        let last = &second[9];
        assert_eq!(last.price_change_7d, Some(dec!(21)));
        assert_eq!(last.price_change_pct_7d, Some(dec!(233.3333)));
    }
}
