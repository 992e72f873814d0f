//! Threshold-based signal detection over daily metrics.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{DailyMetrics, Signal, SignalType};
use crate::store::{MetricsStore, SignalStore, StoreError};

/// Detection thresholds. Percent values are in percent units (10 = 10%).
#[derive(Debug, Clone, PartialEq)]
pub struct SignalThresholds {
    /// |7d change| above this fires momentum_up / momentum_down
    pub momentum_pct: Decimal,
    /// |1d change| above this fires spike_up / spike_down
    pub spike_pct: Decimal,
    /// spread_pct above this fires spread_high
    pub spread_pct: Decimal,
    /// |ma_7d vs ma_30d| above this fires trend_bullish / trend_bearish
    pub trend_pct: Decimal,
    /// volatility_7d / volatility_30d above this fires volatility_high
    pub volatility_high_ratio: Decimal,
    /// volatility_7d / volatility_30d below this fires volatility_low
    pub volatility_low_ratio: Decimal,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            momentum_pct: dec!(10),
            spike_pct: dec!(15),
            spread_pct: dec!(30),
            trend_pct: dec!(5),
            volatility_high_ratio: dec!(1.5),
            volatility_low_ratio: dec!(0.5),
        }
    }
}

/// Confidence for a magnitude above its threshold: 0.5 just past the
/// threshold, 1.0 at twice the threshold, monotonic in between.
pub fn confidence_above(magnitude: Decimal, threshold: Decimal) -> f64 {
    if threshold <= Decimal::ZERO {
        return 1.0;
    }
    let excess = ((magnitude - threshold) / threshold).to_f64().unwrap_or(0.0);
    (0.5 + 0.5 * excess).clamp(0.0, 1.0)
}

/// Confidence for a magnitude below its threshold: 0.5 just under, 1.0 at zero.
pub fn confidence_below(magnitude: Decimal, threshold: Decimal) -> f64 {
    if threshold <= Decimal::ZERO {
        return 0.0;
    }
    let shortfall = ((threshold - magnitude) / threshold).to_f64().unwrap_or(0.0);
    (0.5 + 0.5 * shortfall).clamp(0.0, 1.0)
}

fn fraction(pct: Decimal) -> Decimal {
    (pct / Decimal::ONE_HUNDRED).round_dp(6)
}

/// Classify one metrics row. Pure; `detected_at` is stamped on each signal.
pub fn detect(
    metrics: &DailyMetrics,
    thresholds: &SignalThresholds,
    detected_at: DateTime<Utc>,
) -> Vec<Signal> {
    let mut signals = Vec::new();
    let make = |signal_type: SignalType, value: Decimal, confidence: f64, details: serde_json::Value| Signal {
        item_id: metrics.item_id,
        signal_date: metrics.metric_date,
        signal_type,
        value,
        confidence,
        details,
        explanation: None,
        detected_at,
    };

    if let Some(pct) = metrics.price_change_pct_7d {
        if pct.abs() > thresholds.momentum_pct {
            let signal_type = if pct > Decimal::ZERO {
                SignalType::MomentumUp
            } else {
                SignalType::MomentumDown
            };
            signals.push(make(
                signal_type,
                fraction(pct),
                confidence_above(pct.abs(), thresholds.momentum_pct),
                json!({ "price_change_pct_7d": pct, "threshold_pct": thresholds.momentum_pct }),
            ));
        }
    }

    if let Some(pct) = metrics.price_change_pct_1d {
        if pct.abs() > thresholds.spike_pct {
            let signal_type = if pct > Decimal::ZERO {
                SignalType::SpikeUp
            } else {
                SignalType::SpikeDown
            };
            signals.push(make(
                signal_type,
                fraction(pct),
                confidence_above(pct.abs(), thresholds.spike_pct),
                json!({ "price_change_pct_1d": pct, "threshold_pct": thresholds.spike_pct }),
            ));
        }
    }

    if let Some(spread_pct) = metrics.spread_pct {
        if spread_pct > thresholds.spread_pct {
            signals.push(make(
                SignalType::SpreadHigh,
                fraction(spread_pct),
                confidence_above(spread_pct, thresholds.spread_pct),
                json!({
                    "spread_pct": spread_pct,
                    "source_count": metrics.source_count,
                    "threshold_pct": thresholds.spread_pct,
                }),
            ));
        }
    }

    // Short-window volatility against the 30-day baseline
    if let (Some(short), Some(baseline)) = (metrics.volatility_7d, metrics.volatility_30d) {
        if baseline > Decimal::ZERO {
            let ratio = (short / baseline).round_dp(6);
            let details = json!({
                "volatility_7d": short,
                "volatility_30d": baseline,
                "ratio": ratio,
            });
            if ratio > thresholds.volatility_high_ratio {
                signals.push(make(
                    SignalType::VolatilityHigh,
                    ratio,
                    confidence_above(ratio, thresholds.volatility_high_ratio),
                    details,
                ));
            } else if ratio < thresholds.volatility_low_ratio {
                signals.push(make(
                    SignalType::VolatilityLow,
                    ratio,
                    confidence_below(ratio, thresholds.volatility_low_ratio),
                    details,
                ));
            }
        }
    }

    if let (Some(ma_7d), Some(ma_30d)) = (metrics.ma_7d, metrics.ma_30d) {
        if let Some(gap_pct) = crate::stats::pct_change(ma_7d, ma_30d) {
            if gap_pct.abs() > thresholds.trend_pct {
                let signal_type = if gap_pct > Decimal::ZERO {
                    SignalType::TrendBullish
                } else {
                    SignalType::TrendBearish
                };
                signals.push(make(
                    signal_type,
                    fraction(gap_pct),
                    confidence_above(gap_pct.abs(), thresholds.trend_pct),
                    json!({ "ma_7d": ma_7d, "ma_30d": ma_30d, "threshold_pct": thresholds.trend_pct }),
                ));
            }
        }
    }

    if signals.is_empty() {
        // Quieter moves give higher confidence in stability
        let move_pct = metrics
            .price_change_pct_7d
            .or(metrics.price_change_pct_1d)
            .map(|p| p.abs());
        let confidence = match move_pct {
            Some(p) => confidence_below(p, thresholds.momentum_pct),
            None => 0.5,
        };
        signals.push(make(
            SignalType::Stable,
            move_pct.map(fraction).unwrap_or(Decimal::ZERO),
            confidence,
            json!({ "move_pct": move_pct }),
        ));
    }

    signals
}

/// Human-readable one-liner for a signal.
pub fn explain(signal: &Signal) -> String {
    let pct = (signal.value * Decimal::ONE_HUNDRED).round_dp(1);
    match signal.signal_type {
        SignalType::MomentumUp | SignalType::MomentumDown => {
            format!("Price moved {}% over 7 days", pct)
        }
        SignalType::SpikeUp | SignalType::SpikeDown => format!("Price moved {}% in one day", pct),
        SignalType::SpreadHigh => format!("Prices differ by {}% across listings", pct),
        SignalType::VolatilityHigh => format!(
            "7-day volatility is {}x the 30-day baseline",
            signal.value.round_dp(2)
        ),
        SignalType::VolatilityLow => format!(
            "7-day volatility is only {}x the 30-day baseline",
            signal.value.round_dp(2)
        ),
        SignalType::TrendBullish | SignalType::TrendBearish => {
            format!("7-day average is {}% away from the 30-day average", pct)
        }
        SignalType::Stable => "No significant price movement".to_string(),
    }
}

/// Counters for one detection pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectionStats {
    pub items: usize,
    pub signals: usize,
}

/// Reads daily metrics, writes signals.
pub struct SignalDetector {
    metrics: Arc<dyn MetricsStore>,
    signals: Arc<dyn SignalStore>,
    thresholds: SignalThresholds,
}

impl SignalDetector {
    pub fn new(
        metrics: Arc<dyn MetricsStore>,
        signals: Arc<dyn SignalStore>,
        thresholds: SignalThresholds,
    ) -> Self {
        Self {
            metrics,
            signals,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &SignalThresholds {
        &self.thresholds
    }

    /// Detect and store signals for one item/date. Reruns replace the set.
    pub async fn detect_item(
        &self,
        item_id: Uuid,
        date: NaiveDate,
        detected_at: DateTime<Utc>,
    ) -> Result<Vec<Signal>, StoreError> {
        let Some(metrics) = self.metrics.daily_for(item_id, date).await? else {
            debug!(%item_id, %date, "No metrics for date, skipping");
            return Ok(Vec::new());
        };

        let mut signals = detect(&metrics, &self.thresholds, detected_at);
        for signal in &mut signals {
            signal.explanation = Some(explain(signal));
        }
        self.signals.replace_signals(item_id, date, &signals).await?;
        Ok(signals)
    }

    /// Detect signals for every item with metrics on `date`.
    pub async fn run(
        &self,
        date: NaiveDate,
        detected_at: DateTime<Utc>,
    ) -> Result<DetectionStats, StoreError> {
        let items = self.metrics.items_with_metrics_on(date).await?;
        let mut stats = DetectionStats::default();

        for item_id in items {
            let signals = self.detect_item(item_id, date, detected_at).await?;
            stats.items += 1;
            stats.signals += signals.len();
        }

        info!(%date, items = stats.items, signals = stats.signals, "Signal detection complete");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn metrics_row(item_id: Uuid) -> DailyMetrics {
        DailyMetrics {
            item_id,
            metric_date: NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            avg_price: dec!(15),
            min_price: dec!(15),
            max_price: dec!(15),
            median_price: dec!(15),
            spread: dec!(0),
            spread_pct: Some(dec!(0)),
            listing_count: 0,
            total_quantity: 0,
            source_count: 1,
            snapshot_count: 1,
            price_change_1d: None,
            price_change_pct_1d: None,
            price_change_7d: None,
            price_change_pct_7d: None,
            price_change_30d: None,
            price_change_pct_30d: None,
            ma_7d: None,
            ma_30d: None,
            volatility_7d: None,
            volatility_30d: None,
            computed_at: Utc::now(),
        }
    }

    fn types(signals: &[Signal]) -> Vec<SignalType> {
        signals.iter().map(|s| s.signal_type).collect()
    }

    #[test]
    fn test_momentum_threshold() {
        let thresholds = SignalThresholds {
            momentum_pct: dec!(15),
            ..Default::default()
        };
        let mut m = metrics_row(Uuid::new_v4());

        m.price_change_pct_7d = Some(dec!(25));
        let signals = detect(&m, &thresholds, Utc::now());
        let momentum = signals
            .iter()
            .find(|s| s.signal_type == SignalType::MomentumUp)
            .unwrap();
        assert!(momentum.confidence > 0.0);
        assert_eq!(momentum.value, dec!(0.25));

        m.price_change_pct_7d = Some(dec!(5));
        let signals = detect(&m, &thresholds, Utc::now());
        assert!(!signals.iter().any(|s| matches!(
            s.signal_type,
            SignalType::MomentumUp | SignalType::MomentumDown
        )));
    }

    #[test]
    fn test_spike_from_one_day_change() {
        let mut m = metrics_row(Uuid::new_v4());
        m.price_change_pct_1d = Some(dec!(20));

        let signals = detect(&m, &SignalThresholds::default(), Utc::now());
        assert_eq!(types(&signals), vec![SignalType::SpikeUp]);
        assert_eq!(signals[0].value, dec!(0.20));
        assert!(signals[0].confidence > 0.5);
    }

    #[test]
    fn test_stable_only_when_nothing_fires() {
        let m = metrics_row(Uuid::new_v4());
        let signals = detect(&m, &SignalThresholds::default(), Utc::now());
        assert_eq!(types(&signals), vec![SignalType::Stable]);

        let mut m = metrics_row(Uuid::new_v4());
        m.spread_pct = Some(dec!(45));
        let signals = detect(&m, &SignalThresholds::default(), Utc::now());
        assert_eq!(types(&signals), vec![SignalType::SpreadHigh]);
    }

    #[test]
    fn test_volatility_relative_to_baseline() {
        let mut m = metrics_row(Uuid::new_v4());
        m.volatility_7d = Some(dec!(3));
        m.volatility_30d = Some(dec!(1));
        assert_eq!(
            types(&detect(&m, &SignalThresholds::default(), Utc::now())),
            vec![SignalType::VolatilityHigh]
        );

        m.volatility_7d = Some(dec!(0.2));
        assert_eq!(
            types(&detect(&m, &SignalThresholds::default(), Utc::now())),
            vec![SignalType::VolatilityLow]
        );

        // Null baseline never fires
        m.volatility_30d = None;
        assert_eq!(
            types(&detect(&m, &SignalThresholds::default(), Utc::now())),
            vec![SignalType::Stable]
        );
    }

    #[test]
    fn test_trend_from_moving_averages() {
        let mut m = metrics_row(Uuid::new_v4());
        m.ma_7d = Some(dec!(9));
        m.ma_30d = Some(dec!(10));
        let signals = detect(&m, &SignalThresholds::default(), Utc::now());
        assert_eq!(types(&signals), vec![SignalType::TrendBearish]);
        assert_eq!(signals[0].value, dec!(-0.1));
    }

    #[test]
    fn test_confidence_is_monotonic_and_clamped() {
        let t = dec!(10);
        let a = confidence_above(dec!(11), t);
        let b = confidence_above(dec!(15), t);
        let c = confidence_above(dec!(40), t);
        assert!(a < b && b < c);
        assert_eq!(c, 1.0);
        assert_eq!(confidence_above(dec!(10), t), 0.5);
        assert!(confidence_below(dec!(0.1), dec!(0.5)) > confidence_below(dec!(0.4), dec!(0.5)));
    }

    #[tokio::test]
    async fn test_rerun_updates_instead_of_duplicating() {
        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        let mut m = metrics_row(item);
        let date = m.metric_date;
        store.upsert_daily(&m).await.unwrap();

        let detector = SignalDetector::new(store.clone(), store.clone(), SignalThresholds::default());
        detector.run(date, Utc::now()).await.unwrap();
        detector.run(date, Utc::now()).await.unwrap();
        assert_eq!(store.signals_for(item, date, None).await.unwrap().len(), 1);

        m.price_change_pct_1d = Some(dec!(-30));
        store.upsert_daily(&m).await.unwrap();
        detector.run(date, Utc::now()).await.unwrap();

        let signals = store.signals_for(item, date, None).await.unwrap();
        assert_eq!(types(&signals), vec![SignalType::SpikeDown]);
        assert!(signals[0].explanation.as_deref().unwrap().contains("-30"));
    }
}
