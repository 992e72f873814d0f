//! Recommendation engine.
//!
//! Turns an item's latest daily metrics and that day's signals into a
//! BUY/SELL/HOLD call with a target price, confidence and rationale.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Action, DailyMetrics, Recommendation, Signal, SignalRef, SignalType};
use crate::rationale::{rationale_or_template, RationaleGenerator, RationaleInput, SignalSummary};
use crate::signals::confidence_above;
use crate::stats::{pct_change, round_stat};
use crate::store::{MetricsStore, RecommendationStore, SignalStore, StoreError};

/// Recommendation thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct RecommendationConfig {
    /// Minimum upside (percent) to fair value for a BUY
    pub roi_threshold_pct: Decimal,
    /// BUY/SELL calls below this confidence become HOLD
    pub min_confidence: f64,
    pub horizon_days: i32,
    /// Price above ma_7d + sigma * volatility_7d counts as overextended
    pub overextension_sigma: Decimal,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            roi_threshold_pct: dec!(10),
            min_confidence: 0.3,
            horizon_days: 7,
            overextension_sigma: dec!(2.0),
        }
    }
}

/// How much each signal type counts toward an action.
pub fn signal_weight(signal_type: SignalType) -> f64 {
    match signal_type {
        SignalType::MomentumUp | SignalType::MomentumDown => 1.0,
        SignalType::TrendBullish | SignalType::TrendBearish => 0.8,
        SignalType::SpikeUp | SignalType::SpikeDown => 0.6,
        SignalType::Stable => 0.5,
        SignalType::VolatilityHigh | SignalType::VolatilityLow => 0.4,
        SignalType::SpreadHigh => 0.3,
    }
}

/// Fair value estimate: 60/40 blend of the 7- and 30-day moving averages,
/// whichever exists, else the current average.
pub fn fair_value(metrics: &DailyMetrics) -> Decimal {
    let value = match (metrics.ma_7d, metrics.ma_30d) {
        (Some(short), Some(long)) => short * dec!(0.6) + long * dec!(0.4),
        (Some(ma), None) | (None, Some(ma)) => ma,
        (None, None) => metrics.avg_price,
    };
    round_stat(value)
}

/// Weighted average of signal confidences.
fn weighted_confidence(signals: &[&Signal]) -> f64 {
    let total_weight: f64 = signals.iter().map(|s| signal_weight(s.signal_type)).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = signals
        .iter()
        .map(|s| signal_weight(s.signal_type) * s.confidence)
        .sum();
    (weighted / total_weight).clamp(0.0, 1.0)
}

fn score(signals: &[&Signal]) -> f64 {
    signals
        .iter()
        .map(|s| signal_weight(s.signal_type) * s.confidence)
        .sum()
}

/// Outcome of the decision rules, before persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub confidence: f64,
    pub current_price: Decimal,
    pub target_price: Decimal,
    /// Expected gain in percent for the action (a fall, for SELL)
    pub potential_profit_pct: Decimal,
    pub contributing: Vec<SignalType>,
}

/// Apply the decision rules. Pure.
pub fn decide(
    metrics: &DailyMetrics,
    signals: &[Signal],
    config: &RecommendationConfig,
) -> Decision {
    let current = metrics.avg_price;
    let fair = fair_value(metrics);

    let bullish: Vec<&Signal> = signals.iter().filter(|s| s.signal_type.is_bullish()).collect();
    let bearish: Vec<&Signal> = signals.iter().filter(|s| s.signal_type.is_bearish()).collect();
    let bull = score(&bullish);
    let bear = score(&bearish);

    let upside_pct = pct_change(fair, current).unwrap_or(Decimal::ZERO);

    let band = match (metrics.ma_7d, metrics.volatility_7d) {
        (Some(ma), Some(vol)) if vol > Decimal::ZERO => {
            Some((ma, config.overextension_sigma * vol))
        }
        _ => None,
    };
    let overextended = band.map_or(false, |(ma, width)| current > ma + width);

    let decision = if bull > bear && upside_pct > config.roi_threshold_pct {
        Decision {
            action: Action::Buy,
            confidence: weighted_confidence(&bullish),
            current_price: current,
            target_price: fair,
            potential_profit_pct: round_stat(upside_pct),
            contributing: bullish.iter().map(|s| s.signal_type).collect(),
        }
    } else if bear > bull || overextended {
        // Expect reversion toward fair value, or to the band's center when
        // fair value is not below the current price.
        let target = match band {
            Some((ma, _)) if fair >= current => ma.min(current),
            _ => fair.min(current),
        };
        let confidence = if bear > bull {
            weighted_confidence(&bearish)
        } else {
            band.map_or(0.0, |(ma, width)| confidence_above(current - ma, width))
        };
        Decision {
            action: Action::Sell,
            confidence,
            current_price: current,
            target_price: target,
            potential_profit_pct: round_stat(-pct_change(target, current).unwrap_or(Decimal::ZERO)),
            contributing: bearish.iter().map(|s| s.signal_type).collect(),
        }
    } else {
        let all: Vec<&Signal> = signals.iter().collect();
        Decision {
            action: Action::Hold,
            confidence: if all.is_empty() { 0.5 } else { weighted_confidence(&all) },
            current_price: current,
            target_price: fair,
            potential_profit_pct: round_stat(upside_pct),
            contributing: all.iter().map(|s| s.signal_type).collect(),
        }
    };

    if decision.action != Action::Hold && decision.confidence < config.min_confidence {
        debug!(
            item_id = %metrics.item_id,
            action = %decision.action,
            confidence = decision.confidence,
            "Confidence below minimum, downgrading to HOLD"
        );
        return Decision {
            action: Action::Hold,
            target_price: fair,
            potential_profit_pct: round_stat(upside_pct),
            ..decision
        };
    }
    decision
}

/// Counters for one recommendation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecommendationStats {
    pub items: usize,
    pub buy: usize,
    pub sell: usize,
    pub hold: usize,
}

/// Builds and stores recommendations.
pub struct RecommendationEngine {
    metrics: Arc<dyn MetricsStore>,
    signals: Arc<dyn SignalStore>,
    recommendations: Arc<dyn RecommendationStore>,
    rationale: Option<Arc<dyn RationaleGenerator>>,
    config: RecommendationConfig,
}

impl RecommendationEngine {
    pub fn new(
        metrics: Arc<dyn MetricsStore>,
        signals: Arc<dyn SignalStore>,
        recommendations: Arc<dyn RecommendationStore>,
        config: RecommendationConfig,
    ) -> Self {
        Self {
            metrics,
            signals,
            recommendations,
            rationale: None,
            config,
        }
    }

    /// Attach a text generator for rationales.
    pub fn with_rationale(mut self, generator: Arc<dyn RationaleGenerator>) -> Self {
        self.rationale = Some(generator);
        self
    }

    /// Recommend on one item from its latest metrics. Supersedes the item's
    /// previous active recommendation.
    pub async fn recommend_item(
        &self,
        item_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Recommendation>, StoreError> {
        let Some(metrics) = self.metrics.latest_daily(item_id).await? else {
            return Ok(None);
        };
        let signals = self
            .signals
            .signals_for(item_id, metrics.metric_date, None)
            .await?;

        let decision = decide(&metrics, &signals, &self.config);

        let input = RationaleInput {
            item_id,
            action: decision.action,
            confidence: decision.confidence,
            current_price: decision.current_price,
            target_price: decision.target_price,
            potential_profit_pct: decision.potential_profit_pct,
            horizon_days: self.config.horizon_days,
            ma_7d: metrics.ma_7d,
            ma_30d: metrics.ma_30d,
            volatility_7d: metrics.volatility_7d,
            price_change_pct_7d: metrics.price_change_pct_7d,
            signals: signals
                .iter()
                .map(|s| SignalSummary {
                    signal_type: s.signal_type,
                    value: s.value,
                    confidence: s.confidence,
                })
                .collect(),
        };
        let rationale = rationale_or_template(self.rationale.as_deref(), &input).await;

        let rec = Recommendation {
            id: Uuid::new_v4(),
            item_id,
            action: decision.action,
            confidence: decision.confidence,
            rationale,
            target_price: decision.target_price,
            current_price: decision.current_price,
            potential_profit_pct: decision.potential_profit_pct,
            horizon_days: self.config.horizon_days,
            signal_refs: decision
                .contributing
                .iter()
                .map(|t| SignalRef {
                    signal_type: *t,
                    signal_date: metrics.metric_date,
                })
                .collect(),
            valid_from: now,
            valid_until: now + Duration::days(i64::from(self.config.horizon_days)),
            is_active: true,
            created_at: now,
            outcome: None,
        };

        self.recommendations.insert_recommendation(&rec).await?;
        debug!(
            %item_id,
            action = %rec.action,
            confidence = rec.confidence,
            upside = rec.potential_profit_pct.to_f64().unwrap_or(0.0),
            "Recommendation stored"
        );
        Ok(Some(rec))
    }

    /// Recommend on every item with metrics on `date`.
    pub async fn run(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<RecommendationStats, StoreError> {
        let items = self.metrics.items_with_metrics_on(date).await?;
        let mut stats = RecommendationStats::default();

        for item_id in items {
            if let Some(rec) = self.recommend_item(item_id, now).await? {
                stats.items += 1;
                match rec.action {
                    Action::Buy => stats.buy += 1,
                    Action::Sell => stats.sell += 1,
                    Action::Hold => stats.hold += 1,
                }
            }
        }

        info!(
            %date,
            items = stats.items,
            buy = stats.buy,
            sell = stats.sell,
            hold = stats.hold,
            "Recommendations generated"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecommendationFilter;
    use crate::rationale::{MockRationaleGenerator, RationaleError};
    use crate::store::MemoryStore;

    fn metrics(item_id: Uuid, avg: Decimal) -> DailyMetrics {
        DailyMetrics {
            item_id,
            metric_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            avg_price: avg,
            min_price: avg,
            max_price: avg,
            median_price: avg,
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

    fn signal(m: &DailyMetrics, signal_type: SignalType, confidence: f64) -> Signal {
        Signal {
            item_id: m.item_id,
            signal_date: m.metric_date,
            signal_type,
            value: dec!(0.2),
            confidence,
            details: serde_json::json!({}),
            explanation: None,
            detected_at: Utc::now(),
        }
    }

    #[test]
    fn test_fair_value_blend() {
        let mut m = metrics(Uuid::new_v4(), dec!(10));
        assert_eq!(fair_value(&m), dec!(10));
        m.ma_30d = Some(dec!(20));
        assert_eq!(fair_value(&m), dec!(20));
        m.ma_7d = Some(dec!(10));
        assert_eq!(fair_value(&m), dec!(14));
    }

    #[test]
    fn test_buy_when_bullish_and_below_fair_value() {
        let mut m = metrics(Uuid::new_v4(), dec!(10));
        m.ma_7d = Some(dec!(12));
        m.ma_30d = Some(dec!(13));
        let signals = vec![
            signal(&m, SignalType::MomentumUp, 0.8),
            signal(&m, SignalType::TrendBullish, 0.6),
        ];

        let d = decide(&m, &signals, &RecommendationConfig::default());
        assert_eq!(d.action, Action::Buy);
        // fair = 12*0.6 + 13*0.4 = 12.4
        assert_eq!(d.target_price, dec!(12.4));
        assert_eq!(d.potential_profit_pct, dec!(24));
        let expected = (1.0 * 0.8 + 0.8 * 0.6) / 1.8;
        assert!((d.confidence - expected).abs() < 1e-9);
        assert_eq!(d.contributing, vec![SignalType::MomentumUp, SignalType::TrendBullish]);
    }

    #[test]
    fn test_bullish_without_enough_upside_is_hold() {
        let mut m = metrics(Uuid::new_v4(), dec!(10));
        m.ma_7d = Some(dec!(10.5));
        let signals = vec![signal(&m, SignalType::MomentumUp, 0.9)];
        let d = decide(&m, &signals, &RecommendationConfig::default());
        assert_eq!(d.action, Action::Hold);
    }

    #[test]
    fn test_sell_when_bearish_dominates() {
        let mut m = metrics(Uuid::new_v4(), dec!(10));
        m.ma_7d = Some(dec!(9));
        let signals = vec![
            signal(&m, SignalType::MomentumDown, 0.7),
            signal(&m, SignalType::SpikeUp, 0.5),
        ];
        let d = decide(&m, &signals, &RecommendationConfig::default());
        assert_eq!(d.action, Action::Sell);
        assert_eq!(d.target_price, dec!(9));
        assert_eq!(d.potential_profit_pct, dec!(10));
        assert_eq!(d.contributing, vec![SignalType::MomentumDown]);
    }

    #[test]
    fn test_sell_when_overextended() {
        let mut m = metrics(Uuid::new_v4(), dec!(20));
        m.ma_7d = Some(dec!(12));
        m.volatility_7d = Some(dec!(2));
        // Band top is 12 + 2*2 = 16
        let d = decide(&m, &[], &RecommendationConfig::default());
        assert_eq!(d.action, Action::Sell);
        assert_eq!(d.target_price, dec!(12));
        assert!(d.confidence > 0.5);
    }

    #[test]
    fn test_low_confidence_downgrades_to_hold() {
        let mut m = metrics(Uuid::new_v4(), dec!(10));
        m.ma_7d = Some(dec!(15));
        let signals = vec![signal(&m, SignalType::SpikeUp, 0.1)];
        let d = decide(&m, &signals, &RecommendationConfig::default());
        assert_eq!(d.action, Action::Hold);
    }

    #[tokio::test]
    async fn test_new_recommendation_supersedes_previous() {
        let store = Arc::new(MemoryStore::new());
        let item = Uuid::new_v4();
        store.upsert_daily(&metrics(item, dec!(10))).await.unwrap();

        let mut mock = MockRationaleGenerator::new();
        mock.expect_generate()
            .returning(|_| Err(RationaleError::Empty));

        let engine = RecommendationEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            RecommendationConfig::default(),
        )
        .with_rationale(Arc::new(mock));

        let now = Utc::now();
        let first = engine.recommend_item(item, now).await.unwrap().unwrap();
        let second = engine.recommend_item(item, now).await.unwrap().unwrap();

        assert_eq!(first.action, Action::Hold);
        assert!(first.rationale.starts_with("HOLD"));
        assert_eq!(second.valid_until - second.valid_from, Duration::days(7));

        let active = store
            .active_recommendations(&RecommendationFilter::default())
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
        assert!(!store.get_recommendation(first.id).await.unwrap().unwrap().is_active);
    }
}
