//! Outcome evaluation for recommendations whose horizon has elapsed.
//!
//! Each recommendation is evaluated at most once: the store only writes
//! outcome fields that are still empty.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::aggregator::currencies;
use crate::models::{Action, Recommendation, RecommendationOutcome, Snapshot};
use crate::stats::{mean, pct_change, round_stat};
use crate::store::{RecommendationStore, SnapshotStore, StoreError};

/// Score realized profit against the predicted one, in [0, 1].
/// Zero for a loss, full marks when nothing was predicted but money was made.
pub fn directional_score(actual_pct: Decimal, predicted_pct: Decimal) -> f64 {
    if actual_pct <= Decimal::ZERO {
        return 0.0;
    }
    if predicted_pct <= Decimal::ZERO {
        return 1.0;
    }
    (actual_pct / predicted_pct)
        .to_f64()
        .unwrap_or(0.0)
        .clamp(0.0, 1.0)
}

/// HOLD score: full marks for no movement, zero at the ROI threshold.
pub fn hold_score(change_pct: Decimal, roi_threshold_pct: Decimal) -> f64 {
    if roi_threshold_pct <= Decimal::ZERO {
        return if change_pct.is_zero() { 1.0 } else { 0.0 };
    }
    let drift = (change_pct.abs() / roi_threshold_pct).to_f64().unwrap_or(1.0);
    (1.0 - drift).clamp(0.0, 1.0)
}

/// Average price per snapshot time across sources, oldest first.
fn price_series(snapshots: &[Snapshot]) -> Vec<(DateTime<Utc>, Decimal)> {
    let quoted = currencies(snapshots);
    if quoted.len() > 1 {
        debug!(currencies = ?quoted, "Outcome series mixes currencies without conversion");
    }

    let mut by_time: BTreeMap<DateTime<Utc>, Vec<Decimal>> = BTreeMap::new();
    for s in snapshots {
        by_time.entry(s.snapshot_time).or_default().push(s.price);
    }
    by_time
        .into_iter()
        .filter_map(|(t, prices)| mean(&prices).map(|p| (t, p)))
        .collect()
}

/// Evaluate a recommendation against the snapshots inside its validity
/// window. None when the window has no data.
pub fn evaluate(
    rec: &Recommendation,
    snapshots: &[Snapshot],
    roi_threshold_pct: Decimal,
    evaluated_at: DateTime<Utc>,
) -> Option<RecommendationOutcome> {
    let series = price_series(snapshots);
    let &(_, end_price) = series.last()?;

    let peak = match rec.action {
        Action::Sell => series.iter().min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0))),
        Action::Buy | Action::Hold => series.iter().max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0))),
    };
    let &(peak_at, peak_price) = peak?;

    let change_end = pct_change(end_price, rec.current_price).unwrap_or(Decimal::ZERO);
    let change_peak = pct_change(peak_price, rec.current_price).unwrap_or(Decimal::ZERO);

    // Selling profits from a fall
    let (profit_end, profit_peak) = match rec.action {
        Action::Sell => (-change_end, -change_peak),
        Action::Buy | Action::Hold => (change_end, change_peak),
    };

    let (score_end, score_peak) = match rec.action {
        Action::Hold => (
            hold_score(change_end, roi_threshold_pct),
            hold_score(change_peak, roi_threshold_pct),
        ),
        Action::Buy | Action::Sell => (
            directional_score(profit_end, rec.potential_profit_pct),
            directional_score(profit_peak, rec.potential_profit_pct),
        ),
    };

    Some(RecommendationOutcome {
        end_price: round_stat(end_price),
        peak_price: round_stat(peak_price),
        peak_at,
        accuracy_score_end: score_end,
        accuracy_score_peak: score_peak,
        actual_profit_pct_end: round_stat(profit_end),
        actual_profit_pct_peak: round_stat(profit_peak),
        evaluated_at,
    })
}

/// Counters for one evaluation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutcomeStats {
    pub deactivated: u64,
    pub due: usize,
    pub evaluated: usize,
    pub no_data: usize,
    pub already_evaluated: usize,
}

/// Evaluates due recommendations and retires expired ones.
pub struct OutcomeEvaluator {
    snapshots: Arc<dyn SnapshotStore>,
    recommendations: Arc<dyn RecommendationStore>,
    roi_threshold_pct: Decimal,
}

impl OutcomeEvaluator {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        recommendations: Arc<dyn RecommendationStore>,
        roi_threshold_pct: Decimal,
    ) -> Self {
        Self {
            snapshots,
            recommendations,
            roi_threshold_pct,
        }
    }

    /// Evaluate one recommendation. Returns whether an outcome was written.
    pub async fn evaluate_one(
        &self,
        rec: &Recommendation,
        now: DateTime<Utc>,
    ) -> Result<Option<bool>, StoreError> {
        // Window is inclusive of valid_until
        let snapshots = self
            .snapshots
            .snapshots_between(
                rec.item_id,
                rec.valid_from,
                rec.valid_until + Duration::microseconds(1),
            )
            .await?;

        let Some(outcome) = evaluate(rec, &snapshots, self.roi_threshold_pct, now) else {
            return Ok(None);
        };
        let written = self.recommendations.record_outcome(rec.id, &outcome).await?;
        if written {
            debug!(
                id = %rec.id,
                action = %rec.action,
                score_end = outcome.accuracy_score_end,
                score_peak = outcome.accuracy_score_peak,
                "Outcome recorded"
            );
        }
        Ok(Some(written))
    }

    /// Deactivate expired recommendations, then evaluate every due one.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<OutcomeStats, StoreError> {
        let mut stats = OutcomeStats {
            deactivated: self.recommendations.deactivate_expired(now).await?,
            ..Default::default()
        };

        let due = self.recommendations.due_for_evaluation(now).await?;
        stats.due = due.len();

        for rec in &due {
            match self.evaluate_one(rec, now).await? {
                Some(true) => stats.evaluated += 1,
                Some(false) => stats.already_evaluated += 1,
                None => {
                    warn!(id = %rec.id, item_id = %rec.item_id, "No snapshots in horizon, outcome deferred");
                    stats.no_data += 1;
                }
            }
        }

        info!(
            deactivated = stats.deactivated,
            due = stats.due,
            evaluated = stats.evaluated,
            no_data = stats.no_data,
            "Outcome evaluation complete"
        );
        Ok(stats)
    }
}
