//! Shared data models for items, observations and derived analytics.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::source::Source;

/// Card finish. Prices for the same printing differ per finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Finish {
    #[default]
    Nonfoil,
    Foil,
    Etched,
}

impl Finish {
    pub fn as_str(&self) -> &'static str {
        match self {
            Finish::Nonfoil => "nonfoil",
            Finish::Foil => "foil",
            Finish::Etched => "etched",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "foil" => Finish::Foil,
            "etched" => Finish::Etched,
            _ => Finish::Nonfoil,
        }
    }
}

/// Identity of an item as a source understands it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    /// Card name
    pub name: String,
    /// Set code (e.g. "MH2")
    pub set_code: String,
    /// Collector number within the set
    pub collector_number: Option<String>,
    pub finish: Finish,
    /// Source-specific product id, when the catalog knows it
    pub external_id: Option<String>,
}

impl ItemKey {
    pub fn new(name: &str, set_code: &str) -> Self {
        Self {
            name: name.to_string(),
            set_code: set_code.to_string(),
            collector_number: None,
            finish: Finish::Nonfoil,
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, id: &str) -> Self {
        self.external_id = Some(id.to_string());
        self
    }

    pub fn with_finish(mut self, finish: Finish) -> Self {
        self.finish = finish;
        self
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.name, self.set_code)?;
        if let Some(number) = &self.collector_number {
            write!(f, " #{}", number)?;
        }
        if self.finish != Finish::Nonfoil {
            write!(f, " ({})", self.finish.as_str())?;
        }
        Ok(())
    }
}

/// A catalog item the pipeline tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub id: Uuid,
    pub name: String,
    pub set_code: String,
    pub collector_number: Option<String>,
    pub finish: Finish,
    /// Product ids per source
    pub external_ids: BTreeMap<Source, String>,
}

impl TrackedItem {
    /// Build the key a given source should be queried with.
    pub fn key_for(&self, source: Source) -> ItemKey {
        ItemKey {
            name: self.name.clone(),
            set_code: self.set_code.clone(),
            collector_number: self.collector_number.clone(),
            finish: self.finish,
            external_id: self.external_ids.get(&source).cloned(),
        }
    }
}

/// Optional aggregate fields some sources report alongside the headline price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceAggregates {
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub avg_price: Option<Decimal>,
    pub median_price: Option<Decimal>,
    pub listing_count: Option<i32>,
    pub total_quantity: Option<i32>,
}

/// A price observation produced by an adapter. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub key: ItemKey,
    pub source: Source,
    pub price: Decimal,
    pub currency: String,
    pub aggregates: PriceAggregates,
    pub observed_at: DateTime<Utc>,
    /// Live quote, history point or a value derived from listings
    #[serde(default)]
    pub origin: DataOrigin,
}

/// One individual offer on a marketplace order book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub key: ItemKey,
    pub source: Source,
    pub price: Decimal,
    pub currency: String,
    pub quantity: i32,
    pub condition: Option<String>,
    pub seller: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOrigin {
    /// Historical points loaded by a backfill
    BulkImport,
    #[default]
    LiveApi,
    /// Summarized by us from individual listings
    Computed,
}

impl DataOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataOrigin::BulkImport => "bulk_import",
            DataOrigin::LiveApi => "live_api",
            DataOrigin::Computed => "computed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "bulk_import" => Some(DataOrigin::BulkImport),
            "live_api" => Some(DataOrigin::LiveApi),
            "computed" => Some(DataOrigin::Computed),
            _ => None,
        }
    }
}

/// A snapshot ready to be written. (item_id, source, snapshot_time) is its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSnapshot {
    pub item_id: Uuid,
    pub source: Source,
    pub snapshot_time: DateTime<Utc>,
    pub price: Decimal,
    pub currency: String,
    pub aggregates: PriceAggregates,
    pub origin: DataOrigin,
}

impl NewSnapshot {
    pub fn from_observation(item_id: Uuid, obs: &PriceObservation, origin: DataOrigin) -> Self {
        Self {
            item_id,
            source: obs.source,
            snapshot_time: obs.observed_at,
            price: obs.price,
            currency: obs.currency.clone(),
            aggregates: obs.aggregates.clone(),
            origin,
        }
    }

    /// Natural uniqueness key.
    pub fn key(&self) -> (Uuid, Source, DateTime<Utc>) {
        (self.item_id, self.source, self.snapshot_time)
    }
}

/// A persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub item_id: Uuid,
    pub source: Source,
    pub snapshot_time: DateTime<Utc>,
    pub price: Decimal,
    pub currency: String,
    pub aggregates: PriceAggregates,
    pub origin: DataOrigin,
    pub created_at: DateTime<Utc>,
}

/// Daily price statistics for one item. Upserted per (item_id, metric_date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DailyMetrics {
    pub item_id: Uuid,
    pub metric_date: NaiveDate,
    pub avg_price: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub median_price: Decimal,
    pub spread: Decimal,
    /// spread / min * 100. None when min is zero.
    pub spread_pct: Option<Decimal>,
    pub listing_count: i32,
    pub total_quantity: i32,
    pub source_count: i32,
    pub snapshot_count: i32,
    pub price_change_1d: Option<Decimal>,
    pub price_change_pct_1d: Option<Decimal>,
    pub price_change_7d: Option<Decimal>,
    pub price_change_pct_7d: Option<Decimal>,
    pub price_change_30d: Option<Decimal>,
    pub price_change_pct_30d: Option<Decimal>,
    pub ma_7d: Option<Decimal>,
    pub ma_30d: Option<Decimal>,
    pub volatility_7d: Option<Decimal>,
    pub volatility_30d: Option<Decimal>,
    pub computed_at: DateTime<Utc>,
}

/// Signal classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    MomentumUp,
    MomentumDown,
    VolatilityHigh,
    VolatilityLow,
    SpreadHigh,
    SpikeUp,
    SpikeDown,
    TrendBullish,
    TrendBearish,
    Stable,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::MomentumUp => "momentum_up",
            SignalType::MomentumDown => "momentum_down",
            SignalType::VolatilityHigh => "volatility_high",
            SignalType::VolatilityLow => "volatility_low",
            SignalType::SpreadHigh => "spread_high",
            SignalType::SpikeUp => "spike_up",
            SignalType::SpikeDown => "spike_down",
            SignalType::TrendBullish => "trend_bullish",
            SignalType::TrendBearish => "trend_bearish",
            SignalType::Stable => "stable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "momentum_up" => Some(SignalType::MomentumUp),
            "momentum_down" => Some(SignalType::MomentumDown),
            "volatility_high" => Some(SignalType::VolatilityHigh),
            "volatility_low" => Some(SignalType::VolatilityLow),
            "spread_high" => Some(SignalType::SpreadHigh),
            "spike_up" => Some(SignalType::SpikeUp),
            "spike_down" => Some(SignalType::SpikeDown),
            "trend_bullish" => Some(SignalType::TrendBullish),
            "trend_bearish" => Some(SignalType::TrendBearish),
            "stable" => Some(SignalType::Stable),
            _ => None,
        }
    }

    pub fn is_bullish(&self) -> bool {
        matches!(
            self,
            SignalType::MomentumUp | SignalType::SpikeUp | SignalType::TrendBullish
        )
    }

    pub fn is_bearish(&self) -> bool {
        matches!(
            self,
            SignalType::MomentumDown | SignalType::SpikeDown | SignalType::TrendBearish
        )
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected signal. Unique per (item_id, signal_date, signal_type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub item_id: Uuid,
    pub signal_date: NaiveDate,
    pub signal_type: SignalType,
    /// Magnitude as a fraction (0.20 = 20%)
    pub value: Decimal,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub details: serde_json::Value,
    pub explanation: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Recommended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
            Action::Hold => "HOLD",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            "HOLD" => Some(Action::Hold),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the signal a recommendation was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRef {
    pub signal_type: SignalType,
    pub signal_date: NaiveDate,
}

/// Realized outcome of a recommendation, written once after the horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationOutcome {
    pub end_price: Decimal,
    /// Most favorable price for the action during the horizon: the maximum
    /// for BUY/HOLD, the minimum for SELL.
    pub peak_price: Decimal,
    pub peak_at: DateTime<Utc>,
    pub accuracy_score_end: f64,
    pub accuracy_score_peak: f64,
    pub actual_profit_pct_end: Decimal,
    pub actual_profit_pct_peak: Decimal,
    pub evaluated_at: DateTime<Utc>,
}

/// A buy/sell/hold recommendation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub item_id: Uuid,
    pub action: Action,
    pub confidence: f64,
    pub rationale: String,
    pub target_price: Decimal,
    pub current_price: Decimal,
    pub potential_profit_pct: Decimal,
    pub horizon_days: i32,
    pub signal_refs: Vec<SignalRef>,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub outcome: Option<RecommendationOutcome>,
}

/// Filter for the active recommendation listing.
#[derive(Debug, Clone, Default)]
pub struct RecommendationFilter {
    pub action: Option<Action>,
    pub min_confidence: Option<f64>,
    pub limit: Option<i64>,
}

impl RecommendationFilter {
    pub fn matches(&self, rec: &Recommendation) -> bool {
        rec.is_active
            && self.action.map_or(true, |a| a == rec.action)
            && self.min_confidence.map_or(true, |c| rec.confidence >= c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_key_for_picks_source_external_id() {
        let mut external_ids = BTreeMap::new();
        external_ids.insert(Source::TcgPlayer, "12345".to_string());
        let item = TrackedItem {
            id: Uuid::new_v4(),
            name: "Ragavan, Nimble Pilferer".to_string(),
            set_code: "MH2".to_string(),
            collector_number: Some("138".to_string()),
            finish: Finish::Foil,
            external_ids,
        };

        let key = item.key_for(Source::TcgPlayer);
        assert_eq!(key.external_id.as_deref(), Some("12345"));
        assert_eq!(key.finish, Finish::Foil);
        assert_eq!(item.key_for(Source::Cardmarket).external_id, None);
        assert_eq!(key.to_string(), "Ragavan, Nimble Pilferer [MH2] #138 (foil)");
    }

    #[test]
    fn test_signal_type_polarity() {
        assert!(SignalType::MomentumUp.is_bullish());
        assert!(SignalType::SpikeDown.is_bearish());
        assert!(!SignalType::Stable.is_bullish());
        assert!(!SignalType::Stable.is_bearish());
        assert!(!SignalType::SpreadHigh.is_bullish());
        assert_eq!(SignalType::from_str("trend_bearish"), Some(SignalType::TrendBearish));
    }

    #[test]
    fn test_recommendation_filter() {
        let rec = Recommendation {
            id: Uuid::new_v4(),
            item_id: Uuid::new_v4(),
            action: Action::Buy,
            confidence: 0.7,
            rationale: String::new(),
            target_price: dec!(12),
            current_price: dec!(10),
            potential_profit_pct: dec!(20),
            horizon_days: 7,
            signal_refs: vec![],
            valid_from: Utc::now(),
            valid_until: Utc::now(),
            is_active: true,
            created_at: Utc::now(),
            outcome: None,
        };

        assert!(RecommendationFilter::default().matches(&rec));
        let sells = RecommendationFilter {
            action: Some(Action::Sell),
            ..Default::default()
        };
        assert!(!sells.matches(&rec));
        let confident = RecommendationFilter {
            min_confidence: Some(0.8),
            ..Default::default()
        };
        assert!(!confident.matches(&rec));
    }
}
