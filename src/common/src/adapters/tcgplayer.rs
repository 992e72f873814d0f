//! TCGplayer API client.
//!
//! Current prices come from the pricing endpoint (one row per printing
//! sub-type). Daily history comes from the price-history endpoint, which
//! returns sales buckets newest first.
//!
//! Requests are authenticated with a bearer token and limited to a few per
//! second.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    decimal_price, observation_bucket, parse_price_str, send_json, AdapterError, Capabilities,
    PriceHistory, PriceSource,
};
use crate::config::SourceSettings;
use crate::models::{DataOrigin, Finish, ItemKey, PriceAggregates, PriceObservation};
use crate::rate_limit::RateLimiter;
use crate::source::Source;

/// One pricing row from the pricing endpoint.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TcgPriceRow {
    pub product_id: i64,
    pub low_price: Option<f64>,
    pub mid_price: Option<f64>,
    pub high_price: Option<f64>,
    pub market_price: Option<f64>,
    pub direct_low_price: Option<f64>,
    /// "Normal", "Foil", "Foil Etched"
    pub sub_type_name: String,
}

#[derive(Debug, Deserialize)]
struct PricingResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    results: Vec<TcgPriceRow>,
}

/// One daily bucket from the price-history endpoint. Prices are strings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TcgHistoryBucket {
    pub market_price: String,
    pub quantity_sold: String,
    pub low_sale_price: String,
    pub high_sale_price: String,
    pub transaction_count: String,
    pub bucket_start_date: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TcgHistoryVariant {
    pub variant: String,
    pub buckets: Vec<TcgHistoryBucket>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    result: Vec<TcgHistoryVariant>,
}

fn sub_type_for(finish: Finish) -> &'static str {
    match finish {
        Finish::Nonfoil => "Normal",
        Finish::Foil => "Foil",
        Finish::Etched => "Foil Etched",
    }
}

/// History range parameter covering `days`.
fn history_range(days: u32) -> &'static str {
    match days {
        0..=30 => "month",
        31..=90 => "quarter",
        _ => "annual",
    }
}

/// TCGplayer API client.
pub struct TcgPlayerClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl TcgPlayerClient {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(settings.min_interval))),
        }
    }

    async fn rate_limit(&self) {
        self.rate_limiter.lock().await.wait().await;
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// TCGplayer needs its own product id; names are ambiguous across printings.
fn product_id(key: &ItemKey) -> Result<&str, AdapterError> {
    key.external_id
        .as_deref()
        .ok_or_else(|| AdapterError::NotFound(format!("{} has no TCGplayer product id", key)))
}

/// Pick the row matching the key's finish and turn it into an observation.
pub fn observation_from_rows(
    key: &ItemKey,
    rows: &[TcgPriceRow],
    observed_at: DateTime<Utc>,
) -> Result<PriceObservation, AdapterError> {
    let wanted = sub_type_for(key.finish);
    let row = rows
        .iter()
        .find(|r| r.sub_type_name.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| AdapterError::NotFound(format!("{} has no {} pricing", key, wanted)))?;

    let price = row
        .market_price
        .or(row.mid_price)
        .and_then(decimal_price)
        .ok_or_else(|| AdapterError::NotFound(format!("{} has no market price", key)))?;

    Ok(PriceObservation {
        key: key.clone(),
        source: Source::TcgPlayer,
        price,
        currency: Source::TcgPlayer.currency().to_string(),
        aggregates: PriceAggregates {
            min_price: row.low_price.and_then(decimal_price),
            max_price: row.high_price.and_then(decimal_price),
            avg_price: row.mid_price.and_then(decimal_price),
            median_price: None,
            listing_count: None,
            total_quantity: None,
        },
        observed_at,
        origin: DataOrigin::LiveApi,
    })
}

/// Convert history buckets for the key's finish into observations within
/// the last `days` days of `now`.
pub fn history_from_variants(
    key: &ItemKey,
    variants: &[TcgHistoryVariant],
    days: u32,
    now: DateTime<Utc>,
) -> PriceHistory {
    let wanted = sub_type_for(key.finish);
    let cutoff = now.date_naive() - chrono::Duration::days(i64::from(days));

    let points = variants
        .iter()
        .filter(|v| v.variant.eq_ignore_ascii_case(wanted))
        .flat_map(|v| v.buckets.iter())
        .filter_map(|b| {
            let date = NaiveDate::parse_from_str(&b.bucket_start_date, "%Y-%m-%d").ok()?;
            if date <= cutoff {
                return None;
            }
            let price = parse_price_str(&b.market_price).filter(|p| !p.is_zero())?;
            Some(PriceObservation {
                key: key.clone(),
                source: Source::TcgPlayer,
                price,
                currency: Source::TcgPlayer.currency().to_string(),
                aggregates: PriceAggregates {
                    min_price: parse_price_str(&b.low_sale_price),
                    max_price: parse_price_str(&b.high_sale_price),
                    avg_price: None,
                    median_price: None,
                    listing_count: b.transaction_count.parse().ok(),
                    total_quantity: b.quantity_sold.parse().ok(),
                },
                observed_at: date.and_hms_opt(0, 0, 0)?.and_utc(),
                origin: DataOrigin::BulkImport,
            })
        })
        .collect();

    PriceHistory::new(points)
}

#[async_trait]
impl PriceSource for TcgPlayerClient {
    fn source(&self) -> Source {
        Source::TcgPlayer
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fetch_price: true,
            fetch_price_history: true,
            ..Default::default()
        }
    }

    async fn fetch_price(&self, key: &ItemKey) -> Result<PriceObservation, AdapterError> {
        let id = product_id(key)?;
        self.rate_limit().await;

        let body: PricingResponse = send_json(
            Source::TcgPlayer,
            &key.to_string(),
            self.get(&format!("/pricing/product/{}", id)),
        )
        .await?;

        if !body.success && body.results.is_empty() {
            return Err(AdapterError::NotFound(format!(
                "{}: {}",
                key,
                body.errors.join("; ")
            )));
        }

        observation_from_rows(key, &body.results, observation_bucket(Utc::now()))
    }

    async fn fetch_price_history(
        &self,
        key: &ItemKey,
        days: u32,
    ) -> Result<PriceHistory, AdapterError> {
        let id = product_id(key)?;
        self.rate_limit().await;

        let body: HistoryResponse = send_json(
            Source::TcgPlayer,
            &key.to_string(),
            self.get(&format!("/price/history/{}/detailed", id))
                .query(&[("range", history_range(days))]),
        )
        .await?;

        let history = history_from_variants(key, &body.result, days, Utc::now());
        debug!(item = %key, points = history.len(), "Fetched TCGplayer history");
        Ok(history)
    }
}
