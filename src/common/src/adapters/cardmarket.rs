//! Cardmarket API client.
//!
//! Cardmarket is the main European marketplace. The product endpoint carries
//! a price guide (trend, average, low); the articles endpoint exposes the
//! individual offers behind it. Prices are quoted in EUR.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    decimal_price, observation_bucket, send_json, AdapterError, Capabilities, PriceSource,
};
use crate::config::SourceSettings;
use crate::models::{DataOrigin, Finish, ItemKey, Listing, PriceAggregates, PriceObservation};
use crate::rate_limit::RateLimiter;
use crate::source::Source;
use crate::stats;

/// Articles requested per listings call
const ARTICLE_PAGE_SIZE: u32 = 100;

/// Price guide block of a product.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "UPPERCASE")]
pub struct PriceGuide {
    pub sell: Option<f64>,
    pub low: Option<f64>,
    pub lowex: Option<f64>,
    pub lowfoil: Option<f64>,
    pub avg: Option<f64>,
    pub trend: Option<f64>,
    pub trendfoil: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CardmarketProduct {
    pub id_product: i64,
    pub en_name: String,
    pub price_guide: Option<PriceGuide>,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    product: CardmarketProduct,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ArticleSeller {
    pub username: String,
}

/// One offer.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Article {
    pub id_article: i64,
    pub price: f64,
    pub count: i32,
    pub condition: Option<String>,
    pub is_foil: bool,
    pub seller: Option<ArticleSeller>,
}

#[derive(Debug, Deserialize)]
struct ArticlesResponse {
    #[serde(default)]
    article: Vec<Article>,
}

/// Cardmarket API client.
pub struct CardmarketClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl CardmarketClient {
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

    async fn fetch_product(&self, key: &ItemKey) -> Result<CardmarketProduct, AdapterError> {
        let id = product_id(key)?;
        self.rate_limit().await;
        let body: ProductResponse = send_json(
            Source::Cardmarket,
            &key.to_string(),
            self.get(&format!("/products/{}", id)),
        )
        .await?;
        Ok(body.product)
    }

    async fn fetch_articles(&self, key: &ItemKey) -> Result<Vec<Article>, AdapterError> {
        let id = product_id(key)?;
        self.rate_limit().await;
        let is_foil = if key.finish == Finish::Nonfoil { "false" } else { "true" };
        let body: ArticlesResponse = send_json(
            Source::Cardmarket,
            &key.to_string(),
            self.get(&format!("/articles/{}", id)).query(&[
                ("isFoil", is_foil.to_string()),
                ("start", "0".to_string()),
                ("maxResults", ARTICLE_PAGE_SIZE.to_string()),
            ]),
        )
        .await?;
        Ok(body.article)
    }
}

fn product_id(key: &ItemKey) -> Result<&str, AdapterError> {
    key.external_id
        .as_deref()
        .ok_or_else(|| AdapterError::NotFound(format!("{} has no Cardmarket product id", key)))
}

/// Headline price and aggregates from a product's price guide.
/// None when the guide has no price for the key's finish.
pub fn observation_from_guide(
    key: &ItemKey,
    guide: &PriceGuide,
    observed_at: DateTime<Utc>,
) -> Option<PriceObservation> {
    let (headline, low) = match key.finish {
        Finish::Nonfoil => (guide.trend.or(guide.avg), guide.low),
        Finish::Foil | Finish::Etched => (guide.trendfoil, guide.lowfoil),
    };
    let price = headline.and_then(decimal_price).filter(|p| !p.is_zero())?;

    Some(PriceObservation {
        key: key.clone(),
        source: Source::Cardmarket,
        price,
        currency: Source::Cardmarket.currency().to_string(),
        aggregates: PriceAggregates {
            min_price: low.and_then(decimal_price),
            max_price: None,
            avg_price: if key.finish == Finish::Nonfoil {
                guide.avg.and_then(decimal_price)
            } else {
                None
            },
            median_price: None,
            listing_count: None,
            total_quantity: None,
        },
        observed_at,
        origin: DataOrigin::LiveApi,
    })
}

/// Convert raw articles into listings for the key's finish.
pub fn listings_from_articles(
    key: &ItemKey,
    articles: &[Article],
    observed_at: DateTime<Utc>,
) -> Vec<Listing> {
    let want_foil = key.finish != Finish::Nonfoil;
    articles
        .iter()
        .filter(|a| a.is_foil == want_foil && a.count > 0)
        .filter_map(|a| {
            Some(Listing {
                key: key.clone(),
                source: Source::Cardmarket,
                price: decimal_price(a.price)?,
                currency: Source::Cardmarket.currency().to_string(),
                quantity: a.count,
                condition: a.condition.clone(),
                seller: a.seller.as_ref().map(|s| s.username.clone()),
                observed_at,
            })
        })
        .collect()
}

/// Summarize an order book. The headline price is the median offer, which
/// resists single outlier listings.
pub fn observation_from_listings(key: &ItemKey, listings: &[Listing]) -> Option<PriceObservation> {
    let first = listings.first()?;
    let prices: Vec<Decimal> = listings.iter().map(|l| l.price).collect();
    let median = stats::median(&prices)?;

    Some(PriceObservation {
        key: key.clone(),
        source: Source::Cardmarket,
        price: median,
        currency: first.currency.clone(),
        aggregates: PriceAggregates {
            min_price: prices.iter().min().copied(),
            max_price: prices.iter().max().copied(),
            avg_price: stats::mean(&prices).map(stats::round_stat),
            median_price: Some(median),
            listing_count: Some(listings.len() as i32),
            total_quantity: Some(listings.iter().map(|l| l.quantity).sum()),
        },
        observed_at: first.observed_at,
        origin: DataOrigin::Computed,
    })
}

#[async_trait]
impl PriceSource for CardmarketClient {
    fn source(&self) -> Source {
        Source::Cardmarket
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fetch_price: true,
            fetch_listings: true,
            ..Default::default()
        }
    }

    async fn fetch_price(&self, key: &ItemKey) -> Result<PriceObservation, AdapterError> {
        let product = self.fetch_product(key).await?;
        let observed_at = observation_bucket(Utc::now());

        if let Some(obs) = product
            .price_guide
            .as_ref()
            .and_then(|g| observation_from_guide(key, g, observed_at))
        {
            return Ok(obs);
        }

        // No guide price yet (new printing): summarize the live offers instead
        debug!(item = %key, "No Cardmarket price guide, falling back to listings");
        let listings = self.fetch_listings(key).await?;
        observation_from_listings(key, &listings).ok_or_else(|| {
            warn!(item = %key, "Cardmarket has neither guide price nor listings");
            AdapterError::NotFound(key.to_string())
        })
    }

    async fn fetch_listings(&self, key: &ItemKey) -> Result<Vec<Listing>, AdapterError> {
        let articles = self.fetch_articles(key).await?;
        Ok(listings_from_articles(
            key,
            &articles,
            observation_bucket(Utc::now()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn product() -> CardmarketProduct {
        let body: ProductResponse = serde_json::from_str(
            r#"{"product": {
                "idProduct": 556712,
                "enName": "Ragavan, Nimble Pilferer",
                "priceGuide": {"SELL": 52.0, "LOW": 45.0, "LOWEX": 47.5, "LOWFOIL": 70.0,
                               "AVG": 53.1, "TREND": 51.9, "TRENDFOIL": 79.0}
            }}"#,
        )
        .unwrap();
        body.product
    }

    fn articles() -> Vec<Article> {
        let body: ArticlesResponse = serde_json::from_str(
            r#"{"article": [
                {"idArticle": 1, "price": 50.0, "count": 2, "condition": "NM", "isFoil": false,
                 "seller": {"username": "alice"}},
                {"idArticle": 2, "price": 46.0, "count": 1, "condition": "EX", "isFoil": false,
                 "seller": {"username": "bob"}},
                {"idArticle": 3, "price": 60.0, "count": 1, "condition": "NM", "isFoil": false},
                {"idArticle": 4, "price": 81.0, "count": 1, "condition": "NM", "isFoil": true},
                {"idArticle": 5, "price": 10.0, "count": 0, "condition": "PO", "isFoil": false}
            ]}"#,
        )
        .unwrap();
        body.article
    }

    #[test]
    fn test_guide_trend_price() {
        let key = ItemKey::new("Ragavan, Nimble Pilferer", "MH2").with_external_id("556712");
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
        let guide = product().price_guide.unwrap();

        let obs = observation_from_guide(&key, &guide, at).unwrap();
        assert_eq!(obs.price, dec!(51.9));
        assert_eq!(obs.currency, "EUR");
        assert_eq!(obs.aggregates.min_price, Some(dec!(45)));
        assert_eq!(obs.aggregates.avg_price, Some(dec!(53.1)));

        let foil = observation_from_guide(&key.clone().with_finish(Finish::Foil), &guide, at).unwrap();
        assert_eq!(foil.price, dec!(79));
        assert_eq!(foil.aggregates.min_price, Some(dec!(70)));
    }

    #[test]
    fn test_empty_guide_yields_none() {
        let key = ItemKey::new("New Card", "XYZ");
        assert!(observation_from_guide(&key, &PriceGuide::default(), Utc::now()).is_none());
    }

    #[test]
    fn test_listings_filter_by_finish_and_stock() {
        let key = ItemKey::new("Ragavan", "MH2").with_external_id("556712");
        let listings = listings_from_articles(&key, &articles(), Utc::now());
        assert_eq!(listings.len(), 3);
        assert_eq!(listings[0].seller.as_deref(), Some("alice"));
        assert_eq!(listings[2].seller, None);

        let foil = listings_from_articles(&key.with_finish(Finish::Foil), &articles(), Utc::now());
        assert_eq!(foil.len(), 1);
        assert_eq!(foil[0].price, dec!(81));
    }

    #[test]
    fn test_observation_from_listings_aggregates() {
        let key = ItemKey::new("Ragavan", "MH2");
        let listings = listings_from_articles(&key, &articles(), Utc::now());
        let obs = observation_from_listings(&key, &listings).unwrap();

        assert_eq!(obs.price, dec!(50));
        assert_eq!(obs.aggregates.min_price, Some(dec!(46)));
        assert_eq!(obs.aggregates.max_price, Some(dec!(60)));
        assert_eq!(obs.aggregates.avg_price, Some(dec!(52)));
        assert_eq!(obs.aggregates.listing_count, Some(3));
        assert_eq!(obs.aggregates.total_quantity, Some(4));
        assert_eq!(obs.origin, DataOrigin::Computed);

        assert!(observation_from_listings(&key, &[]).is_none());
    }
}
