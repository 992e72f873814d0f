//! Scryfall API client.
//!
//! Scryfall is the card catalog. Its `prices` block mirrors TCGplayer and
//! Cardmarket once a day, so it serves as a reference price but is not a
//! marketplace.
//! See: https://scryfall.com/docs/api

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    observation_bucket, parse_price_str, send_json, AdapterError, Capabilities, PriceSource,
};
use crate::config::SourceSettings;
use crate::models::{DataOrigin, Finish, ItemKey, PriceAggregates, PriceObservation};
use crate::rate_limit::RateLimiter;
use crate::source::Source;

/// Max search pages followed per query
const MAX_SEARCH_PAGES: usize = 5;

/// Card object (only the fields we use).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ScryfallCard {
    pub id: String,
    pub name: String,
    pub set: String,
    pub collector_number: String,
    pub prices: ScryfallPrices,
}

/// Prices block. Values are decimal strings or null.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ScryfallPrices {
    pub usd: Option<String>,
    pub usd_foil: Option<String>,
    pub usd_etched: Option<String>,
    pub eur: Option<String>,
    pub eur_foil: Option<String>,
}

impl ScryfallPrices {
    /// USD price for the given finish.
    pub fn usd_for(&self, finish: Finish) -> Option<Decimal> {
        let raw = match finish {
            Finish::Nonfoil => self.usd.as_deref(),
            Finish::Foil => self.usd_foil.as_deref(),
            Finish::Etched => self.usd_etched.as_deref(),
        };
        raw.and_then(parse_price_str)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Vec<ScryfallCard>,
    #[serde(default)]
    has_more: bool,
    next_page: Option<String>,
}

/// Scryfall API client.
pub struct ScryfallClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl ScryfallClient {
    pub fn new(settings: &SourceSettings) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("cardpulse/0.1")
                .build()
                .expect("Failed to create HTTP client"),
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(settings.min_interval))),
        }
    }

    async fn rate_limit(&self) {
        self.rate_limiter.lock().await.wait().await;
    }

    /// Look up a card by Scryfall id, or by exact name and set.
    pub async fn fetch_card(&self, key: &ItemKey) -> Result<ScryfallCard, AdapterError> {
        self.rate_limit().await;

        let request = match &key.external_id {
            Some(id) => self.client.get(format!("{}/cards/{}", self.base_url, id)),
            None => self
                .client
                .get(format!("{}/cards/named", self.base_url))
                .query(&[("exact", key.name.as_str()), ("set", key.set_code.as_str())]),
        };

        send_json(Source::Scryfall, &key.to_string(), request).await
    }
}

/// Build an observation from a card's price block.
pub fn observation_from_card(
    key: &ItemKey,
    card: &ScryfallCard,
    observed_at: chrono::DateTime<Utc>,
) -> Result<PriceObservation, AdapterError> {
    let price = card
        .prices
        .usd_for(key.finish)
        .ok_or_else(|| AdapterError::NotFound(format!("{} has no {} price", key, key.finish.as_str())))?;

    Ok(PriceObservation {
        key: key.clone(),
        source: Source::Scryfall,
        price,
        currency: Source::Scryfall.currency().to_string(),
        aggregates: PriceAggregates::default(),
        observed_at,
        origin: DataOrigin::LiveApi,
    })
}

fn key_from_card(card: &ScryfallCard) -> ItemKey {
    ItemKey {
        name: card.name.clone(),
        set_code: card.set.to_uppercase(),
        collector_number: Some(card.collector_number.clone()).filter(|n| !n.is_empty()),
        finish: Finish::Nonfoil,
        external_id: Some(card.id.clone()),
    }
}

#[async_trait]
impl PriceSource for ScryfallClient {
    fn source(&self) -> Source {
        Source::Scryfall
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            fetch_price: true,
            search: true,
            ..Default::default()
        }
    }

    async fn fetch_price(&self, key: &ItemKey) -> Result<PriceObservation, AdapterError> {
        let card = self.fetch_card(key).await?;
        observation_from_card(key, &card, observation_bucket(Utc::now()))
    }

    async fn search(&self, query: &str) -> Result<Vec<ItemKey>, AdapterError> {
        let mut keys = Vec::new();
        let mut next = Some(format!("{}/cards/search", self.base_url));
        let mut first = true;

        for _ in 0..MAX_SEARCH_PAGES {
            let Some(url) = next.take() else { break };
            self.rate_limit().await;

            let mut request = self.client.get(&url);
            if first {
                request = request.query(&[("q", query)]);
                first = false;
            }

            let page: SearchResponse = match send_json(Source::Scryfall, query, request).await {
                Ok(page) => page,
                // Scryfall answers 404 for a search with no hits
                Err(AdapterError::NotFound(_)) => break,
                Err(e) => return Err(e),
            };

            keys.extend(page.data.iter().map(key_from_card));
            if page.has_more {
                next = page.next_page;
            }
        }

        debug!(query, results = keys.len(), "Scryfall search complete");
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn card_json() -> ScryfallCard {
        serde_json::from_str(
            r#"{
                "id": "3f1c1d2e-1111-4d2a-9a3c-abcdefabcdef",
                "name": "Ragavan, Nimble Pilferer",
                "set": "mh2",
                "collector_number": "138",
                "prices": {"usd": "55.12", "usd_foil": "80.00", "usd_etched": null, "eur": "49.90"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_usd_price_per_finish() {
        let card = card_json();
        assert_eq!(card.prices.usd_for(Finish::Nonfoil), Some(dec!(55.12)));
        assert_eq!(card.prices.usd_for(Finish::Foil), Some(dec!(80.00)));
        assert_eq!(card.prices.usd_for(Finish::Etched), None);
    }

    #[test]
    fn test_observation_from_card() {
        let card = card_json();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let key = ItemKey::new("Ragavan, Nimble Pilferer", "MH2");

        let obs = observation_from_card(&key, &card, at).unwrap();
        assert_eq!(obs.price, dec!(55.12));
        assert_eq!(obs.currency, "USD");
        assert_eq!(obs.source, Source::Scryfall);
        assert_eq!(obs.observed_at, at);

        let etched = key.with_finish(Finish::Etched);
        let err = observation_from_card(&etched, &card, at).unwrap_err();
        assert!(matches!(err, AdapterError::NotFound(_)));
    }

    #[test]
    fn test_key_from_card_uses_scryfall_id() {
        let key = key_from_card(&card_json());
        assert_eq!(key.set_code, "MH2");
        assert_eq!(key.collector_number.as_deref(), Some("138"));
        assert_eq!(
            key.external_id.as_deref(),
            Some("3f1c1d2e-1111-4d2a-9a3c-abcdefabcdef")
        );
    }

    #[test]
    fn test_capabilities() {
        let client = ScryfallClient::new(&SourceSettings::defaults_for(Source::Scryfall));
        let caps = client.capabilities();
        assert!(caps.fetch_price && caps.search);
        assert!(!caps.fetch_listings && !caps.fetch_price_history);
    }
}
