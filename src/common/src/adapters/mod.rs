//! Source adapter contract.
//!
//! Every price source implements [`PriceSource`]. Adapters only produce data;
//! they never write to storage. Each one supports a subset of the capability
//! set and advertises it through [`Capabilities`] so callers can check before
//! invoking. Unsupported methods return [`AdapterError::Unsupported`].

pub mod cardmarket;
pub mod scryfall;
pub mod tcgplayer;

pub use cardmarket::CardmarketClient;
pub use scryfall::ScryfallClient;
pub use tcgplayer::TcgPlayerClient;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use reqwest::{RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::models::{ItemKey, Listing, PriceObservation};
use crate::source::Source;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// Network, auth or server failure. Retryable.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The source asked us to slow down. Retryable after backoff.
    #[error("Rate limit exceeded on {0}")]
    RateLimited(Source),

    /// The source does not know the item. Terminal.
    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("{0} does not support {1}")]
    Unsupported(Source, Capability),

    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl AdapterError {
    /// Whether the orchestrator should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::SourceUnavailable(_) | AdapterError::RateLimited(_)
        )
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            AdapterError::ParseError(e.to_string())
        } else {
            AdapterError::SourceUnavailable(e.to_string())
        }
    }
}

/// Adapter capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    FetchPrice,
    FetchPriceHistory,
    FetchListings,
    Search,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::FetchPrice => "fetch_price",
            Capability::FetchPriceHistory => "fetch_price_history",
            Capability::FetchListings => "fetch_listings",
            Capability::Search => "search",
        };
        f.write_str(name)
    }
}

/// Capabilities an adapter implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub fetch_price: bool,
    pub fetch_price_history: bool,
    pub fetch_listings: bool,
    pub search: bool,
}

impl Capabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::FetchPrice => self.fetch_price,
            Capability::FetchPriceHistory => self.fetch_price_history,
            Capability::FetchListings => self.fetch_listings,
            Capability::Search => self.search,
        }
    }
}

/// Price history for one item, ordered oldest to newest.
///
/// Finite and restartable: iterate it as many times as needed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceHistory {
    points: Vec<PriceObservation>,
}

impl PriceHistory {
    pub fn new(mut points: Vec<PriceObservation>) -> Self {
        points.sort_by(|a, b| a.observed_at.cmp(&b.observed_at));
        Self { points }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PriceObservation> {
        self.points.iter()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn latest(&self) -> Option<&PriceObservation> {
        self.points.last()
    }
}

impl IntoIterator for PriceHistory {
    type Item = PriceObservation;
    type IntoIter = std::vec::IntoIter<PriceObservation>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

impl<'a> IntoIterator for &'a PriceHistory {
    type Item = &'a PriceObservation;
    type IntoIter = std::slice::Iter<'a, PriceObservation>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

/// Uniform contract over a marketplace or data source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Which source this adapter talks to.
    fn source(&self) -> Source;

    fn capabilities(&self) -> Capabilities;

    /// Current price for one item.
    async fn fetch_price(&self, key: &ItemKey) -> Result<PriceObservation, AdapterError> {
        let _ = key;
        Err(AdapterError::Unsupported(self.source(), Capability::FetchPrice))
    }

    /// Daily price history for the last `days` days.
    async fn fetch_price_history(
        &self,
        key: &ItemKey,
        days: u32,
    ) -> Result<PriceHistory, AdapterError> {
        let _ = (key, days);
        Err(AdapterError::Unsupported(
            self.source(),
            Capability::FetchPriceHistory,
        ))
    }

    /// Individual offers, for sources that expose an order book.
    async fn fetch_listings(&self, key: &ItemKey) -> Result<Vec<Listing>, AdapterError> {
        let _ = key;
        Err(AdapterError::Unsupported(
            self.source(),
            Capability::FetchListings,
        ))
    }

    /// Look items up by free-text query.
    async fn search(&self, query: &str) -> Result<Vec<ItemKey>, AdapterError> {
        let _ = query;
        Err(AdapterError::Unsupported(self.source(), Capability::Search))
    }
}

/// Send a request and decode a JSON body, mapping HTTP failures onto the
/// adapter error taxonomy.
pub(crate) async fn send_json<T: DeserializeOwned>(
    source: Source,
    what: &str,
    request: RequestBuilder,
) -> Result<T, AdapterError> {
    debug!(%source, what, "Sending request");
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(classify_status(source, status, what, &text));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| AdapterError::ParseError(e.to_string()))
}

/// Map a non-success HTTP status onto an adapter error.
pub(crate) fn classify_status(
    source: Source,
    status: StatusCode,
    what: &str,
    body: &str,
) -> AdapterError {
    match status.as_u16() {
        429 => AdapterError::RateLimited(source),
        404 => AdapterError::NotFound(what.to_string()),
        _ => AdapterError::SourceUnavailable(format!(
            "{} returned status {}: {}",
            source,
            status,
            body.chars().take(200).collect::<String>()
        )),
    }
}

/// Observation time for sources that do not stamp their prices: the fetch
/// time truncated to the hour, so repeated fetches in the same hour share a
/// snapshot key.
pub fn observation_bucket(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(chrono::Duration::hours(1)).unwrap_or(now)
}

/// Convert a JSON float price to a Decimal rounded to cents precision.
pub(crate) fn decimal_price(value: f64) -> Option<Decimal> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Decimal::try_from(value).ok().map(|d| d.round_dp(4).normalize())
}

/// Parse a string price ("1.23") as returned by some APIs.
pub(crate) fn parse_price_str(value: &str) -> Option<Decimal> {
    value
        .trim()
        .parse::<Decimal>()
        .ok()
        .filter(|d| !d.is_sign_negative())
}
