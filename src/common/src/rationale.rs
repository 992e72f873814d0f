//! Rationale text for recommendations.
//!
//! An external text-generation service may write the rationale from the
//! structured metrics and signals. Its responses are cached in the key-value
//! cache. When the service is not configured or fails, callers use
//! [`template_rationale`].

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::KeyValueCache;
use crate::config::RationaleConfig;
use crate::models::{Action, SignalType};

#[derive(Debug, Error)]
pub enum RationaleError {
    #[error("Rationale request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Rationale API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    #[error("Rationale service returned no text")]
    Empty,
}

/// One signal as the text generator sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalSummary {
    pub signal_type: SignalType,
    pub value: Decimal,
    pub confidence: f64,
}

/// Structured input for a rationale.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RationaleInput {
    pub item_id: Uuid,
    pub action: Action,
    pub confidence: f64,
    pub current_price: Decimal,
    pub target_price: Decimal,
    pub potential_profit_pct: Decimal,
    pub horizon_days: i32,
    pub ma_7d: Option<Decimal>,
    pub ma_30d: Option<Decimal>,
    pub volatility_7d: Option<Decimal>,
    pub price_change_pct_7d: Option<Decimal>,
    pub signals: Vec<SignalSummary>,
}

/// Produces free-text rationales.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RationaleGenerator: Send + Sync {
    async fn generate(&self, input: &RationaleInput) -> Result<String, RationaleError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: String,
    context: &'a RationaleInput,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    text: String,
}

/// HTTP text-generation client with a response cache.
pub struct HttpRationaleClient {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    cache: Option<Arc<dyn KeyValueCache>>,
    cache_ttl: Duration,
}

impl HttpRationaleClient {
    /// Build a client from config. None when no API URL is configured.
    pub fn from_config(
        config: &RationaleConfig,
        cache: Option<Arc<dyn KeyValueCache>>,
    ) -> Option<Self> {
        let api_url = config.api_url.clone()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Some(Self {
            client,
            api_url,
            api_key: config.api_key.clone(),
            cache,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
        })
    }

    fn cache_key(input: &RationaleInput) -> String {
        let mut hasher = DefaultHasher::new();
        serde_json::to_string(input)
            .unwrap_or_default()
            .hash(&mut hasher);
        format!("rationale:{:016x}", hasher.finish())
    }

    async fn request(&self, input: &RationaleInput) -> Result<String, RationaleError> {
        let body = GenerateRequest {
            prompt: prompt_for(input),
            context: input,
        };
        let mut request = self.client.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RationaleError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        let text = parsed.text.trim().to_string();
        if text.is_empty() {
            return Err(RationaleError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl RationaleGenerator for HttpRationaleClient {
    async fn generate(&self, input: &RationaleInput) -> Result<String, RationaleError> {
        let key = Self::cache_key(input);

        if let Some(cache) = &self.cache {
            match cache.get(&key).await {
                Ok(Some(text)) => {
                    debug!(item_id = %input.item_id, "Rationale cache hit");
                    return Ok(text);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Rationale cache read failed"),
            }
        }

        let text = self.request(input).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(&key, &text, self.cache_ttl).await {
                warn!(error = %e, "Rationale cache write failed");
            }
        }
        Ok(text)
    }
}

fn prompt_for(input: &RationaleInput) -> String {
    format!(
        "Explain in two or three sentences why a collector should {} this card. \
         Current price {}, target {}, horizon {} days. Use only the provided metrics and signals.",
        input.action.as_str().to_lowercase(),
        input.current_price.round_dp(2),
        input.target_price.round_dp(2),
        input.horizon_days,
    )
}

/// Deterministic rationale built from the input alone.
pub fn template_rationale(input: &RationaleInput) -> String {
    let mut text = match input.action {
        Action::Buy => format!(
            "BUY: trading at {} against an estimated fair value of {} ({}% upside).",
            input.current_price.round_dp(2),
            input.target_price.round_dp(2),
            input.potential_profit_pct.round_dp(1),
        ),
        Action::Sell => format!(
            "SELL: trading at {}, expected to fall toward {} ({}% downside).",
            input.current_price.round_dp(2),
            input.target_price.round_dp(2),
            input.potential_profit_pct.round_dp(1),
        ),
        Action::Hold => format!(
            "HOLD: trading at {}, close to its estimated fair value of {}.",
            input.current_price.round_dp(2),
            input.target_price.round_dp(2),
        ),
    };

    if !input.signals.is_empty() {
        let names: Vec<&str> = input.signals.iter().map(|s| s.signal_type.as_str()).collect();
        text.push_str(&format!(" Signals: {}.", names.join(", ")));
    }
    text.push_str(&format!(
        " Confidence {:.0}% over {} days.",
        input.confidence * 100.0,
        input.horizon_days
    ));
    text
}

/// Ask the generator, falling back to the template on absence or failure.
pub async fn rationale_or_template(
    generator: Option<&dyn RationaleGenerator>,
    input: &RationaleInput,
) -> String {
    let Some(generator) = generator else {
        return template_rationale(input);
    };
    match generator.generate(input).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => template_rationale(input),
        Err(e) => {
            warn!(item_id = %input.item_id, error = %e, "Rationale generation failed, using template");
            template_rationale(input)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn input() -> RationaleInput {
        RationaleInput {
            item_id: Uuid::nil(),
            action: Action::Buy,
            confidence: 0.72,
            current_price: dec!(10),
            target_price: dec!(12.5),
            potential_profit_pct: dec!(25),
            horizon_days: 7,
            ma_7d: Some(dec!(11)),
            ma_30d: Some(dec!(13)),
            volatility_7d: None,
            price_change_pct_7d: Some(dec!(12)),
            signals: vec![SignalSummary {
                signal_type: SignalType::MomentumUp,
                value: dec!(0.12),
                confidence: 0.6,
            }],
        }
    }

    #[test]
    fn test_template_mentions_action_and_signals() {
        let text = template_rationale(&input());
        assert!(text.starts_with("BUY"));
        assert!(text.contains("12.5"));
        assert!(text.contains("momentum_up"));
        assert!(text.contains("Confidence 72%"));
    }

    #[tokio::test]
    async fn test_falls_back_when_generator_fails() {
        let mut mock = MockRationaleGenerator::new();
        mock.expect_generate()
            .times(1)
            .returning(|_| Err(RationaleError::Empty));

        let text = rationale_or_template(Some(&mock), &input()).await;
        assert_eq!(text, template_rationale(&input()));
    }

    #[tokio::test]
    async fn test_uses_generated_text() {
        let mut mock = MockRationaleGenerator::new();
        mock.expect_generate()
            .returning(|_| Ok("Reprint risk is low and demand is climbing.".to_string()));

        let text = rationale_or_template(Some(&mock), &input()).await;
        assert_eq!(text, "Reprint risk is low and demand is climbing.");
        assert_eq!(
            rationale_or_template(None, &input()).await,
            template_rationale(&input())
        );
    }

    #[test]
    fn test_cache_key_is_stable_per_input() {
        let a = HttpRationaleClient::cache_key(&input());
        let b = HttpRationaleClient::cache_key(&input());
        let mut other = input();
        other.action = Action::Hold;
        assert_eq!(a, b);
        assert_ne!(a, HttpRationaleClient::cache_key(&other));
    }

    #[test]
    fn test_no_client_without_url() {
        let config = RationaleConfig {
            api_url: None,
            api_key: None,
            cache_ttl_secs: 60,
        };
        assert!(HttpRationaleClient::from_config(&config, None).is_none());
    }
}
