//! Configuration loading from environment variables.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::rate_limit::RetryPolicy;
use crate::recommendations::RecommendationConfig;
use crate::signals::SignalThresholds;
use crate::source::Source;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
}

/// Per-source fetch settings.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub enabled: bool,
    pub api_url: String,
    pub api_key: Option<String>,
    /// Minimum gap between two requests to this source
    pub min_interval: Duration,
    pub retry: RetryPolicy,
}

impl SourceSettings {
    /// Defaults for a source, before environment overrides.
    pub fn defaults_for(source: Source) -> Self {
        Self {
            enabled: true,
            api_url: source.default_api_url().to_string(),
            api_key: None,
            min_interval: Duration::from_millis(source.default_min_interval_ms()),
            retry: RetryPolicy::default(),
        }
    }
}

/// Ingestion run settings.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Items captured within this many minutes are not fetched again
    pub freshness_window_mins: i64,
    /// Max rows per snapshot insert statement
    pub snapshot_batch_size: usize,
    /// Max items one source task fetches before writing
    pub items_per_task: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            freshness_window_mins: 60,
            snapshot_batch_size: 500,
            items_per_task: 250,
        }
    }
}

/// How often each stage runs, in seconds.
#[derive(Debug, Clone)]
pub struct CadenceConfig {
    pub ingest_secs: u64,
    pub metrics_secs: u64,
    pub signal_secs: u64,
    pub recommendation_secs: u64,
    pub outcome_secs: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            ingest_secs: 3600,
            metrics_secs: 3600,
            signal_secs: 3600,
            recommendation_secs: 6 * 3600,
            outcome_secs: 6 * 3600,
        }
    }
}

/// Text-generation collaborator settings. Absent URL means templated
/// rationales only.
#[derive(Debug, Clone)]
pub struct RationaleConfig {
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub cache_ttl_secs: u64,
}

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    pub sources: BTreeMap<Source, SourceSettings>,
    pub ingest: IngestConfig,
    pub cadence: CadenceConfig,
    /// Trailing days the aggregator recomputes on each run
    pub metrics_lookback_days: i64,
    pub thresholds: SignalThresholds,
    pub recommendation: RecommendationConfig,
    pub rationale: RationaleConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required variables:
    /// - DATABASE_URL: PostgreSQL connection string
    ///
    /// Everything else has a default; see the field docs.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load configuration from environment variables only (no .env file).
    /// Useful for testing.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let mut sources = BTreeMap::new();
        for source in Source::ALL {
            sources.insert(source, source_settings_from_env(source)?);
        }

        let ingest_defaults = IngestConfig::default();
        let ingest = IngestConfig {
            freshness_window_mins: env_or("FRESHNESS_WINDOW_MINS", ingest_defaults.freshness_window_mins),
            snapshot_batch_size: env_or("SNAPSHOT_BATCH_SIZE", ingest_defaults.snapshot_batch_size).max(1),
            items_per_task: env_or("ITEMS_PER_TASK", ingest_defaults.items_per_task).max(1),
        };

        let cadence_defaults = CadenceConfig::default();
        let cadence = CadenceConfig {
            ingest_secs: env_or("INGEST_INTERVAL_SECS", cadence_defaults.ingest_secs),
            metrics_secs: env_or("METRICS_INTERVAL_SECS", cadence_defaults.metrics_secs),
            signal_secs: env_or("SIGNAL_INTERVAL_SECS", cadence_defaults.signal_secs),
            recommendation_secs: env_or(
                "RECOMMENDATION_INTERVAL_SECS",
                cadence_defaults.recommendation_secs,
            ),
            outcome_secs: env_or("OUTCOME_INTERVAL_SECS", cadence_defaults.outcome_secs),
        };

        let t = SignalThresholds::default();
        let thresholds = SignalThresholds {
            momentum_pct: env_or("MOMENTUM_THRESHOLD_PCT", t.momentum_pct),
            spike_pct: env_or("SPIKE_THRESHOLD_PCT", t.spike_pct),
            spread_pct: env_or("SPREAD_THRESHOLD_PCT", t.spread_pct),
            trend_pct: env_or("TREND_THRESHOLD_PCT", t.trend_pct),
            volatility_high_ratio: env_or("VOLATILITY_HIGH_RATIO", t.volatility_high_ratio),
            volatility_low_ratio: env_or("VOLATILITY_LOW_RATIO", t.volatility_low_ratio),
        };

        let r = RecommendationConfig::default();
        let recommendation = RecommendationConfig {
            roi_threshold_pct: env_or("ROI_THRESHOLD_PCT", r.roi_threshold_pct),
            min_confidence: env_or("MIN_CONFIDENCE", r.min_confidence).clamp(0.0, 1.0),
            horizon_days: env_or("HORIZON_DAYS", r.horizon_days).max(1),
            overextension_sigma: env_or("OVEREXTENSION_SIGMA", r.overextension_sigma),
        };

        let rationale_url = env::var("RATIONALE_API_URL").ok().filter(|s| !s.is_empty());
        if let Some(u) = &rationale_url {
            validate_url(u)?;
        }
        let rationale = RationaleConfig {
            api_url: rationale_url,
            api_key: env::var("RATIONALE_API_KEY").ok().filter(|s| !s.is_empty()),
            cache_ttl_secs: env_or("RATIONALE_CACHE_TTL_SECS", 86_400),
        };

        Ok(Self {
            database_url,
            sources,
            ingest,
            cadence,
            metrics_lookback_days: env_or("METRICS_LOOKBACK_DAYS", 2i64).max(1),
            thresholds,
            recommendation,
            rationale,
        })
    }

    /// Settings for one source.
    pub fn source(&self, source: Source) -> SourceSettings {
        self.sources
            .get(&source)
            .cloned()
            .unwrap_or_else(|| SourceSettings::defaults_for(source))
    }

    /// Marketplace sources that are switched on.
    pub fn enabled_marketplaces(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|(s, settings)| settings.enabled && !s.is_reference())
            .map(|(s, _)| *s)
            .collect()
    }
}

fn source_settings_from_env(source: Source) -> Result<SourceSettings, ConfigError> {
    let prefix = source.env_prefix();
    let defaults = SourceSettings::defaults_for(source);

    let api_url = env::var(format!("{prefix}_API_URL")).unwrap_or(defaults.api_url);
    validate_url(&api_url)?;

    let min_interval_ms: u64 = env_or(
        &format!("{prefix}_MIN_INTERVAL_MS"),
        defaults.min_interval.as_millis() as u64,
    );

    Ok(SourceSettings {
        enabled: env_or(&format!("{prefix}_ENABLED"), defaults.enabled),
        api_url,
        api_key: env::var(format!("{prefix}_API_KEY")).ok().filter(|s| !s.is_empty()),
        min_interval: Duration::from_millis(min_interval_ms),
        retry: RetryPolicy {
            max_retries: env_or(&format!("{prefix}_MAX_RETRIES"), defaults.retry.max_retries),
            base_delay: Duration::from_millis(env_or(
                &format!("{prefix}_BACKOFF_BASE_MS"),
                defaults.retry.base_delay.as_millis() as u64,
            )),
            backoff_factor: env_or(
                &format!("{prefix}_BACKOFF_FACTOR"),
                defaults.retry.backoff_factor,
            ),
        },
    })
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    url::Url::parse(raw)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl(raw.to_string()))
}

/// Parse an environment variable, falling back to `default` when unset or
/// malformed.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_missing_database_url() {
        env::remove_var("DATABASE_URL");

        let result = Config::from_env_only();
        assert!(result.is_err());

        if let Err(ConfigError::MissingVar(var)) = result {
            assert_eq!(var, "DATABASE_URL");
        } else {
            panic!("Expected MissingVar error");
        }
    }

    #[test]
    #[serial]
    fn test_config_with_defaults() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");

        let config = Config::from_env_only().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/test");
        assert_eq!(config.ingest.freshness_window_mins, 60);
        assert_eq!(config.ingest.snapshot_batch_size, 500);
        assert_eq!(config.cadence.ingest_secs, 3600);
        assert_eq!(config.metrics_lookback_days, 2);
        assert_eq!(config.thresholds.momentum_pct, dec!(10));
        assert_eq!(config.thresholds.spike_pct, dec!(15));
        assert_eq!(config.recommendation.horizon_days, 7);
        assert!(config.rationale.api_url.is_none());

        let cardmarket = config.source(Source::Cardmarket);
        assert_eq!(cardmarket.min_interval, Duration::from_millis(1000));
        assert_eq!(cardmarket.retry.max_retries, 3);

        // Scryfall is a reference source and never listed as a marketplace
        assert_eq!(
            config.enabled_marketplaces(),
            vec![Source::TcgPlayer, Source::Cardmarket]
        );

        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_config_source_overrides() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("TCGPLAYER_MAX_RETRIES", "5");
        env::set_var("TCGPLAYER_BACKOFF_FACTOR", "3.0");
        env::set_var("CARDMARKET_ENABLED", "false");
        env::set_var("MOMENTUM_THRESHOLD_PCT", "not_a_number");

        let config = Config::from_env_only().unwrap();

        let tcg = config.source(Source::TcgPlayer);
        assert_eq!(tcg.retry.max_retries, 5);
        assert_eq!(tcg.retry.backoff_factor, 3.0);
        assert_eq!(config.enabled_marketplaces(), vec![Source::TcgPlayer]);
        // Falls back to default
        assert_eq!(config.thresholds.momentum_pct, dec!(10));

        for var in [
            "DATABASE_URL",
            "TCGPLAYER_MAX_RETRIES",
            "TCGPLAYER_BACKOFF_FACTOR",
            "CARDMARKET_ENABLED",
            "MOMENTUM_THRESHOLD_PCT",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_config_rejects_invalid_source_url() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("SCRYFALL_API_URL", "not a url");

        let result = Config::from_env_only();
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));

        env::remove_var("SCRYFALL_API_URL");
        env::remove_var("DATABASE_URL");
    }
}
