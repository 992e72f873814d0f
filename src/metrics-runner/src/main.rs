//! Metrics Runner Service
//!
//! Turns stored price snapshots into daily metrics, signals and
//! recommendations, and scores recommendations once their horizon ends.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::config::CadenceConfig;
use common::{
    Config, Database, HttpRationaleClient, KeyValueCache, MemoryCache, MetricsAggregator,
    OutcomeEvaluator, PgStore, RecommendationEngine, SignalDetector,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    All,
    Metrics,
    Signals,
    Recommendations,
    Outcomes,
}

impl Stage {
    /// Stages run together on the analytics tick, in dependency order.
    fn analytics(self) -> Vec<Stage> {
        match self {
            Stage::All => vec![Stage::Metrics, Stage::Signals, Stage::Recommendations],
            Stage::Outcomes => Vec::new(),
            single => vec![single],
        }
    }

    fn runs_outcomes(self) -> bool {
        matches!(self, Stage::All | Stage::Outcomes)
    }

    /// Analytics tick period. A full pipeline follows the metrics cadence.
    fn analytics_secs(self, cadence: &CadenceConfig) -> u64 {
        match self {
            Stage::Signals => cadence.signal_secs,
            Stage::Recommendations => cadence.recommendation_secs,
            _ => cadence.metrics_secs,
        }
    }
}

/// Metrics Runner - daily analytics over price snapshots
#[derive(Parser, Debug)]
#[command(name = "metrics-runner")]
#[command(about = "Aggregates snapshots into metrics, signals and recommendations")]
struct Args {
    /// Run the selected stages once and exit
    #[arg(long)]
    once: bool,

    /// Date to process (YYYY-MM-DD, defaults to today UTC)
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Stage to run
    #[arg(long, value_enum, default_value = "all")]
    stage: Stage,

    /// Create tables before starting
    #[arg(long)]
    apply_schema: bool,
}

/// Every pipeline stage over one store.
struct Pipeline {
    aggregator: MetricsAggregator,
    detector: SignalDetector,
    engine: RecommendationEngine,
    evaluator: OutcomeEvaluator,
    lookback_days: i64,
}

impl Pipeline {
    fn new(config: &Config, store: Arc<PgStore>) -> Self {
        let aggregator = MetricsAggregator::new(store.clone(), store.clone());
        let detector = SignalDetector::new(store.clone(), store.clone(), config.thresholds.clone());

        let mut engine = RecommendationEngine::new(
            store.clone(),
            store.clone(),
            store.clone(),
            config.recommendation.clone(),
        );
        let cache: Arc<dyn KeyValueCache> = Arc::new(MemoryCache::new());
        match HttpRationaleClient::from_config(&config.rationale, Some(cache)) {
            Some(client) => {
                info!("Rationale generator enabled");
                engine = engine.with_rationale(Arc::new(client));
            }
            None => info!("No rationale API configured, using templates"),
        }

        let evaluator = OutcomeEvaluator::new(
            store.clone(),
            store,
            config.recommendation.roi_threshold_pct,
        );

        Self {
            aggregator,
            detector,
            engine,
            evaluator,
            lookback_days: config.metrics_lookback_days,
        }
    }

    async fn aggregate(&self, date: NaiveDate) {
        match self.aggregator.run(date, self.lookback_days, Utc::now()).await {
            Ok(stats) => info!(
                "Metrics complete: {} dates, {} items, {} rows",
                stats.dates, stats.items_seen, stats.rows_written
            ),
            Err(e) => error!("Metrics aggregation failed: {}", e),
        }
    }

    async fn detect(&self, date: NaiveDate) {
        match self.detector.run(date, Utc::now()).await {
            Ok(stats) => info!(
                "Signals complete: {} items, {} signals",
                stats.items, stats.signals
            ),
            Err(e) => error!("Signal detection failed: {}", e),
        }
    }

    async fn recommend(&self, date: NaiveDate) {
        match self.engine.run(date, Utc::now()).await {
            Ok(stats) => info!(
                "Recommendations complete: {} items ({} buy, {} sell, {} hold)",
                stats.items, stats.buy, stats.sell, stats.hold
            ),
            Err(e) => error!("Recommendation run failed: {}", e),
        }
    }

    async fn evaluate(&self) {
        match self.evaluator.run(Utc::now()).await {
            Ok(stats) => {
                info!(
                    "Outcomes complete: {} due, {} evaluated, {} expired",
                    stats.due, stats.evaluated, stats.deactivated
                );
                if stats.no_data > 0 {
                    warn!("{} recommendations had no price data yet", stats.no_data);
                }
            }
            Err(e) => error!("Outcome evaluation failed: {}", e),
        }
    }

    /// Run stages in dependency order.
    async fn run_stage(&self, stage: Stage, date: NaiveDate) {
        match stage {
            Stage::All => {
                self.aggregate(date).await;
                self.detect(date).await;
                self.recommend(date).await;
                self.evaluate().await;
            }
            Stage::Metrics => self.aggregate(date).await,
            Stage::Signals => self.detect(date).await,
            Stage::Recommendations => self.recommend(date).await,
            Stage::Outcomes => self.evaluate().await,
        }
    }
}

fn ticker(secs: u64) -> Interval {
    let mut ticker = interval(Duration::from_secs(secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    info!("Metrics Runner starting...");
    info!("Stage: {:?}", args.stage);

    let config = Config::from_env()?;

    info!("Connecting to database...");
    let db = Database::connect(&config).await?;
    db.health_check().await?;
    if args.apply_schema {
        db.apply_schema().await?;
        info!("Schema applied");
    }
    info!("Database connected successfully");

    let store = Arc::new(PgStore::new(db.pool().clone()));
    let pipeline = Pipeline::new(&config, store);

    let today = || args.date.unwrap_or_else(|| Utc::now().date_naive());

    if args.once {
        pipeline.run_stage(args.stage, today()).await;
        info!("Single run mode - exiting");
        return Ok(());
    }

    let analytics = args.stage.analytics();
    let mut analytics_tick = ticker(args.stage.analytics_secs(&config.cadence));
    let mut outcome_tick = ticker(config.cadence.outcome_secs);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = analytics_tick.tick(), if !analytics.is_empty() => {
                let date = today();
                for stage in &analytics {
                    pipeline.run_stage(*stage, date).await;
                }
            }
            _ = outcome_tick.tick(), if args.stage.runs_outcomes() => {
                pipeline.run_stage(Stage::Outcomes, today()).await;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_pipeline_runs_analytics_in_order() {
        assert_eq!(
            Stage::All.analytics(),
            vec![Stage::Metrics, Stage::Signals, Stage::Recommendations]
        );
        assert!(Stage::All.runs_outcomes());
    }

    #[test]
    fn test_single_stage_ticks_alone() {
        assert_eq!(Stage::Signals.analytics(), vec![Stage::Signals]);
        assert!(!Stage::Signals.runs_outcomes());
        assert!(Stage::Outcomes.analytics().is_empty());
        assert!(Stage::Outcomes.runs_outcomes());
    }

    #[test]
    fn test_full_pipeline_follows_metrics_cadence() {
        let cadence = CadenceConfig {
            metrics_secs: 600,
            signal_secs: 60,
            ..CadenceConfig::default()
        };
        assert_eq!(Stage::All.analytics_secs(&cadence), 600);
        assert_eq!(Stage::Signals.analytics_secs(&cadence), 60);
    }
}
