//! Common library for the cardpulse price pipeline.
//!
//! Provides shared functionality:
//! - Configuration loading from .env
//! - Database connection pooling and schema
//! - Source adapters (Scryfall, TCGplayer, Cardmarket) and their registry
//! - Snapshot ingestion with recency-based dedup
//! - Daily metrics, signals, recommendations and outcome evaluation

pub mod adapters;
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod db;
pub mod models;
pub mod orchestrator;
pub mod outcome;
pub mod rate_limit;
pub mod rationale;
pub mod recommendations;
pub mod registry;
pub mod signals;
pub mod source;
pub mod stats;
pub mod store;

pub use adapters::{
    AdapterError, Capabilities, Capability, CardmarketClient, PriceHistory, PriceSource,
    ScryfallClient, TcgPlayerClient,
};
pub use aggregator::{compute_daily_metrics, AggregationStats, MetricsAggregator};
pub use cache::{CacheError, KeyValueCache, MemoryCache, RecencyCache};
pub use config::{Config, ConfigError, SourceSettings};
pub use db::{Database, DbError};
pub use models::{
    Action, DailyMetrics, DataOrigin, Finish, ItemKey, Listing, NewSnapshot, PriceAggregates,
    PriceObservation, Recommendation, RecommendationFilter, RecommendationOutcome, Signal,
    SignalRef, SignalType, Snapshot, TrackedItem,
};
pub use orchestrator::{IngestMode, IngestionOrchestrator, RunReport, RunState, SourceRunReport};
pub use outcome::{OutcomeEvaluator, OutcomeStats};
pub use rate_limit::{RateLimiter, RetryPolicy};
pub use rationale::{HttpRationaleClient, RationaleError, RationaleGenerator};
pub use recommendations::{RecommendationConfig, RecommendationEngine, RecommendationStats};
pub use registry::{AdapterRegistry, RegistryError};
pub use signals::{DetectionStats, SignalDetector, SignalThresholds};
pub use source::Source;
pub use store::{
    ItemCatalog, MemoryStore, MetricsStore, PgStore, RecommendationStore, SignalStore,
    SnapshotStore, StoreError,
};
