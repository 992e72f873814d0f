//! Adapter registry.
//!
//! Maps a [`Source`] to a lazily constructed, shared adapter instance. Adapter
//! types are registered at startup; the first caller of [`AdapterRegistry::get`]
//! builds the instance and every concurrent caller receives the same `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::adapters::{
    AdapterError, CardmarketClient, Capability, PriceSource, ScryfallClient, TcgPlayerClient,
};
use crate::config::{Config, SourceSettings};
use crate::models::ItemKey;
use crate::source::Source;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No adapter registered for source {0}")]
    NotRegistered(Source),

    #[error("Failed to construct adapter for {0}: {1}")]
    Construction(Source, AdapterError),
}

/// Builds an adapter from its settings.
pub type AdapterFactory =
    Box<dyn Fn(&SourceSettings) -> Result<Arc<dyn PriceSource>, AdapterError> + Send + Sync>;

struct Entry {
    settings: SourceSettings,
    factory: AdapterFactory,
    instance: OnceCell<Arc<dyn PriceSource>>,
}

/// Registry of adapter factories and their cached instances.
///
/// Constructed explicitly and passed to the orchestrator; there is no global
/// instance.
#[derive(Default)]
pub struct AdapterRegistry {
    entries: BTreeMap<Source, Entry>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapter for every configured source.
    pub fn with_defaults(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(Source::Scryfall, config.source(Source::Scryfall), |s| {
            Ok(Arc::new(ScryfallClient::new(s)) as Arc<dyn PriceSource>)
        });
        registry.register(Source::TcgPlayer, config.source(Source::TcgPlayer), |s| {
            Ok(Arc::new(TcgPlayerClient::new(s)) as Arc<dyn PriceSource>)
        });
        registry.register(Source::Cardmarket, config.source(Source::Cardmarket), |s| {
            Ok(Arc::new(CardmarketClient::new(s)) as Arc<dyn PriceSource>)
        });
        registry
    }

    /// Register (or replace) the adapter type for a source.
    pub fn register<F>(&mut self, source: Source, settings: SourceSettings, factory: F)
    where
        F: Fn(&SourceSettings) -> Result<Arc<dyn PriceSource>, AdapterError>
            + Send
            + Sync
            + 'static,
    {
        self.entries.insert(
            source,
            Entry {
                settings,
                factory: Box::new(factory),
                instance: OnceCell::new(),
            },
        );
    }

    /// Get the adapter for a source, constructing it on first use.
    pub async fn get(&self, source: Source) -> Result<Arc<dyn PriceSource>, RegistryError> {
        let entry = self
            .entries
            .get(&source)
            .ok_or(RegistryError::NotRegistered(source))?;

        let adapter = entry
            .instance
            .get_or_try_init(|| async {
                info!(%source, "Constructing adapter");
                (entry.factory)(&entry.settings)
            })
            .await
            .map_err(|e| RegistryError::Construction(source, e))?;

        Ok(Arc::clone(adapter))
    }

    /// Settings a source was registered with.
    pub fn settings(&self, source: Source) -> Option<&SourceSettings> {
        self.entries.get(&source).map(|e| &e.settings)
    }

    /// Every registered source.
    pub fn sources(&self) -> Vec<Source> {
        self.entries.keys().copied().collect()
    }

    /// Registered marketplace sources that are enabled. Reference sources
    /// (catalog only) are excluded.
    pub fn marketplace_sources(&self) -> Vec<Source> {
        self.entries
            .iter()
            .filter(|(source, entry)| !source.is_reference() && entry.settings.enabled)
            .map(|(source, _)| *source)
            .collect()
    }

    /// Look a card up on every enabled source that supports search, reference
    /// sources included. A failing source is logged and left out.
    pub async fn search(&self, query: &str) -> Vec<(Source, Vec<ItemKey>)> {
        let mut results = Vec::new();

        for (source, entry) in &self.entries {
            if !entry.settings.enabled {
                continue;
            }
            let adapter = match self.get(*source).await {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(%source, error = %e, "Adapter unavailable for search");
                    continue;
                }
            };
            if !adapter.capabilities().supports(Capability::Search) {
                continue;
            }
            match adapter.search(query).await {
                Ok(keys) => results.push((*source, keys)),
                Err(e) => warn!(%source, query, error = %e, "Search failed"),
            }
        }
        results
    }
}
