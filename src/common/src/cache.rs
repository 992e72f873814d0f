//! Key-value cache and the recency cache built on it.
//!
//! [`RecencyCache`] records, per (item, source), the latest snapshot time
//! already captured. It is advisory: a hit only lets the orchestrator skip a
//! fetch, a miss never blocks a write, and any cache failure is treated as a
//! miss (fail open).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::source::Source;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Minimal key-value cache with per-entry TTL.
#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Default minimum gap between sweeps of expired entries.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Entries {
    map: HashMap<String, (String, Instant)>,
    last_purge: Option<Instant>,
}

impl Entries {
    fn purge(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, (_, expires_at)| *expires_at > now);
        self.last_purge = Some(now);
        before - self.map.len()
    }
}

/// In-process cache. Reads ignore expired entries; writes sweep them out at
/// most once per purge interval, so a long-running process holds only live
/// keys plus one interval's worth of expired ones.
pub struct MemoryCache {
    entries: RwLock<Entries>,
    purge_interval: Duration,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_purge_interval(PURGE_INTERVAL)
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_purge_interval(purge_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            purge_interval,
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        self.entries.write().await.purge(Instant::now())
    }

    /// Stored entries, expired ones not yet swept included.
    pub async fn len(&self) -> usize {
        self.entries.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .map
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let due = entries
            .last_purge
            .map_or(true, |last| now.duration_since(last) >= self.purge_interval);
        if due {
            let removed = entries.purge(now);
            if removed > 0 {
                debug!(removed, "Swept expired cache entries");
            }
        }
        entries
            .map
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.map.remove(key);
        Ok(())
    }
}

/// Tracks the latest captured snapshot time per (item, source).
#[derive(Clone)]
pub struct RecencyCache {
    backend: Arc<dyn KeyValueCache>,
    window: chrono::Duration,
}

impl RecencyCache {
    pub fn new(backend: Arc<dyn KeyValueCache>, window_mins: i64) -> Self {
        Self {
            backend,
            window: chrono::Duration::minutes(window_mins.max(0)),
        }
    }

    fn key(item_id: Uuid, source: Source) -> String {
        format!("recency:{}:{}", source.as_str(), item_id)
    }

    /// Whether the item was captured from this source within the freshness
    /// window. Any cache failure counts as "not fresh".
    pub async fn is_fresh(&self, item_id: Uuid, source: Source, now: DateTime<Utc>) -> bool {
        let raw = match self.backend.get(&Self::key(item_id, source)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                warn!(%source, %item_id, error = %e, "Recency cache read failed, fetching anyway");
                return false;
            }
        };

        match DateTime::parse_from_rfc3339(&raw) {
            Ok(captured) => now - captured.with_timezone(&Utc) < self.window,
            Err(_) => {
                debug!(%source, %item_id, "Ignoring unparseable recency entry");
                false
            }
        }
    }

    /// Record a captured snapshot. Failures are logged and swallowed.
    pub async fn mark_captured(&self, item_id: Uuid, source: Source, captured_at: DateTime<Utc>) {
        let ttl = self.window.to_std().unwrap_or(Duration::ZERO);
        if ttl.is_zero() {
            return;
        }
        if let Err(e) = self
            .backend
            .set(&Self::key(item_id, source), &captured_at.to_rfc3339(), ttl)
            .await
        {
            warn!(%source, %item_id, error = %e, "Recency cache write failed");
        }
    }

    /// Forget an entry so the next run fetches the item again.
    pub async fn invalidate(&self, item_id: Uuid, source: Source) {
        if let Err(e) = self.backend.delete(&Self::key(item_id, source)).await {
            warn!(%source, %item_id, error = %e, "Recency cache delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that fails every call.
    struct BrokenCache;

    #[async_trait]
    impl KeyValueCache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_memory_cache_ttl() {
        let cache = MemoryCache::new();
        cache.set("a", "1", Duration::from_millis(20)).await.unwrap();
        cache.set("b", "2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap(), Some("1".to_string()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);

        cache.delete("b").await.unwrap();
        assert_eq!(cache.get("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept_on_write() {
        let cache = MemoryCache::with_purge_interval(Duration::ZERO);
        for i in 0..1000 {
            cache
                .set(&format!("rationale:{}", i), "text", Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        for i in 0..1000 {
            assert_eq!(cache.get(&format!("rationale:{}", i)).await.unwrap(), None);
        }

        cache.set("live", "1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("live").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn test_sweep_waits_for_purge_interval() {
        let cache = MemoryCache::with_purge_interval(Duration::from_secs(3600));
        // First write sweeps and starts the interval
        cache.set("a", "1", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("b", "2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.len().await, 2);

        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_recency_window() {
        let cache = RecencyCache::new(Arc::new(MemoryCache::new()), 60);
        let item = Uuid::new_v4();
        let now = Utc::now();

        assert!(!cache.is_fresh(item, Source::TcgPlayer, now).await);

        cache
            .mark_captured(item, Source::TcgPlayer, now - chrono::Duration::minutes(10))
            .await;
        assert!(cache.is_fresh(item, Source::TcgPlayer, now).await);
        // Scoped per source
        assert!(!cache.is_fresh(item, Source::Cardmarket, now).await);
        // Outside the window even though the entry has not expired yet
        assert!(
            !cache
                .is_fresh(item, Source::TcgPlayer, now + chrono::Duration::minutes(55))
                .await
        );

        cache.invalidate(item, Source::TcgPlayer).await;
        assert!(!cache.is_fresh(item, Source::TcgPlayer, now).await);
    }

    #[tokio::test]
    async fn test_recency_fails_open() {
        let cache = RecencyCache::new(Arc::new(BrokenCache), 60);
        let item = Uuid::new_v4();
        cache.mark_captured(item, Source::TcgPlayer, Utc::now()).await;
        assert!(!cache.is_fresh(item, Source::TcgPlayer, Utc::now()).await);
    }

    #[tokio::test]
    async fn test_zero_window_never_caches() {
        let cache = RecencyCache::new(Arc::new(MemoryCache::new()), 0);
        let item = Uuid::new_v4();
        cache.mark_captured(item, Source::TcgPlayer, Utc::now()).await;
        assert!(!cache.is_fresh(item, Source::TcgPlayer, Utc::now()).await);
    }
}
