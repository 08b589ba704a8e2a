use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::endpoints;
use crate::api::transport::HttpTransport;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::storage::{
    FileKeyValueStorage, KeyValueStorage, MemoryKeyValueStorage, MemoryStructuredStorage,
    SqliteStructuredStorage, StructuredStorage,
};

use super::entry::CacheEntry;
use super::key::{invalidation_needle, CacheKey};
use super::metrics::{CacheMetrics, MetricsRecorder};
use super::tiered::{TieredStore, TieredStoreOptions};
use super::types::CacheType;

/// Sub-directory of the storage dir holding the key-value tier.
const KV_DIR: &str = "kv";

/// Database file for the structured tier.
const STRUCTURED_DB: &str = "cache.db";

/// Scoped cache over the tiered store.
///
/// Derives keys from `(type, identifier, user)`, applies per-type TTLs and
/// keeps hit/miss/store/invalidate counters.
pub struct CacheManager {
    store: TieredStore,
    metrics: MetricsRecorder,
}

impl CacheManager {
    pub fn new(
        config: &Config,
        persistent: Arc<dyn KeyValueStorage>,
        structured: Arc<dyn StructuredStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let options = TieredStoreOptions {
            memory_max_entries: config.memory_max_entries,
            persistent_item_max_bytes: config.persistent_item_max_bytes,
            stale_retention: config.stale_retention(),
            ttl_overrides: config
                .ttl_overrides
                .keys()
                .map(|t| (*t, config.ttl_for(*t)))
                .collect(),
        };
        Self {
            store: TieredStore::new(persistent, structured, clock, options),
            metrics: MetricsRecorder::default(),
        }
    }

    /// Cache backed by files and SQLite under the configured storage dir.
    pub fn open(config: &Config) -> Result<Self> {
        let dir = config.storage_dir()?;
        let persistent = FileKeyValueStorage::new(dir.join(KV_DIR), config.persistent_quota_bytes)?;
        let structured = SqliteStructuredStorage::open(&dir.join(STRUCTURED_DB))?;
        debug!(dir = %dir.display(), "Opened cache storage");
        Ok(Self::new(
            config,
            Arc::new(persistent),
            Arc::new(structured),
            Arc::new(SystemClock),
        ))
    }

    /// Cache that lives only as long as the process.
    pub fn in_memory(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(MemoryKeyValueStorage::with_quota(config.persistent_quota_bytes)),
            Arc::new(MemoryStructuredStorage::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn persistent_storage(&self) -> Arc<dyn KeyValueStorage> {
        Arc::clone(self.store.persistent())
    }

    pub fn structured_storage(&self) -> Arc<dyn StructuredStorage> {
        Arc::clone(self.store.structured())
    }

    pub fn store(&self) -> &TieredStore {
        &self.store
    }

    pub fn ttl_for(&self, cache_type: CacheType) -> Duration {
        self.store.options().default_ttl(cache_type)
    }

    // ===== Reads =====

    pub async fn get(&self, cache_type: CacheType, identifier: &str, user_id: Option<&str>) -> Option<Value> {
        self.get_key(&CacheKey::new(cache_type, identifier, user_id)).await
    }

    pub async fn get_key(&self, key: &CacheKey) -> Option<Value> {
        let value = self.store.get(key).await;
        if value.is_some() {
            self.metrics.record_hit();
            debug!(key = %key, "Cache hit");
        } else {
            self.metrics.record_miss();
            debug!(key = %key, "Cache miss");
        }
        value
    }

    /// Any retained copy, expired or not. Does not touch the hit/miss counters.
    pub async fn get_stale(
        &self,
        cache_type: CacheType,
        identifier: &str,
        user_id: Option<&str>,
    ) -> Option<CacheEntry> {
        self.get_stale_key(&CacheKey::new(cache_type, identifier, user_id)).await
    }

    pub async fn get_stale_key(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.store.get_stale(key).await
    }

    // ===== Writes =====

    pub async fn set(
        &self,
        cache_type: CacheType,
        identifier: &str,
        value: Value,
        user_id: Option<&str>,
        custom_ttl: Option<Duration>,
    ) {
        self.set_key(&CacheKey::new(cache_type, identifier, user_id), value, custom_ttl)
            .await
    }

    pub async fn set_key(&self, key: &CacheKey, value: Value, custom_ttl: Option<Duration>) {
        let ttl = custom_ttl.unwrap_or_else(|| self.ttl_for(key.cache_type()));
        self.store.set(key, value, ttl).await;
        self.metrics.record_store();
        debug!(key = %key, ttl_ms = ttl.num_milliseconds(), "Cached value");
    }

    // ===== Invalidation =====

    /// Remove every entry whose key contains `{user_scope}{pattern}`.
    ///
    /// An empty pattern with a user clears all of that user's data. Always
    /// counts as one invalidation, even when nothing matched.
    pub async fn invalidate(&self, pattern: &str, user_id: Option<&str>) -> usize {
        let needle = invalidation_needle(pattern, user_id);
        self.metrics.record_invalidation();

        if needle.is_empty() {
            // No scope and no pattern would match everything; that's clear_all's job
            debug!("Ignoring unscoped empty invalidation");
            return 0;
        }

        let removed = self.store.remove_matching(&needle).await;
        debug!(pattern = %needle, removed, "Invalidated cache entries");
        removed
    }

    pub async fn clear_user(&self, user_id: &str) -> usize {
        self.invalidate("", Some(user_id)).await
    }

    /// Drop every entry in every tier and reset the counters.
    pub async fn clear_all(&self) {
        self.store.clear().await;
        self.metrics.reset();
        info!("Cleared all cached data");
    }

    // ===== Expiry =====

    pub async fn sweep_expired(&self) -> usize {
        let removed = self.store.sweep_expired().await;
        if removed > 0 {
            debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Periodically sweep expired entries. The first sweep runs immediately.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep_expired().await;
            }
        })
    }

    pub async fn rebuild_overflow_index(&self) -> usize {
        self.store.rebuild_overflow_index().await
    }

    // ===== Warming =====

    /// Fetch and store the default payload for each priority, in order.
    /// A failing priority is logged and skipped. Returns the number warmed.
    pub async fn warm_cache(
        &self,
        transport: &dyn HttpTransport,
        user_id: &str,
        priorities: &[CacheType],
    ) -> usize {
        let mut warmed = 0;
        for cache_type in priorities {
            let Some((request, config)) = endpoints::warm_target(*cache_type, user_id) else {
                debug!(cache_type = %cache_type, "No warm endpoint for cache type");
                continue;
            };
            let ttl = config.ttl();
            let Some(target) = config.target else {
                continue;
            };

            match transport.call(&request).await {
                Ok(data) => {
                    self.set_key(&target.key(), data, ttl).await;
                    warmed += 1;
                }
                Err(e) => {
                    warn!(cache_type = %cache_type, error = %e, "Failed to warm cache");
                }
            }
        }
        info!(user_id, warmed, "Cache warming finished");
        warmed
    }

    // ===== Metrics =====

    pub fn metrics(&self) -> CacheMetrics {
        self.metrics
            .snapshot(self.store.memory_len(), self.store.storage_usage_bytes())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockTransport;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn manager() -> (CacheManager, ManualClock) {
        let clock = ManualClock::default();
        let manager = CacheManager::new(
            &Config::default(),
            Arc::new(MemoryKeyValueStorage::new()),
            Arc::new(MemoryStructuredStorage::new()),
            Arc::new(clock.clone()),
        );
        (manager, clock)
    }

    #[tokio::test]
    async fn test_cache_types_are_isolated() {
        let (cache, _) = manager();
        cache.set(CacheType::Books, "1", json!({"a": 1}), None, None).await;
        cache.set(CacheType::Notes, "1", json!({"b": 2}), None, None).await;

        assert_eq!(cache.get(CacheType::Books, "1", None).await, Some(json!({"a": 1})));
        assert_eq!(cache.get(CacheType::Notes, "1", None).await, Some(json!({"b": 2})));
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let (cache, _) = manager();
        cache.set(CacheType::Books, "1", json!("mine"), Some("a"), None).await;

        assert_eq!(cache.get(CacheType::Books, "1", Some("b")).await, None);
        assert_eq!(cache.get(CacheType::Books, "1", None).await, None);
    }

    #[tokio::test]
    async fn test_default_and_custom_ttl() {
        let (cache, clock) = manager();
        cache.set(CacheType::Sessions, "recent", json!(1), Some("u"), None).await;
        cache
            .set(CacheType::Sessions, "short", json!(2), Some("u"), Some(Duration::seconds(1)))
            .await;

        clock.advance(Duration::seconds(1));
        assert_eq!(cache.get(CacheType::Sessions, "short", Some("u")).await, None);
        assert!(cache.get(CacheType::Sessions, "recent", Some("u")).await.is_some());

        clock.advance(Duration::minutes(5));
        assert_eq!(cache.get(CacheType::Sessions, "recent", Some("u")).await, None);
    }

    #[tokio::test]
    async fn test_metrics_accuracy() {
        let (cache, _) = manager();
        cache.set(CacheType::Books, "1", json!(1), None, None).await;
        for _ in 0..3 {
            assert!(cache.get(CacheType::Books, "1", None).await.is_some());
        }
        assert!(cache.get(CacheType::Books, "2", None).await.is_none());
        assert!(cache.get(CacheType::Stats, "1", None).await.is_none());

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 3);
        assert_eq!(metrics.misses, 2);
        assert_eq!(metrics.hit_rate_display(), "60.0%");
        assert_eq!(metrics.stores, 1);
        assert_eq!(metrics.memory_size, 1);
        assert!(metrics.storage_usage_kb > 0.0);
    }

    #[tokio::test]
    async fn test_invalidate_without_matches_is_a_counted_noop() {
        let (cache, _) = manager();
        cache.set(CacheType::Books, "1", json!(1), Some("u"), None).await;

        let removed = cache.invalidate("notes", Some("u")).await;
        assert_eq!(removed, 0);
        assert_eq!(cache.metrics().invalidations, 1);
        assert!(cache.get(CacheType::Books, "1", Some("u")).await.is_some());
    }

    #[tokio::test]
    async fn test_empty_pattern_clears_one_users_data() {
        let (cache, _) = manager();
        cache.set(CacheType::Books, "1", json!(1), Some("u1"), None).await;
        cache.set(CacheType::Notes, "1", json!(1), Some("u1"), None).await;
        cache.set(CacheType::Books, "1", json!(2), Some("u2"), None).await;

        cache.clear_user("u1").await;

        assert_eq!(cache.get(CacheType::Books, "1", Some("u1")).await, None);
        assert_eq!(cache.get(CacheType::Notes, "1", Some("u1")).await, None);
        assert_eq!(cache.get(CacheType::Books, "1", Some("u2")).await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_clear_all_resets_metrics() {
        let (cache, _) = manager();
        cache.set(CacheType::Books, "1", json!(1), None, None).await;
        cache.get(CacheType::Books, "1", None).await;

        cache.clear_all().await;

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 0);
        assert_eq!(metrics.stores, 0);
        assert_eq!(metrics.memory_size, 0);
        assert_eq!(cache.get(CacheType::Books, "1", None).await, None);
    }

    #[tokio::test]
    async fn test_stale_lookup_does_not_count() {
        let (cache, clock) = manager();
        cache
            .set(CacheType::Books, "42", json!("old"), None, Some(Duration::milliseconds(100)))
            .await;
        clock.advance(Duration::milliseconds(150));

        let stale = cache.get_stale(CacheType::Books, "42", None).await.unwrap();
        assert_eq!(stale.value, json!("old"));
        assert_eq!(cache.metrics().hits + cache.metrics().misses, 0);
    }

    #[tokio::test]
    async fn test_warm_cache_continues_past_failures() {
        let (cache, _) = manager();
        let transport = MockTransport::new();
        transport.respond("/books", json!([{"id": 1}]));
        transport.fail("/stats", || crate::api::ApiError::Timeout);
        transport.respond("/reading-sessions", json!([]));

        let warmed = cache
            .warm_cache(
                &transport,
                "7",
                &[CacheType::Stats, CacheType::Books, CacheType::Covers, CacheType::Sessions],
            )
            .await;

        assert_eq!(warmed, 2);
        assert_eq!(cache.get(CacheType::Books, "{}", Some("7")).await, Some(json!([{"id": 1}])));
        assert_eq!(cache.get(CacheType::Stats, "summary", Some("7")).await, None);
        // Sequential, in priority order
        assert_eq!(
            transport.calls().iter().map(|r| r.url.as_str()).collect::<Vec<_>>(),
            vec!["/stats", "/books", "/reading-sessions"]
        );
    }

    #[tokio::test]
    async fn test_warm_cache_applies_type_ttl_override() {
        let clock = ManualClock::default();
        let config = Config {
            ttl_overrides: [(CacheType::Books, 60)].into_iter().collect(),
            ..Config::default()
        };
        let cache = CacheManager::new(
            &config,
            Arc::new(MemoryKeyValueStorage::new()),
            Arc::new(MemoryStructuredStorage::new()),
            Arc::new(clock.clone()),
        );
        let transport = MockTransport::new();
        transport.respond("/books", json!([{"id": 1}]));
        transport.respond("/stats", json!({"pages": 12}));

        let warmed = cache
            .warm_cache(&transport, "7", &[CacheType::Books, CacheType::Stats])
            .await;
        assert_eq!(warmed, 2);

        clock.advance(Duration::seconds(61));
        assert_eq!(cache.get(CacheType::Books, "{}", Some("7")).await, None);
        // Stats keeps its 30 minute default
        assert_eq!(
            cache.get(CacheType::Stats, "summary", Some("7")).await,
            Some(json!({"pages": 12}))
        );
    }

    #[tokio::test]
    async fn test_open_uses_storage_dir() {
        let dir = tempfile::tempdir().unwrap();
        let persistent = FileKeyValueStorage::new(dir.path().join(KV_DIR), 1024 * 1024).unwrap();
        let structured = SqliteStructuredStorage::open(&dir.path().join(STRUCTURED_DB)).unwrap();
        let cache = CacheManager::new(
            &Config::default(),
            Arc::new(persistent),
            Arc::new(structured),
            Arc::new(SystemClock),
        );

        cache.set(CacheType::Books, "1", json!({"t": "Dune"}), Some("7"), None).await;
        cache.set(CacheType::Covers, "1", json!("png"), None, None).await;

        assert!(dir.path().join(KV_DIR).read_dir().unwrap().next().is_some());
        assert!(dir.path().join(STRUCTURED_DB).exists());
    }
}
