//! Three-tier storage with a single logical TTL contract.
//!
//! Lookups go memory → key-value → structured. A hit below the top tier is
//! promoted into memory with the type's default TTL (never the remaining TTL
//! of the source copy). Writes always land in memory and are persisted
//! best-effort: small payloads go to the key-value tier, large ones and bulky
//! types go to structured storage. Persistence failures are logged and
//! swallowed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::storage::{KeyValueStorage, StructuredStorage};

use super::entry::CacheEntry;
use super::key::{strip_namespace, CacheKey};
use super::types::CacheType;

#[derive(Debug, Clone)]
pub struct TieredStoreOptions {
    pub memory_max_entries: usize,
    pub persistent_item_max_bytes: usize,
    pub stale_retention: Duration,
    pub ttl_overrides: BTreeMap<CacheType, Duration>,
}

impl TieredStoreOptions {
    pub fn default_ttl(&self, cache_type: CacheType) -> Duration {
        self.ttl_overrides
            .get(&cache_type)
            .copied()
            .unwrap_or_else(|| cache_type.default_ttl())
    }
}

impl Default for TieredStoreOptions {
    fn default() -> Self {
        Self {
            memory_max_entries: 50,
            persistent_item_max_bytes: 100 * 1024,
            stale_retention: Duration::hours(24),
            ttl_overrides: BTreeMap::new(),
        }
    }
}

/// Bounded map that evicts in insertion order.
#[derive(Debug)]
struct MemoryLayer {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order (oldest first)
    order: VecDeque<String>,
    max_entries: usize,
}

impl MemoryLayer {
    fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Insert or replace. Replacing keeps the original insertion slot.
    /// Returns the evicted key, if any.
    fn insert(&mut self, entry: CacheEntry) -> Option<String> {
        if let Some(existing) = self.entries.get_mut(&entry.key) {
            *existing = entry;
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.max_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }
        self.order.push_back(entry.key.clone());
        self.entries.insert(entry.key.clone(), entry);
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    fn retain<F: FnMut(&CacheEntry) -> bool>(&mut self, mut keep: F) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| keep(entry));
        let entries = &self.entries;
        self.order.retain(|k| entries.contains_key(k));
        before - self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct TieredStore {
    memory: Mutex<MemoryLayer>,
    persistent: Arc<dyn KeyValueStorage>,
    structured: Arc<dyn StructuredStorage>,
    /// Storage keys of non-bulky entries that were too large for the
    /// key-value tier and went to structured storage instead.
    overflow: Mutex<HashSet<String>>,
    clock: Arc<dyn Clock>,
    options: TieredStoreOptions,
}

impl TieredStore {
    pub fn new(
        persistent: Arc<dyn KeyValueStorage>,
        structured: Arc<dyn StructuredStorage>,
        clock: Arc<dyn Clock>,
        options: TieredStoreOptions,
    ) -> Self {
        Self {
            memory: Mutex::new(MemoryLayer::new(options.memory_max_entries)),
            persistent,
            structured,
            overflow: Mutex::new(HashSet::new()),
            clock,
            options,
        }
    }

    pub fn options(&self) -> &TieredStoreOptions {
        &self.options
    }

    pub fn persistent(&self) -> &Arc<dyn KeyValueStorage> {
        &self.persistent
    }

    pub fn structured(&self) -> &Arc<dyn StructuredStorage> {
        &self.structured
    }

    fn memory(&self) -> MutexGuard<'_, MemoryLayer> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn overflow(&self) -> MutexGuard<'_, HashSet<String>> {
        self.overflow.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn consults_structured(&self, key: &CacheKey, storage_key: &str) -> bool {
        key.cache_type().is_bulky() || self.overflow().contains(storage_key)
    }

    // ===== Reads =====

    /// Fresh value for `key`, or `None` if no tier holds an unexpired copy.
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        let now = self.clock.now();

        {
            let mut memory = self.memory();
            if let Some(entry) = memory.get(key.as_str()) {
                if !entry.is_expired_at(now) {
                    return Some(entry.value.clone());
                }
                memory.remove(key.as_str());
            }
        }

        let storage_key = key.storage_key();
        if let Some(entry) = self.read_persistent(&storage_key, now, false) {
            self.promote(key, entry.value.clone(), now);
            return Some(entry.value);
        }

        if self.consults_structured(key, &storage_key) {
            if let Some(entry) = self.read_structured(&storage_key, now, false).await {
                self.promote(key, entry.value.clone(), now);
                return Some(entry.value);
            }
        }

        None
    }

    /// Any retained copy of `key`, expired or not. Never promotes.
    pub async fn get_stale(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = self.clock.now();

        if let Some(entry) = self.memory().get(key.as_str()) {
            return Some(entry.clone());
        }

        let storage_key = key.storage_key();
        if let Some(entry) = self.read_persistent(&storage_key, now, true) {
            return Some(entry);
        }

        if self.consults_structured(key, &storage_key) {
            return self.read_structured(&storage_key, now, true).await;
        }
        None
    }

    fn promote(&self, key: &CacheKey, value: Value, now: DateTime<Utc>) {
        let ttl = self.options.default_ttl(key.cache_type());
        let entry = CacheEntry::new(key.as_str(), value, now, ttl);
        if let Some(evicted) = self.memory().insert(entry) {
            debug!(key = %evicted, "Evicted oldest memory entry during promotion");
        }
        debug!(key = %key, "Promoted entry into memory");
    }

    /// Read a persisted entry, deleting it when corrupt or past retention.
    fn read_persistent(
        &self,
        storage_key: &str,
        now: DateTime<Utc>,
        allow_stale: bool,
    ) -> Option<CacheEntry> {
        let raw = match self.persistent.get_item(storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = storage_key, error = %e, "Failed to read persistent cache entry");
                return None;
            }
        };

        let entry = match CacheEntry::from_json(storage_key, &raw) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(key = storage_key, error = %e, "Discarding unreadable cache entry");
                let _ = self.persistent.remove_item(storage_key);
                return None;
            }
        };

        self.check_freshness(entry, now, allow_stale, || {
            let _ = self.persistent.remove_item(storage_key);
        })
    }

    async fn read_structured(
        &self,
        storage_key: &str,
        now: DateTime<Utc>,
        allow_stale: bool,
    ) -> Option<CacheEntry> {
        let raw = match self.structured.get(storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.overflow().remove(storage_key);
                return None;
            }
            Err(e) => {
                warn!(key = storage_key, error = %e, "Failed to read structured cache entry");
                return None;
            }
        };

        let entry = match CacheEntry::from_json(storage_key, &raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(key = storage_key, error = %e, "Discarding unreadable cache entry");
                None
            }
        };

        let mut delete = entry.is_none();
        let result = entry.and_then(|entry| {
            self.check_freshness(entry, now, allow_stale, || delete = true)
        });

        if delete {
            self.delete_structured(storage_key).await;
        }
        result
    }

    fn check_freshness<F: FnOnce()>(
        &self,
        entry: CacheEntry,
        now: DateTime<Utc>,
        allow_stale: bool,
        on_discard: F,
    ) -> Option<CacheEntry> {
        if !entry.is_retained_at(now, self.options.stale_retention) {
            on_discard();
            return None;
        }
        if entry.is_expired_at(now) && !allow_stale {
            return None;
        }
        Some(entry)
    }

    async fn delete_structured(&self, storage_key: &str) {
        self.overflow().remove(storage_key);
        if let Err(e) = self.structured.delete(storage_key).await {
            warn!(key = storage_key, error = %e, "Failed to delete structured cache entry");
        }
    }

    // ===== Writes =====

    /// Store `value` under `key` for `ttl`. Never fails; persistence is best-effort.
    pub async fn set(&self, key: &CacheKey, value: Value, ttl: Duration) {
        let now = self.clock.now();
        let entry = CacheEntry::new(key.as_str(), value, now, ttl);

        if let Some(evicted) = self.memory().insert(entry.clone()) {
            debug!(key = %evicted, "Evicted oldest memory entry");
        }

        let raw = match entry.to_json() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to serialize cache entry");
                return;
            }
        };

        let storage_key = key.storage_key();
        let bulky = key.cache_type().is_bulky();

        if !bulky && raw.len() < self.options.persistent_item_max_bytes {
            let mut result = self.persistent.set_item(&storage_key, &raw);
            if result.as_ref().is_err_and(|e| e.is_quota_exceeded()) {
                // Under quota pressure expired entries go regardless of retention
                let removed = self.sweep_persistent(now, Duration::zero());
                warn!(key = %key, removed, "Persistent cache full, swept expired entries");
                if removed > 0 {
                    result = self.persistent.set_item(&storage_key, &raw);
                }
            }
            if let Err(e) = result {
                warn!(key = %key, error = %e, "Failed to persist cache entry");
                // The previous copy is superseded by the one in memory
                let _ = self.persistent.remove_item(&storage_key);
            }

            let was_overflow = self.overflow().remove(&storage_key);
            if was_overflow {
                // An older, larger copy may still sit in structured storage
                let _ = self.structured.delete(&storage_key).await;
            }
            return;
        }

        // Don't leave an older small copy behind in the key-value tier
        let _ = self.persistent.remove_item(&storage_key);
        match self.structured.put(&storage_key, raw).await {
            Ok(()) => {
                if !bulky {
                    self.overflow().insert(storage_key);
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to persist cache entry to structured storage");
            }
        }
    }

    // ===== Invalidation and expiry =====

    /// Remove every entry whose key contains `needle`, across all tiers.
    /// Returns the number of stored copies removed.
    pub async fn remove_matching(&self, needle: &str) -> usize {
        let mut removed = self.memory().retain(|entry| !entry.key.contains(needle));

        for storage_key in self.persistent_keys() {
            if strip_namespace(&storage_key).is_some_and(|k| k.contains(needle)) {
                match self.persistent.remove_item(&storage_key) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(key = %storage_key, error = %e, "Failed to remove cache entry"),
                }
            }
        }

        for storage_key in self.structured_keys().await {
            if strip_namespace(&storage_key).is_some_and(|k| k.contains(needle)) {
                self.delete_structured(&storage_key).await;
                removed += 1;
            }
        }

        removed
    }

    /// Drop every cache entry in every tier.
    pub async fn clear(&self) {
        self.memory().clear();

        for storage_key in self.persistent_keys() {
            if strip_namespace(&storage_key).is_some() {
                let _ = self.persistent.remove_item(&storage_key);
            }
        }
        for storage_key in self.structured_keys().await {
            if strip_namespace(&storage_key).is_some() {
                self.delete_structured(&storage_key).await;
            }
        }
        self.overflow().clear();
    }

    /// Remove expired memory entries and persisted entries past retention.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = self.memory().retain(|entry| !entry.is_expired_at(now));
        removed += self.sweep_persistent(now, self.options.stale_retention);

        for storage_key in self.structured_keys().await {
            if strip_namespace(&storage_key).is_none() {
                continue;
            }
            let keep = match self.structured.get(&storage_key).await {
                Ok(Some(raw)) => CacheEntry::from_json(&storage_key, &raw)
                    .map(|e| e.is_retained_at(now, self.options.stale_retention))
                    .unwrap_or(false),
                Ok(None) => true,
                Err(e) => {
                    warn!(key = %storage_key, error = %e, "Failed to read entry during sweep");
                    true
                }
            };
            if !keep {
                self.delete_structured(&storage_key).await;
                removed += 1;
            }
        }

        removed
    }

    /// Remove persisted entries that are unreadable or past `retention`.
    fn sweep_persistent(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let mut removed = 0;
        for storage_key in self.persistent_keys() {
            if strip_namespace(&storage_key).is_none() {
                continue;
            }
            let keep = match self.persistent.get_item(&storage_key) {
                Ok(Some(raw)) => CacheEntry::from_json(&storage_key, &raw)
                    .map(|e| e.is_retained_at(now, retention))
                    .unwrap_or(false),
                Ok(None) => true,
                Err(_) => true,
            };
            if !keep && self.persistent.remove_item(&storage_key).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Repopulate the overflow index from structured storage (startup).
    pub async fn rebuild_overflow_index(&self) -> usize {
        let keys: Vec<String> = self
            .structured_keys()
            .await
            .into_iter()
            .filter(|k| strip_namespace(k).is_some())
            .collect();
        let count = keys.len();
        let mut overflow = self.overflow();
        overflow.clear();
        overflow.extend(keys);
        count
    }

    fn persistent_keys(&self) -> Vec<String> {
        self.persistent.keys().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list persistent cache keys");
            Vec::new()
        })
    }

    async fn structured_keys(&self) -> Vec<String> {
        self.structured.keys().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list structured cache keys");
            Vec::new()
        })
    }

    // ===== Introspection =====

    pub fn memory_len(&self) -> usize {
        self.memory().len()
    }

    pub fn storage_usage_bytes(&self) -> usize {
        self.persistent.usage_bytes()
    }

    /// Copy of the memory-tier entry for `key`, if present.
    pub fn memory_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.memory().get(key.as_str()).cloned()
    }
}
