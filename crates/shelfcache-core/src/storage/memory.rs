//! In-process storage backends.
//!
//! `MemoryKeyValueStorage` enforces a byte quota the same way a browser's
//! local storage does, which makes it a faithful stand-in for tests and for
//! ephemeral sessions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{KeyValueStorage, StorageError, StructuredStorage};

/// Default quota, matching the usual per-origin local storage limit.
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug)]
pub struct MemoryKeyValueStorage {
    items: Mutex<HashMap<String, String>>,
    quota_bytes: usize,
}

impl MemoryKeyValueStorage {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            quota_bytes,
        }
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn usage_of(items: &HashMap<String, String>) -> usize {
        items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl Default for MemoryKeyValueStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStorage for MemoryKeyValueStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items();
        let existing = items.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
        let in_use = Self::usage_of(&items) - existing;
        let needed = key.len() + value.len();
        let available = self.quota_bytes.saturating_sub(in_use);

        if needed > available {
            return Err(StorageError::QuotaExceeded {
                key: key.to_string(),
                needed,
                available,
            });
        }

        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items().keys().cloned().collect())
    }

    fn usage_bytes(&self) -> usize {
        Self::usage_of(&self.items())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStructuredStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStructuredStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl StructuredStorage for MemoryStructuredStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.items().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.items().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.items().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get_item() {
        let storage = MemoryKeyValueStorage::new();
        storage.set_item("a", "1").unwrap();
        assert_eq!(storage.get_item("a").unwrap().as_deref(), Some("1"));
        assert_eq!(storage.usage_bytes(), 2);
    }

    #[test]
    fn test_quota_exceeded() {
        let storage = MemoryKeyValueStorage::with_quota(10);
        storage.set_item("k", "12345").unwrap();

        let err = storage.set_item("other", "123456").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(storage.get_item("other").unwrap(), None);
    }

    #[test]
    fn test_overwrite_reuses_existing_space() {
        let storage = MemoryKeyValueStorage::with_quota(10);
        storage.set_item("k", "123456789").unwrap();
        // Replacing the value frees the old bytes first
        storage.set_item("k", "987654321").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("987654321"));
    }

    #[tokio::test]
    async fn test_structured_round_trip_and_delete() {
        let storage = MemoryStructuredStorage::new();
        storage.put("cover", "x".repeat(1024)).await.unwrap();
        assert_eq!(storage.keys().await.unwrap(), vec!["cover".to_string()]);

        storage.delete("cover").await.unwrap();
        assert_eq!(storage.get("cover").await.unwrap(), None);
    }
}
