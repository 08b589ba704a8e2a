//! Physical storage layers underneath the cache.
//!
//! Two shapes of storage are consumed:
//! - `KeyValueStorage`: small, synchronous, quota-bounded (the mid tier)
//! - `StructuredStorage`: larger, asynchronous (the bottom tier, used for
//!   bulky values and for request-queue overflow)
//!
//! Both store already-serialized strings. Each layer owns its own copy.

pub mod file;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

pub use file::FileKeyValueStorage;
pub use memory::{MemoryKeyValueStorage, MemoryStructuredStorage};
pub use sqlite::SqliteStructuredStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded writing {key}: needs {needed} bytes, {available} available")]
    QuotaExceeded {
        key: String,
        needed: usize,
        available: usize,
    },

    #[error("Corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(String),
}

impl StorageError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

/// Synchronous string key-value storage with finite capacity.
pub trait KeyValueStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Writes may fail with `StorageError::QuotaExceeded`.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Approximate bytes in use (keys plus values).
    fn usage_bytes(&self) -> usize;
}

/// Asynchronous key-value storage for arbitrarily large values.
#[async_trait]
pub trait StructuredStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn put(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}
