//! Tiered local cache for API data.
//!
//! Entries live in up to three tiers: a bounded in-memory map, a
//! quota-limited key-value store and a structured store for bulky
//! payloads. Reads fall through the tiers and promote what they find.
//!
//! Cached data types:
//! - Books, Sessions, Notes, Stats
//! - Covers and Files (always kept in structured storage)

pub mod entry;
pub mod key;
pub mod manager;
pub mod metrics;
pub mod tiered;
pub mod types;

pub use entry::{CacheEntry, MAX_TTL};
pub use key::{canonical_json, invalidation_needle, CacheKey};
pub use manager::CacheManager;
pub use metrics::CacheMetrics;
pub use tiered::{TieredStore, TieredStoreOptions};
pub use types::CacheType;
