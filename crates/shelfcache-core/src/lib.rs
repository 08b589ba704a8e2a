//! Shelfcache - offline-first caching for a reading tracker's API client.
//!
//! Responses are cached across three tiers (memory, a quota-bounded
//! key-value store and a structured store for bulky payloads) with per-type
//! TTLs. When the network fails, reads degrade to stale cached data and
//! mutations are queued durably, then replayed once connectivity returns.
//!
//! The pieces are constructed explicitly and injected; nothing is global.
//! `CachedApiService::open` builds the default stack from a `Config`.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod queue;
pub mod storage;
pub mod telemetry;

pub use api::{ApiError, ApiResponse, CacheConfig, CachedApiService, Connectivity, HttpRequest};
pub use cache::{CacheManager, CacheMetrics, CacheType};
pub use config::Config;
pub use queue::{DrainReport, RequestQueue};
