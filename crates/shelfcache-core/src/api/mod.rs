//! Backend API access with caching and offline support.
//!
//! `CachedApiService` is the entry point for application code. It sits on
//! top of an `HttpTransport` (normally `ReqwestTransport`), the
//! `CacheManager` and the offline `RequestQueue`.

pub mod connectivity;
pub mod endpoints;
pub mod error;
pub mod request;
pub mod service;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connectivity::Connectivity;
pub use error::ApiError;
pub use request::{ApiResponse, CacheConfig, CacheTarget, HttpMethod, HttpRequest};
pub use service::CachedApiService;
pub use transport::{HttpTransport, ReqwestTransport};
