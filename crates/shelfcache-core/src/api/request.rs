//! Request and response types shared by the façade, the transport and the
//! offline queue. Everything here serializes, since queued requests are
//! persisted as JSON.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{canonical_json, CacheKey, CacheType, MAX_TTL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Mutating requests are queued while offline instead of failing.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, HttpMethod::Get)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// An outbound call to the backend. `url` is relative to the transport's
/// base URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            params: None,
            data: None,
            timeout_ms: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, data: Value) -> Self {
        Self::new(HttpMethod::Post, url).with_data(data)
    }

    pub fn put(url: impl Into<String>, data: Value) -> Self {
        Self::new(HttpMethod::Put, url).with_data(data)
    }

    pub fn patch(url: impl Into<String>, data: Value) -> Self {
        Self::new(HttpMethod::Patch, url).with_data(data)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, url)
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Where a response is cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTarget {
    pub cache_type: CacheType,
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl CacheTarget {
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.cache_type, &self.identifier, self.user_id.as_deref())
    }
}

/// Per-request caching behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Serve fresh hits from the cache and store GET responses.
    pub use_cache: bool,
    /// Slot used for reads, writes and stale fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<CacheTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Invalidated after a successful mutating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidate_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidate_user: Option<String>,
}

impl CacheConfig {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn cached(cache_type: CacheType, identifier: impl Into<String>, user_id: Option<&str>) -> Self {
        Self {
            use_cache: true,
            target: Some(CacheTarget {
                cache_type,
                identifier: identifier.into(),
                user_id: user_id.map(String::from),
            }),
            ..Self::default()
        }
    }

    /// Cache slot for a list query keyed by its filter object.
    pub fn query(cache_type: CacheType, filters: &Value, user_id: Option<&str>) -> Self {
        Self::cached(cache_type, canonical_json(filters), user_id)
    }

    pub fn invalidating(pattern: impl Into<String>, user_id: Option<&str>) -> Self {
        Self {
            invalidate_pattern: Some(pattern.into()),
            invalidate_user: user_id.map(String::from),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = Some(ttl.num_milliseconds().max(0) as u64);
        self
    }

    /// Skip fresh hits and don't store the response; stale fallback still applies.
    pub fn bypass_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(|ms| {
            let ms = i64::try_from(ms).unwrap_or(i64::MAX);
            Duration::milliseconds(ms.min(MAX_TTL.num_milliseconds()))
        })
    }
}

/// Outcome of `CachedApiService::request`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ApiResponse {
    /// Fresh response from the backend.
    Network { data: Value },
    /// Served from the cache. `stale` responses carry the error (if any)
    /// that prevented a fresh fetch.
    Cache {
        data: Value,
        stale: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Mutation accepted into the offline queue.
    Queued { queue_id: String, message: String },
}

impl ApiResponse {
    pub fn data(&self) -> Option<&Value> {
        match self {
            ApiResponse::Network { data } | ApiResponse::Cache { data, .. } => Some(data),
            ApiResponse::Queued { .. } => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            ApiResponse::Network { data } | ApiResponse::Cache { data, .. } => Some(data),
            ApiResponse::Queued { .. } => None,
        }
    }

    pub fn is_from_cache(&self) -> bool {
        matches!(self, ApiResponse::Cache { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, ApiResponse::Cache { stale: true, .. })
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, ApiResponse::Queued { .. })
    }

    pub fn queue_id(&self) -> Option<&str> {
        match self {
            ApiResponse::Queued { queue_id, .. } => Some(queue_id),
            _ => None,
        }
    }
}
