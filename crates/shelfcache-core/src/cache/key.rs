//! Cache key derivation.
//!
//! Keys have the layout `{user_scope}{type}_{identifier}` where the user
//! scope is `user_{id}_` (empty for shared data). Invalidation is a substring
//! match against that layout, so the scope segment is escaped to keep one
//! user's scope from being a prefix of another's.

use std::fmt;

use serde_json::Value;

use super::types::CacheType;

/// Prefix applied to every cache entry written to the persistent layers, so
/// other keys in the same storage (like the request queue) are never swept.
pub const STORAGE_NAMESPACE: &str = "shelfcache:";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    cache_type: CacheType,
    key: String,
}

impl CacheKey {
    pub fn new(cache_type: CacheType, identifier: &str, user_id: Option<&str>) -> Self {
        let key = format!("{}{}_{}", user_scope(user_id), cache_type.as_str(), identifier);
        Self { cache_type, key }
    }

    /// Key for a list query, identified by its (order-independent) filter object.
    pub fn for_query(cache_type: CacheType, query: &Value, user_id: Option<&str>) -> Self {
        Self::new(cache_type, &canonical_json(query), user_id)
    }

    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The key as written to persistent storage.
    pub fn storage_key(&self) -> String {
        format!("{}{}", STORAGE_NAMESPACE, self.key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// `user_{id}_`, or empty when the data isn't user scoped.
pub fn user_scope(user_id: Option<&str>) -> String {
    match user_id {
        Some(id) => format!("user_{}_", escape_scope(id)),
        None => String::new(),
    }
}

/// Substring that every key matched by `invalidate(pattern, user_id)` contains.
pub fn invalidation_needle(pattern: &str, user_id: Option<&str>) -> String {
    format!("{}{}", user_scope(user_id), pattern)
}

/// Strip the storage namespace, returning `None` for keys that aren't ours.
pub fn strip_namespace(storage_key: &str) -> Option<&str> {
    storage_key.strip_prefix(STORAGE_NAMESPACE)
}

fn escape_scope(id: &str) -> String {
    id.replace('%', "%25").replace('_', "%5F")
}

/// Serialize JSON with object keys sorted at every level.
///
/// Two filter objects with the same content always produce the same string,
/// whatever order their properties were inserted in.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
