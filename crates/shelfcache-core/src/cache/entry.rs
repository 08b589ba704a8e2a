use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::StorageError;

/// Bumped whenever the persisted entry layout changes. Entries written with
/// another version are discarded on read.
pub const CACHE_FORMAT_VERSION: u32 = 1;

/// Upper bound for TTLs and retention windows. Longer values are clamped.
pub const MAX_TTL: Duration = Duration::days(36_500);

/// A cached value plus its expiry bookkeeping.
///
/// Every layer stores its own serialized copy; entries are never shared by
/// reference between layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u32,
}

impl CacheEntry {
    /// Create an entry stored at `now`. The TTL is clamped to
    /// `1ms..=MAX_TTL` so `expires_at > stored_at` always holds.
    pub fn new(key: impl Into<String>, value: Value, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = ttl.clamp(Duration::milliseconds(1), MAX_TTL);
        Self {
            key: key.into(),
            value,
            stored_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            version: CACHE_FORMAT_VERSION,
        }
    }

    /// Expired at exactly `expires_at`, not one tick later.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether an (possibly expired) entry may still serve as a stale fallback.
    pub fn is_retained_at(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.expires_at
            .checked_add_signed(retention.min(MAX_TTL))
            .map_or(true, |until| now < until)
    }

    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    pub fn age_minutes_at(&self, now: DateTime<Utc>) -> i64 {
        (now - self.stored_at).num_minutes()
    }

    /// Human-readable age, e.g. "5m ago".
    pub fn age_display(&self) -> String {
        self.age_display_at(Utc::now())
    }

    pub fn age_display_at(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes_at(now);
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }

    pub fn to_json(&self) -> Result<String, StorageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a persisted entry. Unparseable, foreign-version, or
    /// inconsistent payloads are reported as `StorageError::Corrupt`.
    pub fn from_json(key: &str, raw: &str) -> Result<Self, StorageError> {
        let entry: CacheEntry = serde_json::from_str(raw).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        if entry.version != CACHE_FORMAT_VERSION {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("unsupported entry version {}", entry.version),
            });
        }
        if entry.expires_at <= entry.stored_at {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: "expires_at is not after stored_at".to_string(),
            });
        }
        Ok(entry)
    }
}
