//! The closed set of cacheable data types and their policies.

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Kind of data held in the cache.
///
/// Each variant carries its own default TTL and storage routing, so an
/// unknown type can't silently fall back to some generic policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Books,
    Covers,
    Sessions,
    Notes,
    Stats,
    Files,
}

impl CacheType {
    pub const ALL: [CacheType; 6] = [
        CacheType::Books,
        CacheType::Covers,
        CacheType::Sessions,
        CacheType::Notes,
        CacheType::Stats,
        CacheType::Files,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Books => "books",
            CacheType::Covers => "covers",
            CacheType::Sessions => "sessions",
            CacheType::Notes => "notes",
            CacheType::Stats => "stats",
            CacheType::Files => "files",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            CacheType::Books => Duration::minutes(10),
            CacheType::Covers => Duration::hours(24),
            CacheType::Sessions => Duration::minutes(5),
            CacheType::Notes => Duration::minutes(15),
            CacheType::Stats => Duration::minutes(30),
            CacheType::Files => Duration::hours(24),
        }
    }

    /// Bulky types skip the key-value tier and live in structured storage.
    pub fn is_bulky(&self) -> bool {
        matches!(self, CacheType::Covers | CacheType::Files)
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CacheType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown cache type: {}", s))
    }
}
