//! Cache and API configuration.
//!
//! Configuration is stored at `~/.config/shelfcache/config.json`. Every
//! field has a default, so a missing or partial file is fine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::cache::{CacheType, MAX_TTL};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "shelfcache";

const CONFIG_FILE: &str = "config.json";

/// Overrides `api_base_url` when set.
pub const API_URL_ENV: &str = "SHELFCACHE_API_URL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// Entry bound for the in-memory tier.
    pub memory_max_entries: usize,
    /// Serialized entries at or above this size skip the key-value tier.
    pub persistent_item_max_bytes: usize,
    /// Capacity of the file-backed key-value tier.
    pub persistent_quota_bytes: usize,
    pub sweep_interval_secs: u64,
    /// How long an expired entry stays available as a stale fallback.
    pub stale_retention_secs: u64,
    pub max_replay_retries: u32,
    pub prefetch_limit: usize,
    /// Per-type TTL overrides in seconds.
    pub ttl_overrides: BTreeMap<CacheType, u64>,
    /// Optional sub-directory for per-profile storage.
    pub profile: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api".to_string(),
            request_timeout_secs: 30,
            memory_max_entries: 50,
            persistent_item_max_bytes: 100 * 1024,
            persistent_quota_bytes: 5 * 1024 * 1024,
            sweep_interval_secs: 600,
            stale_retention_secs: 24 * 60 * 60,
            max_replay_retries: 3,
            prefetch_limit: 10,
            ttl_overrides: BTreeMap::new(),
            profile: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the persistent cache tiers and the request queue.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;

        let mut path = cache_dir.join(APP_NAME);
        if let Some(ref profile) = self.profile {
            path = path.join(profile);
        }
        Ok(path)
    }

    pub fn ttl_for(&self, cache_type: CacheType) -> Duration {
        self.ttl_overrides
            .get(&cache_type)
            .map(|secs| clamped_seconds(*secs))
            .unwrap_or_else(|| cache_type.default_ttl())
    }

    pub fn stale_retention(&self) -> Duration {
        clamped_seconds(self.stale_retention_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

fn clamped_seconds(secs: u64) -> Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    Duration::seconds(secs.min(MAX_TTL.num_seconds()))
}
