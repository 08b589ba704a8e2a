//! File-backed key-value storage.
//!
//! Each key is stored as its own JSON file inside a directory, which keeps
//! a corrupt entry from taking the rest of the store down with it. Total
//! size is bounded by a quota so the mid tier behaves like browser storage.
//!
//! Keys whose encoded form would make an overlong file name are stored
//! under a SHA-256 name instead, with the key kept next to the value.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{KeyValueStorage, StorageError};

/// Extension used for stored items.
const ITEM_EXTENSION: &str = "json";

/// Longest encoded key used directly as a file name (NAME_MAX is 255 on
/// most filesystems).
const MAX_ENCODED_NAME: usize = 200;

/// Leads hashed file names. `encode_key` always escapes it.
const HASHED_PREFIX: char = '~';

/// On-disk layout of an item stored under a hashed name.
#[derive(Serialize, Deserialize)]
struct HashedItem<'a> {
    key: Cow<'a, str>,
    value: Cow<'a, str>,
}

struct ItemFile {
    path: PathBuf,
    hashed: bool,
}

pub struct FileKeyValueStorage {
    dir: PathBuf,
    quota_bytes: usize,
}

impl FileKeyValueStorage {
    pub fn new(dir: PathBuf, quota_bytes: usize) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create storage directory: {}", dir.display()))?;
        Ok(Self { dir, quota_bytes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn item_file(&self, key: &str) -> ItemFile {
        let encoded = encode_key(key);
        if encoded.len() <= MAX_ENCODED_NAME {
            return ItemFile {
                path: self.dir.join(format!("{}.{}", encoded, ITEM_EXTENSION)),
                hashed: false,
            };
        }
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        ItemFile {
            path: self
                .dir
                .join(format!("{}{}.{}", HASHED_PREFIX, digest, ITEM_EXTENSION)),
            hashed: true,
        }
    }

    fn read_hashed(path: &Path) -> Result<HashedItem<'static>, StorageError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn file_size(path: &Path) -> usize {
        std::fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0)
    }
}

impl KeyValueStorage for FileKeyValueStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let item = self.item_file(key);
        if !item.path.exists() {
            return Ok(None);
        }
        if !item.hashed {
            return Ok(Some(std::fs::read_to_string(&item.path)?));
        }

        let stored = Self::read_hashed(&item.path)?;
        if stored.key != key {
            // Digest collision
            return Ok(None);
        }
        Ok(Some(stored.value.into_owned()))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let item = self.item_file(key);
        let contents = if item.hashed {
            Cow::Owned(serde_json::to_string(&HashedItem {
                key: Cow::Borrowed(key),
                value: Cow::Borrowed(value),
            })?)
        } else {
            Cow::Borrowed(value)
        };

        let existing = Self::file_size(&item.path);
        let in_use = self.usage_bytes().saturating_sub(existing);
        let available = self.quota_bytes.saturating_sub(in_use);

        if contents.len() > available {
            return Err(StorageError::QuotaExceeded {
                key: key.to_string(),
                needed: contents.len(),
                available,
            });
        }

        std::fs::write(&item.path, contents.as_bytes())?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let item = self.item_file(key);
        if item.path.exists() {
            std::fs::remove_file(item.path)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ITEM_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = if stem.starts_with(HASHED_PREFIX) {
                Self::read_hashed(&path).ok().map(|item| item.key.into_owned())
            } else {
                decode_key(stem)
            };
            match key {
                Some(key) => keys.push(key),
                None => debug!(file = %path.display(), "Skipping unreadable item file"),
            }
        }
        Ok(keys)
    }

    fn usage_bytes(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| Self::file_size(&e.path()))
            .sum()
    }
}

/// Encode a key into a portable file name. Alphanumerics, `-` and `_` pass
/// through; every other byte becomes `%XX`.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
