//! Persistent key-value store contract and reference implementations
//!
//! This module provides:
//! - The async [`KeyValueStore`] contract consumed by the cache and queue
//! - [`MemoryStore`] for tests and ephemeral sessions
//! - [`FileStore`], a filesystem-backed store with atomic writes
//!
//! Consumers treat every store failure as a soft failure: in-memory state
//! stays authoritative for the current process lifetime and only
//! durability degrades.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;

/// Async get/set/remove/clear/enumerate contract for durable state
///
/// Implementations are external collaborators (filesystem, mobile local
/// storage); this crate only fixes the contract.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
    async fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory store with no durability
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }
}

/// On-disk document wrapper; the original key travels with the value so
/// `keys()` can recover it from hashed file names.
#[derive(Serialize, Deserialize)]
struct FileEntry {
    key: String,
    value: Value,
}

/// Filesystem-backed store: one JSON document per key
///
/// File names are the SHA-256 hex of the key, which keeps arbitrary keys
/// filesystem-safe. Writes go through a temp file and rename so a crash
/// never leaves a half-written document behind.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create store directory {:?}", root))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.root.join(format!("{}.json", hex::encode(hasher.finalize())))
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {:?}", path)),
        };

        let entry: FileEntry = serde_json::from_slice(&data)
            .with_context(|| format!("corrupt store entry {:?}", path))?;
        Ok(Some(entry.value))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let entry = FileEntry {
            key: key.to_string(),
            value,
        };
        let data = serde_json::to_vec(&entry).context("failed to serialize store entry")?;

        let path = self.path_for(key);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &data)
            .await
            .with_context(|| format!("failed to write {:?}", temp_path))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("failed to rename {:?} to {:?}", temp_path, path))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {:?}", path)),
        }
    }

    async fn clear(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list {:?}", self.root))?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                tokio::fs::remove_file(&path)
                    .await
                    .with_context(|| format!("failed to remove {:?}", path))?;
            }
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("failed to list {:?}", self.root))?;

        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<FileEntry>(&data) {
                Ok(entry) => keys.push(entry.key),
                Err(e) => {
                    // Unreadable entries are skipped, not fatal
                    warn!(path = %path.display(), error = %e, "skipping corrupt store entry");
                }
            }
        }
        Ok(keys)
    }
}
