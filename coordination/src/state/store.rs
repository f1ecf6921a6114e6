//! Key/value persistence for conversation snapshots and status blobs.
//!
//! Values are opaque JSON strings. The store is a best-effort cache: callers
//! log and carry on when it fails.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::schema::encode_key;

/// Error type for key/value operations
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for key/value operations
pub type KvResult<T> = Result<T, KvError>;

/// Durable, non-transactional key/value store.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, scope: &str, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, scope: &str, key: &str, value: &str) -> KvResult<()>;
}

/// Shared reference to a KvStore
pub type SharedKvStore = Arc<dyn KvStore>;

/// Volatile store, used in tests and simulations.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values across all scopes.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, scope: &str, key: &str) -> KvResult<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> KvResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert((scope.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

/// One JSON file per key, laid out as `<root>/<scope>/<key>.json`.
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, scope: &str, key: &str) -> PathBuf {
        self.root
            .join(encode_key(scope))
            .join(format!("{}.json", encode_key(key)))
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, scope: &str, key: &str) -> KvResult<Option<String>> {
        let path = self.path_for(scope, key);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KvError::Io(e)),
        }
    }

    async fn set(&self, scope: &str, key: &str, value: &str) -> KvResult<()> {
        let path = self.path_for(scope, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never see a torn file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(scope, key, bytes = value.len(), "Persisted value");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::schema::{SCOPE_CONVERSATIONS, SCOPE_STATUS};

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_scopes() {
        let store = MemoryKvStore::new();
        assert!(store.is_empty().await);
        store.set(SCOPE_STATUS, "arbiter", "{}").await.unwrap();
        assert_eq!(
            store.get(SCOPE_STATUS, "arbiter").await.unwrap().as_deref(),
            Some("{}")
        );
        assert!(store
            .get(SCOPE_CONVERSATIONS, "arbiter")
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileKvStore::new(dir.path());
            store
                .set(SCOPE_CONVERSATIONS, "general", r#"[{"text":"hi"}]"#)
                .await
                .unwrap();
        }
        let reopened = FileKvStore::new(dir.path());
        let value = reopened.get(SCOPE_CONVERSATIONS, "general").await.unwrap();
        assert_eq!(value.as_deref(), Some(r#"[{"text":"hi"}]"#));
        assert!(dir
            .path()
            .join("conversations")
            .join("general.json")
            .exists());
    }

    #[tokio::test]
    async fn test_file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path());
        assert!(store.get(SCOPE_STATUS, "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKvStore::new(dir.path().join("kv"));
        store.set(SCOPE_STATUS, "../../evil", "x").await.unwrap();
        assert!(!dir.path().join("evil.json").exists());
        assert_eq!(
            store
                .get(SCOPE_STATUS, "../../evil")
                .await
                .unwrap()
                .as_deref(),
            Some("x")
        );
    }
}
