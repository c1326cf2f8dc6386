use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, SmartWindowError};

/// Key holding the serialized auth session
pub const AUTH_STORAGE_KEY: &str = "auth-storage";

/// Key holding the last successfully connected BLE device id
pub const LAST_DEVICE_KEY: &str = "lastConnectedDeviceId";

/// Key holding the cached push-notification token
pub const PUSH_TOKEN_KEY: &str = "fcmToken";

/// Persistent string key-value storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value; deleting a missing key is not an error
    async fn remove(&self, key: &str) -> Result<()>;
}

/// Read and deserialize a JSON value
///
/// # Errors
///
/// Returns store errors, or [`SmartWindowError::Serialization`] if the stored text is
/// not valid JSON for `T`.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value
///
/// # Errors
///
/// Returns store or serialization errors.
pub async fn save_json<T: Serialize + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw).await
}

/// Volatile in-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk
///
/// Entries are cached in memory and every mutation rewrites the file through a
/// temporary sibling so a crash never leaves a truncated file behind.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Io`] if the file exists but cannot be read. A
    /// corrupt file is logged and treated as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!("Ignoring corrupt store at {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("Opened store {} with {} entries", path.display(), entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Open the store in the platform data directory
    ///
    /// # Errors
    ///
    /// Returns [`SmartWindowError::Storage`] if the platform has no data directory.
    pub async fn open_default() -> Result<Self> {
        let path = Self::default_path().ok_or_else(|| {
            SmartWindowError::Storage("no platform data directory available".to_string())
        })?;
        Self::open(path).await
    }

    /// `<data dir>/smartwindow/storage.json`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("smartwindow").join("storage.json"))
    }

    /// Location of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, entries: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let raw = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.flush(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get(LAST_DEVICE_KEY).await.unwrap(), None);

        store.set(LAST_DEVICE_KEY, "AA:BB:CC").await.unwrap();
        assert_eq!(
            store.get(LAST_DEVICE_KEY).await.unwrap().as_deref(),
            Some("AA:BB:CC")
        );

        store.remove(LAST_DEVICE_KEY).await.unwrap();
        store.remove(LAST_DEVICE_KEY).await.unwrap();
        assert_eq!(store.get(LAST_DEVICE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.set(PUSH_TOKEN_KEY, "push-token").await.unwrap();
            store.set(LAST_DEVICE_KEY, "AA:BB:CC").await.unwrap();
            store.remove(LAST_DEVICE_KEY).await.unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get(PUSH_TOKEN_KEY).await.unwrap().as_deref(),
            Some("push-token")
        );
        assert_eq!(reopened.get(LAST_DEVICE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_ignores_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = FileStore::open(&path).await.unwrap();
        assert_eq!(store.get(AUTH_STORAGE_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        let value = Sample {
            name: "window".to_string(),
            count: 3,
        };

        save_json(&store, "sample", &value).await.unwrap();
        let loaded: Option<Sample> = load_json(&store, "sample").await.unwrap();
        assert_eq!(loaded, Some(value));

        store.set("sample", "garbage").await.unwrap();
        let result: Result<Option<Sample>> = load_json(&store, "sample").await;
        assert!(matches!(result, Err(SmartWindowError::Serialization(_))));
    }
}
