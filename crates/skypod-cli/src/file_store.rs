use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skypod_crypto::{CryptoError, KeyValueStore};
use tokio::sync::Mutex;
use tracing::debug;

/// All entries as one JSON object in a single file.
pub struct FileStore {
    path: PathBuf,
    // serialises read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, CryptoError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write atomically: `.json.tmp` first, then rename over the original.
    async fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), CryptoError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(path = %self.path.display(), entries = entries.len(), "store written");
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CryptoError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CryptoError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), value.to_string());
        self.write_all(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<(), CryptoError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use skypod_crypto::{InstallBoundStorage, InstallFingerprint, KdfParams, StorageOptions};

    #[tokio::test]
    async fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("store.json"));
        assert_eq!(store.get("a").await.unwrap(), None);
        store.remove("a").await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn values_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = FileStore::new(&path);
        store.set("a", "1").await.unwrap();
        store.set("b", "2").await.unwrap();
        store.remove("a").await.unwrap();

        let reopened = FileStore::new(&path);
        assert_eq!(reopened.get("a").await.unwrap(), None);
        assert_eq!(reopened.get("b").await.unwrap().as_deref(), Some("2"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "not json").unwrap();
        let store = FileStore::new(&path);
        assert!(matches!(
            store.get("a").await,
            Err(CryptoError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn install_bound_storage_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let options = || StorageOptions {
            encrypt: true,
            fingerprint: InstallFingerprint {
                origin: "skypod://test".into(),
                language: "en-US".into(),
                user_agent: "test".into(),
            },
            kdf: KdfParams::new(1_000).unwrap(),
        };

        let storage = InstallBoundStorage::new(Arc::new(FileStore::new(&path)), "records", options());
        storage.set("records", "hello").await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("hello"));
        assert!(raw.contains("records-nonce"));

        let reopened = InstallBoundStorage::new(Arc::new(FileStore::new(&path)), "records", options());
        assert_eq!(reopened.get("records").await.unwrap().as_deref(), Some("hello"));
    }
}
