//! Opaque string key/value stores.
//!
//! The persistence backend is external; this module only fixes its shape
//! and ships an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::CryptoError;

/// A string-keyed store. No transactionality across keys is assumed.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CryptoError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), CryptoError>;
    async fn remove(&self, key: &str) -> Result<(), CryptoError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, CryptoError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CryptoError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), CryptoError> {
        (**self).remove(key).await
    }
}

// ── In-memory store ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the raw stored values, as a backend would see them.
    pub fn snapshot(&self) -> Result<HashMap<String, String>, CryptoError> {
        Ok(self.lock()?.clone())
    }

    pub fn clear(&self) -> Result<(), CryptoError> {
        self.lock()?.clear();
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, CryptoError> {
        self.entries
            .lock()
            .map_err(|_| CryptoError::StoreUnavailable("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CryptoError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CryptoError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CryptoError> {
        self.lock()?.remove(key);
        Ok(())
    }
}
