//! Versioned JSON records on top of a [`KeyValueStore`].
//!
//! Every record is stored as `{"version": n, "state": {...}}`. A
//! [`RecordCodec`] turns live values into `state` and back, and merges
//! persisted state over its defaults so records written by older builds
//! still load.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::map::Entry;
use serde_json::{Map, Value};
use skypod_crypto::KeyValueStore;
use tracing::debug;

use crate::error::StateError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub version: u32,
    pub state: Value,
}

#[async_trait]
pub trait RecordCodec: Send + Sync {
    type Live: Send;

    /// Newest record version this codec reads and the one it writes.
    const VERSION: u32;

    /// Persistable state of `live`. Live key handles are left out.
    fn serialize(&self, live: &Self::Live) -> Result<Value, StateError>;

    /// Rebuild a live value from merged state.
    async fn deserialize(&self, state: Value) -> Result<Self::Live, StateError>;

    fn defaults(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Merge persisted state over [`defaults`](Self::defaults).
    fn merge(&self, persisted: Value) -> Value {
        let mut merged = self.defaults();
        deep_merge(&mut merged, persisted);
        merged
    }
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// anything else in `overlay` replaces the value in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.entry(key) {
                    Entry::Occupied(mut existing) => deep_merge(existing.get_mut(), value),
                    Entry::Vacant(slot) => {
                        slot.insert(value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// One record under a fixed key.
pub struct RecordStore<C: RecordCodec> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    codec: C,
}

impl<C: RecordCodec> RecordStore<C> {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, codec: C) -> Self {
        Self {
            store,
            key: key.into(),
            codec,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn load(&self) -> Result<Option<C::Live>, StateError> {
        let Some(json) = self.store.get(&self.key).await? else {
            return Ok(None);
        };
        let record: PersistedRecord = serde_json::from_str(&json)?;
        if record.version > C::VERSION {
            return Err(StateError::UnsupportedVersion {
                found: record.version,
                supported: C::VERSION,
            });
        }

        debug!(key = %self.key, version = record.version, "loading record");
        let merged = self.codec.merge(record.state);
        self.codec.deserialize(merged).await.map(Some)
    }

    pub async fn save(&self, live: &C::Live) -> Result<(), StateError> {
        let record = PersistedRecord {
            version: C::VERSION,
            state: self.codec.serialize(live)?,
        };
        let json = serde_json::to_string(&record)?;
        self.store.set(&self.key, &json).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<(), StateError> {
        self.store.remove(&self.key).await?;
        Ok(())
    }
}
