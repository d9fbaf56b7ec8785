//! Per-device signing identity.
//!
//! An identity is created once per install on the first [`IdentityManager::ensure`]
//! and then never rotated. The persisted record holds the JWK pair; the live
//! signing key is re-imported on first use after a reload.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use p256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skypod_crypto::{CryptoError, Jwk, JwkPair, KeyValueStore};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use crate::branded_id::IdentId;
use crate::device::DeviceMeta;
use crate::error::StateError;
use crate::keys;
use crate::record::{RecordCodec, RecordStore};
use crate::realm::PeerIdent;

/// Store name and record key for the identity.
pub const IDENTITY_STORE: &str = "skypod-ident";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: IdentId,
    #[serde(flatten)]
    pub device: DeviceMeta,
    pub jwks: JwkPair,
    /// Public key fingerprint.
    pub thumb: String,
}

pub struct Identity {
    record: IdentityRecord,
    keypair: OnceCell<SigningKey>,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.record.id)
            .field("thumb", &self.record.thumb)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn generate(device: DeviceMeta) -> Result<Self, StateError> {
        let secret = keys::generate_secret();
        let record = IdentityRecord {
            id: IdentId::generate(),
            device,
            jwks: keys::export_keypair(&secret)?,
            thumb: keys::fingerprint(&secret.public_key())?,
        };
        Ok(Self {
            record,
            keypair: OnceCell::new_with(Some(SigningKey::from(secret))),
        })
    }

    /// Rebuild from a persisted record after checking its key material.
    /// The signing key handle itself is built lazily.
    pub fn from_record(record: IdentityRecord) -> Result<Self, StateError> {
        record.jwks.validate()?;
        let public = keys::import_public(&record.jwks.public_key)?;
        if keys::fingerprint(&public)? != record.thumb {
            return Err(CryptoError::ImportValidationFailed(
                "identity fingerprint does not match its public key".into(),
            )
            .into());
        }
        // the private half must belong to this public key, not just to its own x/y
        if keys::import_secret(&record.jwks.private_key)?.public_key() != public {
            return Err(CryptoError::ImportValidationFailed(
                "identity private key does not match its public key".into(),
            )
            .into());
        }
        Ok(Self {
            record,
            keypair: OnceCell::new(),
        })
    }

    pub fn id(&self) -> &IdentId {
        &self.record.id
    }

    pub fn fingerprint(&self) -> &str {
        &self.record.thumb
    }

    pub fn device(&self) -> &DeviceMeta {
        &self.record.device
    }

    pub fn record(&self) -> &IdentityRecord {
        &self.record
    }

    pub fn export_public_jwk(&self) -> &Jwk {
        &self.record.jwks.public_key
    }

    pub async fn keypair(&self) -> Result<&SigningKey, StateError> {
        let key = self
            .keypair
            .get_or_try_init(|| async {
                debug!(id = %self.record.id, "importing identity keypair");
                keys::import_secret(&self.record.jwks.private_key).map(SigningKey::from)
            })
            .await?;
        Ok(key)
    }

    /// Public material as seen by realm peers.
    pub fn peer_ident(&self) -> PeerIdent {
        PeerIdent {
            id: self.record.id.clone(),
            device: self.record.device.clone(),
            public_jwk: self.record.jwks.public_key.clone(),
            public_thumb: self.record.thumb.clone(),
        }
    }

    /// Base64 P1363 signature over `payload`.
    pub async fn sign(&self, payload: &[u8]) -> Result<String, StateError> {
        Ok(keys::sign(self.keypair().await?, payload))
    }
}

/// Verify a signature made by [`Identity::sign`].
pub fn verify(public_jwk: &Jwk, payload: &[u8], signature: &str) -> Result<bool, StateError> {
    Ok(keys::verify(public_jwk, payload, signature)?)
}

pub struct IdentityCodec;

#[async_trait]
impl RecordCodec for IdentityCodec {
    type Live = Identity;
    const VERSION: u32 = 1;

    fn serialize(&self, live: &Identity) -> Result<Value, StateError> {
        Ok(serde_json::to_value(&live.record)?)
    }

    async fn deserialize(&self, state: Value) -> Result<Identity, StateError> {
        Identity::from_record(serde_json::from_value(state)?)
    }

    fn defaults(&self) -> Value {
        json!({ "installed": false })
    }
}

/// Owns the device identity and its persistence.
pub struct IdentityManager {
    records: RecordStore<IdentityCodec>,
    device: DeviceMeta,
    current: Mutex<Option<Arc<Identity>>>,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn KeyValueStore>, device: DeviceMeta) -> Self {
        Self {
            records: RecordStore::new(store, IDENTITY_STORE, IdentityCodec),
            device,
            current: Mutex::new(None),
        }
    }

    /// Return the device identity, creating it on first call. Corrupt
    /// records are replaced; store failures propagate.
    pub async fn ensure(&self) -> Result<Arc<Identity>, StateError> {
        let mut current = self.current.lock().await;
        if let Some(identity) = current.as_ref() {
            return Ok(identity.clone());
        }

        match self.records.load().await {
            Ok(Some(identity)) => {
                debug!(id = %identity.id(), "restored identity");
                let identity = Arc::new(identity);
                *current = Some(identity.clone());
                return Ok(identity);
            }
            Ok(None) => {}
            Err(e) if e.is_recoverable_corruption() => {
                warn!(error = %e, "discarding unreadable identity record");
            }
            Err(e) => return Err(e),
        }

        let identity = Identity::generate(self.device.clone())?;
        self.records.save(&identity).await?;
        info!(id = %identity.id(), thumb = %identity.fingerprint(), "created identity");

        let identity = Arc::new(identity);
        *current = Some(identity.clone());
        Ok(identity)
    }

    /// The identity in memory or in storage, never creating one. Unlike
    /// [`ensure`](Self::ensure), corrupt records are reported, not replaced.
    pub async fn load(&self) -> Result<Option<Arc<Identity>>, StateError> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.records.load().await?.map(Arc::new);
        }
        Ok(current.clone())
    }

    /// Forget the identity in memory and in storage.
    pub async fn reset(&self) -> Result<(), StateError> {
        let mut current = self.current.lock().await;
        self.records.clear().await?;
        *current = None;
        info!("identity removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use skypod_crypto::{InstallBoundStorage, InstallFingerprint, KdfParams, MemoryStore, StorageOptions};

    fn device() -> DeviceMeta {
        DeviceMeta::detect().with_device("test-device")
    }

    fn encrypted(base: Arc<MemoryStore>) -> Arc<dyn KeyValueStore> {
        Arc::new(InstallBoundStorage::new(
            base,
            IDENTITY_STORE,
            StorageOptions {
                encrypt: true,
                fingerprint: InstallFingerprint {
                    origin: "skypod://test".into(),
                    language: "en-US".into(),
                    user_agent: "test".into(),
                },
                kdf: KdfParams::new(1_000).unwrap(),
            },
        ))
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let manager = IdentityManager::new(Arc::new(MemoryStore::new()), device());
        let first = manager.ensure().await.unwrap();
        let second = manager.ensure().await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(first.record().jwks, second.record().jwks);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn identity_survives_reload() {
        let base = Arc::new(MemoryStore::new());
        let first = IdentityManager::new(encrypted(base.clone()), device())
            .ensure()
            .await
            .unwrap();

        let reloaded = IdentityManager::new(encrypted(base), device())
            .ensure()
            .await
            .unwrap();
        assert_eq!(reloaded.record(), first.record());

        // keypair is materialised on demand and matches the original
        let signature = reloaded.sign(b"hello").await.unwrap();
        assert!(verify(first.export_public_jwk(), b"hello", &signature).unwrap());
    }

    #[tokio::test]
    async fn restored_identity_imports_lazily() {
        let identity = Identity::generate(device()).unwrap();
        let restored = Identity::from_record(identity.record().clone()).unwrap();
        assert!(restored.keypair.get().is_none());
        restored.keypair().await.unwrap();
        assert!(restored.keypair.get().is_some());
    }

    #[tokio::test]
    async fn persisted_form_has_no_live_handle() {
        let base = Arc::new(MemoryStore::new());
        let identity = IdentityManager::new(base.clone(), device())
            .ensure()
            .await
            .unwrap();

        let raw = base.get(IDENTITY_STORE).await.unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        let state = &value["state"];
        assert_eq!(state["id"], identity.id().as_str());
        assert_eq!(state["thumb"], identity.fingerprint());
        assert_eq!(state["device"], "test-device");
        assert!(state.get("keypair").is_none());
    }

    #[tokio::test]
    async fn corrupt_record_is_regenerated() {
        let base = Arc::new(MemoryStore::new());
        base.set(IDENTITY_STORE, r#"{"version":1,"state":{"id":"bogus"}}"#)
            .await
            .unwrap();

        let identity = IdentityManager::new(base.clone(), device())
            .ensure()
            .await
            .unwrap();
        let raw = base.get(IDENTITY_STORE).await.unwrap().unwrap();
        assert!(raw.contains(identity.id().as_str()));
    }

    #[tokio::test]
    async fn tampered_fingerprint_is_rejected() {
        let identity = Identity::generate(device()).unwrap();
        let mut record = identity.record().clone();
        record.thumb = "00".repeat(32);
        assert!(Identity::from_record(record)
            .unwrap_err()
            .is_recoverable_corruption());
    }

    #[tokio::test]
    async fn reset_forgets_identity() {
        let base = Arc::new(MemoryStore::new());
        let manager = IdentityManager::new(base.clone(), device());
        let first = manager.ensure().await.unwrap();
        manager.reset().await.unwrap();
        assert!(base.get(IDENTITY_STORE).await.unwrap().is_none());

        let second = manager.ensure().await.unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn peer_ident_carries_public_material() {
        let identity = Identity::generate(device()).unwrap();
        let peer = identity.peer_ident();
        assert_eq!(&peer.id, identity.id());
        assert_eq!(peer.public_thumb, identity.fingerprint());
        assert_eq!(&peer.public_jwk, identity.export_public_jwk());
    }

    #[tokio::test]
    async fn private_half_from_another_key_is_rejected() {
        let a = Identity::generate(device()).unwrap();
        let b = Identity::generate(device()).unwrap();
        let mut spliced = a.record().clone();
        spliced.jwks.private_key = b.record().jwks.private_key.clone();

        let err = Identity::from_record(spliced.clone()).unwrap_err();
        assert!(matches!(
            err,
            StateError::Crypto(CryptoError::ImportValidationFailed(_))
        ));

        // ensure() treats it as corruption and issues a fresh identity
        let base = Arc::new(MemoryStore::new());
        let record = json!({ "version": 1, "state": spliced }).to_string();
        base.set(IDENTITY_STORE, &record).await.unwrap();
        let fresh = IdentityManager::new(base, device()).ensure().await.unwrap();
        assert_ne!(fresh.id(), a.id());
        let signature = fresh.sign(b"hello").await.unwrap();
        assert!(verify(fresh.export_public_jwk(), b"hello", &signature).unwrap());
    }

    /// Reads fail; writes are counted and succeed.
    #[derive(Default)]
    struct UnreadableStore {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for UnreadableStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CryptoError> {
            Err(CryptoError::StoreUnavailable("permission denied".into()))
        }

        async fn set(&self, _key: &str, _value: &str) -> Result<(), CryptoError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove(&self, _key: &str) -> Result<(), CryptoError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn store_failure_propagates_without_regenerating() {
        let store = Arc::new(UnreadableStore::default());
        let manager = IdentityManager::new(store.clone(), device());

        let result = manager.ensure().await;
        assert!(matches!(
            result,
            Err(StateError::Crypto(CryptoError::StoreUnavailable(_)))
        ));
        assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn load_never_creates_an_identity() {
        let base = Arc::new(MemoryStore::new());
        let manager = IdentityManager::new(base.clone(), device());
        assert!(manager.load().await.unwrap().is_none());
        assert!(base.get(IDENTITY_STORE).await.unwrap().is_none());

        let created = manager.ensure().await.unwrap();
        let reopened = IdentityManager::new(base, device());
        assert_eq!(reopened.load().await.unwrap().unwrap().id(), created.id());
    }
}
