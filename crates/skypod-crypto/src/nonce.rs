//! Per-context random nonces, generated once and then reused.
//!
//! A nonce is 32 random bytes persisted as base64 under `<context>-nonce`.
//! Losing it makes everything derived from it undecryptable, so a stored
//! value is never overwritten.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::rand::{SecureRandom, SystemRandom};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::CryptoError;
use crate::stores::KeyValueStore;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Nonce(..)")
    }
}

impl Nonce {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| CryptoError::Random)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::Encoding("stored nonce is not valid base64".into()))?;
        let bytes: [u8; NONCE_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CryptoError::Encoding(format!(
                "stored nonce must be {NONCE_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }
}

/// Write-once nonce registry backed by an optional store.
///
/// Without a store, or while the store is failing, nonces live in memory
/// for the lifetime of the ledger only.
pub struct NonceLedger {
    store: Option<Arc<dyn KeyValueStore>>,
    cache: Mutex<HashMap<String, Nonce>>,
}

impl NonceLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store: Some(store),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            store: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Backing store key holding the nonce for `context`.
    pub fn storage_key(context: &str) -> String {
        format!("{context}-nonce")
    }

    /// Return the nonce for `context`, creating and persisting it on first use.
    ///
    /// The cache lock is held across the store round trip so concurrent
    /// first callers converge on one nonce.
    pub async fn ensure_nonce(&self, context: &str) -> Result<Nonce, CryptoError> {
        let mut cache = self.cache.lock().await;
        if let Some(nonce) = cache.get(context) {
            return Ok(nonce.clone());
        }

        let key = Self::storage_key(context);
        let mut persist = self.store.is_some();

        if let Some(store) = &self.store {
            match store.get(&key).await {
                Ok(Some(stored)) => {
                    let nonce = Nonce::from_base64(&stored)?;
                    debug!(context, "loaded stored nonce");
                    cache.insert(context.to_string(), nonce.clone());
                    return Ok(nonce);
                }
                Ok(None) => {}
                Err(e) => {
                    // a nonce may exist behind the failure; never overwrite it
                    warn!(context, error = %e, "nonce store unavailable, keeping nonce in memory only");
                    persist = false;
                }
            }
        }

        let nonce = Nonce::generate()?;
        if let (true, Some(store)) = (persist, &self.store) {
            if let Err(e) = store.set(&key, &nonce.to_base64()).await {
                warn!(context, error = %e, "failed to persist nonce, keeping it in memory only");
            }
        }

        debug!(context, persisted = persist, "generated new nonce");
        cache.insert(context.to_string(), nonce.clone());
        Ok(nonce)
    }
}
