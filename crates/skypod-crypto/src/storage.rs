//! At-rest encryption keyed to the install environment.
//!
//! [`InstallBoundStorage`] wraps any [`KeyValueStore`]. With encryption on,
//! values are written as `enc:<blob>` using keys derived from the install
//! fingerprint and a nonce kept in the wrapped store. This stops casual
//! cross-profile leakage; it does not stop anyone who controls the same
//! install.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cipher::{Cipher, KeySource};
use crate::error::CryptoError;
use crate::kdf::{derive_keys, DerivedKeys, KdfParams, KeyMaterialInputs};
use crate::nonce::NonceLedger;
use crate::stores::KeyValueStore;

pub const ENCRYPTED_PREFIX: &str = "enc:";

/// The environment tuple the storage secret is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFingerprint {
    pub origin: String,
    pub language: String,
    pub user_agent: String,
}

impl InstallFingerprint {
    /// Fingerprint of the running process for the given origin.
    pub fn detect(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            language: detect_language(),
            user_agent: default_user_agent(),
        }
    }

    pub fn secret(&self) -> String {
        format!("{}|{}|{}", self.origin, self.language, self.user_agent)
    }
}

/// `LANG` without its encoding suffix, e.g. `en_US.UTF-8` -> `en_US`.
pub fn detect_language() -> String {
    std::env::var("LANG")
        .ok()
        .and_then(|lang| lang.split('.').next().map(str::to_string))
        .filter(|lang| !lang.is_empty())
        .unwrap_or_else(|| "en-US".to_string())
}

/// Platform-only user agent. The crate version stays out so upgrades keep
/// the same storage keys.
pub fn default_user_agent() -> String {
    format!(
        "skypod ({}; {})",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Whether storage encryption applies. Development builds default to off.
pub fn encryption_enabled(explicit: Option<bool>) -> bool {
    explicit.unwrap_or(!cfg!(debug_assertions))
}

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub encrypt: bool,
    pub fingerprint: InstallFingerprint,
    pub kdf: KdfParams,
}

impl StorageOptions {
    pub fn new(fingerprint: InstallFingerprint) -> Self {
        Self {
            encrypt: encryption_enabled(None),
            fingerprint,
            kdf: KdfParams::default(),
        }
    }
}

struct InstallKeySource {
    ledger: NonceLedger,
    name: String,
    fingerprint: InstallFingerprint,
    kdf: KdfParams,
}

#[async_trait]
impl KeySource for InstallKeySource {
    async fn load(&self) -> Result<DerivedKeys, CryptoError> {
        let nonce = self.ledger.ensure_nonce(&self.name).await?;
        let inputs = KeyMaterialInputs::new(
            self.fingerprint.secret(),
            self.name.clone(),
            nonce.to_base64(),
            self.kdf,
        );
        derive_keys(inputs, false).await
    }
}

pub struct InstallBoundStorage {
    base: Arc<dyn KeyValueStore>,
    cipher: Option<Cipher>,
    name: String,
}

impl InstallBoundStorage {
    /// Wrap `base` under the logical store `name`. Keys are derived on the
    /// first read or write, not here.
    pub fn new(base: Arc<dyn KeyValueStore>, name: impl Into<String>, options: StorageOptions) -> Self {
        let name = name.into();
        let cipher = options.encrypt.then(|| {
            Cipher::new(InstallKeySource {
                ledger: NonceLedger::new(base.clone()),
                name: name.clone(),
                fingerprint: options.fingerprint,
                kdf: options.kdf,
            })
        });
        debug!(store = %name, encrypted = cipher.is_some(), "opened install-bound storage");
        Self { base, cipher, name }
    }

    pub fn passthrough(base: Arc<dyn KeyValueStore>, name: impl Into<String>) -> Self {
        Self {
            base,
            cipher: None,
            name: name.into(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl KeyValueStore for InstallBoundStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, CryptoError> {
        let Some(raw) = self.base.get(key).await? else {
            return Ok(None);
        };
        let Some(cipher) = &self.cipher else {
            return Ok(Some(raw));
        };
        let Some(blob) = raw.strip_prefix(ENCRYPTED_PREFIX) else {
            debug!(store = %self.name, key, "ignoring unencrypted value");
            return Ok(None);
        };

        match cipher.decrypt(blob).await {
            Ok(value) => Ok(Some(value)),
            Err(e @ CryptoError::AuthenticationFailed(_)) => {
                warn!(store = %self.name, key, error = %e, "stored value failed authentication");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CryptoError> {
        match &self.cipher {
            Some(cipher) => {
                let blob = cipher.encrypt(value).await?;
                self.base
                    .set(key, &format!("{ENCRYPTED_PREFIX}{blob}"))
                    .await
            }
            None => self.base.set(key, value).await,
        }
    }

    async fn remove(&self, key: &str) -> Result<(), CryptoError> {
        self.base.remove(key).await
    }
}
