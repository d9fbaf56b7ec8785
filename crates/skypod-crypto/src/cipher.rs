//! Encrypt-then-MAC string cipher.
//!
//! Blob layout before base64 (standard alphabet):
//!
//! ```text
//! [0..12)      IV
//! [12..N-32)   AES-256-GCM ciphertext + 16-byte tag
//! [N-32..N)    HMAC-SHA256 over everything before it
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::CryptoError;
use crate::jwk::Jwk;
use crate::kdf::{derive_keys, DerivedKeys, KeyMaterialInputs, SymmetricKey};

type HmacSha256 = Hmac<Sha256>;

pub const IV_LEN: usize = NONCE_LEN;
pub const TAG_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
/// Shortest decodable blob: an empty plaintext still carries IV, tag and MAC.
pub const MIN_BLOB_LEN: usize = IV_LEN + TAG_LEN + MAC_LEN;

/// Where a [`Cipher`] gets its keys from on first use.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn load(&self) -> Result<DerivedKeys, CryptoError>;
}

#[async_trait]
impl KeySource for DerivedKeys {
    async fn load(&self) -> Result<DerivedKeys, CryptoError> {
        Ok(self.clone())
    }
}

/// Derives keys with PBKDF2 from fixed inputs.
pub struct DerivingKeySource {
    inputs: KeyMaterialInputs,
    extractable: bool,
}

impl DerivingKeySource {
    pub fn new(inputs: KeyMaterialInputs, extractable: bool) -> Self {
        Self {
            inputs,
            extractable,
        }
    }
}

#[async_trait]
impl KeySource for DerivingKeySource {
    async fn load(&self) -> Result<DerivedKeys, CryptoError> {
        derive_keys(self.inputs.clone(), self.extractable).await
    }
}

/// Imports keys from a persisted JWK pair.
pub struct JwkKeySource {
    encryption: Jwk,
    authentication: Jwk,
}

impl JwkKeySource {
    pub fn new(encryption: Jwk, authentication: Jwk) -> Self {
        Self {
            encryption,
            authentication,
        }
    }
}

#[async_trait]
impl KeySource for JwkKeySource {
    async fn load(&self) -> Result<DerivedKeys, CryptoError> {
        DerivedKeys::from_jwks(&self.encryption, &self.authentication)
    }
}

/// A cipher over one key pair, fetched lazily and at most once.
pub struct Cipher {
    source: Box<dyn KeySource>,
    keys: OnceCell<DerivedKeys>,
}

impl Cipher {
    pub fn new(source: impl KeySource + 'static) -> Self {
        Self {
            source: Box::new(source),
            keys: OnceCell::new(),
        }
    }

    /// A cipher whose keys are already in hand.
    pub fn from_keys(keys: DerivedKeys) -> Self {
        Self {
            source: Box::new(keys.clone()),
            keys: OnceCell::new_with(Some(keys)),
        }
    }

    /// Keys for this cipher, loading them on first call. Concurrent first
    /// callers wait on the same load.
    pub async fn keys(&self) -> Result<&DerivedKeys, CryptoError> {
        self.keys
            .get_or_try_init(|| async {
                debug!("loading cipher keys");
                self.source.load().await
            })
            .await
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let keys = self.keys().await?;
        encrypt_with(keys, plaintext)
    }

    pub async fn decrypt(&self, blob: &str) -> Result<String, CryptoError> {
        let raw = decode_blob(blob)?;
        let keys = self.keys().await?;
        open(keys, raw)
    }
}

/// Encrypt with explicit keys.
pub fn encrypt_with(keys: &DerivedKeys, plaintext: &str) -> Result<String, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| CryptoError::Random)?;

    let mut sealed = plaintext.as_bytes().to_vec();
    aead_key(keys.encryption_key())?
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut sealed)
        .map_err(|_| CryptoError::EncryptionFailed("AES-GCM seal failed"))?;

    let mut blob = Vec::with_capacity(IV_LEN + sealed.len() + MAC_LEN);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&sealed);

    let mut mac = hmac_for(keys.authentication_key())?;
    mac.update(&blob);
    blob.extend_from_slice(&mac.finalize().into_bytes());

    Ok(STANDARD.encode(blob))
}

/// Decrypt with explicit keys.
pub fn decrypt_with(keys: &DerivedKeys, blob: &str) -> Result<String, CryptoError> {
    open(keys, decode_blob(blob)?)
}

fn decode_blob(blob: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = STANDARD
        .decode(blob)
        .map_err(|_| CryptoError::AuthenticationFailed("blob is not valid base64"))?;
    if raw.len() < MIN_BLOB_LEN {
        return Err(CryptoError::AuthenticationFailed("blob shorter than minimum length"));
    }
    Ok(raw)
}

fn open(keys: &DerivedKeys, mut raw: Vec<u8>) -> Result<String, CryptoError> {
    let tag = raw.split_off(raw.len() - MAC_LEN);

    // MAC first; no AEAD work on unauthenticated input
    let mut mac = hmac_for(keys.authentication_key())?;
    mac.update(&raw);
    mac.verify_slice(&tag)
        .map_err(|_| CryptoError::AuthenticationFailed("hmac mismatch"))?;

    let mut sealed = raw.split_off(IV_LEN);
    let iv: [u8; IV_LEN] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::AuthenticationFailed("malformed iv"))?;

    let plaintext = aead_key(keys.encryption_key())?
        .open_in_place(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut sealed)
        .map_err(|_| CryptoError::AuthenticationFailed("aead tag mismatch"))?;

    String::from_utf8(plaintext.to_vec())
        .map_err(|_| CryptoError::Encoding("decrypted payload is not UTF-8".into()))
}

fn aead_key(key: &SymmetricKey) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key.expose())
        .map_err(|_| CryptoError::ImportValidationFailed("invalid AES-256-GCM key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

fn hmac_for(key: &SymmetricKey) -> Result<HmacSha256, CryptoError> {
    HmacSha256::new_from_slice(key.expose())
        .map_err(|_| CryptoError::ImportValidationFailed("invalid HMAC key".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{derive_keys_blocking, KdfParams, KeyPurpose};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_inputs() -> KeyMaterialInputs {
        KeyMaterialInputs::new("secret", "skypod-test", "nonce", KdfParams::new(1_000).unwrap())
    }

    fn test_cipher() -> Cipher {
        Cipher::from_keys(derive_keys_blocking(&test_inputs(), true).unwrap())
    }

    #[tokio::test]
    async fn roundtrip_strings() {
        let cipher = test_cipher();
        let long = "x".repeat(10_000);
        for s in ["", "hello", "héllo wörld", "日本語のテキスト 🎧", long.as_str()] {
            let blob = cipher.encrypt(s).await.unwrap();
            assert_eq!(cipher.decrypt(&blob).await.unwrap(), s);
        }
    }

    #[tokio::test]
    async fn fresh_iv_per_call() {
        let cipher = test_cipher();
        let a = cipher.encrypt("same").await.unwrap();
        let b = cipher.encrypt("same").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn blob_layout() {
        let cipher = test_cipher();
        let blob = cipher.encrypt("abc").await.unwrap();
        let raw = STANDARD.decode(blob).unwrap();
        assert_eq!(raw.len(), IV_LEN + 3 + TAG_LEN + MAC_LEN);
    }

    #[tokio::test]
    async fn every_bit_flip_is_rejected() {
        let cipher = test_cipher();
        let raw = STANDARD.decode(cipher.encrypt("tamper me").await.unwrap()).unwrap();

        for byte in 0..raw.len() {
            for bit in [0x01u8, 0x80] {
                let mut tampered = raw.clone();
                tampered[byte] ^= bit;
                match cipher.decrypt(&STANDARD.encode(&tampered)).await {
                    Err(CryptoError::AuthenticationFailed(_)) => {}
                    other => panic!("byte {byte} flip accepted: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn short_blob_rejected() {
        let cipher = test_cipher();
        let short = STANDARD.encode([0u8; MIN_BLOB_LEN - 1]);
        assert!(matches!(
            cipher.decrypt(&short).await,
            Err(CryptoError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            cipher.decrypt("").await,
            Err(CryptoError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn non_base64_rejected() {
        let cipher = test_cipher();
        assert!(matches!(
            cipher.decrypt("not*base64*at*all").await,
            Err(CryptoError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn independent_derivations_are_compatible() {
        let first = Cipher::new(DerivingKeySource::new(test_inputs(), false));
        let second = Cipher::new(DerivingKeySource::new(test_inputs(), false));
        let blob = first.encrypt("shared state").await.unwrap();
        assert_eq!(second.decrypt(&blob).await.unwrap(), "shared state");
    }

    #[tokio::test]
    async fn authentication_key_cannot_encrypt() {
        let keys = derive_keys_blocking(&test_inputs(), true).unwrap();
        let blob = encrypt_with(&keys, "payload").unwrap();

        // authentication bytes dressed up as an encryption key
        let confused = DerivedKeys::new(
            SymmetricKey::new(
                KeyPurpose::Encryption,
                *keys.authentication_key().expose(),
                true,
            ),
            keys.authentication_key().clone(),
        )
        .unwrap();
        assert!(matches!(
            decrypt_with(&confused, &blob),
            Err(CryptoError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn wrong_keys_rejected() {
        let blob = test_cipher().encrypt("payload").await.unwrap();
        let other = Cipher::from_keys(DerivedKeys::generate(false).unwrap());
        assert!(matches!(
            other.decrypt(&blob).await,
            Err(CryptoError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test]
    async fn jwk_source_matches_original_keys() {
        let keys = DerivedKeys::generate(true).unwrap();
        let (encr, hmac) = keys.to_jwks().unwrap();
        let blob = encrypt_with(&keys, "persisted").unwrap();

        let restored = Cipher::new(JwkKeySource::new(encr, hmac));
        assert_eq!(restored.decrypt(&blob).await.unwrap(), "persisted");
    }

    struct CountingSource {
        loads: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KeySource for CountingSource {
        async fn load(&self) -> Result<DerivedKeys, CryptoError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            DerivedKeys::generate(false)
        }
    }

    #[tokio::test]
    async fn concurrent_first_calls_load_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let cipher = Arc::new(Cipher::new(CountingSource {
            loads: loads.clone(),
        }));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cipher = cipher.clone();
                tokio::spawn(async move { cipher.encrypt(&format!("msg {i}")).await.unwrap() })
            })
            .collect();
        let mut blobs = Vec::new();
        for handle in handles {
            blobs.push(handle.await.unwrap());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        // divergent keys would make some blobs undecryptable
        for (i, blob) in blobs.iter().enumerate() {
            assert_eq!(cipher.decrypt(blob).await.unwrap(), format!("msg {i}"));
        }
    }

    struct FailingSource;

    #[async_trait]
    impl KeySource for FailingSource {
        async fn load(&self) -> Result<DerivedKeys, CryptoError> {
            Err(CryptoError::DerivationFailed("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let cipher = Cipher::new(FailingSource);
        assert!(cipher.encrypt("a").await.is_err());
        assert!(cipher.keys.get().is_none());
    }
}
