//! Password-based derivation of purpose-separated symmetric keys.
//!
//! One secret, salt and nonce produce two independent 256-bit keys: an
//! AES-256-GCM encryption key and an HMAC-SHA256 authentication key. The
//! two PBKDF2 runs differ only in their salt suffix.

use std::fmt;
use std::num::NonZeroU32;

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::jwk::{decode_member, encode_member, Jwk, JwkParams, OctJwk};

/// Length of every derived key (256 bits).
pub const KEY_LEN: usize = 32;
/// Default PBKDF2 iteration count.
pub const DEFAULT_ITERATIONS: u32 = 100_000;
/// System label appended to every salt.
const SYSTEM: &str = "cryptosystem";

const DEFAULT_ITERATIONS_NZ: NonZeroU32 = match NonZeroU32::new(DEFAULT_ITERATIONS) {
    Some(n) => n,
    None => panic!("default iteration count must be non-zero"),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    iterations: NonZeroU32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS_NZ,
        }
    }
}

impl KdfParams {
    pub fn new(iterations: u32) -> Result<Self, CryptoError> {
        let iterations = NonZeroU32::new(iterations).ok_or_else(|| {
            CryptoError::DerivationFailed("PBKDF2 iterations must be >= 1".into())
        })?;
        Ok(Self { iterations })
    }

    pub fn iterations(&self) -> u32 {
        self.iterations.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    Encryption,
    Authentication,
}

impl KeyPurpose {
    fn salt_label(self) -> &'static str {
        match self {
            KeyPurpose::Encryption => "encr",
            KeyPurpose::Authentication => "hmac",
        }
    }

    /// JWK `alg` value for keys of this purpose.
    pub fn jwk_alg(self) -> &'static str {
        match self {
            KeyPurpose::Encryption => "A256GCM",
            KeyPurpose::Authentication => "HS256",
        }
    }

    fn key_ops(self) -> Vec<String> {
        let ops: &[&str] = match self {
            KeyPurpose::Encryption => &["encrypt", "decrypt"],
            KeyPurpose::Authentication => &["sign", "verify"],
        };
        ops.iter().map(|op| op.to_string()).collect()
    }
}

/// A 256-bit symmetric key bound to one purpose.
///
/// Key bytes are zeroized on drop. Keys created with `extractable = false`
/// refuse JWK export.
#[derive(Clone)]
pub struct SymmetricKey {
    purpose: KeyPurpose,
    bytes: Zeroizing<[u8; KEY_LEN]>,
    extractable: bool,
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("purpose", &self.purpose)
            .field("extractable", &self.extractable)
            .finish_non_exhaustive()
    }
}

impl SymmetricKey {
    pub(crate) fn new(purpose: KeyPurpose, bytes: [u8; KEY_LEN], extractable: bool) -> Self {
        Self {
            purpose,
            bytes: Zeroizing::new(bytes),
            extractable,
        }
    }

    /// Generate a fresh random key.
    pub fn generate(purpose: KeyPurpose, extractable: bool) -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| CryptoError::Random)?;
        let key = Self::new(purpose, bytes, extractable);
        bytes.zeroize();
        Ok(key)
    }

    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }

    pub fn is_extractable(&self) -> bool {
        self.extractable
    }

    pub(crate) fn expose(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Export as an `oct` JWK.
    pub fn to_jwk(&self) -> Result<Jwk, CryptoError> {
        if !self.extractable {
            return Err(CryptoError::KeyUnavailable("symmetric key was derived non-extractable"));
        }
        Ok(Jwk::Oct(OctJwk {
            k: encode_member(self.bytes.as_slice()),
            params: JwkParams {
                alg: Some(self.purpose.jwk_alg().to_string()),
                key_ops: Some(self.purpose.key_ops()),
                ext: Some(true),
                ..Default::default()
            },
        }))
    }

    /// Import an `oct` JWK for the given purpose. A JWK carrying an `alg`
    /// for the other purpose is rejected.
    pub fn from_jwk(jwk: &Jwk, purpose: KeyPurpose) -> Result<Self, CryptoError> {
        jwk.validate()?;
        let Jwk::Oct(oct) = jwk else {
            return Err(CryptoError::ImportValidationFailed(format!(
                "expected an oct key, got {}",
                jwk.kty()
            )));
        };
        if let Some(alg) = oct.params.alg.as_deref() {
            if alg != purpose.jwk_alg() {
                return Err(CryptoError::ImportValidationFailed(format!(
                    "key alg {alg} cannot be used as {}",
                    purpose.jwk_alg()
                )));
            }
        }

        let raw = Zeroizing::new(decode_member("k", &oct.k)?);
        let bytes: [u8; KEY_LEN] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::ImportValidationFailed(format!(
                "expected {KEY_LEN}-byte key, got {} bytes",
                raw.len()
            ))
        })?;
        Ok(Self::new(purpose, bytes, true))
    }
}

/// Encryption and authentication keys for one cipher.
#[derive(Debug, Clone)]
pub struct DerivedKeys {
    encryption_key: SymmetricKey,
    authentication_key: SymmetricKey,
}

impl DerivedKeys {
    /// Pair two keys, refusing to swap their roles.
    pub fn new(
        encryption_key: SymmetricKey,
        authentication_key: SymmetricKey,
    ) -> Result<Self, CryptoError> {
        if encryption_key.purpose() != KeyPurpose::Encryption
            || authentication_key.purpose() != KeyPurpose::Authentication
        {
            return Err(CryptoError::ImportValidationFailed(
                "encryption and authentication keys are not interchangeable".into(),
            ));
        }
        Ok(Self {
            encryption_key,
            authentication_key,
        })
    }

    pub fn generate(extractable: bool) -> Result<Self, CryptoError> {
        Self::new(
            SymmetricKey::generate(KeyPurpose::Encryption, extractable)?,
            SymmetricKey::generate(KeyPurpose::Authentication, extractable)?,
        )
    }

    pub fn encryption_key(&self) -> &SymmetricKey {
        &self.encryption_key
    }

    pub fn authentication_key(&self) -> &SymmetricKey {
        &self.authentication_key
    }

    /// Export as `(encryption_jwk, authentication_jwk)`.
    pub fn to_jwks(&self) -> Result<(Jwk, Jwk), CryptoError> {
        Ok((self.encryption_key.to_jwk()?, self.authentication_key.to_jwk()?))
    }

    pub fn from_jwks(encryption: &Jwk, authentication: &Jwk) -> Result<Self, CryptoError> {
        Self::new(
            SymmetricKey::from_jwk(encryption, KeyPurpose::Encryption)?,
            SymmetricKey::from_jwk(authentication, KeyPurpose::Authentication)?,
        )
    }
}

/// Inputs to [`derive_keys`]. Identical inputs always yield identical keys.
#[derive(Clone)]
pub struct KeyMaterialInputs {
    pub secret: Zeroizing<String>,
    pub salt: String,
    pub nonce: String,
    pub params: KdfParams,
}

impl KeyMaterialInputs {
    pub fn new(
        secret: impl Into<String>,
        salt: impl Into<String>,
        nonce: impl Into<String>,
        params: KdfParams,
    ) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            salt: salt.into(),
            nonce: nonce.into(),
            params,
        }
    }
}

/// Derive both keys on the blocking pool.
pub async fn derive_keys(
    inputs: KeyMaterialInputs,
    extractable: bool,
) -> Result<DerivedKeys, CryptoError> {
    tokio::task::spawn_blocking(move || derive_keys_blocking(&inputs, extractable))
        .await
        .map_err(|e| CryptoError::DerivationFailed(format!("derivation task failed: {e}")))?
}

/// Derive both keys on the current thread.
pub fn derive_keys_blocking(
    inputs: &KeyMaterialInputs,
    extractable: bool,
) -> Result<DerivedKeys, CryptoError> {
    if inputs.secret.is_empty() {
        return Err(CryptoError::DerivationFailed("secret must not be empty".into()));
    }
    // an empty nonce is never "no nonce"
    if inputs.nonce.is_empty() {
        return Err(CryptoError::DerivationFailed("nonce must not be empty".into()));
    }

    debug!(
        salt = %inputs.salt,
        iterations = inputs.params.iterations(),
        "deriving key pair"
    );

    let derive_one = |purpose: KeyPurpose| {
        let mut salt = format!("{}-{}-{}", inputs.salt, purpose.salt_label(), SYSTEM).into_bytes();
        salt.extend_from_slice(inputs.nonce.as_bytes());

        let mut out = [0u8; KEY_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            inputs.params.iterations,
            &salt,
            inputs.secret.as_bytes(),
            &mut out,
        );
        let key = SymmetricKey::new(purpose, out, extractable);
        out.zeroize();
        key
    };

    DerivedKeys::new(
        derive_one(KeyPurpose::Encryption),
        derive_one(KeyPurpose::Authentication),
    )
}
