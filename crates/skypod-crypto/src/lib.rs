//! Skypod cryptographic core.
//!
//! This crate provides:
//! - PBKDF2 derivation of separated encryption/authentication keys
//! - An encrypt-then-MAC string cipher (AES-256-GCM + HMAC-SHA256)
//! - Write-once per-context nonces
//! - Install-bound encrypted key/value storage
//! - Strict JWK import validation

pub mod cipher;
pub mod error;
pub mod jwk;
pub mod kdf;
pub mod nonce;
pub mod storage;
pub mod stores;

// Re-export key types for convenience
pub use cipher::{Cipher, DerivingKeySource, JwkKeySource, KeySource};
pub use error::CryptoError;
pub use jwk::{Jwk, JwkPair};
pub use kdf::{derive_keys, DerivedKeys, KdfParams, KeyMaterialInputs, KeyPurpose, SymmetricKey};
pub use nonce::{Nonce, NonceLedger};
pub use storage::{InstallBoundStorage, InstallFingerprint, StorageOptions};
pub use stores::{KeyValueStore, MemoryStore};
