use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    DerivationFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    #[error("key import validation failed: {0}")]
    ImportValidationFailed(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(&'static str),

    #[error("backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("key is not extractable: {0}")]
    KeyUnavailable(&'static str),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("OS random generator unavailable")]
    Random,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CryptoError {
    /// True when the error means persisted data is unusable rather than that
    /// the environment is broken. Callers decide whether to regenerate.
    pub fn is_recoverable_corruption(&self) -> bool {
        matches!(
            self,
            CryptoError::AuthenticationFailed(_)
                | CryptoError::ImportValidationFailed(_)
                | CryptoError::Encoding(_)
                | CryptoError::Serialization(_)
        )
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        CryptoError::StoreUnavailable(err.to_string())
    }
}
