use skypod_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("invalid {kind} id: {value:?}")]
    InvalidId { kind: &'static str, value: String },

    #[error("unsupported record version {found} (this build reads up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("invite {0} has expired")]
    InviteExpired(String),

    #[error("invite {0} is unknown or already redeemed")]
    InviteNotFound(String),

    #[error("invite rejected: {0}")]
    InviteRejected(&'static str),

    #[error("no realm has been created or joined")]
    NoRealm,

    #[error("the local identity cannot be removed from its realm")]
    CannotRemoveSelf,
}

impl StateError {
    /// See [`CryptoError::is_recoverable_corruption`].
    pub fn is_recoverable_corruption(&self) -> bool {
        match self {
            StateError::Crypto(e) => e.is_recoverable_corruption(),
            StateError::InvalidId { .. } | StateError::UnsupportedVersion { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Crypto(CryptoError::Serialization(err))
    }
}
