//! Skypod device identity and realm state.
//!
//! This crate provides:
//! - Branded identifiers for identities and realms
//! - A per-device ECDSA identity, created once and persisted
//! - Realms holding shared encryption keys and a peer directory
//! - Single-use invites that move realm keys to a new device
//! - Versioned JSON records with default merging

pub mod branded_id;
pub mod device;
pub mod error;
pub mod identity;
pub mod invite;
pub mod keys;
pub mod realm;
pub mod record;

pub use branded_id::{IdentId, RealmId};
pub use device::DeviceMeta;
pub use error::StateError;
pub use identity::{Identity, IdentityManager, IdentityRecord};
pub use invite::{
    InviteBundle, InviteCredential, InviteOffer, InviteProof, InviteRedeemer, PendingInvite,
    SignedInviteOffer, DEFAULT_INVITE_TTL,
};
pub use realm::{PeerIdent, Realm, RealmManager, RealmRecord, RecoveryKey};
pub use record::{PersistedRecord, RecordCodec, RecordStore};
