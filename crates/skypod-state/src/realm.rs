//! Realms: a shared key pair and member directory for a group of devices.
//!
//! A realm is created on one device, then spread to others through invites
//! (see [`crate::invite`]). Its keys are derived with the realm id as both
//! secret and salt, so anyone who learns the id and recovery nonce can
//! re-derive them. That is a placeholder trust model, not a confidentiality
//! guarantee.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use skypod_crypto::{
    derive_keys, Cipher, CryptoError, DerivedKeys, Jwk, JwkKeySource, KdfParams,
    KeyMaterialInputs, KeyValueStore,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::branded_id::{random_token, IdentId, RealmId};
use crate::device::DeviceMeta;
use crate::error::StateError;
use crate::identity::IdentityManager;
use crate::invite::{
    is_expired, now_secs, open_keys, seal_keys, wrap_key, InviteBundle, InviteCredential,
    InviteOffer, InviteProof, InviteRedeemer, PendingInvite, SealedRealmKeys, SignedInviteOffer,
    INVITE_ID_LEN,
};
use crate::keys;
use crate::record::{RecordCodec, RecordStore};

/// Store name and record key for the realm.
pub const REALM_STORE: &str = "skypod-realm";
const RECOVERY_NONCE_LEN: usize = 32;

/// A device's public material as known to the other members of a realm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerIdent {
    pub id: IdentId,
    #[serde(flatten)]
    pub device: DeviceMeta,
    pub public_jwk: Jwk,
    pub public_thumb: String,
}

impl PeerIdent {
    /// Check that the public key parses and matches the fingerprint.
    pub fn validate(&self) -> Result<(), StateError> {
        let public = keys::import_public(&self.public_jwk)?;
        if keys::fingerprint(&public)? != self.public_thumb {
            return Err(CryptoError::ImportValidationFailed(format!(
                "peer {} fingerprint does not match its key",
                self.id
            ))
            .into());
        }
        Ok(())
    }
}

/// Everything needed to re-derive a realm's keys.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryKey {
    pub realm_id: RealmId,
    pub nonce: String,
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryKey")
            .field("realm_id", &self.realm_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealmRecord {
    pub id: RealmId,
    pub encr_jwk: Jwk,
    pub hmac_jwk: Jwk,
    pub peers: BTreeMap<IdentId, PeerIdent>,
    #[serde(default)]
    pub invites: BTreeMap<String, PendingInvite>,
}

/// A live realm. Clones share one cipher and its key cache.
#[derive(Clone)]
pub struct Realm {
    record: RealmRecord,
    cipher: Arc<Cipher>,
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("id", &self.record.id)
            .field("peers", &self.record.peers.len())
            .finish_non_exhaustive()
    }
}

impl Realm {
    /// Rebuild from a persisted record. Keys are imported on first use.
    pub fn from_record(record: RealmRecord) -> Result<Self, StateError> {
        record.encr_jwk.validate()?;
        record.hmac_jwk.validate()?;
        for (id, peer) in &record.peers {
            if *id != peer.id {
                return Err(CryptoError::ImportValidationFailed(format!(
                    "peer entry {id} holds identity {}",
                    peer.id
                ))
                .into());
            }
            peer.validate()?;
        }

        let cipher = Cipher::new(JwkKeySource::new(
            record.encr_jwk.clone(),
            record.hmac_jwk.clone(),
        ));
        Ok(Self {
            record,
            cipher: Arc::new(cipher),
        })
    }

    fn with_record(&self, record: RealmRecord) -> Self {
        Self {
            record,
            cipher: self.cipher.clone(),
        }
    }

    pub fn id(&self) -> &RealmId {
        &self.record.id
    }

    pub fn record(&self) -> &RealmRecord {
        &self.record
    }

    pub fn peers(&self) -> &BTreeMap<IdentId, PeerIdent> {
        &self.record.peers
    }

    pub fn pending_invites(&self) -> &BTreeMap<String, PendingInvite> {
        &self.record.invites
    }

    pub async fn shared_keys(&self) -> Result<&DerivedKeys, StateError> {
        Ok(self.cipher.keys().await?)
    }

    pub async fn encrypt(&self, plaintext: &str) -> Result<String, StateError> {
        Ok(self.cipher.encrypt(plaintext).await?)
    }

    pub async fn decrypt(&self, blob: &str) -> Result<String, StateError> {
        Ok(self.cipher.decrypt(blob).await?)
    }
}

pub struct RealmCodec;

#[async_trait]
impl RecordCodec for RealmCodec {
    type Live = Realm;
    const VERSION: u32 = 1;

    fn serialize(&self, live: &Realm) -> Result<Value, StateError> {
        Ok(serde_json::to_value(&live.record)?)
    }

    async fn deserialize(&self, state: Value) -> Result<Realm, StateError> {
        Realm::from_record(serde_json::from_value(state)?)
    }

    fn defaults(&self) -> Value {
        json!({ "peers": {}, "invites": {} })
    }
}

/// Owns the current realm, its persistence and the invite exchange.
pub struct RealmManager {
    records: RecordStore<RealmCodec>,
    identity: Arc<IdentityManager>,
    kdf: KdfParams,
    current: Mutex<Option<Realm>>,
}

impl RealmManager {
    pub fn new(store: Arc<dyn KeyValueStore>, identity: Arc<IdentityManager>, kdf: KdfParams) -> Self {
        Self {
            records: RecordStore::new(store, REALM_STORE, RealmCodec),
            identity,
            kdf,
            current: Mutex::new(None),
        }
    }

    /// The realm in memory, or in storage if nothing is loaded yet.
    pub async fn load(&self) -> Result<Option<Realm>, StateError> {
        let mut current = self.current.lock().await;
        if current.is_none() {
            *current = self.records.load().await?;
        }
        Ok(current.clone())
    }

    /// The realm in memory, without touching storage.
    pub async fn current(&self) -> Option<Realm> {
        self.current.lock().await.clone()
    }

    /// Start a new realm with this device as its only member. Replaces any
    /// current realm. The returned recovery key is the only way to
    /// re-derive the realm's keys; it is not stored anywhere.
    pub async fn create(&self) -> Result<(Realm, RecoveryKey), StateError> {
        let identity = self.identity.ensure().await?;
        let recovery = RecoveryKey {
            realm_id: RealmId::generate(),
            nonce: random_token(RECOVERY_NONCE_LEN),
        };
        let realm = self.derive_realm(&recovery, vec![identity.peer_ident()]).await?;

        let mut current = self.current.lock().await;
        if let Some(previous) = current.as_ref() {
            warn!(previous = %previous.id(), "replacing current realm");
        }
        let realm = self.commit(&mut current, realm).await?;
        info!(realm = %realm.id(), "created realm");
        Ok((realm, recovery))
    }

    /// Re-derive a realm from its recovery key, with this device as its
    /// only known member.
    pub async fn recover(&self, recovery: &RecoveryKey) -> Result<Realm, StateError> {
        let identity = self.identity.ensure().await?;
        let realm = self.derive_realm(recovery, vec![identity.peer_ident()]).await?;

        let mut current = self.current.lock().await;
        let realm = self.commit(&mut current, realm).await?;
        info!(realm = %realm.id(), "recovered realm");
        Ok(realm)
    }

    /// Record a peer-join event.
    pub async fn add_peer(&self, peer: PeerIdent) -> Result<Realm, StateError> {
        peer.validate()?;
        let mut current = self.current.lock().await;
        let realm = self.loaded(&mut current).await?;

        let mut record = realm.record.clone();
        debug!(realm = %record.id, peer = %peer.id, "adding peer");
        record.peers.insert(peer.id.clone(), peer);
        let updated = realm.with_record(record);
        self.commit(&mut current, updated).await
    }

    /// Drop a peer from the directory. Returns the removed entry, if any.
    pub async fn remove_peer(&self, id: &IdentId) -> Result<Option<PeerIdent>, StateError> {
        if let Some(identity) = self.identity.load().await? {
            if identity.id() == id {
                return Err(StateError::CannotRemoveSelf);
            }
        }

        let mut current = self.current.lock().await;
        let realm = self.loaded(&mut current).await?;
        let mut record = realm.record.clone();
        let Some(removed) = record.peers.remove(id) else {
            return Ok(None);
        };
        let updated = realm.with_record(record);
        self.commit(&mut current, updated).await?;
        info!(peer = %id, "removed peer");
        Ok(Some(removed))
    }

    /// Issue a single-use invite valid for `ttl`. The bundle's credential
    /// must reach the joining device out of band.
    pub async fn generate_invite(&self, ttl: Duration) -> Result<InviteBundle, StateError> {
        let identity = self.identity.ensure().await?;
        let mut current = self.current.lock().await;
        let realm = self.loaded(&mut current).await?;

        let invite_id = random_token(INVITE_ID_LEN);
        let ephemeral = keys::generate_secret();
        let ephemeral_pair = keys::export_keypair(&ephemeral)?;
        // sender private half is dropped once the keys are sealed
        let sender = keys::generate_secret();
        let sender_public = keys::public_jwk(&sender.public_key())?;
        let wrap = wrap_key(&sender, &ephemeral.public_key(), &invite_id, realm.id())?;
        drop(sender);
        let sealed_keys = seal_keys(
            &wrap,
            &invite_id,
            &SealedRealmKeys {
                encr_jwk: realm.record.encr_jwk.clone(),
                hmac_jwk: realm.record.hmac_jwk.clone(),
            },
        )?;

        let now = now_secs();
        let expires_at = now.saturating_add(ttl.as_secs());
        let offer = InviteOffer {
            invite_id: invite_id.clone(),
            realm_id: realm.id().clone(),
            issuer: identity.peer_ident(),
            ephemeral_public: ephemeral_pair.public_key.clone(),
            sender_public,
            sealed_keys,
            expires_at,
        };
        let signed = SignedInviteOffer::sign(&offer, &identity).await?;

        let mut record = realm.record.clone();
        record.invites.retain(|_, pending| !pending.is_expired(now));
        record.invites.insert(
            invite_id.clone(),
            PendingInvite {
                ephemeral_public: ephemeral_pair.public_key,
                expires_at,
                offer: signed,
            },
        );
        let updated = realm.with_record(record);
        let realm = self.commit(&mut current, updated).await?;
        info!(realm = %realm.id(), invite = %invite_id, expires_at, "issued invite");

        Ok(InviteBundle {
            invite_id: invite_id.clone(),
            expires_at,
            credential: InviteCredential {
                invite_id,
                realm_id: realm.id().clone(),
                ephemeral_private: ephemeral_pair.private_key,
            },
        })
    }

    /// Join a realm using a credential from its issuer. On success the
    /// realm replaces any current one, with the issuer and this device as
    /// its known peers.
    pub async fn exchange_invite(
        &self,
        redeemer: &dyn InviteRedeemer,
        credential: &InviteCredential,
    ) -> Result<Realm, StateError> {
        let identity = self.identity.ensure().await?;
        let proof = credential.prove(identity.peer_ident())?;
        let signed = redeemer.redeem_invite(proof).await?;

        let offer = signed.verify()?;
        if offer.invite_id != credential.invite_id || offer.realm_id != credential.realm_id {
            return Err(StateError::InviteRejected("offer does not match credential"));
        }
        if is_expired(offer.expires_at, now_secs()) {
            return Err(StateError::InviteExpired(offer.invite_id));
        }

        let ephemeral = credential.ephemeral_secret()?;
        if keys::import_public(&offer.ephemeral_public)? != ephemeral.public_key() {
            return Err(StateError::InviteRejected("credential is for a different invite key"));
        }
        let sender = keys::import_public(&offer.sender_public)?;
        let wrap = wrap_key(&ephemeral, &sender, &offer.invite_id, &offer.realm_id)?;
        let sealed = open_keys(&wrap, &offer.invite_id, &offer.sealed_keys)?;
        let shared = DerivedKeys::from_jwks(&sealed.encr_jwk, &sealed.hmac_jwk)?;

        let issuer_id = offer.issuer.id.clone();
        let mut peers = BTreeMap::new();
        peers.insert(offer.issuer.id.clone(), offer.issuer);
        peers.insert(identity.id().clone(), identity.peer_ident());
        let realm = Realm {
            record: RealmRecord {
                id: offer.realm_id,
                encr_jwk: sealed.encr_jwk,
                hmac_jwk: sealed.hmac_jwk,
                peers,
                invites: BTreeMap::new(),
            },
            cipher: Arc::new(Cipher::from_keys(shared)),
        };

        let mut current = self.current.lock().await;
        let realm = self.commit(&mut current, realm).await?;
        info!(realm = %realm.id(), issuer = %issuer_id, "joined realm");
        Ok(realm)
    }

    /// Forget the realm in memory and in storage.
    pub async fn reset(&self) -> Result<(), StateError> {
        let mut current = self.current.lock().await;
        self.records.clear().await?;
        *current = None;
        info!("realm removed");
        Ok(())
    }

    async fn derive_realm(
        &self,
        recovery: &RecoveryKey,
        peers: Vec<PeerIdent>,
    ) -> Result<Realm, StateError> {
        let id = recovery.realm_id.as_str();
        let inputs = KeyMaterialInputs::new(id, id, recovery.nonce.clone(), self.kdf);
        let shared = derive_keys(inputs, true).await?;
        let (encr_jwk, hmac_jwk) = shared.to_jwks()?;

        Ok(Realm {
            record: RealmRecord {
                id: recovery.realm_id.clone(),
                encr_jwk,
                hmac_jwk,
                peers: peers.into_iter().map(|p| (p.id.clone(), p)).collect(),
                invites: BTreeMap::new(),
            },
            cipher: Arc::new(Cipher::from_keys(shared)),
        })
    }

    async fn loaded<'a>(&self, current: &'a mut Option<Realm>) -> Result<&'a Realm, StateError> {
        if current.is_none() {
            *current = self.records.load().await?;
        }
        current.as_ref().ok_or(StateError::NoRealm)
    }

    async fn commit(&self, current: &mut Option<Realm>, realm: Realm) -> Result<Realm, StateError> {
        self.records.save(&realm).await?;
        *current = Some(realm.clone());
        Ok(realm)
    }
}

#[async_trait]
impl InviteRedeemer for RealmManager {
    async fn redeem_invite(&self, proof: InviteProof) -> Result<SignedInviteOffer, StateError> {
        let mut current = self.current.lock().await;
        let realm = self.loaded(&mut current).await?;

        let realm_id = realm.id().clone();
        let mut record = realm.record.clone();
        let outcome = take_invite(&mut record, &proof, now_secs());
        if record != realm.record {
            let updated = realm.with_record(record);
            self.commit(&mut current, updated).await?;
        }

        match &outcome {
            Ok(_) => info!(realm = %realm_id, "invite redeemed"),
            Err(e) => warn!(realm = %realm_id, error = %e, "invite redemption refused"),
        }
        outcome
    }
}

/// Consume the invite behind `proof` and add its joiner. Expired invites
/// are purged from `record` whatever the outcome.
fn take_invite(
    record: &mut RealmRecord,
    proof: &InviteProof,
    now: u64,
) -> Result<SignedInviteOffer, StateError> {
    let claims = proof
        .claims()
        .map_err(|_| StateError::InviteRejected("malformed proof"))?;

    let pending = record.invites.get(&claims.invite_id).cloned();
    record.invites.retain(|_, p| !p.is_expired(now));

    let pending = match pending {
        Some(_) if claims.realm_id != record.id => {
            return Err(StateError::InviteNotFound(claims.invite_id))
        }
        None => return Err(StateError::InviteNotFound(claims.invite_id)),
        Some(p) if p.is_expired(now) => return Err(StateError::InviteExpired(claims.invite_id)),
        Some(p) => p,
    };

    let claims = proof.verify(&pending.ephemeral_public)?;
    claims
        .joiner
        .validate()
        .map_err(|_| StateError::InviteRejected("joiner key does not match its fingerprint"))?;

    record.invites.remove(&claims.invite_id);
    record.peers.insert(claims.joiner.id.clone(), claims.joiner);
    Ok(pending.offer)
}
