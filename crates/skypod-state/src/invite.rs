//! Realm invites: moving a realm's shared keys to a new device.
//!
//! The issuer creates an ephemeral keypair `E` and a one-off sender keypair
//! `S`, and seals the realm keys under `HKDF(ECDH(S, E_pub))`. `E`'s private
//! half leaves the issuer only inside an [`InviteCredential`], handed over
//! out of band. The joiner proves possession of `E` by signing an
//! [`InviteProof`]; the issuer then releases the [`SignedInviteOffer`] once,
//! and the joiner recomputes `ECDH(E, S_pub)` to open it.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hkdf::Hkdf;
use p256::ecdsa::SigningKey;
use p256::{PublicKey, SecretKey};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use skypod_crypto::{CryptoError, Jwk};
use zeroize::Zeroizing;

use crate::branded_id::RealmId;
use crate::error::StateError;
use crate::identity::Identity;
use crate::keys;
use crate::realm::PeerIdent;

pub const DEFAULT_INVITE_TTL: Duration = Duration::from_secs(900);
pub(crate) const INVITE_ID_LEN: usize = 21;
const WRAP_INFO_PREFIX: &str = "skypod-invite|";

/// What the issuer publishes for one invite. Everything here is public;
/// only the holder of the ephemeral private key can open `sealed_keys`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteOffer {
    pub invite_id: String,
    pub realm_id: RealmId,
    pub issuer: PeerIdent,
    pub ephemeral_public: Jwk,
    pub sender_public: Jwk,
    pub sealed_keys: String,
    /// Unix seconds.
    pub expires_at: u64,
}

/// An offer as JSON plus the issuer's signature over those exact bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedInviteOffer {
    pub payload: String,
    pub signature: String,
}

impl SignedInviteOffer {
    pub async fn sign(offer: &InviteOffer, issuer: &Identity) -> Result<Self, StateError> {
        let payload = serde_json::to_string(offer)?;
        let signature = issuer.sign(payload.as_bytes()).await?;
        Ok(Self { payload, signature })
    }

    /// The offer, without checking the signature.
    pub fn offer(&self) -> Result<InviteOffer, StateError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// The offer, once its issuer signature and fingerprint check out.
    pub fn verify(&self) -> Result<InviteOffer, StateError> {
        let offer = self.offer()?;
        let issuer_key = keys::import_public(&offer.issuer.public_jwk)?;
        if keys::fingerprint(&issuer_key)? != offer.issuer.public_thumb {
            return Err(StateError::InviteRejected("issuer fingerprint mismatch"));
        }
        if !keys::verify(
            &offer.issuer.public_jwk,
            self.payload.as_bytes(),
            &self.signature,
        )? {
            return Err(StateError::InviteRejected("bad issuer signature"));
        }
        Ok(offer)
    }
}

/// The secret half of an invite, for the joining device only.
#[derive(Clone, Serialize, Deserialize)]
pub struct InviteCredential {
    pub invite_id: String,
    pub realm_id: RealmId,
    pub ephemeral_private: Jwk,
}

impl fmt::Debug for InviteCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteCredential")
            .field("invite_id", &self.invite_id)
            .field("realm_id", &self.realm_id)
            .finish_non_exhaustive()
    }
}

impl InviteCredential {
    /// Sign a proof of possession of the ephemeral key for `joiner`.
    pub fn prove(&self, joiner: PeerIdent) -> Result<InviteProof, StateError> {
        let secret = keys::import_secret(&self.ephemeral_private)?;
        let claims = ProofClaims {
            invite_id: self.invite_id.clone(),
            realm_id: self.realm_id.clone(),
            joiner,
        };
        let payload = serde_json::to_string(&claims)?;
        let signature = keys::sign(&SigningKey::from(secret), payload.as_bytes());
        Ok(InviteProof { payload, signature })
    }

    pub(crate) fn ephemeral_secret(&self) -> Result<SecretKey, StateError> {
        Ok(keys::import_secret(&self.ephemeral_private)?)
    }

    /// Compact form for QR codes and copy/paste.
    pub fn to_token(&self) -> Result<String, StateError> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    pub fn from_token(token: &str) -> Result<Self, StateError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| StateError::InviteRejected("malformed invite token"))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofClaims {
    pub invite_id: String,
    pub realm_id: RealmId,
    pub joiner: PeerIdent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteProof {
    pub payload: String,
    pub signature: String,
}

impl InviteProof {
    /// The claims, without checking the signature.
    pub fn claims(&self) -> Result<ProofClaims, StateError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// The claims, once the signature verifies under `ephemeral_public`.
    pub fn verify(&self, ephemeral_public: &Jwk) -> Result<ProofClaims, StateError> {
        if !keys::verify(ephemeral_public, self.payload.as_bytes(), &self.signature)? {
            return Err(StateError::InviteRejected("proof not signed by the invite key"));
        }
        self.claims()
    }
}

/// Returned to the issuer by `generate_invite`.
#[derive(Debug, Clone)]
pub struct InviteBundle {
    pub invite_id: String,
    pub expires_at: u64,
    pub credential: InviteCredential,
}

/// An issued invite waiting for its single redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInvite {
    pub ephemeral_public: Jwk,
    pub expires_at: u64,
    pub offer: SignedInviteOffer,
}

impl PendingInvite {
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(self.expires_at, now)
    }
}

/// Issuer side of the exchange.
#[async_trait]
pub trait InviteRedeemer: Send + Sync {
    /// Consume the invite named in `proof` and release its offer.
    async fn redeem_invite(&self, proof: InviteProof) -> Result<SignedInviteOffer, StateError>;
}

#[derive(Serialize, Deserialize)]
pub(crate) struct SealedRealmKeys {
    pub encr_jwk: Jwk,
    pub hmac_jwk: Jwk,
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn is_expired(expires_at: u64, now: u64) -> bool {
    now >= expires_at
}

/// AES-256-GCM key from `ECDH(own, peer)`, bound to the invite and realm.
pub(crate) fn wrap_key(
    own: &SecretKey,
    peer: &PublicKey,
    invite_id: &str,
    realm_id: &RealmId,
) -> Result<Zeroizing<[u8; 32]>, StateError> {
    let shared = p256::ecdh::diffie_hellman(own.to_nonzero_scalar(), peer.as_affine());
    let hk = Hkdf::<Sha256>::new(Some(invite_id.as_bytes()), shared.raw_secret_bytes());

    let info = format!("{WRAP_INFO_PREFIX}{realm_id}");
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info.as_bytes(), okm.as_mut_slice())
        .map_err(|_| CryptoError::DerivationFailed("HKDF expand failed".into()))?;
    Ok(okm)
}

pub(crate) fn seal_keys(
    wrap: &[u8; 32],
    invite_id: &str,
    keys: &SealedRealmKeys,
) -> Result<String, StateError> {
    let mut iv = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut iv)
        .map_err(|_| CryptoError::Random)?;

    let mut in_out = Zeroizing::new(serde_json::to_vec(keys)?);
    wrap_aead(wrap)?
        .seal_in_place_append_tag(
            Nonce::assume_unique_for_key(iv),
            Aad::from(invite_id.as_bytes()),
            &mut *in_out,
        )
        .map_err(|_| CryptoError::EncryptionFailed("invite seal failed"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&in_out);
    Ok(STANDARD.encode(sealed))
}

pub(crate) fn open_keys(
    wrap: &[u8; 32],
    invite_id: &str,
    sealed: &str,
) -> Result<SealedRealmKeys, StateError> {
    let raw = STANDARD
        .decode(sealed)
        .map_err(|_| StateError::InviteRejected("sealed keys are not base64"))?;
    if raw.len() < NONCE_LEN {
        return Err(StateError::InviteRejected("sealed keys truncated"));
    }
    let (iv, body) = raw.split_at(NONCE_LEN);
    let iv: [u8; NONCE_LEN] = iv
        .try_into()
        .map_err(|_| StateError::InviteRejected("sealed keys truncated"))?;

    let mut in_out = Zeroizing::new(body.to_vec());
    let plaintext = wrap_aead(wrap)?
        .open_in_place(
            Nonce::assume_unique_for_key(iv),
            Aad::from(invite_id.as_bytes()),
            &mut *in_out,
        )
        .map_err(|_| StateError::InviteRejected("sealed keys failed authentication"))?;
    Ok(serde_json::from_slice(plaintext)?)
}

fn wrap_aead(wrap: &[u8; 32]) -> Result<LessSafeKey, StateError> {
    let unbound = UnboundKey::new(&AES_256_GCM, wrap)
        .map_err(|_| CryptoError::ImportValidationFailed("invalid wrap key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceMeta;
    use skypod_crypto::DerivedKeys;

    fn realm_keys() -> SealedRealmKeys {
        let (encr_jwk, hmac_jwk) = DerivedKeys::generate(true).unwrap().to_jwks().unwrap();
        SealedRealmKeys { encr_jwk, hmac_jwk }
    }

    #[test]
    fn both_sides_agree_on_wrap_key() {
        let realm = RealmId::generate();
        let ephemeral = keys::generate_secret();
        let sender = keys::generate_secret();

        let issuer_side = wrap_key(&sender, &ephemeral.public_key(), "inv", &realm).unwrap();
        let joiner_side = wrap_key(&ephemeral, &sender.public_key(), "inv", &realm).unwrap();
        assert_eq!(*issuer_side, *joiner_side);

        let other_invite = wrap_key(&ephemeral, &sender.public_key(), "inv2", &realm).unwrap();
        assert_ne!(*issuer_side, *other_invite);
    }

    #[test]
    fn sealed_keys_open_with_matching_wrap() {
        let wrap = [3u8; 32];
        let keys = realm_keys();
        let sealed = seal_keys(&wrap, "inv", &keys).unwrap();

        let opened = open_keys(&wrap, "inv", &sealed).unwrap();
        assert_eq!(opened.encr_jwk, keys.encr_jwk);
        assert_eq!(opened.hmac_jwk, keys.hmac_jwk);

        assert!(matches!(
            open_keys(&[4u8; 32], "inv", &sealed),
            Err(StateError::InviteRejected(_))
        ));
        // invite id is bound as associated data
        assert!(matches!(
            open_keys(&wrap, "other", &sealed),
            Err(StateError::InviteRejected(_))
        ));
    }

    #[tokio::test]
    async fn proof_verifies_only_under_ephemeral_key() {
        let ephemeral = keys::generate_secret();
        let pair = keys::export_keypair(&ephemeral).unwrap();
        let credential = InviteCredential {
            invite_id: "inv".into(),
            realm_id: RealmId::generate(),
            ephemeral_private: pair.private_key,
        };
        let joiner = Identity::generate(DeviceMeta::detect()).unwrap();

        let proof = credential.prove(joiner.peer_ident()).unwrap();
        let claims = proof.verify(&pair.public_key).unwrap();
        assert_eq!(claims.invite_id, "inv");
        assert_eq!(&claims.joiner.id, joiner.id());

        let stranger = keys::export_keypair(&keys::generate_secret()).unwrap();
        assert!(matches!(
            proof.verify(&stranger.public_key),
            Err(StateError::InviteRejected(_))
        ));
    }

    #[tokio::test]
    async fn offer_signature_detects_edits() {
        let issuer = Identity::generate(DeviceMeta::detect()).unwrap();
        let ephemeral = keys::export_keypair(&keys::generate_secret()).unwrap();
        let offer = InviteOffer {
            invite_id: "inv".into(),
            realm_id: RealmId::generate(),
            issuer: issuer.peer_ident(),
            ephemeral_public: ephemeral.public_key.clone(),
            sender_public: ephemeral.public_key,
            sealed_keys: "sealed".into(),
            expires_at: now_secs() + 60,
        };
        let signed = SignedInviteOffer::sign(&offer, &issuer).await.unwrap();
        assert_eq!(signed.verify().unwrap(), offer);

        let mut edited = signed.clone();
        edited.payload = edited.payload.replace("\"sealed\"", "\"tampered\"");
        assert!(matches!(
            edited.verify(),
            Err(StateError::InviteRejected(_))
        ));
    }

    #[test]
    fn credential_token_roundtrip() {
        let pair = keys::export_keypair(&keys::generate_secret()).unwrap();
        let credential = InviteCredential {
            invite_id: "inv".into(),
            realm_id: RealmId::generate(),
            ephemeral_private: pair.private_key,
        };
        let token = credential.to_token().unwrap();
        let back = InviteCredential::from_token(&token).unwrap();
        assert_eq!(back.invite_id, credential.invite_id);
        assert_eq!(back.ephemeral_private, credential.ephemeral_private);
        assert!(InviteCredential::from_token("!!").is_err());
    }

    #[test]
    fn expiry_is_inclusive() {
        assert!(is_expired(100, 100));
        assert!(!is_expired(101, 100));
    }

    #[test]
    fn credential_debug_hides_private_key() {
        let pair = keys::export_keypair(&keys::generate_secret()).unwrap();
        let Jwk::Ec(ec) = &pair.private_key else {
            panic!("expected EC key");
        };
        let d = ec.d.clone().unwrap();
        let credential = InviteCredential {
            invite_id: "inv".into(),
            realm_id: RealmId::generate(),
            ephemeral_private: pair.private_key,
        };
        assert!(!format!("{credential:?}").contains(&d));
    }
}
