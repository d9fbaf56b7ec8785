//! P-256 key handling: JWK export/import, fingerprints, ECDSA signatures.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::EncodePublicKey;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use skypod_crypto::jwk::{decode_member, encode_member, EcJwk, JwkParams};
use skypod_crypto::{CryptoError, Jwk, JwkPair};
use zeroize::Zeroizing;

pub const CURVE: &str = "P-256";
pub const SIGNATURE_ALG: &str = "ES256";
const COORDINATE_LEN: usize = 32;

pub fn generate_secret() -> SecretKey {
    SecretKey::random(&mut OsRng)
}

pub fn public_jwk(public: &PublicKey) -> Result<Jwk, CryptoError> {
    Ok(Jwk::Ec(ec_jwk(public, None, "verify")?))
}

/// Export both halves. The private JWK carries `x`, `y` and `d`.
pub fn export_keypair(secret: &SecretKey) -> Result<JwkPair, CryptoError> {
    let public = secret.public_key();
    let d = Zeroizing::new(secret.to_bytes().to_vec());
    Ok(JwkPair {
        public_key: Jwk::Ec(ec_jwk(&public, None, "verify")?),
        private_key: Jwk::Ec(ec_jwk(&public, Some(encode_member(&d)), "sign")?),
    })
}

fn ec_jwk(public: &PublicKey, d: Option<String>, op: &str) -> Result<EcJwk, CryptoError> {
    let point = public.to_encoded_point(false);
    let (Some(x), Some(y)) = (point.x(), point.y()) else {
        return Err(CryptoError::KeyUnavailable("public key is the identity point"));
    };
    Ok(EcJwk {
        crv: CURVE.to_string(),
        x: encode_member(x),
        y: Some(encode_member(y)),
        d,
        params: JwkParams {
            alg: Some(SIGNATURE_ALG.to_string()),
            key_ops: Some(vec![op.to_string()]),
            ext: Some(true),
            ..Default::default()
        },
    })
}

fn p256_members(jwk: &Jwk) -> Result<&EcJwk, CryptoError> {
    jwk.validate()?;
    match jwk {
        Jwk::Ec(ec) if ec.crv == CURVE => Ok(ec),
        Jwk::Ec(ec) => Err(CryptoError::ImportValidationFailed(format!(
            "unsupported curve {}",
            ec.crv
        ))),
        other => Err(CryptoError::ImportValidationFailed(format!(
            "expected an EC key, got {}",
            other.kty()
        ))),
    }
}

pub fn import_public(jwk: &Jwk) -> Result<PublicKey, CryptoError> {
    let ec = p256_members(jwk)?;
    let y = ec
        .y
        .as_deref()
        .ok_or_else(|| CryptoError::ImportValidationFailed("P-256 key missing y".into()))?;
    let x = decode_member("x", &ec.x)?;
    let y = decode_member("y", y)?;
    if x.len() != COORDINATE_LEN || y.len() != COORDINATE_LEN {
        return Err(CryptoError::ImportValidationFailed(
            "P-256 coordinates must be 32 bytes".into(),
        ));
    }

    let mut sec1 = Vec::with_capacity(1 + 2 * COORDINATE_LEN);
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| CryptoError::ImportValidationFailed("point is not on P-256".into()))
}

/// Import a private JWK, checking `d` agrees with the stated public point.
pub fn import_secret(jwk: &Jwk) -> Result<SecretKey, CryptoError> {
    let ec = p256_members(jwk)?;
    let d = ec
        .d
        .as_deref()
        .ok_or_else(|| CryptoError::ImportValidationFailed("private key missing d".into()))?;
    let d = Zeroizing::new(decode_member("d", d)?);
    let secret = SecretKey::from_slice(&d)
        .map_err(|_| CryptoError::ImportValidationFailed("invalid P-256 scalar".into()))?;

    if secret.public_key() != import_public(jwk)? {
        return Err(CryptoError::ImportValidationFailed(
            "private scalar does not match public point".into(),
        ));
    }
    Ok(secret)
}

/// Lowercase hex SHA-256 of the SPKI DER encoding.
pub fn fingerprint(public: &PublicKey) -> Result<String, CryptoError> {
    let spki = public
        .to_public_key_der()
        .map_err(|e| CryptoError::Encoding(format!("SPKI encoding failed: {e}")))?;
    Ok(hex::encode(Sha256::digest(spki.as_bytes())))
}

/// Base64 of the 64-byte `r || s` signature.
pub fn sign(key: &SigningKey, payload: &[u8]) -> String {
    let signature: Signature = key.sign(payload);
    STANDARD.encode(signature.to_bytes())
}

/// `Ok(false)` for a well-formed signature that does not verify.
pub fn verify(public_jwk: &Jwk, payload: &[u8], signature: &str) -> Result<bool, CryptoError> {
    let public = import_public(public_jwk)?;
    let Ok(raw) = STANDARD.decode(signature) else {
        return Ok(false);
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return Ok(false);
    };
    Ok(VerifyingKey::from(&public).verify(payload, &signature).is_ok())
}
