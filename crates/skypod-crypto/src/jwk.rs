//! JSON Web Key shapes accepted across the persistence boundary.
//!
//! Only three key types are recognised: RSA, EC and symmetric (`oct`).
//! Anything else, or any of the three missing a required member, fails
//! with [`CryptoError::ImportValidationFailed`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa(RsaJwk),
    #[serde(rename = "EC")]
    Ec(EcJwk),
    #[serde(rename = "oct")]
    Oct(OctJwk),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RsaJwk {
    pub n: String,
    pub e: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qi: Option<String>,
    #[serde(flatten)]
    pub params: JwkParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcJwk {
    pub crv: String,
    pub x: String,
    /// Absent for Ed25519/Ed448 style curves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// Private scalar.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(flatten)]
    pub params: JwkParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OctJwk {
    pub k: String,
    #[serde(flatten)]
    pub params: JwkParams,
}

/// Optional members shared by every key type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkParams {
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ops: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,
}

/// Public and private halves of an asymmetric key, both validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkPair {
    pub public_key: Jwk,
    pub private_key: Jwk,
}

impl Jwk {
    /// Parse and validate a JWK from an untyped JSON value.
    pub fn parse(value: serde_json::Value) -> Result<Self, CryptoError> {
        let jwk: Jwk = serde_json::from_value(value)
            .map_err(|e| CryptoError::ImportValidationFailed(e.to_string()))?;
        jwk.validate()?;
        Ok(jwk)
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| CryptoError::ImportValidationFailed(e.to_string()))?;
        Self::parse(value)
    }

    /// Check that all required members are present, non-empty and
    /// base64url encoded.
    pub fn validate(&self) -> Result<(), CryptoError> {
        match self {
            Jwk::Rsa(k) => {
                require_b64("n", &k.n)?;
                require_b64("e", &k.e)?;
                optional_b64("d", k.d.as_deref())
            }
            Jwk::Ec(k) => {
                if k.crv.is_empty() {
                    return Err(CryptoError::ImportValidationFailed(
                        "EC key missing crv".into(),
                    ));
                }
                require_b64("x", &k.x)?;
                optional_b64("y", k.y.as_deref())?;
                optional_b64("d", k.d.as_deref())
            }
            Jwk::Oct(k) => require_b64("k", &k.k),
        }
    }

    pub fn kty(&self) -> &'static str {
        match self {
            Jwk::Rsa(_) => "RSA",
            Jwk::Ec(_) => "EC",
            Jwk::Oct(_) => "oct",
        }
    }

    pub fn params(&self) -> &JwkParams {
        match self {
            Jwk::Rsa(k) => &k.params,
            Jwk::Ec(k) => &k.params,
            Jwk::Oct(k) => &k.params,
        }
    }
}

impl JwkPair {
    pub fn validate(&self) -> Result<(), CryptoError> {
        self.public_key.validate()?;
        self.private_key.validate()
    }
}

/// Encode raw key bytes as an unpadded base64url JWK member.
pub fn encode_member(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode an unpadded base64url JWK member.
pub fn decode_member(name: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|_| CryptoError::ImportValidationFailed(format!("member {name} is not base64url")))
}

fn require_b64(name: &str, value: &str) -> Result<(), CryptoError> {
    if value.is_empty() {
        return Err(CryptoError::ImportValidationFailed(format!(
            "missing required member {name}"
        )));
    }
    decode_member(name, value).map(|_| ())
}

fn optional_b64(name: &str, value: Option<&str>) -> Result<(), CryptoError> {
    match value {
        Some(v) => require_b64(name, v),
        None => Ok(()),
    }
}
