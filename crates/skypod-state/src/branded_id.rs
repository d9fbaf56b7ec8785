//! Prefixed random identifiers that cannot be mixed up across namespaces.

use std::fmt;
use std::sync::LazyLock;

use rand::rngs::OsRng;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StateError;

const URL_SAFE_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

const IDENT_ID_LEN: usize = 24;
const REALM_ID_LEN: usize = 16;

static IDENT_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^idt-[A-Za-z0-9_-]{16,}$").unwrap());
static REALM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^rlm-[A-Za-z0-9_-]{16,}$").unwrap());

/// `len` characters from the URL-safe alphabet, 6 bits of entropy each.
pub fn random_token(len: usize) -> String {
    (0..len)
        .map(|_| URL_SAFE_ALPHABET[OsRng.gen_range(0..URL_SAFE_ALPHABET.len())] as char)
        .collect()
}

macro_rules! branded_id {
    ($name:ident, $kind:literal, $prefix:literal, $len:expr, $regex:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, random_token($len)))
            }

            pub fn parse(value: &str) -> Result<Self, StateError> {
                if $regex.is_match(value) {
                    Ok(Self(value.to_string()))
                } else {
                    Err(StateError::InvalidId {
                        kind: $kind,
                        value: value.to_string(),
                    })
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = StateError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id!(IdentId, "identity", "idt", IDENT_ID_LEN, IDENT_ID_REGEX);
branded_id!(RealmId, "realm", "rlm", REALM_ID_LEN, REALM_ID_REGEX);
