use std::path::PathBuf;

use serde::Deserialize;
use skypod_crypto::kdf::DEFAULT_ITERATIONS;
use skypod_crypto::storage::detect_language;

/// CLI configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct SkypodConfig {
    /// Directory holding the store file. Defaults to the platform data
    /// directory (`~/.local/share/skypod` on Linux).
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Store file name inside `data_dir`.
    #[serde(default = "default_store_file")]
    pub store_file: String,

    /// PBKDF2 iterations for storage and realm keys.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Encrypt persisted records. Unset means on for release builds.
    #[serde(default)]
    pub encrypt_storage: Option<bool>,

    /// Origin part of the install fingerprint. Like `language`, only read
    /// when the fingerprint is first pinned in the store.
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Language part of the install fingerprint. Unset means `LANG`.
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default = "default_invite_ttl_secs")]
    pub invite_ttl_secs: u64,

    /// Default tracing directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_store_file() -> String {
    "store.json".into()
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

fn default_origin() -> String {
    "skypod://local".into()
}

fn default_invite_ttl_secs() -> u64 {
    900
}

fn default_log_filter() -> String {
    "skypod=info".into()
}

impl Default for SkypodConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            store_file: default_store_file(),
            kdf_iterations: default_kdf_iterations(),
            encrypt_storage: None,
            origin: default_origin(),
            language: None,
            invite_ttl_secs: default_invite_ttl_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl SkypodConfig {
    /// Resolved data directory, or `None` if the platform has none.
    pub fn data_dir(&self) -> Option<PathBuf> {
        match &self.data_dir {
            Some(dir) => Some(PathBuf::from(dir)),
            None => dirs::data_dir().map(|dir| dir.join("skypod")),
        }
    }

    pub fn language(&self) -> String {
        self.language.clone().unwrap_or_else(detect_language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = SkypodConfig::default();
        assert_eq!(config.store_file, "store.json");
        assert_eq!(config.kdf_iterations, 100_000);
        assert_eq!(config.origin, "skypod://local");
        assert_eq!(config.invite_ttl_secs, 900);
        assert_eq!(config.log_filter, "skypod=info");
        assert!(config.encrypt_storage.is_none());
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            data_dir = "/tmp/skypod"
            kdf_iterations = 2000
            encrypt_storage = false
            language = "de-DE"
        "#;
        let config: SkypodConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.data_dir(), Some(PathBuf::from("/tmp/skypod")));
        assert_eq!(config.kdf_iterations, 2000);
        assert_eq!(config.encrypt_storage, Some(false));
        assert_eq!(config.language(), "de-DE");
        assert_eq!(config.store_file, "store.json");
    }

    #[test]
    fn empty_toml_matches_defaults() {
        let config: SkypodConfig = toml::from_str("").unwrap();
        let defaults = SkypodConfig::default();
        assert_eq!(config.kdf_iterations, defaults.kdf_iterations);
        assert_eq!(config.origin, defaults.origin);
    }
}
