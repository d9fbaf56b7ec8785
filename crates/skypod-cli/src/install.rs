use anyhow::{Context, Result};
use skypod_crypto::storage::default_user_agent;
use skypod_crypto::{InstallFingerprint, KeyValueStore};
use tracing::{info, warn};

use crate::config::SkypodConfig;

/// Store key of the fingerprint recorded on first run.
pub const FINGERPRINT_KEY: &str = "skypod-install";

/// Fingerprint for the current environment as configured.
pub fn resolve_fingerprint(config: &SkypodConfig) -> InstallFingerprint {
    InstallFingerprint {
        origin: config.origin.clone(),
        language: config.language(),
        user_agent: default_user_agent(),
    }
}

/// The fingerprint recorded in `store`, pinning the current one if none is.
/// Storage keys stay put when `LANG` or the platform string drifts later.
pub async fn pinned_fingerprint(
    store: &dyn KeyValueStore,
    config: &SkypodConfig,
) -> Result<InstallFingerprint> {
    let resolved = resolve_fingerprint(config);

    if let Some(raw) = store
        .get(FINGERPRINT_KEY)
        .await
        .context("failed to read install fingerprint")?
    {
        let pinned: InstallFingerprint =
            serde_json::from_str(&raw).context("install fingerprint is unreadable")?;
        if pinned != resolved {
            warn!(
                pinned_language = %pinned.language,
                language = %resolved.language,
                "environment differs from pinned install fingerprint; keeping pinned values"
            );
        }
        return Ok(pinned);
    }

    let json = serde_json::to_string(&resolved)?;
    store
        .set(FINGERPRINT_KEY, &json)
        .await
        .context("failed to record install fingerprint")?;
    info!(language = %resolved.language, origin = %resolved.origin, "pinned install fingerprint");
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skypod_crypto::MemoryStore;

    fn config(language: &str) -> SkypodConfig {
        SkypodConfig {
            language: Some(language.into()),
            ..SkypodConfig::default()
        }
    }

    #[tokio::test]
    async fn first_run_pins_resolved_fingerprint() {
        let store = MemoryStore::new();
        let pinned = pinned_fingerprint(&store, &config("en_US")).await.unwrap();
        assert_eq!(pinned.language, "en_US");
        assert_eq!(pinned.origin, "skypod://local");
        assert!(store.get(FINGERPRINT_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn later_runs_keep_pinned_language() {
        let store = MemoryStore::new();
        let first = pinned_fingerprint(&store, &config("en_US")).await.unwrap();
        let later = pinned_fingerprint(&store, &config("C")).await.unwrap();
        assert_eq!(later, first);
        assert_eq!(later.secret(), first.secret());
    }

    #[tokio::test]
    async fn garbage_pin_is_an_error() {
        let store = MemoryStore::new();
        store.set(FINGERPRINT_KEY, "{nope").await.unwrap();
        assert!(pinned_fingerprint(&store, &config("en_US")).await.is_err());
    }
}
