use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use skypod_crypto::storage::encryption_enabled;
use skypod_crypto::{InstallBoundStorage, KdfParams, KeyValueStore, StorageOptions};
use skypod_state::identity::IDENTITY_STORE;
use skypod_state::realm::REALM_STORE;
use skypod_state::{DeviceMeta, IdentityManager, InviteCredential, RealmId, RealmManager, RecoveryKey};
use tracing::info;

mod config;
mod file_store;
mod install;

use config::SkypodConfig;
use file_store::FileStore;
use install::{pinned_fingerprint, FINGERPRINT_KEY};

#[derive(Parser)]
#[command(name = "skypod", about = "Skypod identity and realm keys")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Data directory, overrides config
    #[arg(long)]
    data_dir: Option<String>,

    /// Store records unencrypted, overrides config
    #[arg(long)]
    no_encrypt: bool,

    /// PBKDF2 iterations, overrides config
    #[arg(long)]
    iterations: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show this device's identity, creating it if needed
    Ident,
    /// Manage the realm
    #[command(subcommand)]
    Realm(RealmCommand),
    /// Remove the identity and realm records
    Reset,
}

#[derive(Subcommand)]
enum RealmCommand {
    /// Start a new realm and print its recovery key
    Create,
    /// Show the current realm and its peers
    Show,
    /// Re-derive a realm from its recovery key
    Recover {
        #[arg(long)]
        realm_id: String,
        #[arg(long)]
        nonce: String,
    },
    /// Issue an invite and print its credential token
    Invite {
        /// Lifetime in seconds, overrides config
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Join the realm of another data directory on this machine
    Join {
        #[arg(long)]
        token: String,
        /// Data directory of the issuing install
        #[arg(long)]
        issuer_dir: String,
    },
}

struct Skypod {
    base: Arc<dyn KeyValueStore>,
    identity: Arc<IdentityManager>,
    realms: RealmManager,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", config_path))?
    } else {
        SkypodConfig::default()
    };

    // CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = Some(dir);
    }
    if args.no_encrypt {
        config.encrypt_storage = Some(false);
    }
    if let Some(iterations) = args.iterations {
        config.kdf_iterations = iterations;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.as_str().into()),
        )
        .init();

    let data_dir = config
        .data_dir()
        .context("no data directory available; pass --data-dir")?;
    let skypod = open(&config, &data_dir).await?;

    match args.command {
        Command::Ident => {
            let identity = skypod.identity.ensure().await?;
            let device = identity.device();
            println!("id:          {}", identity.id());
            println!("fingerprint: {}", identity.fingerprint());
            println!("device:      {} ({}, {})", device.device, device.os, device.browser);
        }
        Command::Realm(RealmCommand::Create) => {
            let (realm, recovery) = skypod.realms.create().await?;
            println!("realm:    {}", realm.id());
            println!("recovery: --realm-id {} --nonce {}", recovery.realm_id, recovery.nonce);
            println!("Keep the recovery values safe; they are not stored.");
        }
        Command::Realm(RealmCommand::Show) => match skypod.realms.load().await? {
            Some(realm) => {
                println!("realm: {}", realm.id());
                for peer in realm.peers().values() {
                    println!(
                        "  peer {} {} ({}) {}",
                        peer.id, peer.device.device, peer.device.os, peer.public_thumb
                    );
                }
                println!("pending invites: {}", realm.pending_invites().len());
            }
            None => println!("no realm"),
        },
        Command::Realm(RealmCommand::Recover { realm_id, nonce }) => {
            let recovery = RecoveryKey {
                realm_id: RealmId::parse(&realm_id)?,
                nonce,
            };
            let realm = skypod.realms.recover(&recovery).await?;
            println!("realm: {}", realm.id());
        }
        Command::Realm(RealmCommand::Invite { ttl }) => {
            let ttl = Duration::from_secs(ttl.unwrap_or(config.invite_ttl_secs));
            let bundle = skypod.realms.generate_invite(ttl).await?;
            println!("invite:  {}", bundle.invite_id);
            println!("expires: {}", bundle.expires_at);
            println!("token:   {}", bundle.credential.to_token()?);
        }
        Command::Realm(RealmCommand::Join { token, issuer_dir }) => {
            let credential = InviteCredential::from_token(&token)?;
            let issuer = open(&config, Path::new(&issuer_dir))
                .await
                .with_context(|| format!("failed to open issuer data dir: {}", issuer_dir))?;
            let realm = skypod
                .realms
                .exchange_invite(&issuer.realms, &credential)
                .await?;
            println!("joined realm {} with {} peers", realm.id(), realm.peers().len());
        }
        Command::Reset => {
            skypod.realms.reset().await?;
            skypod.identity.reset().await?;
            // the next run pins the environment it finds
            skypod
                .base
                .remove(FINGERPRINT_KEY)
                .await
                .context("failed to remove install fingerprint")?;
            info!(dir = %data_dir.display(), "local state removed");
        }
    }

    Ok(())
}

/// Open the identity and realm managers over the store file in `data_dir`.
async fn open(config: &SkypodConfig, data_dir: &Path) -> Result<Skypod> {
    let kdf = KdfParams::new(config.kdf_iterations).context("invalid kdf_iterations")?;

    let path: PathBuf = data_dir.join(&config.store_file);
    let base: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&path));
    let fingerprint = pinned_fingerprint(base.as_ref(), config).await?;
    let options = StorageOptions {
        encrypt: encryption_enabled(config.encrypt_storage),
        fingerprint,
        kdf,
    };
    info!(path = %path.display(), encrypted = options.encrypt, "opening store");

    let records = |name: &str| -> Arc<dyn KeyValueStore> {
        Arc::new(InstallBoundStorage::new(base.clone(), name, options.clone()))
    };
    let identity = Arc::new(IdentityManager::new(records(IDENTITY_STORE), DeviceMeta::detect()));
    let realms = RealmManager::new(records(REALM_STORE), identity.clone(), kdf);
    Ok(Skypod {
        base,
        identity,
        realms,
    })
}
