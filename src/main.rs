use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fhevm_grant::clock::{Clock, SystemClock};
use fhevm_grant::config::{GrantConfig, StoreConfig, DEFAULT_KEY_NAMESPACE};
use fhevm_grant::error::{GrantError, Result};
use fhevm_grant::grant::{DecryptionAuthorization, SECONDS_PER_DAY};
use fhevm_grant::storage::{self, CacheStore, FileStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fhevm-grant")]
#[command(about = "Inspect and maintain cached FHEVM decryption grants")]
#[command(version)]
struct Cli {
    /// Cache directory
    #[arg(long, env = "FHEVM_GRANT_DIR", global = true)]
    dir: Option<PathBuf>,

    /// Store namespace prefix
    #[arg(long, env = "FHEVM_GRANT_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Cache-key namespace tag
    #[arg(long, default_value = DEFAULT_KEY_NAMESPACE, global = true)]
    key_namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cached grants
    List,
    /// Remove expired and unreadable grants
    Prune,
    /// Remove every cached grant
    Purge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut store_cfg = StoreConfig::default();
    if let Some(dir) = cli.dir {
        store_cfg.dir = dir;
    }
    if let Some(namespace) = cli.namespace {
        store_cfg.namespace = namespace;
    }
    let grant_cfg = GrantConfig {
        key_namespace: cli.key_namespace,
        ..GrantConfig::default()
    };

    let store = FileStore::open(&store_cfg.dir, &store_cfg.namespace).await;
    if !store.is_available() {
        return Err(GrantError::StorageUnavailable(format!(
            "cannot use cache directory {}",
            store_cfg.dir.display()
        )));
    }

    let prefix = format!("{}_", grant_cfg.key_namespace);
    let now = SystemClock.now();

    match cli.command {
        Commands::List => {
            let mut keys = store.keys().await?;
            keys.retain(|k| k.starts_with(&prefix));
            keys.sort();
            for key in keys {
                let Some(raw) = store.get(&key).await? else {
                    continue;
                };
                match DecryptionAuthorization::deserialize(&raw) {
                    Ok(auth) => {
                        let status = if auth.is_valid_at(now) {
                            format!("{}d left", auth.remaining_secs(now) / SECONDS_PER_DAY)
                        } else {
                            "expired".to_string()
                        };
                        println!(
                            "{key}  signer={}  contracts={}  {status}",
                            auth.granted_by(),
                            auth.contracts().len()
                        );
                    }
                    Err(_) => println!("{key}  <unreadable>"),
                }
            }
        }
        Commands::Prune => {
            let removed = storage::prune_expired(&store, &grant_cfg.key_namespace, now).await?;
            println!("Removed {removed} stale grant(s)");
        }
        Commands::Purge => {
            let mut removed = 0;
            for key in store.keys().await? {
                if key.starts_with(&prefix) {
                    store.remove(&key).await?;
                    removed += 1;
                }
            }
            println!("Removed {removed} grant(s)");
        }
    }

    Ok(())
}
