/// Pluggable key/value store for issued grants.
///
/// Values are opaque strings owned by the caller; stores never inspect
/// them. Two backends ship with the crate:
/// - `MemoryStore`: process-local map, gone on exit
/// - `FileStore`: one file per entry under a namespaced directory
///
/// `select_store` picks one at construction time and falls back to memory
/// when the durable backend is not usable in the current environment.
pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::grant::DecryptionAuthorization;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Human-readable name of this backend (e.g., "memory", "file").
    fn name(&self) -> &str;

    /// Fetch a value. `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Insert or overwrite a value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Returns Ok even if the key doesn't exist.
    async fn remove(&self, key: &str) -> Result<()>;

    /// All keys currently held by this store.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Build the store described by `config`.
///
/// A file backend that fails its write probe is replaced by a memory
/// store, so grants keep working for this process but won't survive a
/// restart.
pub async fn select_store(config: &StoreConfig) -> Arc<dyn CacheStore> {
    match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => {
            let store = FileStore::open(&config.dir, &config.namespace).await;
            if store.is_available() {
                info!(dir = %config.dir.display(), "Using file cache store");
                Arc::new(store)
            } else {
                warn!(
                    dir = %config.dir.display(),
                    "File cache store unavailable, falling back to memory"
                );
                Arc::new(MemoryStore::new())
            }
        }
    }
}

/// Remove expired and unreadable grants stored under `key_namespace`.
///
/// Returns the number of entries removed. Entries that fail to read or
/// delete are skipped.
pub async fn prune_expired(store: &dyn CacheStore, key_namespace: &str, now: u64) -> Result<usize> {
    let prefix = format!("{key_namespace}_");
    let mut removed = 0;

    for key in store.keys().await?.into_iter().filter(|k| k.starts_with(&prefix)) {
        let raw = match store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read cache entry, skipping");
                continue;
            }
        };

        let stale = match DecryptionAuthorization::deserialize(&raw) {
            Ok(auth) => !auth.is_valid_at(now),
            Err(_) => true,
        };
        if !stale {
            continue;
        }

        match store.remove(&key).await {
            Ok(()) => {
                info!(key = %key, "Removed stale authorization");
                removed += 1;
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to remove cache entry"),
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_select_memory() {
        let cfg = StoreConfig {
            backend: StoreBackend::Memory,
            ..StoreConfig::default()
        };
        assert_eq!(select_store(&cfg).await.name(), "memory");
    }

    #[tokio::test]
    async fn test_select_file() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        };
        let store = select_store(&cfg).await;
        assert_eq!(store.name(), "file");
        store.set("k", "v").await.unwrap();
        assert!(dir.path().join("anonexam_k.json").exists());
    }

    #[tokio::test]
    async fn test_unusable_file_backend_falls_back_to_memory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let cfg = StoreConfig {
            dir: file.path().join("cache"),
            ..StoreConfig::default()
        };
        let store = select_store(&cfg).await;
        assert_eq!(store.name(), "memory");
        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_prune_skips_other_namespaces() {
        let store = MemoryStore::new();
        store.set("fhevm_decryption_signature_x", "junk").await.unwrap();
        store.set("other_x", "junk").await.unwrap();

        let removed = prune_expired(&store, "fhevm_decryption_signature", 0).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.keys().await.unwrap(), vec!["other_x".to_string()]);
    }
}
