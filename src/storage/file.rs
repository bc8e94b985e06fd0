/// Durable file-backed store.
///
/// Each entry lives in `{dir}/{namespace}{key}.json`. Writes go through a
/// temporary file and a rename so a crash never leaves a half-written
/// entry behind. When the directory can't be used the store is disabled:
/// reads miss and writes are dropped.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::CacheStore;
use crate::error::{GrantError, Result};

const ENTRY_EXT: &str = ".json";
const PROBE_FILE: &str = ".probe";

pub struct FileStore {
    root: Option<PathBuf>,
    namespace: String,
}

fn storage_err(e: std::io::Error) -> GrantError {
    GrantError::StorageUnavailable(e.to_string())
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Entries hold ephemeral private keys; keep them owner-only.
async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

async fn probe(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let probe = dir.join(PROBE_FILE);
    fs::write(&probe, b"ok").await?;
    fs::remove_file(&probe).await
}

impl FileStore {
    /// Open (creating if needed) the store directory.
    pub async fn open(dir: impl AsRef<Path>, namespace: impl Into<String>) -> Self {
        let dir = dir.as_ref();
        let root = match probe(dir).await {
            Ok(()) => Some(dir.to_path_buf()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cache directory unusable, store disabled");
                None
            }
        };
        Self {
            root,
            namespace: namespace.into(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.root.is_some()
    }

    fn entry_path(&self, root: &Path, key: &str) -> Result<PathBuf> {
        if !valid_key(key) {
            return Err(GrantError::Io(format!("Invalid cache key: {key:?}")));
        }
        Ok(root.join(format!("{}{key}{ENTRY_EXT}", self.namespace)))
    }
}

#[async_trait]
impl CacheStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(root) = &self.root else {
            return Ok(None);
        };
        match fs::read_to_string(self.entry_path(root, key)?).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let path = self.entry_path(root, key)?;
        let tmp = path.with_extension("json.tmp");
        write_private(&tmp, value.as_bytes()).await.map_err(storage_err)?;
        fs::rename(&tmp, &path).await.map_err(storage_err)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        match fs::remove_file(self.entry_path(root, key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let Some(root) = &self.root else {
            return Ok(Vec::new());
        };
        let mut dir = fs::read_dir(root).await.map_err(storage_err)?;
        let mut keys = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(storage_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(key) = name
                .strip_prefix(self.namespace.as_str())
                .and_then(|rest| rest.strip_suffix(ENTRY_EXT))
            {
                if valid_key(key) {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }
}
