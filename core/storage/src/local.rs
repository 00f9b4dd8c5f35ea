//! Local filesystem key-value store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Lock file taken by `lock_exclusive`. Hidden, so never a valid key.
const LOCK_FILE_NAME: &str = ".lock";

use crate::store::{validate_key, KeyValueStore, StoreLock};
use recsync_common::{Error, Result};

/// Local filesystem key-value store.
///
/// Each key is one file under the root directory. Writes go to a hidden
/// temporary file that is fsynced and then renamed over the target, so a
/// reader after a crash sees either the old value or the new one.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Root exists and is not a directory
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        } else if !root.is_dir() {
            return Err(Error::InvalidInput(format!(
                "Store root {} is not a directory",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.root.join(format!(".{}.tmp", key))
    }

    /// Flush the directory entry so the rename itself is durable.
    #[cfg(unix)]
    async fn sync_root(&self) -> Result<()> {
        fs::File::open(&self.root).await?.sync_all().await?;
        Ok(())
    }

    #[cfg(not(unix))]
    async fn sync_root(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.key_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        let target = self.key_path(key);
        let temp = self.temp_path(key);

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        self.sync_root().await?;

        debug!("Stored {} bytes under '{}'", value.len(), key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => self.sync_root().await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lock_exclusive(&self) -> Result<Option<StoreLock>> {
        use fs2::FileExt;

        let path = self.root.join(LOCK_FILE_NAME);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::Storage(format!(
                "Store {} is in use by another process",
                self.root.display()
            ))
        })?;

        debug!("Locked store {}", self.root.display());
        Ok(Some(StoreLock::new(path, file)))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
