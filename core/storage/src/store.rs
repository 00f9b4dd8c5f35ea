//! Key-value store trait definition.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

use recsync_common::{Error, Result};

/// Durable key-value store for client-side state.
///
/// Values are opaque byte blobs addressed by a short string key. The store
/// is the single owner of durable state; callers keep at most an in-memory
/// cache of what they last wrote.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the store name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` if nothing was ever written under the key.
    ///
    /// # Errors
    /// - Invalid key
    /// - I/O errors
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`.
    ///
    /// # Postconditions
    /// - When this returns `Ok`, the value survives an abrupt process
    ///   restart
    ///
    /// # Errors
    /// - Invalid key
    /// - I/O errors (the previous value stays in place)
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove the value stored under `key`. Removing a missing key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys currently holding a value.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Take exclusive ownership of the store until the guard is dropped.
    ///
    /// Stores shared with other processes must refuse a second owner, since
    /// each owner rewrites documents from its own in-memory copy. Stores that
    /// only live inside one process return `None`.
    ///
    /// # Errors
    /// - `Error::Storage` if another owner holds the store
    fn lock_exclusive(&self) -> Result<Option<StoreLock>> {
        Ok(None)
    }
}

/// Exclusive hold on a store, released when dropped.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    _file: File,
}

impl StoreLock {
    pub(crate) fn new(path: PathBuf, file: File) -> Self {
        Self { path, _file: file }
    }

    /// Lock file backing the hold.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Check that a key is usable by every store implementation.
///
/// Keys double as file names in the local store, so they must be a single
/// non-empty path component that does not start with '.'.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidInput("Store key cannot be empty".to_string()));
    }
    if key.starts_with('.') {
        return Err(Error::InvalidInput(format!(
            "Store key '{}' cannot start with '.'",
            key
        )));
    }
    if key.contains('/') || key.contains('\\') || key.contains('\0') {
        return Err(Error::InvalidInput(format!(
            "Store key '{}' cannot contain separators",
            key
        )));
    }
    Ok(())
}

/// Read and deserialize a JSON document.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                Error::Serialization(format!("Corrupt document under '{}': {}", key, e))
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize a value as JSON and store it.
pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes).await
}
