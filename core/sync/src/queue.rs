//! Durable FIFO queue of mutations awaiting delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

use recsync_common::{Endpoint, Error, LocalId, MutationMethod, RecordRef, Result};
use recsync_storage::{load_json, save_json, KeyValueStore, StoreLock};

/// Storage key the queue document lives under unless configured otherwise.
pub const DEFAULT_QUEUE_KEY: &str = "offline_queue";

const QUEUE_FORMAT_VERSION: u32 = 1;

/// A write made locally that has not yet been acknowledged by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    /// Client-generated correlation id; the only identity used for removal.
    pub local_id: LocalId,
    /// Target endpoint.
    pub endpoint: Endpoint,
    /// Kind of write.
    pub method: MutationMethod,
    /// Request body; `null` for deletes.
    #[serde(default)]
    pub payload: Value,
    /// When the write was made. Diagnostics only.
    pub queued_at: DateTime<Utc>,
}

impl QueuedMutation {
    /// Create a mutation with a fresh local id.
    pub fn new(endpoint: Endpoint, method: MutationMethod, payload: Value) -> Self {
        let payload = if method.carries_payload() {
            payload
        } else {
            Value::Null
        };
        Self {
            local_id: LocalId::generate(),
            endpoint,
            method,
            payload,
            queued_at: Utc::now(),
        }
    }

    /// Override the generated local id.
    pub fn with_local_id(mut self, local_id: LocalId) -> Self {
        self.local_id = local_id;
        self
    }

    /// The record this mutation writes to, if it can be named.
    ///
    /// `resource/id` endpoints name their record directly. A create against
    /// a collection names a record only when the payload carries an `"id"`.
    pub fn target(&self) -> Option<RecordRef> {
        if let Some(record) = self.endpoint.record_ref() {
            return Some(record);
        }
        if self.method != MutationMethod::Create {
            return None;
        }
        let id = match self.payload.get("id")? {
            Value::String(id) if !id.is_empty() => id.clone(),
            Value::Number(id) => id.to_string(),
            _ => return None,
        };
        RecordRef::new(&self.endpoint.to_path(), id).ok()
    }

    /// Whether this mutation writes to `record`.
    pub fn targets(&self, record: &RecordRef) -> bool {
        self.target().as_ref() == Some(record)
    }
}

#[derive(Serialize, Deserialize)]
struct QueueDocument {
    version: u32,
    mutations: Vec<QueuedMutation>,
}

/// Ordered list of pending mutations, mirrored to a `KeyValueStore`.
///
/// Every change is written through before the call returns. A failed write
/// leaves the in-memory list as it was before the call.
///
/// The queue owns its store exclusively while open: every write replaces the
/// stored document with the in-memory list.
pub struct MutationQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    entries: Mutex<Vec<QueuedMutation>>,
    _lock: Option<StoreLock>,
}

impl MutationQueue {
    /// Load the queue stored under `key`, or start an empty one.
    ///
    /// # Errors
    /// - `Error::Storage` if another process has the store open
    /// - `Error::Serialization` if the stored document cannot be parsed; it
    ///   is never replaced with an empty queue
    pub async fn open(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let lock = store.lock_exclusive()?;
        let entries = match load_json::<QueueDocument>(store.as_ref(), &key).await? {
            Some(doc) if doc.version == QUEUE_FORMAT_VERSION => doc.mutations,
            Some(doc) => {
                return Err(Error::Serialization(format!(
                    "Unsupported queue format version {} under key {}",
                    doc.version, key
                )))
            }
            None => Vec::new(),
        };

        debug!(
            "Opened queue '{}' on {} store with {} pending mutations",
            key,
            store.name(),
            entries.len()
        );

        Ok(Self {
            store,
            key,
            entries: Mutex::new(entries),
            _lock: lock,
        })
    }

    /// Storage key of the queue document.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append a mutation and persist before returning.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` if a mutation with the same local id is queued
    /// - Persistence errors from the store
    pub async fn append(&self, mutation: QueuedMutation) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|m| m.local_id == mutation.local_id) {
            return Err(Error::AlreadyExists(format!(
                "Mutation {} is already queued",
                mutation.local_id
            )));
        }

        let local_id = mutation.local_id.clone();
        entries.push(mutation);
        if let Err(err) = self.persist(&entries).await {
            entries.pop();
            error!("Failed to persist queued mutation {}: {}", local_id, err);
            return Err(err);
        }

        debug!("Queued mutation {} ({} pending)", local_id, entries.len());
        Ok(())
    }

    /// Remove every mutation whose local id is in `ids`.
    ///
    /// Unknown ids are ignored. Returns how many mutations were removed; when
    /// nothing matches, no write happens.
    pub async fn remove_by_ids(&self, ids: &HashSet<LocalId>) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let retained: Vec<QueuedMutation> = entries
            .iter()
            .filter(|m| !ids.contains(&m.local_id))
            .cloned()
            .collect();

        let removed = entries.len() - retained.len();
        if removed == 0 {
            return Ok(0);
        }

        self.persist(&retained).await?;
        *entries = retained;
        debug!("Removed {} mutations ({} pending)", removed, entries.len());
        Ok(removed)
    }

    /// Swap the mutation `local_id` for `replacement` in one write.
    ///
    /// The original is removed and the replacement goes to the back of the
    /// queue. If the write fails, the original stays queued.
    ///
    /// # Errors
    /// - `Error::NotFound` if nothing with `local_id` is queued
    /// - `Error::AlreadyExists` if the replacement's id is already queued
    /// - Persistence errors from the store
    pub async fn replace(&self, local_id: &LocalId, replacement: QueuedMutation) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if !entries.iter().any(|m| &m.local_id == local_id) {
            return Err(Error::NotFound(format!("No queued mutation {}", local_id)));
        }
        if entries.iter().any(|m| m.local_id == replacement.local_id) {
            return Err(Error::AlreadyExists(format!(
                "Mutation {} is already queued",
                replacement.local_id
            )));
        }

        let mut updated: Vec<QueuedMutation> = entries
            .iter()
            .filter(|m| &m.local_id != local_id)
            .cloned()
            .collect();
        let new_id = replacement.local_id.clone();
        updated.push(replacement);

        if let Err(err) = self.persist(&updated).await {
            error!("Failed to persist replacement of {}: {}", local_id, err);
            return Err(err);
        }
        *entries = updated;
        debug!("Replaced mutation {} with {}", local_id, new_id);
        Ok(())
    }

    /// Snapshot of all pending mutations in insertion order.
    pub async fn all(&self) -> Vec<QueuedMutation> {
        self.entries.lock().await.clone()
    }

    /// Number of pending mutations.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Look up a pending mutation by local id.
    pub async fn get(&self, local_id: &LocalId) -> Option<QueuedMutation> {
        self.entries
            .lock()
            .await
            .iter()
            .find(|m| &m.local_id == local_id)
            .cloned()
    }

    /// Most recently appended pending mutation that writes to `record`.
    pub async fn latest_for(&self, record: &RecordRef) -> Option<QueuedMutation> {
        self.entries
            .lock()
            .await
            .iter()
            .rev()
            .find(|m| m.targets(record))
            .cloned()
    }

    async fn persist(&self, entries: &[QueuedMutation]) -> Result<()> {
        let doc = QueueDocument {
            version: QUEUE_FORMAT_VERSION,
            mutations: entries.to_vec(),
        };
        save_json(self.store.as_ref(), &self.key, &doc).await
    }
}
