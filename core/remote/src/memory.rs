//! In-memory record API for testing.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use recsync_common::{Endpoint, Error, Result};

use crate::api::{Ack, RecordApi};

/// Failure injected for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Requests never reach the server.
    Unreachable,
    /// The server answers with a domain rejection.
    Reject(String),
    /// The server accepts the connection and never answers.
    Hang,
}

/// One call observed by the in-memory API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// "create", "update", "delete" or "fetch".
    pub operation: &'static str,
    /// Endpoint the call targeted.
    pub endpoint: Endpoint,
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, Value>,
    faults: HashMap<String, Fault>,
    calls: Vec<RecordedCall>,
}

/// In-memory record API.
///
/// Useful for testing and development. Records live in a map keyed by
/// endpoint path; failures can be injected per endpoint or globally, and
/// every call is recorded in order. Clones share state.
#[derive(Clone)]
pub struct MemoryRecordApi {
    inner: Arc<Mutex<Inner>>,
    reachable: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

impl MemoryRecordApi {
    /// Create a new, reachable, empty API.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            reachable: Arc::new(AtomicBool::new(true)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("Memory API lock poisoned".to_string()))
    }

    /// Toggle reachability of the whole API.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Inject a failure for every call on `endpoint`.
    pub fn inject_fault(&self, endpoint: &str, fault: Fault) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.insert(endpoint.to_string(), fault);
        }
    }

    /// Remove the failure injected for `endpoint`.
    pub fn clear_fault(&self, endpoint: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.faults.remove(endpoint);
        }
    }

    /// Seed a record as if it already existed on the server.
    pub fn insert_record(&self, endpoint: &str, record: Value) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.records.insert(endpoint.to_string(), record);
        }
    }

    /// Current server copy of a record.
    pub fn record(&self, endpoint: &str) -> Option<Value> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.records.get(endpoint).cloned())
    }

    /// Every call received so far, in arrival order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    /// Record the call and apply any injected failure.
    async fn enter(&self, operation: &'static str, endpoint: &Endpoint) -> Result<()> {
        let fault = {
            let mut inner = self.lock()?;
            inner.calls.push(RecordedCall {
                operation,
                endpoint: endpoint.clone(),
            });
            inner.faults.get(&endpoint.to_path()).cloned()
        };

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::Network("Connection refused".to_string()));
        }

        match fault {
            None => Ok(()),
            Some(Fault::Unreachable) => Err(Error::Network(format!(
                "Connection reset while sending to {}",
                endpoint
            ))),
            Some(Fault::Reject(message)) => Err(Error::Rejected {
                status: Some(422),
                message,
            }),
            Some(Fault::Hang) => std::future::pending().await,
        }
    }
}

impl Default for MemoryRecordApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordApi for MemoryRecordApi {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, endpoint: &Endpoint, payload: &Value) -> Result<Ack> {
        self.enter("create", endpoint).await?;

        let mut record = payload.clone();
        let id = match record.get("id") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                if let Value::Object(fields) = &mut record {
                    fields.insert("id".to_string(), Value::from(id));
                }
                id.to_string()
            }
        };

        let key = endpoint.join(&id)?.to_path();
        let mut inner = self.lock()?;
        if inner.records.contains_key(&key) {
            return Err(Error::Rejected {
                status: Some(409),
                message: format!("Record {} already exists", key),
            });
        }
        inner.records.insert(key, record.clone());
        Ok(Ack {
            record: Some(record),
        })
    }

    async fn update(&self, endpoint: &Endpoint, payload: &Value) -> Result<Ack> {
        self.enter("update", endpoint).await?;

        let mut inner = self.lock()?;
        let existing = inner.records.get_mut(&endpoint.to_path()).ok_or_else(|| {
            Error::Rejected {
                status: Some(404),
                message: format!("Record {} does not exist", endpoint),
            }
        })?;

        match (existing.as_object_mut(), payload.as_object()) {
            (Some(fields), Some(changes)) => {
                for (key, value) in changes {
                    fields.insert(key.clone(), value.clone());
                }
            }
            _ => *existing = payload.clone(),
        }

        Ok(Ack {
            record: Some(existing.clone()),
        })
    }

    async fn delete(&self, endpoint: &Endpoint) -> Result<Ack> {
        self.enter("delete", endpoint).await?;

        let mut inner = self.lock()?;
        match inner.records.remove(&endpoint.to_path()) {
            Some(_) => Ok(Ack { record: None }),
            None => Err(Error::Rejected {
                status: Some(404),
                message: format!("Record {} does not exist", endpoint),
            }),
        }
    }

    async fn fetch(&self, endpoint: &Endpoint) -> Result<Value> {
        self.enter("fetch", endpoint).await?;

        let inner = self.lock()?;
        inner
            .records
            .get(&endpoint.to_path())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Record {} not found", endpoint)))
    }
}
