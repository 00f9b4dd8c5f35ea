//! Remote record API trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use recsync_common::{Endpoint, MutationMethod, Result};

/// Explicit success acknowledgement from the remote API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// Record as stored by the server (created/updated), if returned.
    pub record: Option<Value>,
}

/// Response envelope shared by every record endpoint.
///
/// `{"success": true, "data": {...}}` or `{"success": false, "error": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, alias = "message", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Successful envelope carrying a record.
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    /// Failed envelope carrying a reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Remote record API, one endpoint family per resource type.
///
/// Every implementation must keep the two failure classes apart:
/// - `Error::Network` / `Error::Timeout` when no response was received
/// - `Error::Rejected` when the server answered and refused the request
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Get the API name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Create a record in the collection addressed by `endpoint`.
    async fn create(&self, endpoint: &Endpoint, payload: &Value) -> Result<Ack>;

    /// Update the record addressed by `endpoint`.
    async fn update(&self, endpoint: &Endpoint, payload: &Value) -> Result<Ack>;

    /// Delete the record addressed by `endpoint`.
    async fn delete(&self, endpoint: &Endpoint) -> Result<Ack>;

    /// Fetch the current server state of the record addressed by `endpoint`.
    ///
    /// # Errors
    /// - `Error::NotFound` if the server has no such record
    /// - Network errors
    async fn fetch(&self, endpoint: &Endpoint) -> Result<Value>;

    /// Dispatch a queued write by method.
    async fn send(
        &self,
        method: MutationMethod,
        endpoint: &Endpoint,
        payload: &Value,
    ) -> Result<Ack> {
        match method {
            MutationMethod::Create => self.create(endpoint, payload).await,
            MutationMethod::Update => self.update(endpoint, payload).await,
            MutationMethod::Delete => self.delete(endpoint).await,
        }
    }
}
