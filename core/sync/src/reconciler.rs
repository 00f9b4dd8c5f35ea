//! Read path: live fetch with fallback to queued writes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use recsync_common::{Error, MutationMethod, RecordRef, Result};
use recsync_remote::RecordApi;

use crate::queue::MutationQueue;

/// Where record data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Fetched from the server just now.
    Authoritative,
    /// Taken from a write that is still queued.
    LocallyQueued,
}

/// Result of a record read.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found { data: Value, provenance: Provenance },
    /// No data to show. `queued_delete` is set when the latest queued write
    /// for the record deletes it.
    NotAvailable { queued_delete: bool, cause: String },
}

impl FetchOutcome {
    /// Record data, if any.
    pub fn data(&self) -> Option<&Value> {
        match self {
            FetchOutcome::Found { data, .. } => Some(data),
            FetchOutcome::NotAvailable { .. } => None,
        }
    }

    /// Provenance of the data, if any.
    pub fn provenance(&self) -> Option<Provenance> {
        match self {
            FetchOutcome::Found { provenance, .. } => Some(*provenance),
            FetchOutcome::NotAvailable { .. } => None,
        }
    }
}

/// Prefers the server's copy of a record and falls back to the most recent
/// queued write for it when the server cannot be asked.
pub struct Reconciler {
    api: Arc<dyn RecordApi>,
    queue: Arc<MutationQueue>,
    request_timeout: Duration,
}

impl Reconciler {
    pub fn new(api: Arc<dyn RecordApi>, queue: Arc<MutationQueue>, request_timeout: Duration) -> Self {
        Self {
            api,
            queue,
            request_timeout,
        }
    }

    /// Read `record`.
    ///
    /// Any remote failure (including "not found") falls back to the queue;
    /// the fallback payload is the queued request body, which for an update
    /// may hold only the changed fields.
    pub async fn fetch_record(&self, record: &RecordRef) -> FetchOutcome {
        let cause = match self.fetch_remote(record).await {
            Ok(data) => {
                debug!("Fetched {} from {}", record, self.api.name());
                return FetchOutcome::Found {
                    data,
                    provenance: Provenance::Authoritative,
                };
            }
            Err(err) => err,
        };

        info!("Remote fetch of {} failed, checking queue: {}", record, cause);

        match self.queue.latest_for(record).await {
            Some(mutation) if mutation.method == MutationMethod::Delete => {
                FetchOutcome::NotAvailable {
                    queued_delete: true,
                    cause: cause.to_string(),
                }
            }
            Some(mutation) => FetchOutcome::Found {
                data: mutation.payload,
                provenance: Provenance::LocallyQueued,
            },
            None => FetchOutcome::NotAvailable {
                queued_delete: false,
                cause: cause.to_string(),
            },
        }
    }

    async fn fetch_remote(&self, record: &RecordRef) -> Result<Value> {
        let endpoint = record.endpoint();
        match tokio::time::timeout(self.request_timeout, self.api.fetch(&endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "GET {} got no response within {:?}",
                endpoint, self.request_timeout
            ))),
        }
    }
}
