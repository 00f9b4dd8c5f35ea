//! Delivery ledger: per-mutation outcome tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use recsync_common::{Endpoint, Error, LocalId, Result};

use crate::queue::QueuedMutation;

/// Last known delivery outcome of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// The server refused it. It stays queued until discarded or replaced.
    Rejected,
    /// The pass halted on it because the server could not be reached.
    Deferred,
}

/// Ledger row for one mutation that was attempted and not delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEntry {
    /// Mutation this row describes.
    pub local_id: LocalId,
    /// Endpoint the mutation targets.
    pub endpoint: Endpoint,
    /// Outcome of the last attempt.
    pub status: DeliveryStatus,
    /// Number of failed attempts so far.
    pub failure_count: u32,
    /// Error message of the last failed attempt.
    pub last_error: String,
    /// When the last attempt finished.
    pub last_attempt: DateTime<Utc>,
}

impl DeliveryEntry {
    fn new(mutation: &QueuedMutation, status: DeliveryStatus, error: String) -> Self {
        Self {
            local_id: mutation.local_id.clone(),
            endpoint: mutation.endpoint.clone(),
            status,
            failure_count: 1,
            last_error: error,
            last_attempt: Utc::now(),
        }
    }

    /// Record another failed attempt.
    pub fn mark_failed(&mut self, status: DeliveryStatus, error: impl Into<String>) {
        self.status = status;
        self.failure_count += 1;
        self.last_error = error.into();
        self.last_attempt = Utc::now();
    }

    /// Whether this mutation needs manual attention.
    pub fn is_stuck(&self) -> bool {
        self.status == DeliveryStatus::Rejected
    }
}

/// Process-local record of failed delivery attempts, keyed by local id.
///
/// Successful delivery or manual removal clears a row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryState {
    entries: HashMap<LocalId, DeliveryEntry>,
    /// When the last drain pass finished.
    pub last_pass: Option<DateTime<Utc>>,
}

impl DeliveryState {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt for `mutation`.
    pub fn record_failure(
        &mut self,
        mutation: &QueuedMutation,
        status: DeliveryStatus,
        error: impl Into<String>,
    ) -> &DeliveryEntry {
        let error = error.into();
        self.entries
            .entry(mutation.local_id.clone())
            .and_modify(|entry| entry.mark_failed(status, error.clone()))
            .or_insert_with(|| DeliveryEntry::new(mutation, status, error))
    }

    /// Get the row for a mutation.
    pub fn get(&self, local_id: &LocalId) -> Option<&DeliveryEntry> {
        self.entries.get(local_id)
    }

    /// Drop the rows of the given mutations.
    pub fn clear<'a>(&mut self, ids: impl IntoIterator<Item = &'a LocalId>) {
        for id in ids {
            self.entries.remove(id);
        }
    }

    /// Drop rows whose mutation is no longer queued.
    pub fn retain_queued(&mut self, queued: &HashSet<LocalId>) {
        self.entries.retain(|id, _| queued.contains(id));
    }

    /// All rows.
    pub fn entries(&self) -> impl Iterator<Item = &DeliveryEntry> {
        self.entries.values()
    }

    /// Rows with a specific status, oldest attempt first.
    pub fn entries_with_status(&self, status: DeliveryStatus) -> Vec<&DeliveryEntry> {
        let mut entries: Vec<&DeliveryEntry> =
            self.entries.values().filter(|e| e.status == status).collect();
        entries.sort_by_key(|e| e.last_attempt);
        entries
    }

    /// Count rows by status.
    pub fn count_by_status(&self) -> HashMap<DeliveryStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
