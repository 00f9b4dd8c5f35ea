//! Drain engine: delivers queued mutations to the remote API.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use recsync_common::{Endpoint, Error, LocalId, Result};
use recsync_remote::{Ack, RecordApi};
use recsync_storage::{save_json, KeyValueStore};

use crate::network::{ConnectivityState, NetworkStatusTracker};
use crate::queue::{MutationQueue, QueuedMutation, DEFAULT_QUEUE_KEY};
use crate::retry::RetryConfig;
use crate::scheduler::SyncMode;
use crate::state::{DeliveryState, DeliveryStatus};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound for a single remote call, in milliseconds.
    pub request_timeout_ms: u64,
    /// Storage key of the queue document.
    pub queue_key: String,
    /// When drain passes start automatically.
    pub sync_mode: SyncMode,
    /// Backoff for automatic re-drain after a network halt.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
            sync_mode: SyncMode::OnReconnect,
            retry: RetryConfig::default(),
        }
    }
}

/// Why a drain call did no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Nothing was queued.
    EmptyQueue,
    /// Another pass holds the tracker at `Pending`.
    AlreadyRunning,
}

/// A mutation the server acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub local_id: LocalId,
    pub endpoint: Endpoint,
    /// Record as returned by the server, if any.
    pub record: Option<Value>,
}

/// A mutation the server refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub local_id: LocalId,
    pub endpoint: Endpoint,
    pub error: String,
}

/// Result of one drain pass.
#[derive(Debug, Clone)]
pub struct DrainReport {
    /// Mutations sent, including the one that halted the pass.
    pub attempted: usize,
    /// Acknowledged mutations, now removed from the queue.
    pub delivered: Vec<Delivery>,
    /// Refused mutations, still queued.
    pub rejected: Vec<Rejection>,
    /// Mutation whose network failure ended the pass early.
    pub halted_at: Option<LocalId>,
    /// Queue length after removal.
    pub remaining: usize,
    /// Connectivity state the pass ended in.
    pub state: ConnectivityState,
    pub duration: Duration,
}

impl DrainReport {
    /// Local ids of delivered mutations.
    pub fn delivered_ids(&self) -> HashSet<LocalId> {
        self.delivered.iter().map(|d| d.local_id.clone()).collect()
    }

    /// Whether the pass stopped on a network failure.
    pub fn halted(&self) -> bool {
        self.halted_at.is_some()
    }
}

/// Outcome of a drain call.
#[derive(Debug, Clone)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Completed(DrainReport),
}

impl DrainOutcome {
    /// The pass report, if a pass ran.
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped(_) => None,
        }
    }
}

/// Delivers queued mutations in FIFO order.
///
/// A pass keeps going past rejections and stops at the first network
/// failure, so a later write to a record is never sent before an earlier
/// one that could not be delivered. Only acknowledged mutations leave the
/// queue.
pub struct SyncEngine {
    api: Arc<dyn RecordApi>,
    queue: Arc<MutationQueue>,
    tracker: Arc<NetworkStatusTracker>,
    ledger: Arc<RwLock<DeliveryState>>,
    ledger_store: Option<(Arc<dyn KeyValueStore>, String)>,
    request_timeout: Duration,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        api: Arc<dyn RecordApi>,
        queue: Arc<MutationQueue>,
        tracker: Arc<NetworkStatusTracker>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            api,
            queue,
            tracker,
            ledger: Arc::new(RwLock::new(DeliveryState::new())),
            ledger_store: None,
            request_timeout,
        }
    }

    /// Start from `ledger` and write it to `store` under `key` after every
    /// pass, so rejections stay visible across restarts.
    pub fn with_persisted_ledger(
        mut self,
        ledger: DeliveryState,
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
    ) -> Self {
        self.ledger = Arc::new(RwLock::new(ledger));
        self.ledger_store = Some((store, key.into()));
        self
    }

    /// Write the ledger out, if it is persisted.
    ///
    /// Failures are logged only: the ledger is advisory and the queue stays
    /// the source of truth.
    pub async fn persist_ledger(&self) {
        let Some((store, key)) = &self.ledger_store else {
            return;
        };
        let snapshot = self.ledger.read().await.clone();
        if let Err(err) = save_json(store.as_ref(), key, &snapshot).await {
            warn!("Failed to persist delivery ledger under '{}': {}", key, err);
        }
    }

    /// Get a reference to the delivery ledger.
    pub fn ledger(&self) -> Arc<RwLock<DeliveryState>> {
        self.ledger.clone()
    }

    /// Get the connectivity tracker.
    pub fn tracker(&self) -> Arc<NetworkStatusTracker> {
        self.tracker.clone()
    }

    /// Get the queue.
    pub fn queue(&self) -> Arc<MutationQueue> {
        self.queue.clone()
    }

    /// Run one drain pass.
    ///
    /// # Errors
    /// Only persistence errors from removing delivered mutations. The
    /// tracker is set to `Offline` before the error is returned.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if self.queue.is_empty().await {
            debug!("Drain skipped: queue is empty");
            return Ok(DrainOutcome::Skipped(SkipReason::EmptyQueue));
        }
        if !self.tracker.try_begin_pass() {
            debug!("Drain skipped: a pass is already running");
            return Ok(DrainOutcome::Skipped(SkipReason::AlreadyRunning));
        }

        let start = Instant::now();
        let snapshot = self.queue.all().await;
        info!(
            "Starting drain pass over {} queued mutations via {}",
            snapshot.len(),
            self.api.name()
        );

        let mut attempted = 0;
        let mut delivered = Vec::new();
        let mut rejected = Vec::new();
        let mut halted_at = None;

        for mutation in &snapshot {
            attempted += 1;
            match self.dispatch(mutation).await {
                Ok(ack) => {
                    debug!(
                        "Delivered {} {} ({})",
                        mutation.method, mutation.endpoint, mutation.local_id
                    );
                    delivered.push(Delivery {
                        local_id: mutation.local_id.clone(),
                        endpoint: mutation.endpoint.clone(),
                        record: ack.record,
                    });
                }
                Err(err) if err.is_network() => {
                    warn!(
                        "Drain halted at {} {} ({}): {}",
                        mutation.method, mutation.endpoint, mutation.local_id, err
                    );
                    self.ledger.write().await.record_failure(
                        mutation,
                        DeliveryStatus::Deferred,
                        err.to_string(),
                    );
                    halted_at = Some(mutation.local_id.clone());
                    break;
                }
                Err(err) => {
                    warn!(
                        "Mutation {} to {} rejected: {}",
                        mutation.local_id, mutation.endpoint, err
                    );
                    self.ledger.write().await.record_failure(
                        mutation,
                        DeliveryStatus::Rejected,
                        err.to_string(),
                    );
                    rejected.push(Rejection {
                        local_id: mutation.local_id.clone(),
                        endpoint: mutation.endpoint.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let successful: HashSet<LocalId> =
            delivered.iter().map(|d| d.local_id.clone()).collect();
        if let Err(err) = self.queue.remove_by_ids(&successful).await {
            error!(
                "Failed to remove {} delivered mutations from the queue: {}",
                successful.len(),
                err
            );
            self.tracker.set_status(ConnectivityState::Offline);
            return Err(err);
        }

        {
            let mut ledger = self.ledger.write().await;
            ledger.clear(&successful);
            ledger.last_pass = Some(chrono::Utc::now());
        }
        self.persist_ledger().await;

        let remaining = self.queue.len().await;
        let state = if remaining == 0 {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        self.tracker.set_status(state);

        let report = DrainReport {
            attempted,
            delivered,
            rejected,
            halted_at,
            remaining,
            state,
            duration: start.elapsed(),
        };

        info!(
            "Drain pass finished in {:?}: {} delivered, {} rejected, {} remaining{}",
            report.duration,
            report.delivered.len(),
            report.rejected.len(),
            remaining,
            if report.halted() { " (halted)" } else { "" }
        );

        Ok(DrainOutcome::Completed(report))
    }

    /// Send one mutation, bounded by the request timeout.
    async fn dispatch(&self, mutation: &QueuedMutation) -> Result<Ack> {
        let send = self
            .api
            .send(mutation.method, &mutation.endpoint, &mutation.payload);
        match tokio::time::timeout(self.request_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} {} got no response within {:?}",
                mutation.method, mutation.endpoint, self.request_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recsync_common::MutationMethod;
    use recsync_remote::{Fault, MemoryRecordApi};
    use recsync_storage::{KeyValueStore, MemoryStore};
    use serde_json::json;

    struct Harness {
        api: MemoryRecordApi,
        store: MemoryStore,
        queue: Arc<MutationQueue>,
        tracker: Arc<NetworkStatusTracker>,
        engine: SyncEngine,
    }

    async fn harness(timeout: Duration) -> Harness {
        let api = MemoryRecordApi::new();
        let store = MemoryStore::new();
        let queue = Arc::new(
            MutationQueue::open(Arc::new(store.clone()), DEFAULT_QUEUE_KEY)
                .await
                .unwrap(),
        );
        let tracker = Arc::new(NetworkStatusTracker::with_state(ConnectivityState::Online));
        let engine = SyncEngine::new(Arc::new(api.clone()), queue.clone(), tracker.clone(), timeout);
        Harness {
            api,
            store,
            queue,
            tracker,
            engine,
        }
    }

    async fn enqueue(
        queue: &MutationQueue,
        id: &str,
        endpoint: &str,
        method: MutationMethod,
        payload: Value,
    ) -> QueuedMutation {
        let m = QueuedMutation::new(Endpoint::parse(endpoint).unwrap(), method, payload)
            .with_local_id(LocalId::new(id).unwrap());
        queue.append(m.clone()).await.unwrap();
        m
    }

    fn completed(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Completed(report) => report,
            DrainOutcome::Skipped(reason) => panic!("pass skipped: {:?}", reason),
        }
    }

    #[tokio::test]
    async fn test_offline_create_synced_on_reconnect() {
        let h = harness(Duration::from_secs(5)).await;
        h.tracker.set_status(ConnectivityState::Offline);
        enqueue(
            &h.queue,
            "a",
            "candidates",
            MutationMethod::Create,
            json!({"name": "Ada"}),
        )
        .await;

        let report = completed(h.engine.drain().await.unwrap());

        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered_ids(), HashSet::from([LocalId::new("a").unwrap()]));
        assert_eq!(report.remaining, 0);
        assert_eq!(report.state, ConnectivityState::Online);
        assert!(h.queue.is_empty().await);
        assert_eq!(h.tracker.current(), ConnectivityState::Online);
        assert_eq!(h.api.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_halts_pass_in_order() {
        let h = harness(Duration::from_secs(5)).await;
        h.api.insert_record("candidates/2", json!({"id": 2}));
        h.api.inject_fault("candidates/2", Fault::Unreachable);

        enqueue(&h.queue, "a", "candidates", MutationMethod::Create, json!({"n": 1})).await;
        let b = enqueue(&h.queue, "b", "candidates/2", MutationMethod::Update, json!({"n": 2})).await;
        let c = enqueue(&h.queue, "c", "candidates", MutationMethod::Create, json!({"n": 3})).await;

        let report = completed(h.engine.drain().await.unwrap());

        assert_eq!(report.attempted, 2);
        assert_eq!(report.halted_at, Some(b.local_id.clone()));
        assert_eq!(report.state, ConnectivityState::Offline);
        assert_eq!(h.queue.all().await, vec![b.clone(), c.clone()]);
        assert_eq!(h.tracker.current(), ConnectivityState::Offline);

        // c was never sent.
        let endpoints: Vec<String> = h.api.calls().iter().map(|c| c.endpoint.to_path()).collect();
        assert_eq!(endpoints, vec!["candidates", "candidates/2"]);

        let ledger = h.engine.ledger();
        let ledger = ledger.read().await;
        assert_eq!(
            ledger.get(&b.local_id).map(|e| e.status),
            Some(DeliveryStatus::Deferred)
        );
    }

    #[tokio::test]
    async fn test_rejection_does_not_halt_pass() {
        let h = harness(Duration::from_secs(5)).await;
        h.api.inject_fault("visas", Fault::Reject("passport number missing".to_string()));

        enqueue(&h.queue, "a", "candidates", MutationMethod::Create, json!({})).await;
        let b = enqueue(&h.queue, "b", "visas", MutationMethod::Create, json!({})).await;
        enqueue(&h.queue, "c", "jobs", MutationMethod::Create, json!({})).await;

        let report = completed(h.engine.drain().await.unwrap());

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].local_id, b.local_id);
        assert!(report.rejected[0].error.contains("passport number missing"));
        assert!(!report.halted());

        assert_eq!(h.queue.all().await, vec![b.clone()]);
        assert_eq!(report.state, ConnectivityState::Offline);

        let ledger = h.engine.ledger();
        let entry = ledger.read().await.get(&b.local_id).cloned().unwrap();
        assert!(entry.is_stuck());
        assert_eq!(entry.failure_count, 1);
    }

    #[tokio::test]
    async fn test_rejected_mutation_resent_every_pass() {
        let h = harness(Duration::from_secs(5)).await;
        h.api.inject_fault("visas", Fault::Reject("invalid".to_string()));
        let m = enqueue(&h.queue, "a", "visas", MutationMethod::Create, json!({})).await;

        completed(h.engine.drain().await.unwrap());
        completed(h.engine.drain().await.unwrap());

        assert_eq!(h.api.calls().len(), 2);
        let ledger = h.engine.ledger();
        assert_eq!(ledger.read().await.get(&m.local_id).unwrap().failure_count, 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_network_failure() {
        let h = harness(Duration::from_millis(50)).await;
        h.api.inject_fault("jobs/1", Fault::Hang);
        let m = enqueue(&h.queue, "a", "jobs/1", MutationMethod::Delete, Value::Null).await;

        let report = completed(h.engine.drain().await.unwrap());

        assert_eq!(report.halted_at, Some(m.local_id));
        assert_eq!(report.remaining, 1);
        assert_eq!(h.tracker.current(), ConnectivityState::Offline);
    }

    #[tokio::test]
    async fn test_empty_queue_leaves_state_alone() {
        let h = harness(Duration::from_secs(5)).await;
        h.tracker.set_status(ConnectivityState::Offline);

        let outcome = h.engine.drain().await.unwrap();

        assert!(matches!(outcome, DrainOutcome::Skipped(SkipReason::EmptyQueue)));
        assert_eq!(h.tracker.current(), ConnectivityState::Offline);
        assert!(h.api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pending_state_skips_pass() {
        let h = harness(Duration::from_secs(5)).await;
        enqueue(&h.queue, "a", "jobs", MutationMethod::Create, json!({})).await;
        h.tracker.set_status(ConnectivityState::Pending);

        let outcome = h.engine.drain().await.unwrap();

        assert!(matches!(outcome, DrainOutcome::Skipped(SkipReason::AlreadyRunning)));
        assert!(h.api.calls().is_empty());
        assert_eq!(h.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_send_each_mutation_once() {
        let h = harness(Duration::from_secs(5)).await;
        for i in 0..5 {
            enqueue(
                &h.queue,
                &format!("m{}", i),
                "candidates",
                MutationMethod::Create,
                json!({"n": i}),
            )
            .await;
        }

        let (first, second) = tokio::join!(h.engine.drain(), h.engine.drain());
        let outcomes = [first.unwrap(), second.unwrap()];

        let completed_count = outcomes.iter().filter(|o| o.report().is_some()).count();
        let total_delivered: usize = outcomes
            .iter()
            .filter_map(|o| o.report())
            .map(|r| r.delivered.len())
            .sum();
        assert!(completed_count >= 1);
        assert_eq!(total_delivered, 5);
        assert_eq!(h.api.calls().len(), 5);
        assert!(h.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_persistence_failure_releases_pending() {
        let h = harness(Duration::from_secs(5)).await;
        enqueue(&h.queue, "a", "jobs", MutationMethod::Create, json!({})).await;
        h.store.set_read_only(true);

        let err = h.engine.drain().await.unwrap_err();

        assert!(err.is_persistence());
        assert_eq!(h.tracker.current(), ConnectivityState::Offline);
        // The server got it; it will be sent again next pass.
        assert_eq!(h.queue.len().await, 1);
        assert!(h.store.get(DEFAULT_QUEUE_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_after_offline_edits() {
        let h = harness(Duration::from_secs(5)).await;
        h.api.insert_record("employers/9", json!({"id": 9, "name": "Acme"}));

        enqueue(&h.queue, "a", "employers/9", MutationMethod::Update, json!({"name": "Acme Ltd"})).await;
        enqueue(&h.queue, "b", "employers/9", MutationMethod::Delete, Value::Null).await;

        let report = completed(h.engine.drain().await.unwrap());

        assert_eq!(report.delivered.len(), 2);
        assert_eq!(report.delivered[0].record, Some(json!({"id": 9, "name": "Acme Ltd"})));
        assert!(h.api.record("employers/9").is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.queue_key, "offline_queue");
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
    }
}
