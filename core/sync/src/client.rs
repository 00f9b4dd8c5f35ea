//! Public facade for the offline-first write path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use recsync_common::{Endpoint, Error, LocalId, MutationMethod, RecordRef, Result};
use recsync_remote::RecordApi;
use recsync_storage::{load_json, KeyValueStore};

use crate::connectivity::ConnectivitySource;
use crate::engine::{DrainOutcome, SyncConfig, SyncEngine};
use crate::network::{ConnectivityState, NetworkStatusTracker};
use crate::queue::{MutationQueue, QueuedMutation};
use crate::reconciler::{FetchOutcome, Provenance, Reconciler};
use crate::scheduler::SyncScheduler;
use crate::state::{DeliveryEntry, DeliveryState};
use crate::view::{LocalView, ViewEntry};

/// Delivery status of a write as seen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    /// Waiting in the queue. Not saved on the server.
    Queued,
    /// Still queued; the server refused it and it needs attention.
    Rejected,
    /// No longer queued: delivered, or discarded by the user.
    Settled,
}

/// Receipt for a write accepted into the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWrite {
    pub local_id: LocalId,
    pub status: WriteStatus,
}

/// A queued mutation the server keeps refusing.
#[derive(Debug, Clone, PartialEq)]
pub struct StuckMutation {
    pub mutation: QueuedMutation,
    pub delivery: DeliveryEntry,
}

/// Offline-first client: every write is queued durably first and delivered
/// by drain passes when the server is reachable.
pub struct OfflineClient {
    queue: Arc<MutationQueue>,
    tracker: Arc<NetworkStatusTracker>,
    engine: SyncEngine,
    reconciler: Reconciler,
    view: RwLock<LocalView>,
    config: SyncConfig,
}

impl OfflineClient {
    /// Open the queue in `store` and wire up the engine.
    ///
    /// Mutations left over from a previous run are reapplied to the local
    /// view and wait for the next pass.
    pub async fn open(
        api: Arc<dyn RecordApi>,
        store: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let queue = Arc::new(MutationQueue::open(store.clone(), config.queue_key.clone()).await?);
        let pending = queue.all().await;

        let ledger_key = format!("{}_ledger", config.queue_key);
        let mut ledger = match load_json::<DeliveryState>(store.as_ref(), &ledger_key).await {
            Ok(ledger) => ledger.unwrap_or_default(),
            Err(err) => {
                warn!("Ignoring unreadable delivery ledger: {}", err);
                DeliveryState::new()
            }
        };
        let queued: HashSet<LocalId> = pending.iter().map(|m| m.local_id.clone()).collect();
        ledger.retain_queued(&queued);

        let tracker = Arc::new(NetworkStatusTracker::new());
        let engine = SyncEngine::new(
            api.clone(),
            queue.clone(),
            tracker.clone(),
            config.request_timeout(),
        )
        .with_persisted_ledger(ledger, store, ledger_key);
        let reconciler = Reconciler::new(api, queue.clone(), config.request_timeout());

        let mut view = LocalView::new();
        for mutation in &pending {
            view.apply(mutation);
        }
        if !pending.is_empty() {
            info!("Restored {} queued mutations", pending.len());
        }

        Ok(Self {
            queue,
            tracker,
            engine,
            reconciler,
            view: RwLock::new(view),
            config,
        })
    }

    /// Queue a write.
    ///
    /// The returned status is always `Queued`: the write is durable locally
    /// but has not reached the server.
    pub async fn add_to_queue(
        &self,
        endpoint: Endpoint,
        method: MutationMethod,
        payload: Value,
    ) -> Result<QueuedWrite> {
        if method.carries_payload() && payload.is_null() {
            return Err(Error::InvalidInput(format!(
                "{} to {} needs a payload",
                method, endpoint
            )));
        }
        self.enqueue(QueuedMutation::new(endpoint, method, payload)).await
    }

    /// Queue a prepared mutation.
    pub async fn enqueue(&self, mutation: QueuedMutation) -> Result<QueuedWrite> {
        self.queue.append(mutation.clone()).await?;
        self.view.write().await.apply(&mutation);

        info!(
            "Queued {} {} as {}",
            mutation.method, mutation.endpoint, mutation.local_id
        );
        Ok(QueuedWrite {
            local_id: mutation.local_id,
            status: WriteStatus::Queued,
        })
    }

    /// Current connectivity state.
    pub fn current_network_status(&self) -> ConnectivityState {
        self.tracker.current()
    }

    /// Subscribe to connectivity transitions.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectivityState> {
        self.tracker.subscribe()
    }

    /// Shared connectivity tracker.
    pub fn tracker(&self) -> Arc<NetworkStatusTracker> {
        self.tracker.clone()
    }

    /// Run a drain pass now and settle the local view.
    pub async fn trigger_sync(&self) -> Result<DrainOutcome> {
        let outcome = self.engine.drain().await?;
        if let DrainOutcome::Completed(report) = &outcome {
            self.view.write().await.settle(&report.delivered);
        }
        Ok(outcome)
    }

    /// Read a record, preferring the server's copy.
    pub async fn fetch_record(&self, record: &RecordRef) -> FetchOutcome {
        let outcome = self.reconciler.fetch_record(record).await;
        if let FetchOutcome::Found {
            data,
            provenance: Provenance::Authoritative,
        } = &outcome
        {
            self.view
                .write()
                .await
                .replace_authoritative(record.clone(), data.clone());
        }
        outcome
    }

    /// Number of queued mutations.
    pub async fn pending_count(&self) -> usize {
        self.queue.len().await
    }

    /// Snapshot of the queue in delivery order.
    pub async fn queued(&self) -> Vec<QueuedMutation> {
        self.queue.all().await
    }

    /// Delivery status of a write.
    pub async fn write_status(&self, local_id: &LocalId) -> WriteStatus {
        if self.queue.get(local_id).await.is_none() {
            return WriteStatus::Settled;
        }
        let ledger = self.engine.ledger();
        let ledger = ledger.read().await;
        match ledger.get(local_id) {
            Some(entry) if entry.is_stuck() => WriteStatus::Rejected,
            _ => WriteStatus::Queued,
        }
    }

    /// Queued mutations the server has refused, oldest rejection first.
    pub async fn stuck_mutations(&self) -> Vec<StuckMutation> {
        let queued = self.queue.all().await;
        let ledger = self.engine.ledger();
        let ledger = ledger.read().await;

        let mut stuck: Vec<StuckMutation> = queued
            .into_iter()
            .filter_map(|mutation| {
                let delivery = ledger.get(&mutation.local_id)?.clone();
                delivery.is_stuck().then_some(StuckMutation { mutation, delivery })
            })
            .collect();
        stuck.sort_by_key(|s| s.delivery.last_attempt);
        stuck
    }

    /// Drop a queued mutation without sending it.
    ///
    /// Returns `false` if nothing with that id was queued.
    pub async fn discard(&self, local_id: &LocalId) -> Result<bool> {
        let ids = HashSet::from([local_id.clone()]);
        let removed = self.queue.remove_by_ids(&ids).await?;

        self.engine.ledger().write().await.clear(&ids);
        self.engine.persist_ledger().await;
        self.view.write().await.forget(&ids);

        if removed > 0 {
            warn!("Discarded queued mutation {}", local_id);
        }
        Ok(removed > 0)
    }

    /// Swap the payload of a queued mutation.
    ///
    /// A corrected mutation for the same endpoint and method takes the old
    /// one's place at the back of the queue. The swap is a single queue
    /// write: if it fails, the old mutation stays queued.
    pub async fn replace(&self, local_id: &LocalId, payload: Value) -> Result<QueuedWrite> {
        let original = self
            .queue
            .get(local_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("No queued mutation {}", local_id)))?;
        if original.method.carries_payload() && payload.is_null() {
            return Err(Error::InvalidInput(format!(
                "{} to {} needs a payload",
                original.method, original.endpoint
            )));
        }

        let replacement = QueuedMutation::new(original.endpoint.clone(), original.method, payload);
        self.queue.replace(local_id, replacement.clone()).await?;

        let ids = HashSet::from([local_id.clone()]);
        self.engine.ledger().write().await.clear(&ids);
        self.engine.persist_ledger().await;
        {
            let mut view = self.view.write().await;
            view.forget(&ids);
            view.apply(&replacement);
        }

        info!("Replaced queued mutation {} with {}", local_id, replacement.local_id);
        Ok(QueuedWrite {
            local_id: replacement.local_id,
            status: WriteStatus::Queued,
        })
    }

    /// Local display state of a record.
    pub async fn view(&self, record: &RecordRef) -> Option<ViewEntry> {
        self.view.read().await.get(record).cloned()
    }

    /// Configuration in use.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Spawn the background scheduler fed by `source`.
    pub fn start_scheduler<S>(self: &Arc<Self>, source: S) -> (SyncScheduler, JoinHandle<()>)
    where
        S: ConnectivitySource + 'static,
    {
        let (scheduler, handle) = SyncScheduler::new(
            self.config.sync_mode.clone(),
            self.config.retry.clone(),
            self.tracker.clone(),
        );
        let client = self.clone();
        let task = tokio::spawn(handle.run(source, move || {
            let client = client.clone();
            async move { client.trigger_sync().await }
        }));
        (scheduler, task)
    }
}
