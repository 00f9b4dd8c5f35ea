//! recsync Sync Engine
//!
//! Offline-first write path for the record API, including:
//! - Durable FIFO mutation queue
//! - Tri-state connectivity tracking (online / offline / pending)
//! - Drain passes that halt on network failure and skip past rejections
//! - Read fallback to queued writes when the server is unreachable
//! - Connectivity-driven scheduling with exponential backoff

pub mod client;
pub mod connectivity;
pub mod engine;
pub mod network;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod view;

// Re-export main types
pub use client::{OfflineClient, QueuedWrite, StuckMutation, WriteStatus};
pub use connectivity::{channel, ChannelSource, ConnectivityHandle, ConnectivitySource, HttpProbe};
pub use engine::{
    Delivery, DrainOutcome, DrainReport, Rejection, SkipReason, SyncConfig, SyncEngine,
};
pub use network::{ConnectivityEvent, ConnectivityState, NetworkStatusTracker};
pub use queue::{MutationQueue, QueuedMutation, DEFAULT_QUEUE_KEY};
pub use reconciler::{FetchOutcome, Provenance, Reconciler};
pub use retry::RetryConfig;
pub use scheduler::{SyncMode, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{DeliveryEntry, DeliveryState, DeliveryStatus};
pub use view::{LocalView, ViewEntry, ViewState};
