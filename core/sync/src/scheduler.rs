//! Sync scheduling: connectivity-driven, periodic and on-request drain passes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use recsync_common::{Error, Result};

use crate::connectivity::ConnectivitySource;
use crate::engine::DrainOutcome;
use crate::network::{ConnectivityState, NetworkStatusTracker};
use crate::retry::RetryConfig;

/// When drain passes start without being asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// Only explicit requests drain. Connectivity events still update the
    /// tracker.
    Manual,
    /// Drain whenever connectivity comes back.
    OnReconnect,
    /// Drain on reconnect and every `interval_secs` while connected.
    Periodic { interval_secs: u64 },
}

impl SyncMode {
    fn drains_on_reconnect(&self) -> bool {
        !matches!(self, SyncMode::Manual)
    }

    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval_secs } => Some(Duration::from_secs((*interval_secs).max(1))),
            _ => None,
        }
    }
}

/// Sync request types.
#[derive(Debug)]
pub enum SyncRequest {
    /// Run a drain pass now.
    Drain,
    /// Shutdown the scheduler.
    Shutdown,
}

type Reply = oneshot::Sender<Result<DrainOutcome>>;

/// Control side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<(SyncRequest, Option<Reply>)>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(
        mode: SyncMode,
        retry: RetryConfig,
        tracker: Arc<NetworkStatusTracker>,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);

        let handle = SyncSchedulerHandle {
            mode,
            tracker,
            backoff: Backoff::new(retry),
            request_rx,
        };

        (Self { request_tx }, handle)
    }

    /// Ask the running scheduler for a drain pass and wait for its outcome.
    pub async fn request_sync(&self) -> Result<DrainOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((SyncRequest::Drain, Some(response_tx)))
            .await
            .map_err(|_| Error::InvalidInput("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidInput("Scheduler stopped before replying".to_string()))?
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send((SyncRequest::Shutdown, None)).await;
    }
}

/// Retry bookkeeping after passes that halted on a network failure.
struct Backoff {
    config: RetryConfig,
    attempt: u32,
    due: Option<Instant>,
}

impl Backoff {
    fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt: 0,
            due: None,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
        self.due = None;
    }

    fn after_pass(&mut self, result: &Result<DrainOutcome>, device_online: bool) {
        let report = match result {
            Ok(DrainOutcome::Completed(report)) => report,
            Ok(DrainOutcome::Skipped(_)) => return,
            Err(_) => {
                self.due = None;
                return;
            }
        };

        if !report.halted() {
            self.reset();
            return;
        }
        if !device_online {
            self.due = None;
            return;
        }
        if self.attempt >= self.config.max_retries {
            warn!(
                "Drain still halting after {} retries; waiting for the next connectivity change",
                self.attempt
            );
            self.due = None;
            return;
        }

        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt += 1;
        info!(
            "Drain halted with {} queued; retry {}/{} in {:?}",
            report.remaining, self.attempt, self.config.max_retries, delay
        );
        self.due = Some(Instant::now() + delay);
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: SyncMode,
    tracker: Arc<NetworkStatusTracker>,
    backoff: Backoff,
    request_rx: mpsc::Receiver<(SyncRequest, Option<Reply>)>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. `sync_fn` runs one drain
    /// pass. Returns when `source` is exhausted or on shutdown.
    pub async fn run<S, F, Fut>(mut self, mut source: S, sync_fn: F)
    where
        S: ConnectivitySource,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<DrainOutcome>> + Send,
    {
        let mut periodic = self.mode.interval().map(|period| {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks
        });
        let mut seen_report = false;
        let mut device_online = false;

        info!("Sync scheduler started ({:?})", self.mode);

        loop {
            let start_pass = tokio::select! {
                event = source.next_event() => {
                    let Some(event) = event else {
                        info!("Connectivity source closed, stopping scheduler");
                        break;
                    };
                    let status = event.status();
                    device_online = status == ConnectivityState::Online;
                    self.backoff.reset();

                    if seen_report && self.tracker.current() == ConnectivityState::Pending {
                        debug!("Connectivity {} reported during a drain pass; ignored", status);
                        false
                    } else {
                        seen_report = true;
                        info!("Connectivity changed: {}", status);
                        self.tracker.set_status(status);
                        device_online && self.mode.drains_on_reconnect()
                    }
                }

                request = self.request_rx.recv() => match request {
                    Some((SyncRequest::Drain, reply)) => {
                        debug!("Processing drain request");
                        let result = sync_fn().await;
                        Self::log_result("Requested", &result);
                        self.backoff.after_pass(&result, device_online);
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                        false
                    }
                    Some((SyncRequest::Shutdown, _)) | None => {
                        info!("Sync scheduler shutting down");
                        break;
                    }
                },

                _ = Self::wait_for_retry(self.backoff.due) => {
                    self.backoff.due = None;
                    debug!("Backoff elapsed, retrying drain");
                    true
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    device_online && self.tracker.current() != ConnectivityState::Pending
                }
            };

            if start_pass {
                let result = sync_fn().await;
                Self::log_result("Automatic", &result);
                self.backoff.after_pass(&result, device_online);
            }
        }
    }

    fn log_result(kind: &str, result: &Result<DrainOutcome>) {
        match result {
            Ok(DrainOutcome::Completed(report)) => info!(
                "{} drain completed: {} delivered, {} rejected, {} remaining",
                kind,
                report.delivered.len(),
                report.rejected.len(),
                report.remaining
            ),
            Ok(DrainOutcome::Skipped(reason)) => debug!("{} drain skipped: {:?}", kind, reason),
            Err(e) => error!("{} drain failed: {}", kind, e),
        }
    }

    async fn wait_for_retry(due: Option<Instant>) {
        match due {
            Some(due) => sleep_until(due).await,
            None => std::future::pending().await,
        }
    }

    async fn wait_for_periodic(interval: &mut Option<Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::channel;
    use crate::engine::{DrainReport, SkipReason};
    use crate::network::ConnectivityEvent;
    use recsync_common::LocalId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn report(halted: bool) -> DrainOutcome {
        DrainOutcome::Completed(DrainReport {
            attempted: 1,
            delivered: Vec::new(),
            rejected: Vec::new(),
            halted_at: halted.then(|| LocalId::new("a").unwrap()),
            remaining: usize::from(halted),
            state: if halted {
                ConnectivityState::Offline
            } else {
                ConnectivityState::Online
            },
            duration: Duration::from_millis(1),
        })
    }

    fn counting(
        count: Arc<AtomicU32>,
    ) -> impl Fn() -> std::future::Ready<Result<DrainOutcome>> + Send + Sync {
        move || {
            count.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(report(false)))
        }
    }

    async fn wait_for(count: &AtomicU32, expected: u32) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_first_report_sets_state_without_pass() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let (_scheduler, handle) =
            SyncScheduler::new(SyncMode::OnReconnect, RetryConfig::default(), tracker.clone());
        let (events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        events.report(ConnectivityEvent::disconnected()).await.unwrap();
        drop(events);
        handle.run(source, counting(count.clone())).await;

        assert_eq!(tracker.current(), ConnectivityState::Offline);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconnect_triggers_pass() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let (_scheduler, handle) =
            SyncScheduler::new(SyncMode::OnReconnect, RetryConfig::default(), tracker.clone());
        let (events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        events.report(ConnectivityEvent::disconnected()).await.unwrap();
        events.report(ConnectivityEvent::connected()).await.unwrap();
        drop(events);
        handle.run(source, counting(count.clone())).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manual_mode_only_tracks_state() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let (_scheduler, handle) =
            SyncScheduler::new(SyncMode::Manual, RetryConfig::default(), tracker.clone());
        let (events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        events.report(ConnectivityEvent::connected()).await.unwrap();
        drop(events);
        handle.run(source, counting(count.clone())).await;

        assert_eq!(tracker.current(), ConnectivityState::Online);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_event_during_pass_is_ignored() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let (_scheduler, handle) =
            SyncScheduler::new(SyncMode::OnReconnect, RetryConfig::default(), tracker.clone());
        let (events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        // First report is applied, then an external pass holds Pending.
        events.report(ConnectivityEvent::disconnected()).await.unwrap();
        let task = tokio::spawn(handle.run(source, counting(count.clone())));
        tokio::time::timeout(Duration::from_secs(5), async {
            while tracker.current() != ConnectivityState::Offline {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(tracker.try_begin_pass());

        events.report(ConnectivityEvent::connected()).await.unwrap();
        drop(events);
        task.await.unwrap();

        assert_eq!(tracker.current(), ConnectivityState::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_request_sync_and_shutdown() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let (scheduler, handle) =
            SyncScheduler::new(SyncMode::Manual, RetryConfig::default(), tracker);
        let (_events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        let task = tokio::spawn(handle.run(source, counting(count.clone())));

        let outcome = scheduler.request_sync().await.unwrap();
        assert!(outcome.report().is_some());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.shutdown().await;
        task.await.unwrap();
        assert!(scheduler.request_sync().await.is_err());
    }

    #[tokio::test]
    async fn test_halted_pass_is_retried_with_backoff() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(false);
        let (scheduler, handle) = SyncScheduler::new(SyncMode::OnReconnect, retry, tracker);
        let (events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        let calls = count.clone();
        let task = tokio::spawn(handle.run(source, move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            // Halts twice, then drains.
            std::future::ready(Ok(report(n < 2)))
        }));

        events.report(ConnectivityEvent::connected()).await.unwrap();
        wait_for(&count, 3).await;

        // Nothing further is scheduled once a pass completes.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_are_capped() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let retry = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false);
        let (scheduler, handle) = SyncScheduler::new(SyncMode::OnReconnect, retry, tracker);
        let (events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        let calls = count.clone();
        let task = tokio::spawn(handle.run(source, move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(report(true)))
        }));

        events.report(ConnectivityEvent::connected()).await.unwrap();
        wait_for(&count, 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Initial pass + 2 retries.
        assert_eq!(count.load(Ordering::SeqCst), 3);

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_mode_drains_while_connected() {
        let tracker = Arc::new(NetworkStatusTracker::new());
        let (scheduler, handle) = SyncScheduler::new(
            SyncMode::Periodic { interval_secs: 1 },
            RetryConfig::default(),
            tracker,
        );
        let (events, source) = channel(4);
        let count = Arc::new(AtomicU32::new(0));

        let calls = count.clone();
        let task = tokio::spawn(handle.run(source, move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(DrainOutcome::Skipped(SkipReason::EmptyQueue)))
        }));

        events.report(ConnectivityEvent::connected()).await.unwrap();
        // Reconnect pass, then at least one tick.
        wait_for(&count, 2).await;

        scheduler.shutdown().await;
        task.await.unwrap();
    }

    #[test]
    fn test_mode_serialization() {
        let mode: SyncMode =
            serde_json::from_str(r#"{"mode": "periodic", "interval_secs": 30}"#).unwrap();
        assert_eq!(mode, SyncMode::Periodic { interval_secs: 30 });
        assert_eq!(mode.interval(), Some(Duration::from_secs(30)));

        let manual: SyncMode = serde_json::from_str(r#"{"mode": "manual"}"#).unwrap();
        assert!(!manual.drains_on_reconnect());
    }
}
