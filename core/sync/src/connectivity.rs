//! Device connectivity signal sources.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use recsync_common::{Error, Result};

use crate::network::ConnectivityEvent;

/// Stream of connectivity reports from the device.
///
/// Returns `None` once the source is exhausted; the scheduler then stops.
#[async_trait]
pub trait ConnectivitySource: Send {
    async fn next_event(&mut self) -> Option<ConnectivityEvent>;
}

/// Create a channel-backed source and the handle that feeds it.
pub fn channel(buffer: usize) -> (ConnectivityHandle, ChannelSource) {
    let (tx, rx) = mpsc::channel(buffer);
    (ConnectivityHandle { tx }, ChannelSource { rx })
}

/// Sending half: platform glue reports connectivity changes through it.
#[derive(Clone)]
pub struct ConnectivityHandle {
    tx: mpsc::Sender<ConnectivityEvent>,
}

impl ConnectivityHandle {
    /// Report a connectivity change.
    ///
    /// # Errors
    /// Fails if the receiving source has been dropped.
    pub async fn report(&self, event: ConnectivityEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::InvalidInput("Connectivity listener is gone".to_string()))
    }
}

/// Receiving half of [`channel`].
pub struct ChannelSource {
    rx: mpsc::Receiver<ConnectivityEvent>,
}

#[async_trait]
impl ConnectivitySource for ChannelSource {
    async fn next_event(&mut self) -> Option<ConnectivityEvent> {
        self.rx.recv().await
    }
}

/// Polls a health URL and reports reachability changes.
///
/// Any HTTP response counts as reachable; a transport failure or timeout
/// counts as disconnected. Only changes are reported, the first probe
/// always is.
pub struct HttpProbe {
    http: reqwest::Client,
    url: Url,
    interval: Duration,
    last: Option<bool>,
}

impl HttpProbe {
    /// Create a probe against `url`.
    pub fn new(url: &str, interval: Duration, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| Error::Config(format!("Invalid health URL '{}': {}", url, e)))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            url,
            interval,
            last: None,
        })
    }

    async fn probe(&self) -> bool {
        match self.http.get(self.url.clone()).send().await {
            Ok(response) => {
                trace!("Health probe {} -> {}", self.url, response.status());
                true
            }
            Err(err) => {
                trace!("Health probe {} failed: {}", self.url, err);
                false
            }
        }
    }
}

#[async_trait]
impl ConnectivitySource for HttpProbe {
    async fn next_event(&mut self) -> Option<ConnectivityEvent> {
        loop {
            if self.last.is_some() {
                tokio::time::sleep(self.interval).await;
            }
            let reachable = self.probe().await;
            if self.last != Some(reachable) {
                debug!(
                    "Health probe: {} is {}",
                    self.url,
                    if reachable { "reachable" } else { "unreachable" }
                );
                self.last = Some(reachable);
                return Some(ConnectivityEvent {
                    is_connected: reachable,
                    is_internet_reachable: Some(reachable),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConnectivityState;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_channel_source() {
        let (handle, mut source) = channel(4);
        handle.report(ConnectivityEvent::connected()).await.unwrap();
        handle.report(ConnectivityEvent::disconnected()).await.unwrap();
        drop(handle);

        assert_eq!(source.next_event().await, Some(ConnectivityEvent::connected()));
        assert_eq!(source.next_event().await, Some(ConnectivityEvent::disconnected()));
        assert_eq!(source.next_event().await, None);
    }

    #[tokio::test]
    async fn test_report_after_source_dropped() {
        let (handle, source) = channel(1);
        drop(source);
        assert!(handle.report(ConnectivityEvent::connected()).await.is_err());
    }

    #[test]
    fn test_probe_rejects_bad_url() {
        assert!(HttpProbe::new("not a url", Duration::from_secs(1), Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_probe_reports_reachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });

        let mut probe = HttpProbe::new(
            &format!("http://{}/health", addr),
            Duration::from_secs(60),
            Duration::from_secs(2),
        )
        .unwrap();

        let event = probe.next_event().await.unwrap();
        assert_eq!(event.status(), ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_probe_reports_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut probe = HttpProbe::new(
            &format!("http://{}/health", addr),
            Duration::from_secs(60),
            Duration::from_secs(2),
        )
        .unwrap();

        let event = probe.next_event().await.unwrap();
        assert_eq!(event.status(), ConnectivityState::Offline);
    }
}
