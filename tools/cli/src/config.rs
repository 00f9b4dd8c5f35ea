//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use recsync_remote::HttpRecordApi;
use recsync_storage::{create_default_registry, KeyValueStore};
use recsync_sync::{HttpProbe, SyncConfig};

/// Name of the config file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "recsync.json";

/// Settings read from `recsync.json`; command-line flags override them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Base URL of the record API, e.g. `http://192.168.1.20:3000/api/`.
    pub server_url: Option<String>,
    /// Where the queue lives. Defaults to the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Bearer token sent with every request.
    pub auth_token: Option<String>,
    /// URL polled to detect connectivity. Defaults to the server URL.
    pub health_url: Option<String>,
    /// Seconds between connectivity probes in `watch`.
    pub probe_interval_secs: Option<u64>,
    /// Store configuration for the store registry, e.g.
    /// `{"type": "local", "root": "/var/lib/recsync"}`.
    pub store: Option<Value>,
    pub sync: SyncConfig,
}

impl CliConfig {
    /// Load the config file.
    ///
    /// An explicitly given path must exist; the default location may be
    /// missing, in which case defaults are used.
    pub fn load(explicit: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let dir = match data_dir {
                    Some(dir) => dir.to_path_buf(),
                    None => default_data_dir()?,
                };
                let path = dir.join(CONFIG_FILE_NAME);
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Data directory in effect.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    /// Open the configured store, a local store in the data directory by
    /// default.
    pub fn open_store(&self) -> Result<Arc<dyn KeyValueStore>> {
        let store_config = match &self.store {
            Some(config) => config.clone(),
            None => json!({
                "type": "local",
                "root": self.data_dir()?.join("queue"),
            }),
        };

        create_default_registry()
            .resolve_config(&store_config)
            .context("Failed to open queue store")
    }

    /// Build the HTTP record API client.
    pub fn open_api(&self) -> Result<HttpRecordApi> {
        let server_url = self
            .server_url
            .as_deref()
            .context("No server configured: pass --server or set server_url in the config file")?;

        let api = HttpRecordApi::new(server_url, self.sync.request_timeout())
            .with_context(|| format!("Invalid server URL '{}'", server_url))?;
        Ok(match &self.auth_token {
            Some(token) => api.with_auth_token(token.clone()),
            None => api,
        })
    }

    /// Build the connectivity probe used by `status` and `watch`.
    pub fn open_probe(&self) -> Result<HttpProbe> {
        let url = self
            .health_url
            .as_deref()
            .or(self.server_url.as_deref())
            .context("No health URL or server configured")?;
        let interval = Duration::from_secs(self.probe_interval_secs.unwrap_or(10));

        HttpProbe::new(url, interval, self.sync.request_timeout())
            .with_context(|| format!("Invalid health URL '{}'", url))
    }
}

/// `{platform data dir}/recsync`.
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("recsync"))
        .context("Could not determine the platform data directory; pass --data-dir")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_default_config_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = CliConfig::load(None, Some(temp.path())).unwrap();
        assert!(config.server_url.is_none());
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        assert!(CliConfig::load(Some(&temp.path().join("nope.json")), None).is_err());
    }

    #[test]
    fn test_partial_config_file() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE_NAME),
            r#"{"server_url": "http://10.0.0.2:3000/api/", "sync": {"request_timeout_ms": 500}}"#,
        )
        .unwrap();

        let config = CliConfig::load(None, Some(temp.path())).unwrap();
        assert_eq!(config.server_url.as_deref(), Some("http://10.0.0.2:3000/api/"));
        assert_eq!(config.sync.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.sync.queue_key, "offline_queue");
    }

    #[test]
    fn test_open_store_defaults_to_local() {
        let temp = TempDir::new().unwrap();
        let config = CliConfig {
            data_dir: Some(temp.path().to_path_buf()),
            ..CliConfig::default()
        };

        let store = config.open_store().unwrap();
        assert_eq!(store.name(), "local");
        assert!(temp.path().join("queue").is_dir());
    }

    #[test]
    fn test_open_api_requires_server() {
        assert!(CliConfig::default().open_api().is_err());

        let config = CliConfig {
            server_url: Some("http://127.0.0.1:3000/api/".to_string()),
            ..CliConfig::default()
        };
        assert!(config.open_api().is_ok());
    }
}
