//! Client configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use fiscalgate_auth::AuthConfig;
use fiscalgate_cache::CacheConfig;
use fiscalgate_common::types::duration_ms;
use fiscalgate_common::{Error, Result};
use fiscalgate_sync::{OfflineConfig, QueueConfig, SyncConfig};

/// Default port of the mTLS endpoint.
pub const DEFAULT_MTLS_PORT: u16 = 444;

/// Everything needed to wire a [`FiscalClient`](crate::FiscalClient).
///
/// Every section has defaults, so a minimal file only names the API:
///
/// ```json
/// { "api_base_url": "https://api.example.com" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the bearer-token endpoint.
    pub api_base_url: String,
    /// Port of the mTLS endpoint on the same host.
    pub mtls_port: u16,
    /// Per-call timeout.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Path probed to confirm reachability and mTLS readiness.
    pub probe_path: String,
    pub auth: AuthConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    pub offline: OfflineConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            mtls_port: DEFAULT_MTLS_PORT,
            request_timeout: Duration::from_secs(30),
            probe_path: "/".to_string(),
            auth: AuthConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            sync: SyncConfig::default(),
            offline: OfflineConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for `api_base_url` with default sections.
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_mtls_port(mut self, port: u16) -> Self {
        self.mtls_port = port;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_probe_path(mut self, path: impl Into<String>) -> Self {
        self.probe_path = path.into();
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_offline(mut self, offline: OfflineConfig) -> Self {
        self.offline = offline;
        self
    }

    /// URL probed by the network monitor.
    pub fn probe_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            self.probe_path.trim_start_matches('/')
        )
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Read a JSON configuration file.
    ///
    /// # Errors
    /// - File read failure
    /// - Invalid JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}
