//! Response cache contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use fiscalgate_common::types::option_duration_ms;
use fiscalgate_common::{clock::elapsed_between, Result};

/// Where a cached value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    /// Written from a server response.
    Server,
    /// Written locally (optimistic or offline copy).
    Local,
}

/// Whether a cached value has been confirmed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSyncStatus {
    Synced,
    Pending,
    Failed,
}

/// One cached response, keyed by normalized request URL.
///
/// Items are immutable once written; updates replace the whole item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedItem {
    /// Response payload.
    pub data: serde_json::Value,
    /// When the item was written.
    pub timestamp: DateTime<Utc>,
    /// Time-to-live; `None` never expires.
    #[serde(default, with = "option_duration_ms")]
    pub ttl: Option<Duration>,
    #[serde(default)]
    pub source: Option<CacheSource>,
    #[serde(default)]
    pub sync_status: Option<CacheSyncStatus>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CachedItem {
    /// Create an item written from a server response at `timestamp`.
    pub fn from_server(
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            data,
            timestamp,
            ttl,
            source: Some(CacheSource::Server),
            sync_status: Some(CacheSyncStatus::Synced),
            tags: Vec::new(),
        }
    }

    /// Attach tags.
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Age of the item at `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.timestamp, now)
    }

    /// Whether the item is past its TTL at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(ttl) => self.age_at(now) >= ttl,
            None => false,
        }
    }
}

/// Response cache used by the strategy engine.
///
/// Keys are normalized request URLs (path plus query string).
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Look up an item, expired or not.
    async fn get(&self, key: &str) -> Result<Option<CachedItem>>;

    /// Store a server response under `key` with an optional TTL.
    async fn set(
        &self,
        key: &str,
        data: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Store a fully built item.
    async fn set_item(&self, key: &str, item: CachedItem) -> Result<()>;

    /// Remove every key matching a `*` wildcard pattern.
    ///
    /// # Returns
    /// Number of removed entries.
    async fn invalidate(&self, pattern: &str) -> Result<usize>;

    /// Remove everything.
    async fn clear(&self) -> Result<()>;

    /// Number of stored entries.
    async fn size(&self) -> Result<usize>;

    /// All stored keys.
    async fn keys(&self) -> Result<Vec<String>>;
}
