//! In-memory adapters for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use fiscalgate_common::{system_clock, Error, Result, SharedClock};

use crate::cache::{CacheAdapter, CachedItem};
use crate::glob::GlobPattern;
use crate::secure::SecureStorage;

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
}

/// In-memory secure storage.
///
/// All data is lost on drop. Clones share the same map, which lets tests
/// simulate a process restart by building new components over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemorySecureStorage {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl MemorySecureStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.read().map(|v| v.len()).unwrap_or(0)
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SecureStorage for MemorySecureStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(read_lock(&self.values)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        write_lock(&self.values)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        write_lock(&self.values)?.remove(key);
        Ok(())
    }
}

/// In-memory response cache.
pub struct MemoryCacheAdapter {
    items: Arc<RwLock<HashMap<String, CachedItem>>>,
    clock: SharedClock,
}

impl MemoryCacheAdapter {
    /// Create an empty cache using the system clock for timestamps.
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create an empty cache stamping items with `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            items: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Drop every expired item.
    ///
    /// # Returns
    /// Number of removed entries.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut items = write_lock(&self.items)?;
        let before = items.len();
        items.retain(|_, item| !item.is_expired_at(now));
        Ok(before - items.len())
    }
}

impl Default for MemoryCacheAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheAdapter for MemoryCacheAdapter {
    async fn get(&self, key: &str) -> Result<Option<CachedItem>> {
        Ok(read_lock(&self.items)?.get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        data: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let item = CachedItem::from_server(data, self.clock.now(), ttl);
        self.set_item(key, item).await
    }

    async fn set_item(&self, key: &str, item: CachedItem) -> Result<()> {
        write_lock(&self.items)?.insert(key.to_string(), item);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let pattern = GlobPattern::new(pattern)?;
        let mut items = write_lock(&self.items)?;
        let before = items.len();
        items.retain(|key, _| !pattern.matches(key));
        Ok(before - items.len())
    }

    async fn clear(&self) -> Result<()> {
        write_lock(&self.items)?.clear();
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(read_lock(&self.items)?.len())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = read_lock(&self.items)?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
