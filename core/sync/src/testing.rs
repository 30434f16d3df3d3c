//! Storage doubles shared by the queue and manager tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use fiscalgate_common::{Error, Result};
use fiscalgate_storage::{MemorySecureStorage, SecureStorage};

/// In-memory storage whose writes can be switched off, or failed a given
/// number of times.
#[derive(Default)]
pub struct ReadOnlySwitch {
    inner: MemorySecureStorage,
    read_only: AtomicBool,
    failing_writes: AtomicUsize,
}

impl ReadOnlySwitch {
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Fail the next `count` writes on top of any already pending.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.fetch_add(count, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing || self.read_only.load(Ordering::SeqCst) {
            return Err(Error::Storage("disk full".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecureStorage for ReadOnlySwitch {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.remove(key).await
    }
}
