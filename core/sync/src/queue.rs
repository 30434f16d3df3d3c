//! Durable priority queue of offline mutations.
//!
//! The whole queue is stored as one JSON array under a single secure-storage
//! key and rewritten on every mutation. Entries are kept in drain order:
//! highest priority first, oldest first within a priority.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fiscalgate_common::{system_clock, Error, HttpMethod, Result, SharedClock};
use fiscalgate_storage::SecureStorage;

use crate::operation::{OperationStatus, OperationType, Priority, QueuedOperation};

/// Storage key of the persisted queue.
pub const DEFAULT_QUEUE_KEY: &str = "offline_queue";

/// Queue limits and persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub storage_key: String,
    /// Maximum number of entries, failed ones included.
    pub capacity: usize,
    /// Retry budget given to new entries.
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_key: DEFAULT_QUEUE_KEY.to_string(),
            capacity: 1000,
            default_max_retries: 3,
        }
    }
}

/// Entry counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub total: usize,
}

/// Persisted, capacity-bounded queue of [`QueuedOperation`]s.
pub struct OfflineOperationQueue {
    storage: Arc<dyn SecureStorage>,
    config: QueueConfig,
    clock: SharedClock,
    operations: Mutex<Vec<QueuedOperation>>,
}

impl OfflineOperationQueue {
    /// Load the queue from storage.
    ///
    /// # Postconditions
    /// - Entries left in `processing` by a crash are back to `pending`
    /// - Entries are in drain order
    ///
    /// # Errors
    /// - Storage read failure
    /// - `Error::Serialization` if the stored array is corrupt
    pub async fn load(
        storage: Arc<dyn SecureStorage>,
        config: QueueConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut operations: Vec<QueuedOperation> = match storage.get(&config.storage_key).await? {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };

        let now = clock.now();
        let mut recovered = 0;
        for op in operations.iter_mut() {
            if op.status == OperationStatus::Processing {
                op.status = OperationStatus::Pending;
                op.updated_at = now;
                recovered += 1;
            }
        }
        sort_for_drain(&mut operations);

        let queue = Self {
            storage,
            config,
            clock,
            operations: Mutex::new(operations),
        };

        if recovered > 0 {
            warn!(recovered, "Recovered operations interrupted mid-flight");
            let operations = queue.operations.lock().await;
            queue.persist(&operations).await?;
        }

        info!(
            entries = queue.operations.lock().await.len(),
            "Loaded offline queue"
        );
        Ok(queue)
    }

    /// Load using the system clock.
    pub async fn open(storage: Arc<dyn SecureStorage>, config: QueueConfig) -> Result<Self> {
        Self::load(storage, config, system_clock()).await
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn persist(&self, operations: &[QueuedOperation]) -> Result<()> {
        let json = serde_json::to_string(operations)?;
        self.storage.set(&self.config.storage_key, &json).await
    }

    /// Apply `f` to a copy of the queue, persist the copy, then swap it in.
    ///
    /// A failed write leaves the in-memory queue untouched.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<QueuedOperation>, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let mut operations = self.operations.lock().await;
        let mut next = operations.clone();
        let out = f(&mut next, self.clock.now())?;
        self.persist(&next).await?;
        *operations = next;
        Ok(out)
    }

    /// Add an operation.
    ///
    /// When the queue is full, the oldest pending entry of the lowest
    /// priority not above `priority` is evicted to make room.
    ///
    /// # Errors
    /// - `Error::QueueFull` if the queue is full and nothing is evictable
    /// - Storage write failure
    pub async fn enqueue(
        &self,
        op_type: OperationType,
        resource: &str,
        endpoint: &str,
        method: HttpMethod,
        payload: Option<serde_json::Value>,
        priority: Priority,
    ) -> Result<String> {
        let capacity = self.config.capacity;
        let max_retries = self.config.default_max_retries;

        self.mutate(|ops, now| {
            if ops.len() >= capacity {
                let victim = ops
                    .iter()
                    .enumerate()
                    .filter(|(_, op)| op.status == OperationStatus::Pending && op.priority <= priority)
                    .min_by_key(|(_, op)| (op.priority, op.created_at))
                    .map(|(i, _)| i);

                match victim {
                    Some(i) => {
                        let evicted = ops.remove(i);
                        warn!(
                            id = %evicted.id,
                            endpoint = %evicted.endpoint,
                            "Queue full, evicted pending operation"
                        );
                    }
                    None => return Err(Error::QueueFull(capacity)),
                }
            }

            let op = QueuedOperation::new(
                op_type,
                resource,
                endpoint,
                method,
                payload,
                priority,
                max_retries,
                now,
            );
            let id = op.id.clone();
            let position = ops
                .iter()
                .position(|existing| existing.priority < priority)
                .unwrap_or(ops.len());
            ops.insert(position, op);
            debug!(id = %id, endpoint, ?priority, "Enqueued operation");
            Ok(id)
        })
        .await
    }

    /// Hand out up to `max_batch_size` due pending operations in drain
    /// order, marking them `processing`.
    pub async fn dequeue_batch(&self, max_batch_size: usize) -> Result<Vec<QueuedOperation>> {
        self.mutate(|ops, now| {
            let mut batch = Vec::new();
            for op in ops.iter_mut() {
                if batch.len() >= max_batch_size {
                    break;
                }
                if op.is_due(now) {
                    op.mark_processing(now);
                    batch.push(op.clone());
                }
            }
            Ok(batch)
        })
        .await
    }

    /// Hand out one specific pending operation, marking it `processing`.
    ///
    /// Returns `None` if the entry is missing or not pending.
    pub async fn dequeue_by_id(&self, id: &str) -> Result<Option<QueuedOperation>> {
        self.mutate(|ops, now| {
            Ok(ops
                .iter_mut()
                .find(|op| op.id == id && op.status == OperationStatus::Pending)
                .map(|op| {
                    op.mark_processing(now);
                    op.clone()
                }))
        })
        .await
    }

    /// Most recently created pending operation.
    pub async fn latest_pending(&self) -> Option<QueuedOperation> {
        self.operations
            .lock()
            .await
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .max_by_key(|op| op.created_at)
            .cloned()
    }

    /// Set the status of an entry.
    ///
    /// `Completed` removes the entry; `Pending` and `Failed` keep it.
    ///
    /// # Errors
    /// - `Error::NotFound` if no entry has `id`
    pub async fn mark_status(
        &self,
        id: &str,
        status: OperationStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.mutate(|ops, now| {
            let index = ops
                .iter()
                .position(|op| op.id == id)
                .ok_or_else(|| Error::NotFound(format!("queued operation {}", id)))?;

            if status == OperationStatus::Completed {
                ops.remove(index);
                return Ok(());
            }

            let op = &mut ops[index];
            op.status = status;
            op.updated_at = now;
            if error.is_some() {
                op.error = error;
            }
            Ok(())
        })
        .await
    }

    /// Remove a completed operation.
    ///
    /// Returns whether the entry existed.
    pub async fn complete(&self, id: &str) -> Result<bool> {
        self.mutate(|ops, _| {
            let before = ops.len();
            ops.retain(|op| op.id != id);
            Ok(ops.len() != before)
        })
        .await
    }

    /// Drop a completed entry from memory after [`complete`](Self::complete)
    /// could not persist. Storage catches up on the next successful write.
    pub async fn complete_in_memory(&self, id: &str) -> bool {
        let mut operations = self.operations.lock().await;
        let before = operations.len();
        operations.retain(|op| op.id != id);
        operations.len() != before
    }

    /// Apply a failed attempt in memory after
    /// [`record_failure`](Self::record_failure) could not persist, so the
    /// entry does not stay `processing` until the next restart.
    pub async fn record_failure_in_memory(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Option<QueuedOperation> {
        let now = self.clock.now();
        let mut operations = self.operations.lock().await;
        operations.iter_mut().find(|op| op.id == id).map(|op| {
            op.record_failure(error, retry_at, now);
            op.clone()
        })
    }

    /// Record a failed attempt; see [`QueuedOperation::record_failure`].
    pub async fn record_failure(
        &self,
        id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<Option<QueuedOperation>> {
        self.mutate(|ops, now| {
            Ok(ops.iter_mut().find(|op| op.id == id).map(|op| {
                op.record_failure(error, retry_at, now);
                op.clone()
            }))
        })
        .await
    }

    /// Remove entries matching `predicate`. Entries being processed are kept.
    ///
    /// # Returns
    /// Number of removed entries.
    pub async fn purge<P>(&self, predicate: P) -> Result<usize>
    where
        P: Fn(&QueuedOperation) -> bool,
    {
        self.mutate(|ops, _| {
            let before = ops.len();
            ops.retain(|op| op.status == OperationStatus::Processing || !predicate(op));
            Ok(before - ops.len())
        })
        .await
    }

    /// Remove one entry.
    ///
    /// # Errors
    /// - `Error::InvalidState` if the entry is being processed
    pub async fn remove(&self, id: &str) -> Result<bool> {
        self.mutate(|ops, _| match ops.iter().position(|op| op.id == id) {
            Some(i) if ops[i].status == OperationStatus::Processing => Err(Error::InvalidState(
                format!("operation {} is being processed", id),
            )),
            Some(i) => {
                ops.remove(i);
                Ok(true)
            }
            None => Ok(false),
        })
        .await
    }

    /// Put every failed entry back to pending with a fresh retry budget.
    ///
    /// # Returns
    /// Number of entries reset.
    pub async fn retry_failed(&self) -> Result<usize> {
        self.mutate(|ops, now| {
            let mut reset = 0;
            for op in ops.iter_mut().filter(|op| op.status == OperationStatus::Failed) {
                op.reset_for_retry(now);
                reset += 1;
            }
            Ok(reset)
        })
        .await
    }

    /// Earliest time a pending entry becomes due.
    pub async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.operations
            .lock()
            .await
            .iter()
            .filter(|op| op.status == OperationStatus::Pending)
            .map(|op| op.next_attempt_at.unwrap_or(now))
            .min()
    }

    /// Snapshot of all entries in drain order.
    pub async fn list(&self) -> Vec<QueuedOperation> {
        self.operations.lock().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<QueuedOperation> {
        self.operations
            .lock()
            .await
            .iter()
            .find(|op| op.id == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.operations.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let operations = self.operations.lock().await;
        let mut stats = QueueStats {
            total: operations.len(),
            ..QueueStats::default()
        };
        for op in operations.iter() {
            match op.status {
                OperationStatus::Pending => stats.pending += 1,
                OperationStatus::Processing => stats.processing += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Completed => {}
            }
        }
        stats
    }
}

fn sort_for_drain(operations: &mut [QueuedOperation]) {
    operations.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fiscalgate_common::{Clock, ManualClock};
    use fiscalgate_storage::{FileSecureStorage, MemorySecureStorage};
    use proptest::prelude::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn queue_with(storage: MemorySecureStorage, capacity: usize) -> (OfflineOperationQueue, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = QueueConfig {
            capacity,
            ..QueueConfig::default()
        };
        let queue = OfflineOperationQueue::load(Arc::new(storage), config, Arc::new(clock.clone()))
            .await
            .unwrap();
        (queue, clock)
    }

    async fn push(queue: &OfflineOperationQueue, clock: &ManualClock, priority: Priority) -> String {
        clock.advance(Duration::from_millis(10));
        queue
            .enqueue(
                OperationType::Create,
                "receipts",
                "/mf1/receipts",
                HttpMethod::Post,
                Some(serde_json::json!({"total": "1.00"})),
                priority,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_drain_order_is_priority_then_age() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 100).await;
        let low = push(&queue, &clock, Priority::Low).await;
        let normal_a = push(&queue, &clock, Priority::Normal).await;
        let high = push(&queue, &clock, Priority::High).await;
        let normal_b = push(&queue, &clock, Priority::Normal).await;

        let ids: Vec<String> = queue
            .dequeue_batch(10)
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![high, normal_a, normal_b, low]);
    }

    #[tokio::test]
    async fn test_dequeued_entries_are_not_handed_out_twice() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 100).await;
        for _ in 0..3 {
            push(&queue, &clock, Priority::Normal).await;
        }

        assert_eq!(queue.dequeue_batch(2).await.unwrap().len(), 2);
        assert_eq!(queue.dequeue_batch(2).await.unwrap().len(), 1);
        assert!(queue.dequeue_batch(2).await.unwrap().is_empty());
        assert_eq!(queue.stats().await.processing, 3);
    }

    #[tokio::test]
    async fn test_crash_recovery_resets_processing() {
        let storage = MemorySecureStorage::new();
        {
            let (queue, clock) = queue_with(storage.clone(), 100).await;
            push(&queue, &clock, Priority::Normal).await;
            push(&queue, &clock, Priority::Normal).await;
            queue.dequeue_batch(1).await.unwrap();
            assert_eq!(queue.stats().await.processing, 1);
        }

        let (restarted, _) = queue_with(storage, 100).await;
        let stats = restarted.stats().await;
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.pending, 2);
        assert_eq!(restarted.dequeue_batch(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_queue_survives_restart_on_disk() {
        let temp = TempDir::new().unwrap();
        let id = {
            let storage = Arc::new(FileSecureStorage::new(temp.path()).unwrap());
            let queue = OfflineOperationQueue::open(storage, QueueConfig::default())
                .await
                .unwrap();
            queue
                .enqueue(
                    OperationType::Delete,
                    "cashiers",
                    "/mf1/cashiers/c-1",
                    HttpMethod::Delete,
                    None,
                    Priority::Normal,
                )
                .await
                .unwrap()
        };

        let storage = Arc::new(FileSecureStorage::new(temp.path()).unwrap());
        let queue = OfflineOperationQueue::open(storage, QueueConfig::default())
            .await
            .unwrap();
        let op = queue.get(&id).await.unwrap();
        assert_eq!(op.endpoint, "/mf1/cashiers/c-1");
        assert_eq!(op.op_type, OperationType::Delete);
    }

    #[tokio::test]
    async fn test_persisted_as_single_json_array() {
        let storage = MemorySecureStorage::new();
        let (queue, clock) = queue_with(storage.clone(), 100).await;
        push(&queue, &clock, Priority::Normal).await;
        push(&queue, &clock, Priority::High).await;

        let raw = storage.get(DEFAULT_QUEUE_KEY).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0]["priority"], "high");
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest_lowest_priority() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 3).await;
        let low_old = push(&queue, &clock, Priority::Low).await;
        let low_new = push(&queue, &clock, Priority::Low).await;
        let high = push(&queue, &clock, Priority::High).await;

        let incoming = push(&queue, &clock, Priority::Normal).await;

        assert_eq!(queue.len().await, 3);
        assert!(queue.get(&low_old).await.is_none());
        assert!(queue.get(&low_new).await.is_some());
        assert!(queue.get(&high).await.is_some());
        assert!(queue.get(&incoming).await.is_some());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_when_nothing_evictable() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 2).await;
        push(&queue, &clock, Priority::High).await;
        push(&queue, &clock, Priority::High).await;

        let err = queue
            .enqueue(
                OperationType::Create,
                "receipts",
                "/mf1/receipts",
                HttpMethod::Post,
                None,
                Priority::Low,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull(2)));
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_processing_entries_are_not_evicted_or_removed() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 1).await;
        let id = push(&queue, &clock, Priority::Low).await;
        queue.dequeue_batch(1).await.unwrap();

        assert!(matches!(
            queue
                .enqueue(OperationType::Create, "r", "/r", HttpMethod::Post, None, Priority::Critical)
                .await,
            Err(Error::QueueFull(1))
        ));
        assert!(matches!(queue.remove(&id).await, Err(Error::InvalidState(_))));
        assert_eq!(queue.purge(|_| true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failure_and_manual_retry() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 10).await;
        let id = push(&queue, &clock, Priority::Normal).await;
        queue.dequeue_batch(1).await.unwrap();

        let op = queue.record_failure(&id, "HTTP 422: bad vat", None).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(queue.dequeue_batch(10).await.unwrap().is_empty());

        assert_eq!(queue.retry_failed().await.unwrap(), 1);
        let op = queue.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
        assert_eq!(queue.dequeue_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unpersisted_settle_does_not_strand_processing() {
        let storage = Arc::new(crate::testing::ReadOnlySwitch::default());
        let clock = ManualClock::starting_now();
        let queue = OfflineOperationQueue::load(storage.clone(), QueueConfig::default(), Arc::new(clock.clone()))
            .await
            .unwrap();
        let done = push(&queue, &clock, Priority::Normal).await;
        let retried = push(&queue, &clock, Priority::Normal).await;
        assert_eq!(queue.dequeue_batch(10).await.unwrap().len(), 2);

        storage.set_read_only(true);
        assert!(queue.complete(&done).await.is_err());
        assert!(queue.record_failure(&retried, "HTTP 503", None).await.is_err());
        assert_eq!(queue.stats().await.processing, 2);

        assert!(queue.complete_in_memory(&done).await);
        let op = queue
            .record_failure_in_memory(&retried, "HTTP 503", Some(clock.now()))
            .await
            .unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 1);
        assert!(queue.get(&done).await.is_none());
        assert_eq!(queue.stats().await.processing, 0);

        storage.set_read_only(false);
        let batch = queue.dequeue_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, retried);

        let reloaded = OfflineOperationQueue::load(storage, QueueConfig::default(), Arc::new(clock))
            .await
            .unwrap();
        assert_eq!(reloaded.len().await, 1);
        assert!(reloaded.get(&done).await.is_none());
    }

    #[tokio::test]
    async fn test_mark_status_completed_removes() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 10).await;
        let id = push(&queue, &clock, Priority::Normal).await;

        queue
            .mark_status(&id, OperationStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();
        assert_eq!(queue.stats().await.failed, 1);

        queue.mark_status(&id, OperationStatus::Completed, None).await.unwrap();
        assert!(queue.is_empty().await);
        assert!(matches!(
            queue.mark_status(&id, OperationStatus::Pending, None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_next_due_at_and_scheduling() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 10).await;
        assert!(queue.next_due_at().await.is_none());

        let id = push(&queue, &clock, Priority::Normal).await;
        queue.dequeue_batch(1).await.unwrap();
        let retry_at = clock.now() + chrono::Duration::seconds(5);
        queue.record_failure(&id, "timeout", Some(retry_at)).await.unwrap();

        assert_eq!(queue.next_due_at().await, Some(retry_at));
        assert!(queue.dequeue_batch(10).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(5));
        assert_eq!(queue.dequeue_batch(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_storage_is_reported() {
        let storage = MemorySecureStorage::new();
        storage.set(DEFAULT_QUEUE_KEY, "[{\"broken\"").await.unwrap();
        let result = OfflineOperationQueue::open(Arc::new(storage), QueueConfig::default()).await;
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[tokio::test]
    async fn test_latest_pending() {
        let (queue, clock) = queue_with(MemorySecureStorage::new(), 10).await;
        push(&queue, &clock, Priority::High).await;
        let newest = push(&queue, &clock, Priority::Low).await;

        assert_eq!(queue.latest_pending().await.unwrap().id, newest);
        assert_eq!(queue.dequeue_by_id(&newest).await.unwrap().unwrap().id, newest);
        assert!(queue.dequeue_by_id(&newest).await.unwrap().is_none());
    }

    fn priority() -> impl Strategy<Value = Priority> {
        prop_oneof![
            Just(Priority::Low),
            Just(Priority::Normal),
            Just(Priority::High),
            Just(Priority::Critical)
        ]
    }

    proptest! {
        #[test]
        fn test_queue_always_in_drain_order(priorities in proptest::collection::vec(priority(), 1..20)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (queue, clock) = queue_with(MemorySecureStorage::new(), 100).await;
                for p in &priorities {
                    push(&queue, &clock, *p).await;
                }
                let ops = queue.list().await;
                for pair in ops.windows(2) {
                    assert!(
                        pair[0].priority > pair[1].priority
                            || (pair[0].priority == pair[1].priority
                                && pair[0].created_at <= pair[1].created_at)
                    );
                }
            });
        }
    }
}
