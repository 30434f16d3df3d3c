//! Queue draining with bounded concurrency and exponential backoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use fiscalgate_common::types::duration_ms;
use fiscalgate_common::{system_clock, ApiResponse, Error, Result, SharedClock};
use fiscalgate_storage::NetworkMonitor;

use crate::offline::{BufferedWrite, OfflineModeStateMachine};
use crate::operation::{resource_of, OperationType, QueuedOperation};
use crate::queue::OfflineOperationQueue;
use crate::retry::RetryConfig;

const EVENT_CAPACITY: usize = 256;

/// Sends one queued operation to the server.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, operation: &QueuedOperation) -> Result<ApiResponse>;
}

/// Drain settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operations executed concurrently per batch.
    pub batch_size: usize,
    /// Pause between consecutive batches.
    #[serde(with = "duration_ms")]
    pub batch_pause: Duration,
    pub retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }
}

/// Counts from one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub batches: usize,
    /// Outcomes applied in memory only because the queue write failed.
    /// Storage catches up on the next successful queue write.
    pub unpersisted: usize,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl SyncReport {
    fn record(&mut self, settled: Settled) {
        match settled.outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Rescheduled { .. } => self.rescheduled += 1,
            Outcome::Failed { .. } => self.failed += 1,
        }
        if !settled.persisted {
            self.unpersisted += 1;
        }
    }

    fn merge(&mut self, other: SyncReport) {
        self.completed += other.completed;
        self.rescheduled += other.rescheduled;
        self.failed += other.failed;
        self.batches += other.batches;
        self.unpersisted += other.unpersisted;
        self.duration += other.duration;
    }

    /// Operations handled in total.
    pub fn processed(&self) -> usize {
        self.completed + self.rescheduled + self.failed
    }
}

/// Notifications published while draining.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Started,
    OperationCompleted {
        id: String,
        resource: String,
    },
    RetryScheduled {
        id: String,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    OperationFailed {
        id: String,
        error: String,
    },
    Finished(SyncReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Rescheduled { connectivity: bool },
    Failed { connectivity: bool },
}

/// An outcome and whether the queue write recording it reached storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Settled {
    outcome: Outcome,
    persisted: bool,
}

impl Outcome {
    fn lost_connectivity(&self) -> bool {
        matches!(
            self,
            Outcome::Rescheduled { connectivity: true } | Outcome::Failed { connectivity: true }
        )
    }
}

/// Replays the offline queue against the server.
pub struct SyncManager {
    queue: Arc<OfflineOperationQueue>,
    executor: Arc<dyn OperationExecutor>,
    monitor: Arc<dyn NetworkMonitor>,
    offline: Option<Arc<OfflineModeStateMachine>>,
    config: SyncConfig,
    clock: SharedClock,
    draining: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncManager {
    pub fn new(
        queue: Arc<OfflineOperationQueue>,
        executor: Arc<dyn OperationExecutor>,
        monitor: Arc<dyn NetworkMonitor>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            queue,
            executor,
            monitor,
            offline: None,
            config,
            clock: system_clock(),
            draining: Mutex::new(()),
            events,
        }
    }

    /// Feed outcomes into an offline state machine.
    pub fn with_offline_state(mut self, offline: Arc<OfflineModeStateMachine>) -> Self {
        self.offline = Some(offline);
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &Arc<OfflineOperationQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<dyn NetworkMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Drain every due operation.
    ///
    /// Returns an empty report when offline or when another drain is
    /// already running.
    ///
    /// # Errors
    /// - Queue storage failure while handing out a batch
    pub async fn drain(&self) -> Result<SyncReport> {
        let Ok(guard) = self.draining.try_lock() else {
            debug!("Drain already in progress");
            return Ok(SyncReport::default());
        };
        self.drain_locked(&guard).await
    }

    async fn drain_locked(&self, _guard: &MutexGuard<'_, ()>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if !self.monitor.is_online() {
            debug!("Offline, skipping drain");
            return Ok(report);
        }

        let started = Instant::now();
        let _ = self.events.send(SyncEvent::Started);
        let batch_size = self.config.batch_size.max(1);

        loop {
            if report.batches > 0 && !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }

            let batch = self.queue.dequeue_batch(batch_size).await?;
            if batch.is_empty() {
                break;
            }
            report.batches += 1;
            debug!(batch = report.batches, size = batch.len(), "Executing batch");

            let settled = join_all(batch.iter().map(|op| self.process(op))).await;
            let all_unreachable = settled.iter().all(|s| s.outcome.lost_connectivity());
            for s in settled {
                report.record(s);
            }

            if all_unreachable || !self.monitor.is_online() {
                info!("Server unreachable, pausing drain");
                break;
            }
        }

        report.duration = started.elapsed();
        info!(
            completed = report.completed,
            rescheduled = report.rescheduled,
            failed = report.failed,
            batches = report.batches,
            unpersisted = report.unpersisted,
            "Drain finished"
        );
        let _ = self.events.send(SyncEvent::Finished(report.clone()));
        Ok(report)
    }

    /// Execute one operation and record its outcome in the queue.
    ///
    /// When the queue cannot persist the outcome it is still applied in
    /// memory, so the entry never stays `processing` for the rest of the
    /// session.
    async fn process(&self, op: &QueuedOperation) -> Settled {
        match self.executor.execute(op).await {
            Ok(_) => {
                let persisted = match self.queue.complete(&op.id).await {
                    Ok(_) => true,
                    Err(e) => {
                        error!(id = %op.id, "Failed to persist completed operation: {}", e);
                        self.queue.complete_in_memory(&op.id).await;
                        false
                    }
                };
                if let Some(offline) = &self.offline {
                    offline.record_success();
                }
                debug!(id = %op.id, endpoint = %op.endpoint, "Operation completed");
                let _ = self.events.send(SyncEvent::OperationCompleted {
                    id: op.id.clone(),
                    resource: op.resource.clone(),
                });
                Settled {
                    outcome: Outcome::Completed,
                    persisted,
                }
            }
            Err(e) => self.handle_failure(op, e).await,
        }
    }

    /// Store a failed attempt, falling back to memory when the write fails.
    async fn settle_failure(
        &self,
        op: &QueuedOperation,
        message: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> bool {
        match self.queue.record_failure(&op.id, message, retry_at).await {
            Ok(_) => true,
            Err(e) => {
                error!(id = %op.id, "Failed to persist operation failure: {}", e);
                self.queue.record_failure_in_memory(&op.id, message, retry_at).await;
                false
            }
        }
    }

    async fn handle_failure(&self, op: &QueuedOperation, err: Error) -> Settled {
        let connectivity = err.is_connectivity();
        if connectivity {
            if let Some(offline) = &self.offline {
                offline.record_failure();
            }
        }

        let message = err.to_string();
        let retry_count = op.retry_count + 1;

        if err.is_retryable() && retry_count < op.max_retries {
            let next_attempt_at = self.config.retry.next_attempt_at(self.clock.now(), retry_count);
            let persisted = self.settle_failure(op, &message, Some(next_attempt_at)).await;
            info!(
                id = %op.id,
                retry_count,
                %next_attempt_at,
                "Operation failed, retry scheduled: {}",
                message
            );
            let _ = self.events.send(SyncEvent::RetryScheduled {
                id: op.id.clone(),
                retry_count,
                next_attempt_at,
            });
            Settled {
                outcome: Outcome::Rescheduled { connectivity },
                persisted,
            }
        } else {
            let persisted = self.settle_failure(op, &message, None).await;
            warn!(id = %op.id, endpoint = %op.endpoint, "Operation failed: {}", message);
            let _ = self.events.send(SyncEvent::OperationFailed {
                id: op.id.clone(),
                error: message,
            });
            Settled {
                outcome: Outcome::Failed { connectivity },
                persisted,
            }
        }
    }

    /// Handle a transition from offline to online.
    ///
    /// Best-effort writes move into the durable queue, the most recent
    /// pending write is re-attempted on its own, then the rest of the queue
    /// is drained. With nothing to send the state machine returns to Online
    /// without a confirmed submission.
    pub async fn on_reconnect(&self) -> Result<SyncReport> {
        if !self.monitor.is_online() {
            return Ok(SyncReport::default());
        }
        let guard = self.draining.lock().await;
        info!("Connectivity restored, replaying offline writes");

        let mut latest_id = None;
        if let Some(offline) = &self.offline {
            offline.on_connectivity_change(true);
            latest_id = self.adopt_buffered(offline).await;
        }
        if latest_id.is_none() {
            latest_id = self.queue.latest_pending().await.map(|op| op.id);
        }

        let mut report = SyncReport::default();
        let latest = match latest_id {
            Some(id) => self.queue.dequeue_by_id(&id).await?,
            None => None,
        };

        match latest {
            Some(op) => {
                debug!(id = %op.id, "Re-attempting most recent write");
                let settled = self.process(&op).await;
                report.record(settled);
                if settled.outcome.lost_connectivity() {
                    return Ok(report);
                }
            }
            None => {
                if let Some(offline) = &self.offline {
                    if self.queue.next_due_at().await.is_none() {
                        offline.mark_reachable();
                    }
                }
            }
        }

        let drained = self.drain_locked(&guard).await?;
        report.merge(drained);
        Ok(report)
    }

    /// Move best-effort writes into the queue.
    ///
    /// Returns the queue id of the most recent one. Writes that do not fit
    /// stay buffered.
    async fn adopt_buffered(&self, offline: &OfflineModeStateMachine) -> Option<String> {
        let mut writes = offline.take_buffered().into_iter();
        let mut latest = None;

        while let Some(write) = writes.next() {
            match self.enqueue_buffered(&write).await {
                Ok(id) => latest = Some(id),
                Err(e) => {
                    warn!(id = %write.id, "Could not queue best-effort write: {}", e);
                    let mut rest = vec![write];
                    rest.extend(writes);
                    offline.restore_buffered(rest);
                    break;
                }
            }
        }
        latest
    }

    async fn enqueue_buffered(&self, write: &BufferedWrite) -> Result<String> {
        let request = &write.request;
        let op_type = OperationType::for_method(request.method).ok_or_else(|| {
            Error::InvalidInput(format!("{} is not a mutating method", request.method.as_str()))
        })?;
        self.queue
            .enqueue(
                op_type,
                &resource_of(&request.url),
                &request.url,
                request.method,
                request.body.clone(),
                write.priority,
            )
            .await
    }

    /// Time until the earliest pending operation is due; zero when one is
    /// due already.
    pub async fn next_wakeup(&self) -> Option<Duration> {
        let due = self.queue.next_due_at().await?;
        Some((due - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Put every failed operation back in line.
    ///
    /// # Returns
    /// Number of operations reset. Call [`drain`](Self::drain) to send them.
    pub async fn retry_all_failed(&self) -> Result<usize> {
        let reset = self.queue.retry_failed().await?;
        info!(reset, "Failed operations reset for retry");
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{OfflineConfig, OfflineMode};
    use crate::operation::{OperationStatus, Priority};
    use crate::queue::QueueConfig;
    use crate::testing::ReadOnlySwitch;
    use fiscalgate_common::{Clock, HttpMethod, ManualClock, RequestConfig};
    use fiscalgate_storage::{ManualNetworkMonitor, MemorySecureStorage, SecureStorage};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Copy)]
    enum Reply {
        Ok,
        Unreachable,
        Status(u16),
    }

    #[derive(Default)]
    struct ScriptedExecutor {
        replies: StdMutex<HashMap<String, Reply>>,
        executed: StdMutex<Vec<String>>,
        delay: Option<Duration>,
        /// Storage whose next write fails for every executed request.
        flaky_storage: Option<Arc<ReadOnlySwitch>>,
    }

    impl ScriptedExecutor {
        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn reply(&self, endpoint: &str, reply: Reply) {
            self.replies.lock().unwrap().insert(endpoint.to_string(), reply);
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OperationExecutor for ScriptedExecutor {
        async fn execute(&self, operation: &QueuedOperation) -> Result<ApiResponse> {
            self.executed.lock().unwrap().push(operation.endpoint.clone());
            if let Some(storage) = &self.flaky_storage {
                storage.fail_next_writes(1);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self
                .replies
                .lock()
                .unwrap()
                .get(&operation.endpoint)
                .copied()
                .unwrap_or(Reply::Ok);
            match reply {
                Reply::Ok => Ok(ApiResponse::new(201, serde_json::json!({"ok": true}))),
                Reply::Unreachable => Err(Error::Network("connection refused".to_string())),
                Reply::Status(status) => Err(Error::from_status(status, "rejected")),
            }
        }
    }

    struct Fixture {
        manager: Arc<SyncManager>,
        queue: Arc<OfflineOperationQueue>,
        executor: Arc<ScriptedExecutor>,
        monitor: Arc<ManualNetworkMonitor>,
        offline: Arc<OfflineModeStateMachine>,
        clock: ManualClock,
    }

    async fn fixture_with(executor: ScriptedExecutor, batch_size: usize) -> Fixture {
        fixture_on(Arc::new(MemorySecureStorage::new()), executor, batch_size).await
    }

    async fn fixture_on(
        storage: Arc<dyn SecureStorage>,
        executor: ScriptedExecutor,
        batch_size: usize,
    ) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let queue = Arc::new(
            OfflineOperationQueue::load(storage, QueueConfig::default(), shared.clone())
                .await
                .unwrap(),
        );
        let executor = Arc::new(executor);
        let monitor = Arc::new(ManualNetworkMonitor::new(true));
        let offline = Arc::new(OfflineModeStateMachine::new(
            true,
            OfflineConfig::default(),
            shared.clone(),
        ));
        let config = SyncConfig {
            batch_size,
            batch_pause: Duration::ZERO,
            retry: RetryConfig::default(),
        };
        let manager = Arc::new(
            SyncManager::new(queue.clone(), executor.clone(), monitor.clone(), config)
                .with_offline_state(offline.clone())
                .with_clock(shared),
        );
        Fixture {
            manager,
            queue,
            executor,
            monitor,
            offline,
            clock,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(ScriptedExecutor::default(), 10).await
    }

    async fn enqueue(f: &Fixture, endpoint: &str, priority: Priority) -> String {
        f.clock.advance(Duration::from_millis(5));
        f.queue
            .enqueue(
                OperationType::Create,
                &resource_of(endpoint),
                endpoint,
                HttpMethod::Post,
                Some(serde_json::json!({"amount": 1})),
                priority,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_drain_empties_queue() {
        let f = fixture().await;
        let mut events = f.manager.subscribe();
        let id = enqueue(&f, "/mf1/receipts", Priority::Normal).await;

        let report = f.manager.drain().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.batches, 1);
        assert!(f.queue.is_empty().await);

        assert_eq!(events.recv().await.unwrap(), SyncEvent::Started);
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::OperationCompleted {
                id,
                resource: "receipts".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_to_failed() {
        let f = fixture().await;
        f.executor.reply("/mf1/receipts", Reply::Status(503));
        let id = enqueue(&f, "/mf1/receipts", Priority::Normal).await;

        let first = f.manager.drain().await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let op = f.queue.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.next_attempt_at, Some(f.clock.now() + chrono::Duration::seconds(2)));

        // Not due yet.
        assert_eq!(f.manager.drain().await.unwrap().processed(), 0);

        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.manager.drain().await.unwrap().rescheduled, 1);
        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.manager.drain().await.unwrap().failed, 1);

        let op = f.queue.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 3);
        assert_eq!(f.queue.len().await, 1);
        assert_eq!(f.executor.executed().len(), 3);

        f.clock.advance(Duration::from_secs(600));
        assert_eq!(f.manager.drain().await.unwrap().processed(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_retries() {
        let f = fixture_with(ScriptedExecutor::default(), 1).await;
        f.executor.reply("/mf1/receipts", Reply::Unreachable);
        let id = enqueue(&f, "/mf1/receipts", Priority::Normal).await;
        let waiting = enqueue(&f, "/mf1/receipts/void", Priority::Normal).await;
        let len = f.queue.len().await;

        // Each drain stops after the first unreachable batch.
        let first = f.manager.drain().await.unwrap();
        assert_eq!((first.rescheduled, first.batches), (1, 1));
        f.clock.advance(Duration::from_secs(60));
        assert_eq!(f.manager.drain().await.unwrap().rescheduled, 1);
        f.clock.advance(Duration::from_secs(60));
        let last = f.manager.drain().await.unwrap();
        assert_eq!((last.failed, last.batches), (1, 1));

        let op = f.queue.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 3);
        assert_eq!(op.error.as_deref(), Some("Network error: connection refused"));
        assert_eq!(f.queue.len().await, len);
        assert_eq!(f.executor.executed(), vec!["/mf1/receipts"; 3]);

        let untouched = f.queue.get(&waiting).await.unwrap();
        assert_eq!(untouched.status, OperationStatus::Pending);
        assert_eq!(untouched.retry_count, 0);
    }

    #[tokio::test]
    async fn test_unpersisted_outcomes_are_applied_in_memory() {
        let storage = Arc::new(ReadOnlySwitch::default());
        let executor = ScriptedExecutor {
            flaky_storage: Some(storage.clone()),
            ..ScriptedExecutor::default()
        };
        let f = fixture_on(storage.clone(), executor, 10).await;
        f.executor.reply("/mf1/cashiers", Reply::Status(503));
        let done = enqueue(&f, "/mf1/receipts", Priority::High).await;
        let retried = enqueue(&f, "/mf1/cashiers", Priority::Normal).await;

        // Both outcome writes fail; the next batch lookup persists them.
        let report = f.manager.drain().await.unwrap();
        assert_eq!((report.completed, report.rescheduled), (1, 1));
        assert_eq!(report.unpersisted, 2);
        assert_eq!(report.batches, 1);

        assert_eq!(f.queue.stats().await.processing, 0);
        assert!(f.queue.get(&done).await.is_none());
        let op = f.queue.get(&retried).await.unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 1);

        let reloaded = OfflineOperationQueue::load(storage, QueueConfig::default(), Arc::new(f.clock.clone()))
            .await
            .unwrap();
        assert_eq!(reloaded.len().await, 1);
        let op = reloaded.get(&retried).await.unwrap();
        assert_eq!((op.status, op.retry_count), (OperationStatus::Pending, 1));

        f.clock.advance(Duration::from_secs(60));
        f.executor.reply("/mf1/cashiers", Reply::Ok);
        let report = f.manager.drain().await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_immediate() {
        let f = fixture().await;
        f.executor.reply("/mf1/receipts", Reply::Status(422));
        let id = enqueue(&f, "/mf1/receipts", Priority::Normal).await;

        let report = f.manager.drain().await.unwrap();
        assert_eq!(report.failed, 1);
        let op = f.queue.get(&id).await.unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert!(op.error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_retry_all_failed_requeues() {
        let f = fixture().await;
        f.executor.reply("/mf1/cashiers", Reply::Status(400));
        enqueue(&f, "/mf1/cashiers", Priority::Normal).await;
        f.manager.drain().await.unwrap();

        f.executor.reply("/mf1/cashiers", Reply::Ok);
        assert_eq!(f.manager.retry_all_failed().await.unwrap(), 1);
        assert_eq!(f.manager.drain().await.unwrap().completed, 1);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_batches_drain_in_priority_order() {
        let f = fixture_with(ScriptedExecutor::default(), 2).await;
        enqueue(&f, "/mf1/low", Priority::Low).await;
        enqueue(&f, "/mf1/normal", Priority::Normal).await;
        enqueue(&f, "/mf1/critical", Priority::Critical).await;
        enqueue(&f, "/mf1/high", Priority::High).await;
        enqueue(&f, "/mf1/normal-2", Priority::Normal).await;

        let report = f.manager.drain().await.unwrap();
        assert_eq!(report.completed, 5);
        assert_eq!(report.batches, 3);

        let executed = f.executor.executed();
        let mut first_batch = executed[..2].to_vec();
        first_batch.sort();
        assert_eq!(first_batch, vec!["/mf1/critical", "/mf1/high"]);
        assert_eq!(executed[4], "/mf1/low");
    }

    #[tokio::test]
    async fn test_concurrent_drains_execute_each_operation_once() {
        let f = fixture_with(ScriptedExecutor::slow(Duration::from_millis(30)), 2).await;
        for i in 0..5 {
            enqueue(&f, &format!("/mf1/receipts/{}", i), Priority::Normal).await;
        }

        let a = tokio::spawn({
            let manager = f.manager.clone();
            async move { manager.drain().await.unwrap() }
        });
        let b = tokio::spawn({
            let manager = f.manager.clone();
            async move { manager.drain().await.unwrap() }
        });
        let total = a.await.unwrap().completed + b.await.unwrap().completed;

        assert_eq!(total, 5);
        assert_eq!(f.executor.executed().len(), 5);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_offline_drain_does_nothing() {
        let f = fixture().await;
        enqueue(&f, "/mf1/receipts", Priority::Normal).await;
        f.monitor.set_online(false);

        assert_eq!(f.manager.drain().await.unwrap(), SyncReport::default());
        assert!(f.executor.executed().is_empty());
        assert_eq!(f.queue.stats().await.pending, 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_feeds_offline_state() {
        let f = fixture().await;
        f.executor.reply("/mf1/receipts", Reply::Unreachable);
        enqueue(&f, "/mf1/receipts", Priority::Normal).await;

        let report = f.manager.drain().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(f.offline.mode(), OfflineMode::Offline);

        f.executor.reply("/mf1/receipts", Reply::Ok);
        f.clock.advance(Duration::from_secs(10));
        f.manager.drain().await.unwrap();
        assert_eq!(f.offline.mode(), OfflineMode::Online);
    }

    #[tokio::test]
    async fn test_reconnect_reattempts_most_recent_write_first() {
        let f = fixture().await;
        enqueue(&f, "/mf1/receipts/old", Priority::High).await;
        enqueue(&f, "/mf1/receipts/older-priority", Priority::Normal).await;
        enqueue(&f, "/mf1/receipts/newest", Priority::Low).await;

        let report = f.manager.on_reconnect().await.unwrap();
        assert_eq!(report.completed, 3);
        assert_eq!(f.executor.executed()[0], "/mf1/receipts/newest");
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_reconnect_after_emergency_adopts_best_effort_writes() {
        let f = fixture().await;
        f.offline.record_failure();
        f.clock.advance(Duration::from_secs(3600));
        assert_eq!(f.offline.mode(), OfflineMode::Emergency);

        f.offline
            .buffer_write(
                RequestConfig::post("/mf1/receipts", serde_json::json!({"n": 1})),
                Priority::Normal,
            )
            .unwrap();
        f.offline
            .buffer_write(RequestConfig::delete("/mf1/cashiers/c-9"), Priority::Normal)
            .unwrap();

        let report = f.manager.on_reconnect().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(f.executor.executed()[0], "/mf1/cashiers/c-9");
        assert_eq!(f.offline.buffered_len(), 0);
        assert_eq!(f.offline.mode(), OfflineMode::Online);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_reconnect_with_nothing_pending_returns_online() {
        let f = fixture().await;
        f.offline.record_failure();
        let baseline = f.offline.state().last_success_at;

        let report = f.manager.on_reconnect().await.unwrap();
        assert_eq!(report.processed(), 0);
        assert_eq!(f.offline.mode(), OfflineMode::Online);
        assert_eq!(f.offline.state().last_success_at, baseline);
    }

    #[tokio::test]
    async fn test_reconnect_stops_when_server_still_unreachable() {
        let f = fixture().await;
        f.executor.reply("/mf1/receipts/b", Reply::Unreachable);
        enqueue(&f, "/mf1/receipts/a", Priority::Normal).await;
        enqueue(&f, "/mf1/receipts/b", Priority::Normal).await;

        let report = f.manager.on_reconnect().await.unwrap();
        assert_eq!(report.rescheduled, 1);
        assert_eq!(f.executor.executed(), vec!["/mf1/receipts/b"]);
        assert_eq!(f.queue.stats().await.pending, 2);
    }
}
