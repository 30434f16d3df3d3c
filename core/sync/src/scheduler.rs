//! Sync scheduling - explicit, reconnect-driven and periodic drains.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info};

use fiscalgate_common::{Error, Result};

use crate::manager::{SyncManager, SyncReport};

/// Longest the scheduler sleeps between due-time checks.
const MAX_IDLE: Duration = Duration::from_secs(60);

/// Shortest wait before re-checking due operations.
const MIN_DUE_WAIT: Duration = Duration::from_millis(100);

/// Sync mode configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Drain only on explicit requests.
    Manual,
    /// Also drain on reconnect and when retries come due.
    OnReconnect,
    /// Like `OnReconnect`, plus a drain at regular intervals.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn is_automatic(&self) -> bool {
        !matches!(self, SyncMode::Manual)
    }

    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } => Some(*interval),
            _ => None,
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Drain due operations.
    Drain,
    /// Reset failed operations, then drain.
    RetryFailed,
    /// Shutdown the scheduler.
    Shutdown,
}

type Request = (SyncRequest, oneshot::Sender<Result<SyncReport>>);

/// Front end for requesting drains from a running [`SyncSchedulerHandle`].
pub struct SyncScheduler {
    /// Current sync mode.
    mode: Arc<RwLock<SyncMode>>,
    /// Channel to send sync requests.
    request_tx: mpsc::Sender<Request>,
    /// Shutdown signal.
    shutdown: Arc<RwLock<bool>>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let mode = Arc::new(RwLock::new(mode));
        let shutdown = Arc::new(RwLock::new(false));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Request a drain and wait for its report.
    pub async fn request_drain(&self) -> Result<SyncReport> {
        self.request(SyncRequest::Drain).await
    }

    /// Request a retry of every failed operation.
    pub async fn request_retry_failed(&self) -> Result<SyncReport> {
        self.request(SyncRequest::RetryFailed).await
    }

    async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::InvalidState("Sync scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::InvalidState("Failed to receive sync result".to_string()))?
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        let mut current_mode = self.mode.write().await;
        *current_mode = mode;
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.shutdown.write().await;
        *is_shutdown = true;

        let (response_tx, _) = oneshot::channel();
        let _ = self
            .request_tx
            .send((SyncRequest::Shutdown, response_tx))
            .await;
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<Request>,
    shutdown: Arc<RwLock<bool>>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler background task.
    ///
    /// This should be spawned in a tokio task. Drains run on explicit
    /// requests, on offline-to-online transitions of `connectivity`, when a
    /// rescheduled operation comes due, and at the periodic interval.
    pub async fn run(mut self, manager: Arc<SyncManager>, mut connectivity: watch::Receiver<bool>) {
        let mut was_online = *connectivity.borrow_and_update();
        let mut watching = true;
        let mut current_interval = self.mode.read().await.interval();
        let mut periodic_interval = current_interval.map(interval);

        info!("Sync scheduler started");

        loop {
            if *self.shutdown.read().await {
                info!("Sync scheduler shutting down");
                break;
            }

            let mode = self.mode.read().await.clone();
            let automatic = mode.is_automatic() && manager.monitor().is_online();

            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        None | Some((SyncRequest::Shutdown, _)) => {
                            info!("Received shutdown request");
                            break;
                        }
                        Some((request, response_tx)) => {
                            debug!("Processing sync request: {:?}", request);
                            let result = Self::handle_request(&manager, request).await;
                            let _ = response_tx.send(result);
                        }
                    }
                }

                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        debug!("Network monitor closed");
                        watching = false;
                        continue;
                    }
                    let online = *connectivity.borrow_and_update();
                    if online && !was_online && mode.is_automatic() {
                        Self::log_result("Reconnect sync", manager.on_reconnect().await);
                    }
                    was_online = online;
                }

                _ = Self::wait_until_due(&manager), if automatic => {
                    Self::log_result("Scheduled retry", manager.drain().await);
                }

                _ = Self::wait_for_periodic(&mut periodic_interval) => {
                    if mode.interval().is_some() && manager.monitor().is_online() {
                        debug!("Triggering periodic sync");
                        Self::log_result("Periodic sync", manager.drain().await);
                    }
                }
            }

            // Recreate interval if mode changed
            let expected_interval = self.mode.read().await.interval();
            if current_interval != expected_interval {
                current_interval = expected_interval;
                periodic_interval = current_interval.map(interval);
            }
        }
    }

    async fn handle_request(manager: &SyncManager, request: SyncRequest) -> Result<SyncReport> {
        match request {
            SyncRequest::Drain => manager.drain().await,
            SyncRequest::RetryFailed => {
                manager.retry_all_failed().await?;
                manager.drain().await
            }
            SyncRequest::Shutdown => Ok(SyncReport::default()),
        }
    }

    fn log_result(what: &str, result: Result<SyncReport>) {
        match result {
            Ok(report) if report.processed() > 0 => {
                info!(
                    "{} completed: {} completed, {} rescheduled, {} failed",
                    what, report.completed, report.rescheduled, report.failed
                );
            }
            Ok(_) => {}
            Err(e) => error!("{} failed: {}", what, e),
        }
    }

    async fn wait_until_due(manager: &SyncManager) {
        match manager.next_wakeup().await {
            Some(delay) => tokio::time::sleep(delay.clamp(MIN_DUE_WAIT, MAX_IDLE)).await,
            // Re-check later for operations enqueued meanwhile
            None => tokio::time::sleep(MAX_IDLE).await,
        }
    }

    async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
        if let Some(ref mut interval) = interval {
            interval.tick().await;
        } else {
            // If no periodic sync, wait indefinitely
            std::future::pending::<()>().await;
        }
    }
}
