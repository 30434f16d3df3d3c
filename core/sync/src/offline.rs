//! Online / Offline / Emergency operating mode.
//!
//! The emergency timer measures how long the server has been continuously
//! unreachable: it restarts on every successful submission and whenever
//! reachability is confirmed while Online, including the moment the client
//! drops from Online to Offline. A failure within the emergency timeout
//! leaves the client Offline, where writes are still queued durably. Once
//! the timeout has elapsed the client enters Emergency: new writes are only
//! kept in a bounded in-memory buffer that does not survive the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fiscalgate_common::clock::elapsed_between;
use fiscalgate_common::types::duration_ms;
use fiscalgate_common::{Error, RequestConfig, Result, SharedClock};

use crate::operation::Priority;

const EVENT_CAPACITY: usize = 64;

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfflineMode {
    Online,
    Offline,
    Emergency,
}

impl fmt::Display for OfflineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OfflineMode::Online => "online",
            OfflineMode::Offline => "offline",
            OfflineMode::Emergency => "emergency",
        };
        f.write_str(name)
    }
}

/// Offline handling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Time the server may stay unreachable before the client enters
    /// Emergency.
    #[serde(with = "duration_ms")]
    pub emergency_timeout: Duration,
    /// Maximum number of best-effort writes held in memory.
    pub buffer_capacity: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            emergency_timeout: Duration::from_secs(60 * 60),
            buffer_capacity: 100,
        }
    }
}

/// Snapshot of the machine, recomputed on every read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfflineState {
    pub mode: OfflineMode,
    pub last_success_at: DateTime<Utc>,
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(with = "duration_ms")]
    pub remaining_time_to_emergency: Duration,
    pub is_emergency: bool,
    pub is_offline_before_emergency: bool,
}

/// Notifications published by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum OfflineEvent {
    ModeChanged {
        from: OfflineMode,
        to: OfflineMode,
        at: DateTime<Utc>,
    },
    /// A write was accepted into the in-memory buffer only.
    BestEffortWrite { id: String, url: String },
}

/// A write held in memory while in Emergency.
#[derive(Debug, Clone)]
pub struct BufferedWrite {
    pub id: String,
    pub request: RequestConfig,
    pub priority: Priority,
    pub buffered_at: DateTime<Utc>,
}

struct Inner {
    mode: OfflineMode,
    last_success_at: DateTime<Utc>,
    /// Last moment the server was known to be reachable.
    reachable_at: DateTime<Utc>,
    last_failure_at: Option<DateTime<Utc>>,
    buffer: VecDeque<BufferedWrite>,
}

/// Tracks the operating mode from submission outcomes and connectivity.
pub struct OfflineModeStateMachine {
    config: OfflineConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
    events: broadcast::Sender<OfflineEvent>,
}

impl OfflineModeStateMachine {
    /// Create a machine whose initial mode follows the current network
    /// signal. The emergency timer starts now.
    pub fn new(online: bool, config: OfflineConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let machine = Self {
            config,
            clock,
            inner: Mutex::new(Inner {
                mode: OfflineMode::Online,
                last_success_at: now,
                reachable_at: now,
                last_failure_at: None,
                buffer: VecDeque::new(),
            }),
            events,
        };
        if !online {
            machine.record_failure();
        }
        machine
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remaining(&self, inner: &Inner, now: DateTime<Utc>) -> Duration {
        self.config
            .emergency_timeout
            .saturating_sub(elapsed_between(inner.reachable_at, now))
    }

    fn transition(&self, inner: &mut Inner, to: OfflineMode, now: DateTime<Utc>) {
        let from = inner.mode;
        if from == to {
            return;
        }
        inner.mode = to;
        match to {
            OfflineMode::Emergency => warn!(%from, "Entering emergency mode"),
            _ => info!(%from, %to, "Offline mode changed"),
        }
        let _ = self.events.send(OfflineEvent::ModeChanged { from, to, at: now });
    }

    /// Apply the timeout to a failure state without a new event.
    fn refresh(&self, inner: &mut Inner, now: DateTime<Utc>) {
        if inner.mode == OfflineMode::Offline && self.remaining(inner, now).is_zero() {
            self.transition(inner, OfflineMode::Emergency, now);
        }
    }

    /// A submission reached the server.
    ///
    /// # Postconditions
    /// - `last_success_at` is now, failure markers are cleared
    /// - Mode is Online
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.last_success_at = now;
        inner.reachable_at = now;
        inner.last_failure_at = None;
        self.transition(&mut inner, OfflineMode::Online, now);
    }

    /// A submission failed to reach the server, or connectivity was lost.
    ///
    /// Leaving Online starts the emergency timer: the server was reachable
    /// until now.
    ///
    /// # Returns
    /// The resulting mode: Offline while time remains, Emergency otherwise.
    pub fn record_failure(&self) -> OfflineMode {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.mode == OfflineMode::Online {
            inner.reachable_at = now;
        }
        inner.last_failure_at = Some(now);
        let remaining = self.remaining(&inner, now);
        let to = if remaining.is_zero() {
            OfflineMode::Emergency
        } else {
            OfflineMode::Offline
        };
        debug!(remaining_ms = remaining.as_millis() as u64, "Recorded submission failure");
        self.transition(&mut inner, to, now);
        inner.mode
    }

    /// Network monitor signal.
    ///
    /// Losing connectivity counts as a failure. Regaining it changes nothing
    /// until a submission succeeds or [`mark_reachable`](Self::mark_reachable)
    /// is called.
    pub fn on_connectivity_change(&self, online: bool) -> OfflineMode {
        if online {
            debug!("Connectivity restored, awaiting confirmed submission");
            self.mode()
        } else {
            self.record_failure()
        }
    }

    /// Return to Online after reconnecting with nothing to submit.
    ///
    /// Restarts the emergency timer without counting as a submission.
    pub fn mark_reachable(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.reachable_at = now;
        inner.last_failure_at = None;
        self.transition(&mut inner, OfflineMode::Online, now);
    }

    /// Apply the timeout at the current time.
    pub fn tick(&self) -> OfflineMode {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.mode
    }

    pub fn mode(&self) -> OfflineMode {
        self.tick()
    }

    pub fn state(&self) -> OfflineState {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        let mode = inner.mode;
        let remaining_time_to_emergency = match mode {
            OfflineMode::Online => self.config.emergency_timeout,
            OfflineMode::Offline => self.remaining(&inner, now),
            OfflineMode::Emergency => Duration::ZERO,
        };
        OfflineState {
            mode,
            last_success_at: inner.last_success_at,
            last_failure_at: inner.last_failure_at,
            remaining_time_to_emergency,
            is_emergency: mode == OfflineMode::Emergency,
            is_offline_before_emergency: mode == OfflineMode::Offline,
        }
    }

    /// Whether new writes may go to the durable queue.
    pub fn accepts_durable_writes(&self) -> bool {
        self.mode() != OfflineMode::Emergency
    }

    /// Hold a write in memory while in Emergency.
    ///
    /// # Errors
    /// - `Error::InvalidState` outside Emergency
    /// - `Error::QueueFull` when the buffer is at capacity
    pub fn buffer_write(&self, request: RequestConfig, priority: Priority) -> Result<String> {
        let now = self.clock.now();
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.mode != OfflineMode::Emergency {
            return Err(Error::InvalidState(format!(
                "best-effort buffering requires emergency mode, current mode is {}",
                inner.mode
            )));
        }
        if inner.buffer.len() >= self.config.buffer_capacity {
            return Err(Error::QueueFull(self.config.buffer_capacity));
        }

        let id = Uuid::new_v4().to_string();
        warn!(
            id = %id,
            url = %request.url,
            "Write accepted in emergency mode; not durable beyond this process"
        );
        let _ = self.events.send(OfflineEvent::BestEffortWrite {
            id: id.clone(),
            url: request.url.clone(),
        });
        inner.buffer.push_back(BufferedWrite {
            id: id.clone(),
            request,
            priority,
            buffered_at: now,
        });
        Ok(id)
    }

    /// Remove and return all buffered writes, oldest first.
    pub fn take_buffered(&self) -> Vec<BufferedWrite> {
        self.lock().buffer.drain(..).collect()
    }

    /// Put writes back at the front of the buffer, e.g. after a failed
    /// hand-over to the queue.
    pub fn restore_buffered(&self, writes: Vec<BufferedWrite>) {
        let mut inner = self.lock();
        for write in writes.into_iter().rev() {
            inner.buffer.push_front(write);
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Follow a network monitor until its sender is dropped, applying the
    /// timeout every `tick_every`.
    pub async fn watch_connectivity(
        self: Arc<Self>,
        mut connectivity: watch::Receiver<bool>,
        tick_every: Duration,
    ) {
        let mut ticker = interval(tick_every);
        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        debug!("Network monitor closed, stopping offline watcher");
                        break;
                    }
                    let online = *connectivity.borrow_and_update();
                    self.on_connectivity_change(online);
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}
