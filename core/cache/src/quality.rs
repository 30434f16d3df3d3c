//! Network quality assessment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use fiscalgate_common::{clock::elapsed_between, system_clock, SharedClock};
use fiscalgate_storage::{NetworkInfo, NetworkMonitor};

/// How long an assessment is reused before re-measuring.
pub const DEFAULT_QUALITY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkSpeed {
    Fast,
    Moderate,
    Slow,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    High,
    Medium,
    Low,
    Unknown,
}

/// Snapshot of the link as seen by the cache strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkQuality {
    pub is_online: bool,
    pub speed: NetworkSpeed,
    pub latency_ms: Option<u64>,
    pub reliability: Reliability,
}

impl NetworkQuality {
    /// Quality when the monitor reports no connectivity.
    pub fn offline() -> Self {
        Self {
            is_online: false,
            speed: NetworkSpeed::Unknown,
            latency_ms: None,
            reliability: Reliability::Unknown,
        }
    }

    /// Derive quality from platform link information.
    pub fn from_info(info: Option<&NetworkInfo>) -> Self {
        let Some(info) = info else {
            return Self {
                is_online: true,
                speed: NetworkSpeed::Unknown,
                latency_ms: None,
                reliability: Reliability::Unknown,
            };
        };

        let speed = match info.effective_type.as_deref() {
            Some("4g") => NetworkSpeed::Fast,
            Some("3g") => NetworkSpeed::Moderate,
            Some("2g") | Some("slow-2g") => NetworkSpeed::Slow,
            _ => match info.downlink_mbps {
                Some(mbps) if mbps >= 5.0 => NetworkSpeed::Fast,
                Some(mbps) if mbps >= 1.0 => NetworkSpeed::Moderate,
                Some(_) => NetworkSpeed::Slow,
                None => NetworkSpeed::Unknown,
            },
        };

        let reliability = match info.rtt_ms {
            Some(rtt) if rtt < 150 => Reliability::High,
            Some(rtt) if rtt < 500 => Reliability::Medium,
            Some(_) => Reliability::Low,
            None => Reliability::Unknown,
        };

        Self {
            is_online: true,
            speed,
            latency_ms: info.rtt_ms,
            reliability,
        }
    }

    /// Online, fast, and not known to be unreliable.
    pub fn is_fast(&self) -> bool {
        self.is_online && self.speed == NetworkSpeed::Fast && self.reliability != Reliability::Low
    }

    /// Online but slow or unreliable.
    pub fn is_poor(&self) -> bool {
        self.is_online && (self.speed == NetworkSpeed::Slow || self.reliability == Reliability::Low)
    }
}

/// Assesses network quality, reusing the last result for a short period.
///
/// A change in reachability always forces a fresh assessment.
pub struct QualityAssessor {
    monitor: Arc<dyn NetworkMonitor>,
    clock: SharedClock,
    ttl: Duration,
    cached: Mutex<Option<(DateTime<Utc>, NetworkQuality)>>,
}

impl QualityAssessor {
    pub fn new(monitor: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            monitor,
            clock: system_clock(),
            ttl: DEFAULT_QUALITY_TTL,
            cached: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Current reachability straight from the monitor.
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Current quality, possibly cached.
    pub fn assess(&self) -> NetworkQuality {
        let now = self.clock.now();
        let online = self.monitor.is_online();
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((measured_at, quality)) = *cached {
            if quality.is_online == online && elapsed_between(measured_at, now) < self.ttl {
                return quality;
            }
        }

        let quality = if online {
            NetworkQuality::from_info(self.monitor.network_info().as_ref())
        } else {
            NetworkQuality::offline()
        };
        debug!(?quality, "Assessed network quality");
        *cached = Some((now, quality));
        quality
    }

    /// Drop the cached assessment.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
