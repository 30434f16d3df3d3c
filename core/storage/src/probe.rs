//! Network monitor driven by periodic HTTP probes.

use reqwest::Client;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use fiscalgate_common::{Error, Result};

use crate::network::{NetworkInfo, NetworkMonitor};

/// Default interval between probes.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);
/// Default timeout of a single probe.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Monitor that infers reachability from a health endpoint.
///
/// Any HTTP response counts as reachable; connection errors and timeouts
/// count as unreachable. The measured round-trip time is exposed as
/// [`NetworkInfo`].
pub struct ProbeNetworkMonitor {
    client: Client,
    url: String,
    period: Duration,
    status: watch::Sender<bool>,
    info: RwLock<Option<NetworkInfo>>,
}

impl ProbeNetworkMonitor {
    /// Create a monitor probing `url`. Starts in the online state.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_PROBE_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create probe client: {}", e)))?;
        let (status, _) = watch::channel(true);

        Ok(Self {
            client,
            url: url.into(),
            period: DEFAULT_PROBE_INTERVAL,
            status,
            info: RwLock::new(None),
        })
    }

    /// Set the probe interval.
    pub fn with_interval(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Probe once and publish the result.
    pub async fn probe_once(&self) -> bool {
        let started = Instant::now();
        let online = match self.client.get(&self.url).send().await {
            Ok(response) => {
                debug!(status = response.status().as_u16(), "Probe answered");
                true
            }
            Err(e) => {
                debug!("Probe failed: {}", e);
                false
            }
        };

        if online {
            let rtt_ms = started.elapsed().as_millis() as u64;
            if let Ok(mut guard) = self.info.write() {
                *guard = Some(NetworkInfo {
                    effective_type: Some(effective_type_for_rtt(rtt_ms).to_string()),
                    downlink_mbps: None,
                    rtt_ms: Some(rtt_ms),
                });
            }
        }

        let changed = self.status.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, url = %self.url, "Network status changed");
        }
        online
    }

    /// Probe forever at the configured interval.
    ///
    /// Spawn this on a task; abort the task handle to stop probing.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(self.period);
        loop {
            ticker.tick().await;
            self.probe_once().await;
        }
    }
}

/// Map a measured round-trip time onto a connection class.
pub fn effective_type_for_rtt(rtt_ms: u64) -> &'static str {
    match rtt_ms {
        0..=99 => "4g",
        100..=299 => "3g",
        300..=1399 => "2g",
        _ => "slow-2g",
    }
}

impl NetworkMonitor for ProbeNetworkMonitor {
    fn is_online(&self) -> bool {
        *self.status.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }

    fn network_info(&self) -> Option<NetworkInfo> {
        self.info.read().ok().and_then(|guard| guard.clone())
    }
}
