//! Network reachability contract.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tokio::sync::watch;
use tracing::info;

/// Link information reported by the host platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Connection class such as `4g`, `3g`, `2g` or `slow-2g`.
    pub effective_type: Option<String>,
    /// Estimated downlink bandwidth in megabits per second.
    pub downlink_mbps: Option<f64>,
    /// Estimated round-trip time in milliseconds.
    pub rtt_ms: Option<u64>,
}

/// Source of the online/offline signal.
///
/// Status changes are delivered on a `watch` channel; dropping the receiver
/// unsubscribes.
pub trait NetworkMonitor: Send + Sync {
    /// Current reachability.
    fn is_online(&self) -> bool;

    /// Subscribe to reachability changes.
    fn subscribe(&self) -> watch::Receiver<bool>;

    /// Link information, when the platform exposes it.
    fn network_info(&self) -> Option<NetworkInfo>;
}

/// Monitor whose state is set explicitly by the host (or by tests).
pub struct ManualNetworkMonitor {
    status: watch::Sender<bool>,
    info: RwLock<Option<NetworkInfo>>,
}

impl ManualNetworkMonitor {
    /// Create a monitor with an initial reachability.
    pub fn new(online: bool) -> Self {
        let (status, _) = watch::channel(online);
        Self {
            status,
            info: RwLock::new(None),
        }
    }

    /// Update reachability, notifying subscribers on change.
    pub fn set_online(&self, online: bool) {
        let changed = self.status.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Network status changed");
        }
    }

    /// Update link information.
    pub fn set_network_info(&self, info: Option<NetworkInfo>) {
        if let Ok(mut guard) = self.info.write() {
            *guard = info;
        }
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_monitor_notifies_on_change() {
        let monitor = ManualNetworkMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());
    }

    #[test]
    fn test_manual_monitor_ignores_same_value() {
        let monitor = ManualNetworkMonitor::new(true);
        let rx = monitor.subscribe();
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_network_info() {
        let monitor = ManualNetworkMonitor::new(true);
        assert!(monitor.network_info().is_none());

        monitor.set_network_info(Some(NetworkInfo {
            effective_type: Some("4g".to_string()),
            downlink_mbps: Some(10.0),
            rtt_ms: Some(50),
        }));
        assert_eq!(monitor.network_info().unwrap().rtt_ms, Some(50));
    }
}
