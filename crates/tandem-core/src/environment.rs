//! Environment signals consumed by the scheduler
//!
//! Network availability is observed through a `watch` channel: the scheduler
//! holds a receiver and reacts to transitions. Dropping the receiver is the
//! unsubscribe. Power is a simple policy query made at evaluation time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Kind of the active network link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    Wifi,
    Ethernet,
    Cellular,
    Other,
    None,
}

/// Snapshot of connectivity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    /// General internet connectivity is present
    pub available: bool,
    pub kind: NetworkKind,
    /// The platform flagged the link as metered
    pub metered: bool,
}

impl NetworkState {
    pub fn offline() -> Self {
        Self {
            available: false,
            kind: NetworkKind::None,
            metered: false,
        }
    }

    pub fn wifi() -> Self {
        Self {
            available: true,
            kind: NetworkKind::Wifi,
            metered: false,
        }
    }

    pub fn cellular() -> Self {
        Self {
            available: true,
            kind: NetworkKind::Cellular,
            metered: true,
        }
    }

    /// Wifi or ethernet that is not flagged metered
    pub fn is_unmetered(&self) -> bool {
        matches!(self.kind, NetworkKind::Wifi | NetworkKind::Ethernet) && !self.metered
    }
}

/// Source of network availability transitions
pub trait NetworkMonitor: Send + Sync {
    fn current(&self) -> NetworkState;

    /// Receiver that observes every later state change
    fn subscribe(&self) -> watch::Receiver<NetworkState>;
}

/// Network monitor driven by the host
///
/// Platforms without a connectivity API, and tests, push states with
/// [`set`](ManualNetworkMonitor::set).
#[derive(Clone)]
pub struct ManualNetworkMonitor {
    tx: Arc<watch::Sender<NetworkState>>,
}

impl ManualNetworkMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self, state: NetworkState) {
        debug!(?state, "Network state changed");
        self.tx.send_replace(state);
    }
}

impl Default for ManualNetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkState::wifi())
    }
}

impl NetworkMonitor for ManualNetworkMonitor {
    fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}

/// Whether the device has enough power for background work
pub trait PowerPolicy: Send + Sync {
    fn is_sufficient(&self) -> bool;
}

/// Used when no power signal is wired in
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSufficient;

impl PowerPolicy for AlwaysSufficient {
    fn is_sufficient(&self) -> bool {
        true
    }
}

/// Power flag the host flips from its battery callbacks
#[derive(Debug, Clone)]
pub struct SharedPowerState {
    sufficient: Arc<AtomicBool>,
}

impl SharedPowerState {
    pub fn new(sufficient: bool) -> Self {
        Self {
            sufficient: Arc::new(AtomicBool::new(sufficient)),
        }
    }

    pub fn set_sufficient(&self, sufficient: bool) {
        self.sufficient.store(sufficient, Ordering::Release);
    }
}

impl PowerPolicy for SharedPowerState {
    fn is_sufficient(&self) -> bool {
        self.sufficient.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmetered_kinds() {
        assert!(NetworkState::wifi().is_unmetered());
        assert!(!NetworkState::cellular().is_unmetered());
        assert!(!NetworkState::offline().is_unmetered());

        let tethered = NetworkState {
            available: true,
            kind: NetworkKind::Wifi,
            metered: true,
        };
        assert!(!tethered.is_unmetered());

        let wired = NetworkState {
            available: true,
            kind: NetworkKind::Ethernet,
            metered: false,
        };
        assert!(wired.is_unmetered());
    }

    #[tokio::test]
    async fn test_manual_monitor_notifies_subscribers() {
        let monitor = ManualNetworkMonitor::new(NetworkState::offline());
        let mut rx = monitor.subscribe();

        monitor.set(NetworkState::wifi());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), NetworkState::wifi());
        assert_eq!(monitor.current(), NetworkState::wifi());
    }

    #[test]
    fn test_power_policies() {
        assert!(AlwaysSufficient.is_sufficient());

        let power = SharedPowerState::new(true);
        let handle = power.clone();
        handle.set_sufficient(false);
        assert!(!power.is_sufficient());
    }
}
