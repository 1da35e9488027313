//! Lifecycle events published by the coordinator
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Coordinator: Initialized, SyncEnabledChanged,                  │
//! │               SyncConfigChanged, DeviceNameChanged              │
//! │  Registry:    DevicesDiscovered, DevicePaired, DeviceUnpaired   │
//! │  Session:     SyncStarted → SyncProgress* →                     │
//! │               (SyncCompleted | SyncFailed | SyncCancelled)      │
//! │  Inbound:     SyncReceived                                      │
//! │  Scheduler:   BackgroundSync{Started,Completed,Failed,Skipped}  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Events for one session arrive in order and end with exactly one terminal
//! event. Events from different sessions may interleave.

use std::fmt;

use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{
    DiscoveredDevice, DiscoveryId, PairedDevice, SessionId, SyncConfiguration, TransferResult,
};

/// Default capacity for the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why an automatic sync did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NetworkNotSuitable,
    PowerInsufficient,
    NoPairedDevices,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::NetworkNotSuitable => "network not suitable",
            SkipReason::PowerInsufficient => "battery too low",
            SkipReason::NoPairedDevices => "no paired devices",
        };
        f.write_str(s)
    }
}

/// Events emitted by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// `initialize` finished
    Initialized { sync_enabled: bool },
    SyncEnabledChanged { enabled: bool },
    SyncConfigChanged { config: SyncConfiguration },
    DeviceNameChanged { name: String },
    /// Results of a discovery sweep
    DevicesDiscovered {
        discovery_id: DiscoveryId,
        devices: Vec<DiscoveredDevice>,
    },
    DevicePaired { device: PairedDevice },
    DeviceUnpaired { device: PairedDevice },
    SyncStarted {
        session_id: SessionId,
        device_id: String,
    },
    SyncProgress { session_id: SessionId, progress: u8 },
    SyncCompleted {
        session_id: SessionId,
        device_id: String,
        result: TransferResult,
    },
    SyncFailed { session_id: SessionId, error: String },
    SyncCancelled { session_id: SessionId },
    /// A paired device pushed a package to us and it was applied
    SyncReceived {
        device_id: String,
        items_applied: usize,
    },
    BackgroundSyncStarted,
    BackgroundSyncCompleted { device_count: usize },
    BackgroundSyncFailed { error: String },
    BackgroundSyncSkipped { reason: SkipReason },
}

impl SyncEvent {
    /// Get the session ID associated with this event, if any
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            SyncEvent::SyncStarted { session_id, .. }
            | SyncEvent::SyncProgress { session_id, .. }
            | SyncEvent::SyncCompleted { session_id, .. }
            | SyncEvent::SyncFailed { session_id, .. }
            | SyncEvent::SyncCancelled { session_id } => Some(session_id),
            _ => None,
        }
    }

    /// Whether this event ends a session
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            SyncEvent::SyncCompleted { .. }
                | SyncEvent::SyncFailed { .. }
                | SyncEvent::SyncCancelled { .. }
        )
    }
}

/// Multi-subscriber event feed
///
/// Subscribers only see events sent after they subscribe. A slow subscriber
/// that falls more than the channel capacity behind gets
/// `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: SyncEvent) {
        trace!(?event, "Emitting sync event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_reason_display() {
        assert_eq!(
            SkipReason::NetworkNotSuitable.to_string(),
            "network not suitable"
        );
        assert_eq!(SkipReason::PowerInsufficient.to_string(), "battery too low");
        assert_eq!(SkipReason::NoPairedDevices.to_string(), "no paired devices");
    }

    #[test]
    fn test_event_session_id() {
        let session_id = SessionId::new();

        let event = SyncEvent::SyncProgress {
            session_id: session_id.clone(),
            progress: 40,
        };
        assert_eq!(event.session_id(), Some(&session_id));
        assert!(!event.is_session_terminal());

        let event = SyncEvent::SyncCancelled {
            session_id: session_id.clone(),
        };
        assert!(event.is_session_terminal());

        assert_eq!(SyncEvent::BackgroundSyncStarted.session_id(), None);
    }

    #[tokio::test]
    async fn test_subscribers_only_see_later_events() {
        let bus = EventBus::default();
        bus.emit(SyncEvent::SyncEnabledChanged { enabled: true });

        let mut rx = bus.subscribe();
        bus.emit(SyncEvent::DeviceNameChanged {
            name: "Desk".to_string(),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::DeviceNameChanged {
                name: "Desk".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(SyncEvent::BackgroundSyncStarted);

        assert_eq!(a.recv().await.unwrap(), SyncEvent::BackgroundSyncStarted);
        assert_eq!(b.recv().await.unwrap(), SyncEvent::BackgroundSyncStarted);
    }
}
