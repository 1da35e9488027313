//! Sync sessions: one bounded attempt to push state to one paired device
//!
//! ## State machine
//!
//! ```text
//! ┌───────────┐   ┌────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Preparing │──▶│ Connecting │──▶│ Transferring │──▶│ Verifying │
//! └─────┬─────┘   └─────┬──────┘   └──────┬───────┘   └─────┬─────┘
//!       │               │                 │                 │
//!       ▼               ▼                 ▼                 ▼
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │          Completed  |  Failed  |  Cancelled  (terminal)      │
//!   └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Completed` is only reachable from `Verifying`. Any state may fail or be
//! cancelled. Terminal states are never left.
//!
//! ## Event ordering
//!
//! Each session's record sits behind its own lock, and every event for that
//! session is emitted while holding it. Together with the terminal check
//! this gives `SyncStarted → SyncProgress* → exactly one terminal event`.
//!
//! ## Cancellation
//!
//! [`SessionManager::cancel`] marks the record `Cancelled` immediately and
//! trips the session's token. The running task notices at the next phase
//! boundary, between chunks, or while awaiting the transport, and unwinds
//! without touching the registry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::package;
use crate::provider::DomainProviders;
use crate::registry::DeviceRegistry;
use crate::settings::CoordinatorSettings;
use crate::transport::{Channel, ChecksumAssertion, TransportSet};
use crate::types::{
    DeviceIdentity, DeviceStatus, PairedDevice, SessionId, SyncConfiguration, SyncPayload,
    TransferResult, TransportKind,
};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Preparing,
    Connecting,
    Transferring,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Cancelled => true,
            Connecting => *self == Preparing,
            Transferring => *self == Connecting,
            Verifying => *self == Transferring,
            Completed => *self == Verifying,
            Preparing => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Preparing => "preparing",
            SessionState::Connecting => "connecting",
            SessionState::Transferring => "transferring",
            SessionState::Verifying => "verifying",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Observable record of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    pub id: SessionId,
    pub remote_device_id: String,
    pub remote_device_name: String,
    pub transport_kind: TransportKind,
    pub status: SessionState,
    /// 0-100; 100 only once completed
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncSession {
    fn new(id: SessionId, device: &PairedDevice) -> Self {
        Self {
            id,
            remote_device_id: device.id.clone(),
            remote_device_name: device.name.clone(),
            transport_kind: device.transport_kind,
            status: SessionState::Preparing,
            progress: 0,
            start_time: Utc::now(),
            end_time: None,
            error: None,
        }
    }
}

/// Everything a session needs, captured when it starts
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub device: PairedDevice,
    pub shared_secret: Vec<u8>,
    pub local: DeviceIdentity,
    pub config: SyncConfiguration,
}

struct SessionSlot {
    record: Mutex<SyncSession>,
    cancel: CancellationToken,
}

/// Why a running session stopped short of completion
enum Abort {
    Cancelled,
    Failed(SyncError),
}

impl From<SyncError> for Abort {
    fn from(e: SyncError) -> Self {
        Abort::Failed(e)
    }
}

/// Runs sessions and keeps their records queryable
pub struct SessionManager {
    events: EventBus,
    registry: Arc<DeviceRegistry>,
    transports: TransportSet,
    providers: DomainProviders,
    settings: CoordinatorSettings,
    sessions: Mutex<BTreeMap<SessionId, Arc<SessionSlot>>>,
    /// Device id → its one non-terminal session
    active: Mutex<HashMap<String, SessionId>>,
}

impl SessionManager {
    pub fn new(
        events: EventBus,
        registry: Arc<DeviceRegistry>,
        transports: TransportSet,
        providers: DomainProviders,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            events,
            registry,
            transports,
            providers,
            settings,
            sessions: Mutex::new(BTreeMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session and run it on its own task.
    ///
    /// Returns as soon as `SyncStarted` has been emitted.
    ///
    /// # Errors
    ///
    /// `SyncError::SessionAlreadyActive` if the device already has a
    /// non-terminal session.
    pub fn start(self: &Arc<Self>, request: SessionRequest) -> SyncResult<SessionId> {
        let id = SessionId::new();
        let slot = Arc::new(SessionSlot {
            record: Mutex::new(SyncSession::new(id.clone(), &request.device)),
            cancel: CancellationToken::new(),
        });

        {
            let mut active = self.active.lock();
            if active.contains_key(&request.device.id) {
                return Err(SyncError::SessionAlreadyActive(request.device.id.clone()));
            }
            active.insert(request.device.id.clone(), id.clone());

            // Nothing can reach the slot before it is in the map, so Started
            // is always first.
            self.events.emit(SyncEvent::SyncStarted {
                session_id: id.clone(),
                device_id: request.device.id.clone(),
            });
            self.sessions.lock().insert(id.clone(), slot.clone());
        }
        self.evict_old_sessions();

        info!(
            session_id = %id,
            device_id = %request.device.id,
            transport = %request.device.transport_kind,
            "Sync session started"
        );

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.drive(slot, request).await;
        });

        Ok(id)
    }

    /// Snapshot of a session, if it is still retained
    pub fn status(&self, id: &SessionId) -> Option<SyncSession> {
        let slot = self.sessions.lock().get(id).cloned()?;
        let record = slot.record.lock().clone();
        Some(record)
    }

    /// Request cancellation.
    ///
    /// Returns `false` if the session already reached a terminal state, in
    /// which case nothing changes.
    pub fn cancel(&self, id: &SessionId) -> SyncResult<bool> {
        let slot = self
            .sessions
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::SessionNotFound(id.to_string()))?;
        Ok(self.cancel_slot(&slot))
    }

    /// Cancel the in-flight session against `device_id`, if any
    pub fn cancel_device(&self, device_id: &str) -> bool {
        let id = self.active.lock().get(device_id).cloned();
        match id {
            Some(id) => self.cancel(&id).unwrap_or(false),
            None => false,
        }
    }

    pub fn active_session_for(&self, device_id: &str) -> Option<SessionId> {
        self.active.lock().get(device_id).cloned()
    }

    /// Non-terminal sessions, oldest first
    pub fn active_sessions(&self) -> Vec<SyncSession> {
        let slots: Vec<_> = self.sessions.lock().values().cloned().collect();
        slots
            .iter()
            .map(|slot| slot.record.lock().clone())
            .filter(|s| !s.status.is_terminal())
            .collect()
    }

    /// Cancel every in-flight session
    pub fn cancel_all(&self) -> usize {
        let slots: Vec<_> = self.sessions.lock().values().cloned().collect();
        slots.iter().filter(|slot| self.cancel_slot(slot)).count()
    }

    fn cancel_slot(&self, slot: &SessionSlot) -> bool {
        let (device_id, id) = {
            let mut record = slot.record.lock();
            if record.status.is_terminal() {
                return false;
            }
            record.status = SessionState::Cancelled;
            record.end_time = Some(Utc::now());
            self.events.emit(SyncEvent::SyncCancelled {
                session_id: record.id.clone(),
            });
            info!(session_id = %record.id, progress = record.progress, "Sync session cancelled");
            slot.cancel.cancel();
            (record.remote_device_id.clone(), record.id.clone())
        };
        self.release_device(&device_id, &id);
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Session task
    // ═══════════════════════════════════════════════════════════════════════

    async fn drive(self: Arc<Self>, slot: Arc<SessionSlot>, request: SessionRequest) {
        let outcome = AssertUnwindSafe(self.run(&slot, &request))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(device_id = %request.device.id, %message, "Sync session panicked");
                Err(Abort::Failed(SyncError::InvalidOperation(format!(
                    "session task panicked: {}",
                    message
                ))))
            }
        };

        match result {
            Ok(transfer) => self.finish_completed(&slot, transfer),
            Err(Abort::Failed(e)) => self.finish_failed(&slot, e),
            Err(Abort::Cancelled) => {
                self.cancel_slot(&slot);
            }
        }

        let id = slot.record.lock().id.clone();
        self.release_device(&request.device.id, &id);
    }

    async fn run(&self, slot: &SessionSlot, request: &SessionRequest) -> Result<TransferResult, Abort> {
        let device = &request.device;

        // Preparing
        let payload = self.prepare_payload(slot, &request.config).await?;

        // Connecting
        self.advance(slot, SessionState::Connecting)?;
        let adapter = self.transports.get(device.transport_kind)?.clone();
        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            adapter.connect(&device.id, &request.local.id),
        );
        let mut channel = tokio::select! {
            _ = slot.cancel.cancelled() => return Err(Abort::Cancelled),
            result = connect => match result {
                Ok(channel) => channel?,
                Err(_) => {
                    return Err(SyncError::Timeout(format!("connecting to {}", device.id)).into())
                }
            },
        };
        debug!(device_id = %device.id, "Channel established");

        // Transferring
        self.advance(slot, SessionState::Transferring)?;
        let packed = package::pack(
            &payload,
            &request.local,
            &request.config,
            &request.shared_secret,
        )?;
        self.send_chunks(slot, channel.as_mut(), &packed).await?;

        // Verifying
        self.advance(slot, SessionState::Verifying)?;
        let ack = tokio::select! {
            _ = slot.cancel.cancelled() => return Err(Abort::Cancelled),
            result = tokio::time::timeout(self.settings.ack_timeout, channel.receive_ack()) => {
                match result {
                    Ok(ack) => ack?,
                    Err(_) => {
                        return Err(SyncError::Timeout(
                            "waiting for acknowledgement".to_string(),
                        ).into())
                    }
                }
            }
        };
        let expected = ChecksumAssertion::of(&packed);
        ack.verify_against(&expected)?;
        debug!(device_id = %device.id, %ack, "Remote acknowledgement verified");

        Ok(TransferResult {
            bytes_sent: packed.len() as u64,
            bytes_received: ChecksumAssertion::ENCODED_LEN,
            items_synced: payload.domain_blobs.len(),
        })
    }

    async fn prepare_payload(
        &self,
        slot: &SessionSlot,
        config: &SyncConfiguration,
    ) -> Result<SyncPayload, Abort> {
        let mut payload = SyncPayload::new();
        for domain in &config.sync_domains {
            if slot.cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            let provider = self.providers.get(*domain)?;
            let blob = provider
                .prepare(*domain)
                .await
                .map_err(|e| SyncError::Provider(format!("{}: {}", domain, e)))?;
            payload
                .metadata
                .insert(format!("{}_bytes", domain), blob.len().into());
            payload.domain_blobs.insert(*domain, blob);
        }
        Ok(payload)
    }

    async fn send_chunks(
        &self,
        slot: &SessionSlot,
        channel: &mut dyn Channel,
        packed: &[u8],
    ) -> Result<(), Abort> {
        let total = packed.len() as u64;
        let mut sent = 0u64;

        for chunk in packed.chunks(self.settings.chunk_size.max(1)) {
            if slot.cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }

            tokio::select! {
                _ = slot.cancel.cancelled() => return Err(Abort::Cancelled),
                result = tokio::time::timeout(self.settings.chunk_timeout, channel.send(chunk)) => {
                    match result {
                        Ok(result) => result?,
                        Err(_) => {
                            return Err(SyncError::Timeout("sending a chunk".to_string()).into())
                        }
                    }
                }
            }

            sent += chunk.len() as u64;
            // Capped at 99; only completion reports 100
            let progress = (sent * 99 / total.max(1)) as u8;
            self.report_progress(slot, progress)?;
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record updates (each under the slot lock)
    // ═══════════════════════════════════════════════════════════════════════

    fn advance(&self, slot: &SessionSlot, next: SessionState) -> Result<(), Abort> {
        let mut record = slot.record.lock();
        if record.status.is_terminal() || slot.cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        if !record.status.can_transition_to(next) {
            return Err(SyncError::InvalidOperation(format!(
                "illegal transition {} -> {}",
                record.status, next
            ))
            .into());
        }
        debug!(session_id = %record.id, from = %record.status, to = %next, "Session state change");
        record.status = next;
        Ok(())
    }

    fn report_progress(&self, slot: &SessionSlot, progress: u8) -> Result<(), Abort> {
        let mut record = slot.record.lock();
        if record.status != SessionState::Transferring {
            return Err(Abort::Cancelled);
        }
        record.progress = record.progress.max(progress);
        self.events.emit(SyncEvent::SyncProgress {
            session_id: record.id.clone(),
            progress: record.progress,
        });
        Ok(())
    }

    fn finish_completed(&self, slot: &SessionSlot, transfer: TransferResult) {
        let mut record = slot.record.lock();
        if record.status.is_terminal() {
            return;
        }

        let now = Utc::now();
        match self.registry.record_completed(&record.remote_device_id, now) {
            Ok(Some(_)) => {}
            // Unpaired while the transfer was in flight
            Ok(None) => {
                let device_id = record.remote_device_id.clone();
                drop(record);
                self.finish_failed(slot, SyncError::DeviceNotPaired(device_id));
                return;
            }
            Err(e) => {
                drop(record);
                self.finish_failed(slot, e);
                return;
            }
        }

        record.status = SessionState::Completed;
        record.progress = 100;
        record.end_time = Some(now);
        self.events.emit(SyncEvent::SyncCompleted {
            session_id: record.id.clone(),
            device_id: record.remote_device_id.clone(),
            result: transfer,
        });
        info!(
            session_id = %record.id,
            device_id = %record.remote_device_id,
            bytes = transfer.bytes_sent,
            items = transfer.items_synced,
            "Sync session completed"
        );
    }

    fn finish_failed(&self, slot: &SessionSlot, error: SyncError) {
        let mut record = slot.record.lock();
        if record.status.is_terminal() {
            return;
        }

        let device_status = if error.is_connection_error() {
            DeviceStatus::Offline
        } else {
            DeviceStatus::Error
        };
        if let Err(e) = self
            .registry
            .record_failed(&record.remote_device_id, device_status)
        {
            warn!(device_id = %record.remote_device_id, error = %e, "Failed to record session failure");
        }

        let message = error.to_string();
        record.status = SessionState::Failed;
        record.end_time = Some(Utc::now());
        record.error = Some(message.clone());
        self.events.emit(SyncEvent::SyncFailed {
            session_id: record.id.clone(),
            error: message,
        });
        warn!(
            session_id = %record.id,
            device_id = %record.remote_device_id,
            error = %error,
            "Sync session failed"
        );
    }

    /// Free the device for a new session if `id` still holds it
    fn release_device(&self, device_id: &str, id: &SessionId) {
        let mut active = self.active.lock();
        if active.get(device_id) == Some(id) {
            active.remove(device_id);
        }
    }

    /// Drop the oldest terminal sessions beyond the retention limit
    fn evict_old_sessions(&self) {
        let mut sessions = self.sessions.lock();
        let mut excess = sessions
            .len()
            .saturating_sub(self.settings.retained_sessions);
        if excess == 0 {
            return;
        }

        let evictable: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, slot)| slot.record.lock().status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in evictable {
            if excess == 0 {
                break;
            }
            sessions.remove(&id);
            excess -= 1;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{DomainProvider, InMemoryProvider};
    use crate::storage::MemoryStore;
    use crate::transport::{LoopbackPeer, LoopbackTransport};
    use crate::types::{DeviceClass, SyncDomain};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::broadcast;

    const KIND: TransportKind = TransportKind::LocalNetwork;

    struct Fixture {
        manager: Arc<SessionManager>,
        registry: Arc<DeviceRegistry>,
        transport: Arc<LoopbackTransport>,
        events: broadcast::Receiver<SyncEvent>,
    }

    fn fixture(settings: CoordinatorSettings, providers: DomainProviders) -> Fixture {
        let bus = EventBus::default();
        let events = bus.subscribe();
        let registry = Arc::new(DeviceRegistry::open(Arc::new(MemoryStore::new())).unwrap());
        let transport = Arc::new(LoopbackTransport::new(KIND));
        let manager = Arc::new(SessionManager::new(
            bus,
            registry.clone(),
            TransportSet::new().with(transport.clone()),
            providers,
            settings,
        ));
        Fixture {
            manager,
            registry,
            transport,
            events,
        }
    }

    fn providers() -> DomainProviders {
        let provider = Arc::new(InMemoryProvider::new());
        provider.set(SyncDomain::Memory, vec![1u8; 4000]);
        provider.set(SyncDomain::Preferences, b"theme=dark".to_vec());
        SyncDomain::ALL
            .into_iter()
            .fold(DomainProviders::new(), |p, d| p.with(d, provider.clone()))
    }

    fn request(fx: &Fixture, peer: LoopbackPeer) -> SessionRequest {
        let device = PairedDevice {
            id: peer.id.clone(),
            name: peer.name.clone(),
            device_class: peer.device_class,
            transport_kind: KIND,
            last_sync_time: None,
            status: DeviceStatus::Paired,
        };
        fx.transport.add_peer(peer);
        fx.registry.insert(device.clone(), &[9u8; 32]).unwrap();
        SessionRequest {
            device,
            shared_secret: vec![9u8; 32],
            local: DeviceIdentity::generate("Local"),
            config: SyncConfiguration::default(),
        }
    }

    async fn events_until_terminal(
        rx: &mut broadcast::Receiver<SyncEvent>,
        id: &SessionId,
    ) -> Vec<SyncEvent> {
        let mut seen = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            if event.session_id() != Some(id) {
                continue;
            }
            let terminal = event.is_session_terminal();
            seen.push(event);
            if terminal {
                return seen;
            }
        }
    }

    #[test]
    fn test_transitions() {
        use SessionState::*;

        assert!(Preparing.can_transition_to(Connecting));
        assert!(Verifying.can_transition_to(Completed));
        assert!(Transferring.can_transition_to(Cancelled));
        assert!(Connecting.can_transition_to(Failed));

        assert!(!Preparing.can_transition_to(Transferring));
        assert!(!Transferring.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Preparing));
    }

    #[tokio::test]
    async fn test_session_completes_with_ordered_events() {
        let settings = CoordinatorSettings {
            chunk_size: 512,
            ..Default::default()
        };
        let mut fx = fixture(settings, providers());
        let req = request(&fx, LoopbackPeer::new("tab", "Tablet", DeviceClass::Tablet));

        let id = fx.manager.start(req).unwrap();
        let events = events_until_terminal(&mut fx.events, &id).await;

        assert!(matches!(events[0], SyncEvent::SyncStarted { .. }));
        let mut last = 0u8;
        for event in &events[1..events.len() - 1] {
            match event {
                SyncEvent::SyncProgress { progress, .. } => {
                    assert!(*progress >= last);
                    assert!(*progress < 100);
                    last = *progress;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        match events.last().unwrap() {
            SyncEvent::SyncCompleted { result, .. } => {
                assert_eq!(result.items_synced, 3);
                assert!(result.bytes_sent > 4000);
            }
            other => panic!("expected completion, got {:?}", other),
        }

        let session = fx.manager.status(&id).unwrap();
        assert_eq!(session.status, SessionState::Completed);
        assert_eq!(session.progress, 100);
        assert!(session.end_time.is_some());
        assert_eq!(fx.registry.get("tab").unwrap().status, DeviceStatus::Synced);
        assert!(fx.manager.active_session_for("tab").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fails_and_marks_offline() {
        let mut fx = fixture(CoordinatorSettings::default(), providers());
        let req = request(
            &fx,
            LoopbackPeer::new("slow", "Slow", DeviceClass::Phone)
                .with_connect_delay(Duration::from_secs(60)),
        );

        let id = fx.manager.start(req).unwrap();
        let events = events_until_terminal(&mut fx.events, &id).await;
        assert!(matches!(events.last(), Some(SyncEvent::SyncFailed { .. })));

        let session = fx.manager.status(&id).unwrap();
        assert_eq!(session.status, SessionState::Failed);
        assert!(session.error.unwrap().contains("Timed out"));
        assert_eq!(fx.registry.get("slow").unwrap().status, DeviceStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_removed_mid_transfer_fails_session() {
        let settings = CoordinatorSettings {
            chunk_size: 256,
            ..Default::default()
        };
        let mut fx = fixture(settings, providers());
        let req = request(
            &fx,
            LoopbackPeer::new("gone", "Gone", DeviceClass::Tablet)
                .with_chunk_delay(Duration::from_millis(100)),
        );

        let id = fx.manager.start(req).unwrap();
        loop {
            if let SyncEvent::SyncProgress { .. } = fx.events.recv().await.unwrap() {
                break;
            }
        }
        fx.registry.remove("gone").unwrap();

        let events = events_until_terminal(&mut fx.events, &id).await;
        match events.last() {
            Some(SyncEvent::SyncFailed { error, .. }) => {
                assert!(error.contains("gone"), "{}", error)
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(fx.manager.status(&id).unwrap().status, SessionState::Failed);
        assert!(fx.registry.get("gone").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_transfer() {
        let settings = CoordinatorSettings {
            chunk_size: 256,
            ..Default::default()
        };
        let mut fx = fixture(settings, providers());
        let req = request(
            &fx,
            LoopbackPeer::new("crawl", "Crawl", DeviceClass::Desktop)
                .with_chunk_delay(Duration::from_millis(100)),
        );

        let id = fx.manager.start(req).unwrap();
        // Wait for some progress, then cancel
        loop {
            if let SyncEvent::SyncProgress { progress, .. } = fx.events.recv().await.unwrap() {
                if progress > 10 {
                    break;
                }
            }
        }
        assert!(fx.manager.cancel(&id).unwrap());
        assert!(!fx.manager.cancel(&id).unwrap());

        let session = fx.manager.status(&id).unwrap();
        assert_eq!(session.status, SessionState::Cancelled);
        assert!(session.progress < 100);
        assert!(session.end_time.is_some());
        assert_eq!(fx.registry.get("crawl").unwrap().status, DeviceStatus::Paired);

        // The task unwinds without emitting anything else for this session
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.manager.status(&id).unwrap(), session);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let fx = fixture(CoordinatorSettings::default(), providers());
        let req = request(
            &fx,
            LoopbackPeer::new("dup", "Dup", DeviceClass::Phone)
                .with_connect_delay(Duration::from_secs(5)),
        );

        let first = fx.manager.start(req.clone()).unwrap();
        assert!(matches!(
            fx.manager.start(req),
            Err(SyncError::SessionAlreadyActive(_))
        ));
        assert_eq!(fx.manager.active_session_for("dup"), Some(first.clone()));
        assert!(fx.manager.cancel(&first).unwrap());
        assert!(fx.manager.active_session_for("dup").is_none());
    }

    #[tokio::test]
    async fn test_corrupted_ack_fails_verification() {
        let mut fx = fixture(CoordinatorSettings::default(), providers());
        let req = request(
            &fx,
            LoopbackPeer::new("liar", "Liar", DeviceClass::Other).corrupting_ack(),
        );

        let id = fx.manager.start(req).unwrap();
        events_until_terminal(&mut fx.events, &id).await;

        let session = fx.manager.status(&id).unwrap();
        assert_eq!(session.status, SessionState::Failed);
        assert!(session.error.unwrap().contains("verification failed"));
        assert_eq!(fx.registry.get("liar").unwrap().status, DeviceStatus::Error);
    }

    struct PanickingProvider;

    #[async_trait]
    impl DomainProvider for PanickingProvider {
        async fn prepare(&self, _domain: SyncDomain) -> SyncResult<Vec<u8>> {
            panic!("provider exploded");
        }

        async fn apply(&self, _domain: SyncDomain, _bytes: &[u8]) -> SyncResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_provider_fails_session() {
        let providers = DomainProviders::new()
            .with(SyncDomain::Memory, Arc::new(PanickingProvider))
            .with(SyncDomain::Preferences, Arc::new(InMemoryProvider::new()))
            .with(SyncDomain::Personality, Arc::new(InMemoryProvider::new()));
        let mut fx = fixture(CoordinatorSettings::default(), providers);
        let req = request(&fx, LoopbackPeer::new("p", "P", DeviceClass::Phone));

        let id = fx.manager.start(req).unwrap();
        events_until_terminal(&mut fx.events, &id).await;

        let session = fx.manager.status(&id).unwrap();
        assert_eq!(session.status, SessionState::Failed);
        assert!(session.error.unwrap().contains("provider exploded"));
    }

    #[tokio::test]
    async fn test_missing_provider_fails_in_preparing() {
        let mut fx = fixture(CoordinatorSettings::default(), DomainProviders::new());
        let req = request(&fx, LoopbackPeer::new("np", "NP", DeviceClass::Phone));

        let id = fx.manager.start(req).unwrap();
        events_until_terminal(&mut fx.events, &id).await;

        let session = fx.manager.status(&id).unwrap();
        assert_eq!(session.status, SessionState::Failed);
        assert!(session.error.unwrap().contains("no provider registered"));
        assert_eq!(session.progress, 0);
    }

    #[tokio::test]
    async fn test_old_terminal_sessions_evicted() {
        let settings = CoordinatorSettings {
            retained_sessions: 2,
            ..Default::default()
        };
        let mut fx = fixture(settings, providers());
        let req = request(&fx, LoopbackPeer::new("e", "E", DeviceClass::Phone));

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = fx.manager.start(req.clone()).unwrap();
            events_until_terminal(&mut fx.events, &id).await;
            ids.push(id);
        }

        assert!(fx.manager.status(&ids[0]).is_none());
        assert!(fx.manager.status(&ids[1]).is_some());
        assert!(fx.manager.status(&ids[2]).is_some());
    }
}
