//! SyncCoordinator - the entry point for cross-device sync
//!
//! The coordinator owns the device identity, the user's sync configuration,
//! the device registry, and the event stream. It wires the session manager
//! and the background scheduler together.
//!
//! ## Lifecycle
//!
//! ```text
//! new(deps, settings)
//!   └── initialize()      load identity/config/registry, arm scheduler
//!         ├── pair / unpair / start_discovery
//!         ├── sync_with_device / sync_with_all_devices
//!         ├── set_sync_enabled / update_sync_config / set_device_name
//!         └── shutdown()  stop scheduler, cancel sessions
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tandem_core::{CoordinatorDeps, CoordinatorSettings, MemoryStore, SyncCoordinator};
//!
//! let coordinator = SyncCoordinator::new(
//!     CoordinatorDeps::new(Arc::new(MemoryStore::new()), transports, providers),
//!     CoordinatorSettings::default(),
//! );
//! coordinator.initialize().await?;
//! let mut events = coordinator.subscribe();
//! let sessions = coordinator.sync_with_all_devices();
//! ```

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::crypto::PairingKeys;
use crate::environment::{AlwaysSufficient, ManualNetworkMonitor, NetworkMonitor, PowerPolicy};
use crate::error::{SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::package;
use crate::provider::DomainProviders;
use crate::registry::DeviceRegistry;
use crate::scheduler::{BackgroundSync, Environment, SchedulerHandle};
use crate::session::{SessionManager, SessionRequest, SyncSession};
use crate::settings::CoordinatorSettings;
use crate::storage::{keys, load_json, save_json, Persistence};
use crate::transport::{PairingAccept, PairingOffer, RemoteEndpoint, TransportSet};
use crate::types::{
    DeviceIdentity, DeviceStatus, DiscoveredDevice, DiscoveryId, PairedDevice, SessionId,
    SyncConfiguration, TransportKind,
};

/// Injected capabilities
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub store: Arc<dyn Persistence>,
    pub transports: TransportSet,
    pub providers: DomainProviders,
    pub network: Arc<dyn NetworkMonitor>,
    pub power: Arc<dyn PowerPolicy>,
}

impl CoordinatorDeps {
    /// Deps with a network monitor that reports wifi and no power signal
    pub fn new(
        store: Arc<dyn Persistence>,
        transports: TransportSet,
        providers: DomainProviders,
    ) -> Self {
        Self {
            store,
            transports,
            providers,
            network: Arc::new(ManualNetworkMonitor::default()),
            power: Arc::new(AlwaysSufficient),
        }
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = network;
        self
    }

    pub fn with_power(mut self, power: Arc<dyn PowerPolicy>) -> Self {
        self.power = power;
        self
    }
}

/// Mutable coordinator state
struct CoordinatorState {
    initialized: bool,
    identity: Option<DeviceIdentity>,
    sync_enabled: bool,
    config: SyncConfiguration,
}

struct CoordinatorInner {
    store: Arc<dyn Persistence>,
    settings: CoordinatorSettings,
    events: EventBus,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    transports: TransportSet,
    providers: DomainProviders,
    environment: Environment,
    state: RwLock<CoordinatorState>,
    /// Serializes setters and owns the running scheduler, if any
    control: Mutex<Option<SchedulerHandle>>,
    /// Held while a session starts and while a device is unpaired, so the
    /// two never interleave
    membership: SyncMutex<()>,
}

/// Cross-device sync coordinator
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SyncCoordinator {
    /// Build a coordinator. Nothing is loaded until [`initialize`](Self::initialize).
    pub fn new(deps: CoordinatorDeps, settings: CoordinatorSettings) -> Self {
        let events = EventBus::new(settings.event_capacity);
        let registry = Arc::new(DeviceRegistry::new(deps.store.clone()));
        let sessions = Arc::new(SessionManager::new(
            events.clone(),
            registry.clone(),
            deps.transports.clone(),
            deps.providers.clone(),
            settings.clone(),
        ));

        let inner = CoordinatorInner {
            store: deps.store,
            settings,
            events,
            registry,
            sessions,
            transports: deps.transports,
            providers: deps.providers,
            environment: Environment {
                network: deps.network,
                power: deps.power,
            },
            state: RwLock::new(CoordinatorState {
                initialized: false,
                identity: None,
                sync_enabled: false,
                config: SyncConfiguration::default(),
            }),
            control: Mutex::new(None),
            membership: SyncMutex::new(()),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Subscribe to lifecycle events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Load identity, configuration, and registry; arm the scheduler if sync
    /// was left enabled.
    ///
    /// Generates and persists an identity on first run. Calling this again
    /// on an initialized coordinator does nothing.
    pub async fn initialize(&self) -> SyncResult<()> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        if inner.state.read().initialized {
            return Ok(());
        }

        let store = inner.store.as_ref();
        let identity = match load_json::<DeviceIdentity>(store, keys::IDENTITY)? {
            Some(identity) => identity,
            None => {
                let identity = DeviceIdentity::generate(&inner.settings.default_device_name);
                save_json(store, keys::IDENTITY, &identity)?;
                info!(device_id = %identity.id, "Generated device identity");
                identity
            }
        };
        let sync_enabled = load_json::<bool>(store, keys::SYNC_ENABLED)?.unwrap_or(false);
        let config = load_json::<SyncConfiguration>(store, keys::SYNC_CONFIG)?.unwrap_or_default();
        let device_count = inner.registry.reload()?;

        info!(
            device_id = %identity.id,
            sync_enabled,
            paired_devices = device_count,
            "Sync coordinator initialized"
        );

        {
            let mut state = inner.state.write();
            state.initialized = true;
            state.identity = Some(identity);
            state.sync_enabled = sync_enabled;
            state.config = config;
        }
        inner.rearm_scheduler(&mut control).await;

        inner.events.emit(SyncEvent::Initialized { sync_enabled });
        Ok(())
    }

    /// Stop the scheduler and cancel every in-flight session.
    ///
    /// The coordinator refuses further work until initialized again.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        if let Some(scheduler) = control.take() {
            scheduler.stop().await;
        }
        inner.state.write().initialized = false;
        let cancelled = inner.sessions.cancel_all();
        info!(cancelled_sessions = cancelled, "Sync coordinator shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.read().initialized
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Configuration
    // ═══════════════════════════════════════════════════════════════════════

    pub fn is_sync_enabled(&self) -> bool {
        self.inner.state.read().sync_enabled
    }

    /// Turn automatic sync on or off.
    ///
    /// Disabling stops both triggers. Sessions already running finish.
    pub async fn set_sync_enabled(&self, enabled: bool) -> SyncResult<()> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        inner.ensure_initialized()?;
        if inner.state.read().sync_enabled == enabled {
            return Ok(());
        }

        save_json(inner.store.as_ref(), keys::SYNC_ENABLED, &enabled)?;
        inner.state.write().sync_enabled = enabled;
        info!(enabled, "Sync enabled changed");
        inner.events.emit(SyncEvent::SyncEnabledChanged { enabled });

        inner.rearm_scheduler(&mut control).await;
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfiguration {
        self.inner.state.read().config.clone()
    }

    /// Replace the sync configuration.
    ///
    /// # Errors
    ///
    /// `SyncError::InvalidOperation` for a zero auto-sync interval.
    pub async fn update_sync_config(&self, config: SyncConfiguration) -> SyncResult<()> {
        let inner = &self.inner;
        let mut control = inner.control.lock().await;
        inner.ensure_initialized()?;
        if config.auto_sync_interval.is_zero() {
            return Err(SyncError::InvalidOperation(
                "auto-sync interval must be positive".to_string(),
            ));
        }
        if inner.state.read().config == config {
            return Ok(());
        }

        save_json(inner.store.as_ref(), keys::SYNC_CONFIG, &config)?;
        inner.state.write().config = config.clone();
        info!(?config, "Sync configuration changed");
        inner.events.emit(SyncEvent::SyncConfigChanged { config });

        inner.rearm_scheduler(&mut control).await;
        Ok(())
    }

    /// Local identity, once initialized
    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.inner.state.read().identity.clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.identity().map(|i| i.id)
    }

    pub fn device_name(&self) -> Option<String> {
        self.identity().map(|i| i.display_name)
    }

    /// Rename this device. Surrounding whitespace is trimmed.
    pub async fn set_device_name(&self, name: &str) -> SyncResult<()> {
        let inner = &self.inner;
        let _control = inner.control.lock().await;
        let mut identity = inner.ensure_initialized()?;

        let name = name.trim();
        if name.is_empty() {
            return Err(SyncError::InvalidOperation(
                "device name must not be empty".to_string(),
            ));
        }
        if identity.display_name == name {
            return Ok(());
        }

        identity.display_name = name.to_string();
        save_json(inner.store.as_ref(), keys::IDENTITY, &identity)?;
        inner.state.write().identity = Some(identity);
        info!(name, "Device name changed");
        inner.events.emit(SyncEvent::DeviceNameChanged {
            name: name.to_string(),
        });
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Discovery and pairing
    // ═══════════════════════════════════════════════════════════════════════

    /// Enumerate reachable devices on every registered transport.
    ///
    /// Returns immediately; the result arrives as `DevicesDiscovered` with
    /// the same id. A failing adapter is logged and skipped.
    pub fn start_discovery(&self) -> SyncResult<DiscoveryId> {
        let local = self.inner.ensure_initialized()?;
        let discovery_id = DiscoveryId::new();
        let adapters = self.inner.transports.adapters();
        let events = self.inner.events.clone();

        debug!(%discovery_id, transports = adapters.len(), "Starting discovery");
        let id = discovery_id.clone();
        tokio::spawn(async move {
            let mut devices: Vec<DiscoveredDevice> = Vec::new();
            for adapter in adapters {
                match adapter.discover().await {
                    Ok(found) => devices.extend(found.into_iter().filter(|d| d.id != local.id)),
                    Err(e) => {
                        warn!(transport = %adapter.kind(), error = %e, "Discovery failed on transport")
                    }
                }
            }
            info!(discovery_id = %id, count = devices.len(), "Discovery finished");
            events.emit(SyncEvent::DevicesDiscovered {
                discovery_id: id,
                devices,
            });
        });

        Ok(discovery_id)
    }

    /// Pair with a device over `transport_kind`.
    ///
    /// Runs the X25519 handshake, bounded by the pairing timeout, then
    /// records the device as `paired`. On any failure the registry is left
    /// untouched and no event is emitted.
    pub async fn pair(
        &self,
        device_id: &str,
        name: &str,
        transport_kind: TransportKind,
    ) -> SyncResult<PairedDevice> {
        let inner = &self.inner;
        let local = inner.ensure_initialized()?;
        if device_id == local.id {
            return Err(SyncError::InvalidOperation(
                "cannot pair with this device".to_string(),
            ));
        }
        let adapter = inner.transports.get(transport_kind)?.clone();

        let keys = PairingKeys::generate();
        let offer = PairingOffer {
            device_id: local.id.clone(),
            device_name: local.display_name.clone(),
            device_class: inner.settings.device_class,
            public_key: keys.public_bytes(),
        };

        info!(device_id, transport = %transport_kind, "Pairing with device");
        let accept =
            tokio::time::timeout(inner.settings.pairing_timeout, adapter.pair(device_id, offer))
                .await
                .map_err(|_| SyncError::Timeout(format!("pairing with {}", device_id)))??;
        let secret = keys.agree(&accept.public_key)?;

        let device = PairedDevice {
            id: device_id.to_string(),
            name: name.to_string(),
            device_class: accept.device_class,
            transport_kind,
            last_sync_time: None,
            status: DeviceStatus::Paired,
        };
        inner.registry.insert(device.clone(), &secret)?;
        inner.events.emit(SyncEvent::DevicePaired {
            device: device.clone(),
        });
        Ok(device)
    }

    /// Forget a paired device.
    ///
    /// The device leaves the registry first, then any in-flight session
    /// against it is cancelled, so no new session can start in between.
    /// Returns `false` if the device was not paired.
    pub async fn unpair(&self, device_id: &str) -> SyncResult<bool> {
        let inner = &self.inner;
        inner.ensure_initialized()?;

        let removed = {
            let _membership = inner.membership.lock();
            let removed = inner.registry.remove(device_id)?;
            if inner.sessions.cancel_device(device_id) {
                debug!(device_id, "Cancelled active session of unpaired device");
            }
            removed
        };

        match removed {
            Some(device) => {
                inner.events.emit(SyncEvent::DeviceUnpaired { device });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Snapshot of the registry
    pub fn paired_devices(&self) -> Vec<PairedDevice> {
        self.inner.registry.list()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sessions
    // ═══════════════════════════════════════════════════════════════════════

    /// Start a session against one paired device and return its id.
    ///
    /// Does not require sync to be enabled; that only gates automatic runs.
    ///
    /// # Errors
    ///
    /// - `SyncError::DeviceNotPaired` for an unknown or merely discovered device
    /// - `SyncError::SessionAlreadyActive` if the device already has a session
    pub fn sync_with_device(&self, device_id: &str) -> SyncResult<SessionId> {
        self.inner.start_session(device_id)
    }

    /// Start one session per paired device. A device that cannot start is
    /// logged and skipped.
    pub fn sync_with_all_devices(&self) -> Vec<SessionId> {
        self.inner.start_all_sessions()
    }

    pub fn session_status(&self, session_id: &SessionId) -> Option<SyncSession> {
        self.inner.sessions.status(session_id)
    }

    /// Request cancellation. `false` if the session had already ended.
    pub fn cancel_sync(&self, session_id: &SessionId) -> SyncResult<bool> {
        self.inner.sessions.cancel(session_id)
    }

    pub fn active_sessions(&self) -> Vec<SyncSession> {
        self.inner.sessions.active_sessions()
    }
}

impl CoordinatorInner {
    /// Identity if initialized, else an error
    fn ensure_initialized(&self) -> SyncResult<DeviceIdentity> {
        let state = self.state.read();
        match (&state.identity, state.initialized) {
            (Some(identity), true) => Ok(identity.clone()),
            _ => Err(SyncError::InvalidOperation(
                "coordinator is not initialized".to_string(),
            )),
        }
    }

    fn start_session(&self, device_id: &str) -> SyncResult<SessionId> {
        let local = self.ensure_initialized()?;
        let _membership = self.membership.lock();
        let device = self
            .registry
            .get(device_id)
            .filter(|d| d.status.is_sync_target())
            .ok_or_else(|| SyncError::DeviceNotPaired(device_id.to_string()))?;
        let shared_secret = self.registry.secret_for(device_id)?;
        let config = self.state.read().config.clone();

        self.sessions.start(SessionRequest {
            device,
            shared_secret,
            local,
            config,
        })
    }

    fn start_all_sessions(&self) -> Vec<SessionId> {
        let mut started = Vec::new();
        for device in self.registry.list() {
            if !device.status.is_sync_target() {
                continue;
            }
            match self.start_session(&device.id) {
                Ok(id) => started.push(id),
                Err(SyncError::SessionAlreadyActive(_)) => {
                    debug!(device_id = %device.id, "Session already active, skipping");
                }
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "Could not start sync session");
                }
            }
        }
        started
    }

    /// Stop the current scheduler and start a new one if sync and auto-sync
    /// are both on.
    async fn rearm_scheduler(self: &Arc<Self>, slot: &mut Option<SchedulerHandle>) {
        if let Some(scheduler) = slot.take() {
            scheduler.stop().await;
        }

        let (armed, interval) = {
            let state = self.state.read();
            (
                state.initialized && state.sync_enabled && state.config.auto_sync_enabled,
                state.config.auto_sync_interval,
            )
        };
        if armed {
            let target: Weak<dyn BackgroundSync> = Arc::downgrade(self) as Weak<dyn BackgroundSync>;
            *slot = Some(SchedulerHandle::spawn(
                target,
                self.environment.clone(),
                self.events.clone(),
                interval,
            ));
        }
    }
}

#[async_trait]
impl BackgroundSync for CoordinatorInner {
    fn paired_device_count(&self) -> usize {
        self.registry
            .list()
            .iter()
            .filter(|d| d.status.is_sync_target())
            .count()
    }

    fn sync_config(&self) -> SyncConfiguration {
        self.state.read().config.clone()
    }

    async fn sync_all(&self) -> SyncResult<Vec<SessionId>> {
        self.ensure_initialized()?;
        Ok(self.start_all_sessions())
    }
}

#[async_trait]
impl RemoteEndpoint for SyncCoordinator {
    /// Answer a pairing offer from another device.
    async fn accept_pairing(
        &self,
        offer: PairingOffer,
        kind: TransportKind,
    ) -> SyncResult<PairingAccept> {
        let inner = &self.inner;
        let local = inner.ensure_initialized()?;
        if offer.device_id == local.id {
            return Err(SyncError::PairingRefused(
                "offer came from this device".to_string(),
            ));
        }

        let keys = PairingKeys::generate();
        let secret = keys.agree(&offer.public_key)?;
        let device = PairedDevice {
            id: offer.device_id,
            name: offer.device_name,
            device_class: offer.device_class,
            transport_kind: kind,
            last_sync_time: None,
            status: DeviceStatus::Paired,
        };
        inner.registry.insert(device.clone(), &secret)?;
        inner.events.emit(SyncEvent::DevicePaired { device });

        Ok(PairingAccept {
            device_class: inner.settings.device_class,
            public_key: keys.public_bytes(),
        })
    }

    /// Apply a package pushed by a paired device.
    ///
    /// Only domains enabled locally are applied; the rest are ignored.
    async fn accept_package(&self, from_device_id: &str, bytes: Vec<u8>) -> SyncResult<usize> {
        let inner = &self.inner;
        inner.ensure_initialized()?;
        if inner.registry.get(from_device_id).is_none() {
            return Err(SyncError::DeviceNotPaired(from_device_id.to_string()));
        }

        let metadata = package::peek_metadata(&bytes)?;
        if metadata.sender_id != from_device_id {
            return Err(SyncError::MalformedPackage(format!(
                "package sender {} does not match peer {}",
                metadata.sender_id, from_device_id
            )));
        }

        let secret = inner.registry.secret_for(from_device_id)?;
        let unpacked = package::unpack(&bytes, &secret)?;
        let enabled = inner.state.read().config.sync_domains.clone();

        let mut applied = 0;
        for (domain, blob) in &unpacked.payload.domain_blobs {
            if !enabled.contains(domain) {
                debug!(%domain, "Ignoring domain disabled locally");
                continue;
            }
            inner.providers.get(*domain)?.apply(*domain, blob).await?;
            applied += 1;
        }

        inner.registry.record_completed(from_device_id, Utc::now())?;
        info!(
            device_id = from_device_id,
            sender = %unpacked.metadata.sender_name,
            domains = applied,
            "Applied package from paired device"
        );
        inner.events.emit(SyncEvent::SyncReceived {
            device_id: from_device_id.to_string(),
            items_applied: applied,
        });
        Ok(applied)
    }
}
