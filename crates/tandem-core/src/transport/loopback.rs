//! In-process transport adapter
//!
//! `LoopbackTransport` serves one transport kind and holds a set of
//! simulated peers. A peer either answers on its own (fresh X25519 key per
//! pairing, packages kept for inspection) or is linked to a
//! [`RemoteEndpoint`], typically another coordinator in the same process.
//!
//! Latency and failure knobs make it usable for exercising timeouts,
//! cancellation, refusal, and verification failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    Channel, ChecksumAssertion, PairingAccept, PairingOffer, RemoteEndpoint, TransportAdapter,
};
use crate::crypto::PairingKeys;
use crate::error::{SyncError, SyncResult};
use crate::types::{DeviceClass, DiscoveredDevice, TransportKind};

/// A simulated remote device
pub struct LoopbackPeer {
    pub id: String,
    pub name: String,
    pub device_class: DeviceClass,
    refuse_pairing: bool,
    unreachable: bool,
    connect_delay: Duration,
    chunk_delay: Duration,
    corrupt_ack: bool,
    remote: Option<Arc<dyn RemoteEndpoint>>,
    shared_secret: Mutex<Option<[u8; 32]>>,
    received: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackPeer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_class: DeviceClass) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_class,
            refuse_pairing: false,
            unreachable: false,
            connect_delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            corrupt_ack: false,
            remote: None,
            shared_secret: Mutex::new(None),
            received: Mutex::new(Vec::new()),
        }
    }

    /// Reject every pairing handshake
    pub fn refusing_pairing(mut self) -> Self {
        self.refuse_pairing = true;
        self
    }

    /// Visible in discovery but never accepts a connection or handshake
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    /// Delay before a handshake or connection completes
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Delay per chunk sent
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Acknowledge with a digest that does not match what was received
    pub fn corrupting_ack(mut self) -> Self {
        self.corrupt_ack = true;
        self
    }

    /// Forward handshakes and packages to `remote`
    pub fn linked_to(mut self, remote: Arc<dyn RemoteEndpoint>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Secret agreed during the last standalone pairing
    pub fn shared_secret(&self) -> Option<[u8; 32]> {
        *self.shared_secret.lock()
    }

    /// Packages received so far, oldest first
    pub fn received_packages(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    fn descriptor(&self, kind: TransportKind) -> DiscoveredDevice {
        DiscoveredDevice {
            id: self.id.clone(),
            name: self.name.clone(),
            device_class: self.device_class,
            transport_kind: kind,
        }
    }

    async fn simulate_latency(&self) -> SyncResult<()> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.unreachable {
            return Err(SyncError::Connection(format!(
                "device {} is not reachable",
                self.id
            )));
        }
        Ok(())
    }
}

/// In-memory transport adapter for one transport kind
pub struct LoopbackTransport {
    kind: TransportKind,
    peers: RwLock<HashMap<String, Arc<LoopbackPeer>>>,
}

impl LoopbackTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Add or replace a peer; returns a handle for inspection
    pub fn add_peer(&self, peer: LoopbackPeer) -> Arc<LoopbackPeer> {
        let peer = Arc::new(peer);
        self.peers.write().insert(peer.id.clone(), peer.clone());
        peer
    }

    pub fn remove_peer(&self, device_id: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers.write().remove(device_id)
    }

    pub fn peer(&self, device_id: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers.read().get(device_id).cloned()
    }

    fn lookup(&self, device_id: &str) -> SyncResult<Arc<LoopbackPeer>> {
        self.peer(device_id).ok_or_else(|| {
            SyncError::Connection(format!("device {} is not reachable", device_id))
        })
    }
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn discover(&self) -> SyncResult<Vec<DiscoveredDevice>> {
        let mut devices: Vec<_> = self
            .peers
            .read()
            .values()
            .map(|p| p.descriptor(self.kind))
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn pair(&self, device_id: &str, offer: PairingOffer) -> SyncResult<PairingAccept> {
        let peer = self.lookup(device_id)?;
        peer.simulate_latency().await?;

        if peer.refuse_pairing {
            return Err(SyncError::PairingRefused(format!(
                "{} declined the handshake",
                peer.id
            )));
        }

        if let Some(remote) = &peer.remote {
            return remote.accept_pairing(offer, self.kind).await;
        }

        let keys = PairingKeys::generate();
        let secret = keys.agree(&offer.public_key)?;
        *peer.shared_secret.lock() = Some(secret);
        debug!(device_id, from = %offer.device_id, "Loopback peer accepted pairing");

        Ok(PairingAccept {
            device_class: peer.device_class,
            public_key: keys.public_bytes(),
        })
    }

    async fn connect(&self, device_id: &str, local_id: &str) -> SyncResult<Box<dyn Channel>> {
        let peer = self.lookup(device_id)?;
        peer.simulate_latency().await?;

        Ok(Box::new(LoopbackChannel {
            peer,
            from: local_id.to_string(),
            buffer: Vec::new(),
        }))
    }
}

struct LoopbackChannel {
    peer: Arc<LoopbackPeer>,
    from: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn send(&mut self, chunk: &[u8]) -> SyncResult<()> {
        if !self.peer.chunk_delay.is_zero() {
            tokio::time::sleep(self.peer.chunk_delay).await;
        }
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn receive_ack(&mut self) -> SyncResult<ChecksumAssertion> {
        let bytes = std::mem::take(&mut self.buffer);
        let mut ack = ChecksumAssertion::of(&bytes);

        if let Some(remote) = &self.peer.remote {
            remote
                .accept_package(&self.from, bytes.clone())
                .await
                .map_err(|e| {
                    SyncError::VerificationFailed(format!("remote rejected package: {}", e))
                })?;
        }
        self.peer.received.lock().push(bytes);

        if self.peer.corrupt_ack {
            ack.digest[0] ^= 0xFF;
        }
        Ok(ack)
    }
}
