//! Transport adapters: how bytes reach a paired device.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  TransportSet: one adapter per TransportKind                    │
//! │  └── TransportAdapter                                           │
//! │      ├── discover()  → reachable devices                        │
//! │      ├── pair()      → X25519 offer/accept handshake            │
//! │      └── connect()   → Channel                                  │
//! │          ├── send(chunk)   (awaited per chunk)                  │
//! │          └── receive_ack() → ChecksumAssertion                  │
//! │                                                                 │
//! │  RemoteEndpoint: the receiving half, implemented by the         │
//! │  coordinator so in-process transports can link two of them      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The session state machine only depends on these traits, so its contract
//! holds for any adapter plugged in.

pub mod loopback;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::types::{DeviceClass, DiscoveredDevice, TransportKind};

pub use loopback::{LoopbackPeer, LoopbackTransport};

/// What the remote reports having received: length and BLAKE3 digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumAssertion {
    pub length: u64,
    pub digest: [u8; 32],
}

impl ChecksumAssertion {
    /// Size of an acknowledgement on the wire
    pub const ENCODED_LEN: u64 = 8 + 32;

    pub fn of(bytes: &[u8]) -> Self {
        Self {
            length: bytes.len() as u64,
            digest: *blake3::hash(bytes).as_bytes(),
        }
    }

    /// Compare what the remote acknowledged against what was sent.
    pub fn verify_against(&self, sent: &ChecksumAssertion) -> SyncResult<()> {
        if self.length != sent.length {
            return Err(SyncError::VerificationFailed(format!(
                "remote received {} bytes, sent {}",
                self.length, sent.length
            )));
        }
        if self.digest != sent.digest {
            return Err(SyncError::VerificationFailed(
                "digest mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ChecksumAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes, blake3:{}",
            self.length,
            &hex::encode(self.digest)[..16]
        )
    }
}

/// First half of the pairing handshake, sent by the initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingOffer {
    pub device_id: String,
    pub device_name: String,
    pub device_class: DeviceClass,
    /// Initiator's X25519 public key for this attempt
    pub public_key: [u8; 32],
}

/// Second half of the pairing handshake, returned by the responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingAccept {
    pub device_class: DeviceClass,
    pub public_key: [u8; 32],
}

/// An established byte channel to one remote device
#[async_trait]
pub trait Channel: Send {
    /// Send one chunk. Returns once the transport has taken it.
    async fn send(&mut self, chunk: &[u8]) -> SyncResult<()>;

    /// Signal end of transfer and wait for the remote acknowledgement.
    async fn receive_ack(&mut self) -> SyncResult<ChecksumAssertion>;
}

/// Capability to reach devices over one transport kind
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Enumerate devices reachable right now
    async fn discover(&self) -> SyncResult<Vec<DiscoveredDevice>>;

    /// Run the pairing handshake with `device_id`
    async fn pair(&self, device_id: &str, offer: PairingOffer) -> SyncResult<PairingAccept>;

    /// Open a channel to `device_id`, announcing ourselves as `local_id`
    async fn connect(&self, device_id: &str, local_id: &str) -> SyncResult<Box<dyn Channel>>;
}

/// The receiving side of pairing and transfer
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn accept_pairing(
        &self,
        offer: PairingOffer,
        kind: TransportKind,
    ) -> SyncResult<PairingAccept>;

    /// Apply a package pushed by `from_device_id`; returns domains applied
    async fn accept_package(&self, from_device_id: &str, bytes: Vec<u8>) -> SyncResult<usize>;
}

/// Adapters keyed by the transport kind they serve
#[derive(Clone, Default)]
pub struct TransportSet {
    adapters: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind, replacing any previous one
    pub fn with(mut self, adapter: Arc<dyn TransportAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn TransportAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: TransportKind) -> SyncResult<&Arc<dyn TransportAdapter>> {
        self.adapters
            .get(&kind)
            .ok_or_else(|| SyncError::UnsupportedTransport(kind.to_string()))
    }

    /// All registered adapters, in a stable order
    pub fn adapters(&self) -> Vec<Arc<dyn TransportAdapter>> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort();
        kinds
            .into_iter()
            .filter_map(|k| self.adapters.get(&k).cloned())
            .collect()
    }
}
