//! Tandem Core Library
//!
//! Cross-device sync coordination: discover, pair with, and periodically
//! push application state to other installations of the same app.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncCoordinator                                                │
//! │  ├── DeviceRegistry   paired devices + pairing secrets          │
//! │  ├── SessionManager   one state machine per in-flight sync      │
//! │  │   ├── DomainProviders   opaque blobs per domain              │
//! │  │   ├── package           encrypt + frame (ChaCha20-Poly1305)  │
//! │  │   └── TransportSet      connect / send / acknowledge         │
//! │  ├── Scheduler        network transitions + periodic timer      │
//! │  └── EventBus         broadcast of lifecycle events             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Principles
//!
//! - **Whole-snapshot transfer**: each session replaces domain blobs; merging
//!   diverged data is the provider's business
//! - **Metadata in the clear, payload sealed**: the container header is
//!   authenticated but readable, so a receiver can route before decrypting
//! - **Failures are outcomes**: session errors end in `Failed` plus an event,
//!   never in a panic reaching the caller
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tandem_core::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(LoopbackTransport::new(TransportKind::LocalNetwork));
//!     transport.add_peer(LoopbackPeer::new("tablet-1", "Tablet", DeviceClass::Tablet));
//!
//!     let provider = Arc::new(InMemoryProvider::new());
//!     let providers = SyncDomain::ALL
//!         .into_iter()
//!         .fold(DomainProviders::new(), |p, d| p.with(d, provider.clone()));
//!
//!     let coordinator = SyncCoordinator::new(
//!         CoordinatorDeps::new(
//!             Arc::new(MemoryStore::new()),
//!             TransportSet::new().with(transport),
//!             providers,
//!         ),
//!         CoordinatorSettings::default(),
//!     );
//!     coordinator.initialize().await?;
//!     coordinator.pair("tablet-1", "Tablet", TransportKind::LocalNetwork).await?;
//!
//!     for id in coordinator.sync_with_all_devices() {
//!         println!("started {}", id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod coordinator;
pub mod crypto;
pub mod environment;
pub mod error;
pub mod events;
pub mod package;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod storage;
pub mod transport;
pub mod types;

// Re-exports
pub use coordinator::{CoordinatorDeps, SyncCoordinator};
pub use environment::{
    AlwaysSufficient, ManualNetworkMonitor, NetworkKind, NetworkMonitor, NetworkState,
    PowerPolicy, SharedPowerState,
};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SkipReason, SyncEvent, EVENT_CHANNEL_CAPACITY};
pub use package::{PackageMetadata, UnpackedPackage, PACKAGE_VERSION};
pub use provider::{DomainProvider, DomainProviders, InMemoryProvider};
pub use registry::DeviceRegistry;
pub use scheduler::{BackgroundSync, SchedulerHandle};
pub use session::{SessionState, SyncSession};
pub use settings::CoordinatorSettings;
pub use storage::{MemoryStore, Persistence, RedbStore};
pub use transport::{
    Channel, ChecksumAssertion, LoopbackPeer, LoopbackTransport, PairingAccept, PairingOffer,
    RemoteEndpoint, TransportAdapter, TransportSet,
};
pub use types::*;
