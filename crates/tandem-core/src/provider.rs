//! Domain providers: the owners of the state being synced.
//!
//! The coordinator never looks inside a domain blob. Each provider turns its
//! domain into bytes for an outgoing session and applies bytes received from
//! a peer. How diverged data is merged is entirely the provider's concern.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{SyncError, SyncResult};
use crate::types::SyncDomain;

/// Produces and consumes the opaque blob for one domain
#[async_trait]
pub trait DomainProvider: Send + Sync {
    /// Snapshot the domain for sending
    async fn prepare(&self, domain: SyncDomain) -> SyncResult<Vec<u8>>;

    /// Replace local state with a snapshot received from a peer
    async fn apply(&self, domain: SyncDomain, bytes: &[u8]) -> SyncResult<()>;
}

/// Provider lookup by domain
#[derive(Clone, Default)]
pub struct DomainProviders {
    providers: HashMap<SyncDomain, Arc<dyn DomainProvider>>,
}

impl DomainProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for `domain`, replacing any previous one
    pub fn with(mut self, domain: SyncDomain, provider: Arc<dyn DomainProvider>) -> Self {
        self.providers.insert(domain, provider);
        self
    }

    pub fn register(&mut self, domain: SyncDomain, provider: Arc<dyn DomainProvider>) {
        self.providers.insert(domain, provider);
    }

    /// Provider for `domain`, or a provider error if none is wired in
    pub fn get(&self, domain: SyncDomain) -> SyncResult<&Arc<dyn DomainProvider>> {
        self.providers
            .get(&domain)
            .ok_or_else(|| SyncError::Provider(format!("no provider registered for {}", domain)))
    }
}

/// Provider backed by an in-memory map of blobs
///
/// Useful for tests and demos; `apply` simply stores what it receives.
#[derive(Clone, Default)]
pub struct InMemoryProvider {
    blobs: Arc<RwLock<HashMap<SyncDomain, Vec<u8>>>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, domain: SyncDomain, bytes: impl Into<Vec<u8>>) {
        self.blobs.write().insert(domain, bytes.into());
    }

    pub fn get(&self, domain: SyncDomain) -> Option<Vec<u8>> {
        self.blobs.read().get(&domain).cloned()
    }
}

#[async_trait]
impl DomainProvider for InMemoryProvider {
    async fn prepare(&self, domain: SyncDomain) -> SyncResult<Vec<u8>> {
        Ok(self.get(domain).unwrap_or_default())
    }

    async fn apply(&self, domain: SyncDomain, bytes: &[u8]) -> SyncResult<()> {
        self.set(domain, bytes.to_vec());
        Ok(())
    }
}
