//! Device registry: the persisted set of paired devices
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  pair()              → insert (status = paired)                 │
//! │  session completed   → status = synced, last_sync_time = now    │
//! │  session failed      → status = offline | error                 │
//! │  unpair()            → remove                                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole registry is one JSON record under `paired_devices`. Every
//! mutation builds the next map, persists it, and only then swaps it in, so a
//! failed write leaves memory exactly as it was. Writers are serialized by a
//! single lock, which keeps concurrent session completions from losing
//! updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::storage::{keys, load_json, save_json, Persistence};
use crate::types::{DeviceStatus, PairedDevice};

/// A paired device together with its pairing secret
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DeviceRecord {
    device: PairedDevice,
    /// Hex-encoded X25519 shared secret
    shared_secret: String,
}

type Records = BTreeMap<String, DeviceRecord>;

pub struct DeviceRegistry {
    store: Arc<dyn Persistence>,
    records: Mutex<Records>,
}

impl DeviceRegistry {
    /// Empty registry backed by `store`. Call [`reload`](Self::reload) to
    /// read what was saved.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            records: Mutex::new(Records::new()),
        }
    }

    /// Registry loaded from `store`, empty if nothing is saved.
    pub fn open(store: Arc<dyn Persistence>) -> SyncResult<Self> {
        let registry = Self::new(store);
        registry.reload()?;
        Ok(registry)
    }

    /// Replace the in-memory view with what is persisted.
    pub fn reload(&self) -> SyncResult<usize> {
        let saved: Vec<DeviceRecord> =
            load_json(self.store.as_ref(), keys::PAIRED_DEVICES)?.unwrap_or_default();
        let records: Records = saved
            .into_iter()
            .map(|r| (r.device.id.clone(), r))
            .collect();

        let count = records.len();
        *self.records.lock() = records;
        debug!(count, "Loaded device registry");
        Ok(count)
    }

    /// Snapshot of all paired devices, ordered by id
    pub fn list(&self) -> Vec<PairedDevice> {
        self.records
            .lock()
            .values()
            .map(|r| r.device.clone())
            .collect()
    }

    pub fn get(&self, device_id: &str) -> Option<PairedDevice> {
        self.records.lock().get(device_id).map(|r| r.device.clone())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pairing secret for `device_id`
    pub fn secret_for(&self, device_id: &str) -> SyncResult<Vec<u8>> {
        let records = self.records.lock();
        let record = records
            .get(device_id)
            .ok_or_else(|| SyncError::DeviceNotPaired(device_id.to_string()))?;
        hex::decode(&record.shared_secret)
            .map_err(|e| SyncError::Storage(format!("corrupt secret for {}: {}", device_id, e)))
    }

    /// Insert or overwrite a paired device.
    pub fn insert(&self, device: PairedDevice, shared_secret: &[u8]) -> SyncResult<()> {
        let record = DeviceRecord {
            shared_secret: hex::encode(shared_secret),
            device,
        };
        let id = record.device.id.clone();
        self.mutate(move |records| {
            records.insert(record.device.id.clone(), record);
            Some(())
        })?;
        info!(device_id = %id, "Device paired");
        Ok(())
    }

    /// Remove a device. Returns the removed entry, or `None` if it was absent.
    pub fn remove(&self, device_id: &str) -> SyncResult<Option<PairedDevice>> {
        let removed = self.mutate(|records| records.remove(device_id).map(|r| r.device))?;
        if removed.is_some() {
            info!(device_id, "Device unpaired");
        }
        Ok(removed)
    }

    /// Fold a completed session into the registry.
    pub fn record_completed(
        &self,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> SyncResult<Option<PairedDevice>> {
        self.mutate(|records| {
            let record = records.get_mut(device_id)?;
            record.device.status = DeviceStatus::Synced;
            record.device.last_sync_time = Some(at);
            Some(record.device.clone())
        })
    }

    /// Fold a failed session into the registry. `last_sync_time` is untouched.
    pub fn record_failed(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> SyncResult<Option<PairedDevice>> {
        self.mutate(|records| {
            let record = records.get_mut(device_id)?;
            if record.device.status == status {
                return None;
            }
            record.device.status = status;
            Some(record.device.clone())
        })
    }

    /// Apply `f` to a copy of the records; persist and swap if it changed
    /// something. `None` from `f` means nothing changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut Records) -> Option<R>) -> SyncResult<Option<R>> {
        let mut guard = self.records.lock();
        let mut next = guard.clone();
        let Some(out) = f(&mut next) else {
            return Ok(None);
        };

        let saved: Vec<&DeviceRecord> = next.values().collect();
        save_json(self.store.as_ref(), keys::PAIRED_DEVICES, &saved)?;
        *guard = next;
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{DeviceClass, TransportKind};

    fn device(id: &str) -> PairedDevice {
        PairedDevice {
            id: id.to_string(),
            name: format!("{} name", id),
            device_class: DeviceClass::Phone,
            transport_kind: TransportKind::LocalNetwork,
            last_sync_time: None,
            status: DeviceStatus::Paired,
        }
    }

    /// Store whose writes always fail
    struct ReadOnlyStore;

    impl Persistence for ReadOnlyStore {
        fn load(&self, _key: &str) -> SyncResult<Option<Vec<u8>>> {
            Ok(None)
        }

        fn save(&self, key: &str, _value: &[u8]) -> SyncResult<()> {
            Err(SyncError::Storage(format!("{} is read-only", key)))
        }
    }

    #[test]
    fn test_insert_persists_and_reloads() {
        let store = Arc::new(MemoryStore::new());
        let registry = DeviceRegistry::open(store.clone()).unwrap();
        registry.insert(device("b"), &[2u8; 32]).unwrap();
        registry.insert(device("a"), &[1u8; 32]).unwrap();

        let reloaded = DeviceRegistry::open(store).unwrap();
        let ids: Vec<_> = reloaded.list().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(reloaded.secret_for("a").unwrap(), vec![1u8; 32]);
    }

    #[test]
    fn test_secret_not_in_listing() {
        let store = Arc::new(MemoryStore::new());
        let registry = DeviceRegistry::open(store).unwrap();
        registry.insert(device("a"), &[7u8; 32]).unwrap();

        let listed = format!("{:?}", registry.list());
        assert!(!listed.contains(&hex::encode([7u8; 32])));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let registry = DeviceRegistry::open(store.clone()).unwrap();
        assert_eq!(registry.remove("ghost").unwrap(), None);
        assert_eq!(store.load(keys::PAIRED_DEVICES).unwrap(), None);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let registry = DeviceRegistry::open(Arc::new(ReadOnlyStore)).unwrap();
        let result = registry.insert(device("a"), &[0u8; 32]);
        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_record_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let registry = DeviceRegistry::open(store).unwrap();
        registry.insert(device("a"), &[0u8; 32]).unwrap();

        let now = Utc::now();
        let updated = registry.record_completed("a", now).unwrap().unwrap();
        assert_eq!(updated.status, DeviceStatus::Synced);
        assert_eq!(updated.last_sync_time, Some(now));

        let updated = registry
            .record_failed("a", DeviceStatus::Offline)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, DeviceStatus::Offline);
        assert_eq!(updated.last_sync_time, Some(now));

        assert_eq!(registry.record_completed("ghost", now).unwrap(), None);
    }

    #[test]
    fn test_secret_for_unknown_device() {
        let registry = DeviceRegistry::open(Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            registry.secret_for("nope"),
            Err(SyncError::DeviceNotPaired(_))
        ));
    }
}
