//! Persistent key-value storage for identity, configuration, and the registry.
//!
//! The coordinator only needs `load`/`save` of whole values under string
//! keys. Each `save` replaces the previous value entirely.
//!
//! - [`RedbStore`]: ACID storage using redb, one write transaction per save
//! - [`MemoryStore`]: process-local map, for tests and embedders

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{SyncError, SyncResult};

/// Keys used by the coordinator
pub mod keys {
    pub const IDENTITY: &str = "identity";
    pub const SYNC_ENABLED: &str = "sync_enabled";
    pub const SYNC_CONFIG: &str = "sync_config";
    pub const PAIRED_DEVICES: &str = "paired_devices";
}

const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Injected storage capability
pub trait Persistence: Send + Sync {
    /// Load the value stored under `key`, if any
    fn load(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Replace the value stored under `key`
    fn save(&self, key: &str, value: &[u8]) -> SyncResult<()>;
}

/// Load and decode a JSON record.
pub fn load_json<T: DeserializeOwned>(store: &dyn Persistence, key: &str) -> SyncResult<Option<T>> {
    match store.load(key)? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::Serialization(format!("{}: {}", key, e)))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encode and save a JSON record.
pub fn save_json<T: Serialize>(store: &dyn Persistence, key: &str, value: &T) -> SyncResult<()> {
    let bytes =
        serde_json::to_vec(value).map_err(|e| SyncError::Serialization(format!("{}: {}", key, e)))?;
    store.save(key, &bytes)
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<RwLock<Database>>,
}

impl RedbStore {
    /// Open or create a store at the given path.
    ///
    /// Creates the parent directory and the settings table if missing.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// All keys currently stored
    pub fn keys(&self) -> SyncResult<Vec<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }
}

impl Persistence for RedbStore {
    fn load(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn save(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

/// In-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemoryStore {
    fn load(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn save(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        self.values.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
