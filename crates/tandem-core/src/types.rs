//! Core types for Tandem

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Default interval between timer-driven background syncs (6 hours)
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Unique identifier for a sync session
///
/// Uses ULID so ids sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Ulid);

impl SessionId {
    /// Create a new SessionId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse from the `sync_<ulid>` form produced by `Display`
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        let raw = s.strip_prefix("sync_").unwrap_or(s);
        Ok(Self(Ulid::from_string(raw)?))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync_{}", self.0)
    }
}

/// Correlation id for one discovery sweep
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveryId(pub Ulid);

impl DiscoveryId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DiscoveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DiscoveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "discovery_{}", self.0)
    }
}

/// Identity of this installation
///
/// Generated once and persisted; only the display name ever changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Opaque, stable device id
    pub id: String,
    /// Human-readable name shown to paired devices
    pub display_name: String,
}

impl DeviceIdentity {
    /// Generate a fresh identity with a random id
    pub fn generate(display_name: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string().to_lowercase(),
            display_name: display_name.into(),
        }
    }
}

/// Form factor of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Phone,
    Tablet,
    Desktop,
    Other,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::Phone => "phone",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Other => "other",
        };
        f.write_str(s)
    }
}

/// How bytes reach a remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    ShortRangeWireless,
    LocalWirelessDirect,
    LocalNetwork,
    CloudRelay,
    Wired,
}

impl TransportKind {
    pub const ALL: [TransportKind; 5] = [
        TransportKind::ShortRangeWireless,
        TransportKind::LocalWirelessDirect,
        TransportKind::LocalNetwork,
        TransportKind::CloudRelay,
        TransportKind::Wired,
    ];
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::ShortRangeWireless => "short-range-wireless",
            TransportKind::LocalWirelessDirect => "local-wireless-direct",
            TransportKind::LocalNetwork => "local-network",
            TransportKind::CloudRelay => "cloud-relay",
            TransportKind::Wired => "wired",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a known device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Discovered,
    Paired,
    Synced,
    Offline,
    Error,
}

impl DeviceStatus {
    /// Only devices that completed pairing may be synced with.
    pub fn is_sync_target(&self) -> bool {
        !matches!(self, DeviceStatus::Discovered)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Discovered => "discovered",
            DeviceStatus::Paired => "paired",
            DeviceStatus::Synced => "synced",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A device found by discovery. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: String,
    pub name: String,
    pub device_class: DeviceClass,
    pub transport_kind: TransportKind,
}

/// A device with an established pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    /// Remote device id
    pub id: String,
    /// Name supplied at pairing time
    pub name: String,
    pub device_class: DeviceClass,
    /// Transport used to reach the device
    pub transport_kind: TransportKind,
    /// Time of the last completed session, if any
    pub last_sync_time: Option<DateTime<Utc>>,
    pub status: DeviceStatus,
}

/// A named category of application state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDomain {
    Memory,
    Preferences,
    Personality,
}

impl SyncDomain {
    pub const ALL: [SyncDomain; 3] = [
        SyncDomain::Memory,
        SyncDomain::Preferences,
        SyncDomain::Personality,
    ];
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncDomain::Memory => "memory",
            SyncDomain::Preferences => "preferences",
            SyncDomain::Personality => "personality",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for SyncDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(SyncDomain::Memory),
            "preferences" => Ok(SyncDomain::Preferences),
            "personality" => Ok(SyncDomain::Personality),
            other => Err(format!("unknown sync domain '{}'", other)),
        }
    }
}

/// Which networks automatic sync may use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkConstraint {
    Any,
    UnmeteredOnly,
}

/// User-facing sync configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    /// Domains included in outgoing payloads and accepted from incoming ones
    pub sync_domains: BTreeSet<SyncDomain>,
    pub network_constraint: NetworkConstraint,
    /// Whether the scheduler may start sessions on its own
    pub auto_sync_enabled: bool,
    /// Period of the timer-driven trigger
    pub auto_sync_interval: Duration,
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self {
            sync_domains: SyncDomain::ALL.into_iter().collect(),
            network_constraint: NetworkConstraint::UnmeteredOnly,
            auto_sync_enabled: true,
            auto_sync_interval: DEFAULT_AUTO_SYNC_INTERVAL,
        }
    }
}

/// Everything sent to a remote device in one session
///
/// Each domain blob is opaque to the coordinator. `metadata` carries small
/// free-form annotations (counts, versions) from the providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub domain_blobs: BTreeMap<SyncDomain, Vec<u8>>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SyncPayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Domains present in this payload
    pub fn domains(&self) -> BTreeSet<SyncDomain> {
        self.domain_blobs.keys().copied().collect()
    }
}

/// Byte and item counts for one successful transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub items_synced: usize,
}
