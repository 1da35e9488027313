//! Host-facing tuning for a coordinator. Not persisted.

use std::time::Duration;

use crate::events::EVENT_CHANNEL_CAPACITY;
use crate::types::DeviceClass;

/// Default size of one transfer chunk (16 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Name given to a freshly generated identity
pub const DEFAULT_DEVICE_NAME: &str = "Unknown Device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Bytes per `Channel::send` call
    pub chunk_size: usize,
    /// Bound on establishing a channel
    pub connect_timeout: Duration,
    /// Bound on a single chunk send
    pub chunk_timeout: Duration,
    /// Bound on waiting for the remote acknowledgement
    pub ack_timeout: Duration,
    /// Bound on the whole pairing handshake
    pub pairing_timeout: Duration,
    /// Broadcast buffer per subscriber
    pub event_capacity: usize,
    /// Terminal sessions kept queryable before the oldest are evicted
    pub retained_sessions: usize,
    pub default_device_name: String,
    /// Form factor announced during pairing
    pub device_class: DeviceClass,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            chunk_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            pairing_timeout: Duration::from_secs(15),
            event_capacity: EVENT_CHANNEL_CAPACITY,
            retained_sessions: 256,
            default_device_name: DEFAULT_DEVICE_NAME.to_string(),
            device_class: DeviceClass::Other,
        }
    }
}
