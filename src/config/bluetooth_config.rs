use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::{
    DEFAULT_BOND_POLL_INTERVAL_MS, DEFAULT_EVENT_BUFFER, DEFAULT_SCAN_SERVICES, Permission,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Service UUIDs advertised by the devices we want to discover
    pub services: Vec<Uuid>,

    /// Runtime permissions that must be granted before scanning
    pub required_permissions: Vec<Permission>,

    /// Capacity of the outward event stream. Subscribers that fall this far
    /// behind skip ahead; events between components are never dropped.
    pub event_buffer: usize,

    /// How often the hardware backend polls the bonded device list
    pub bond_poll_interval_ms: u64,

    /// Advertisements weaker than this are ignored
    pub min_rssi: Option<i16>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            services: DEFAULT_SCAN_SERVICES.to_vec(),
            required_permissions: vec![Permission::BluetoothScan, Permission::BluetoothConnect],
            event_buffer: DEFAULT_EVENT_BUFFER,
            bond_poll_interval_ms: DEFAULT_BOND_POLL_INTERVAL_MS,
            min_rssi: None,
        }
    }
}
