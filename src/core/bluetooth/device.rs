//! Bluetooth device representation and the persisted paired-device record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::normalize_address;

/// Represents a physical Bluetooth device as seen by the subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BluetoothDevice {
    /// The hardware address; primary key for every entity in the subsystem
    pub address: String,
    /// The advertised or OS-provided name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the last advertisement, if known
    pub rssi: Option<i16>,
}

impl BluetoothDevice {
    /// Creates a new BluetoothDevice instance, normalizing the address
    pub fn new(address: &str, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            address: normalize_address(address),
            name,
            rssi,
        }
    }

    /// Creates a device known only by its address
    pub fn with_address(address: &str) -> Self {
        Self::new(address, None, None)
    }

    /// Returns true if both values refer to the same physical device
    pub fn same_device(&self, other: &BluetoothDevice) -> bool {
        self.address == other.address
    }
}

/// A known device, persisted across process restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedDevice {
    pub address: String,
    pub name: Option<String>,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
}

impl PairedDevice {
    pub fn new(device: &BluetoothDevice, connected: bool, last_seen: DateTime<Utc>) -> Self {
        Self {
            address: device.address.clone(),
            name: device.name.clone(),
            connected,
            last_seen,
        }
    }
}
