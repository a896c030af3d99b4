//! Constants used throughout the Bluetooth subsystem
//! This module contains the well-known service and characteristic UUIDs,
//! storage keys and channel sizes.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_WEIGHT_SCALE_SERVICE: Uuid = Uuid::from_u128(0x0000181d_0000_1000_8000_00805f9b34fb);
pub const UUID_BLOOD_PRESSURE_SERVICE: Uuid = Uuid::from_u128(0x00001810_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_WEIGHT_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a9d_0000_1000_8000_00805f9b34fb);
pub const UUID_BLOOD_PRESSURE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a35_0000_1000_8000_00805f9b34fb);
pub const UUID_HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Storage key holding the serialized paired-device list
pub const PAIRED_DEVICES_STORAGE_KEY: &str = "paired_ble_devices";

/// Default capacity of every broadcast channel in the subsystem
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Default polling period for deriving bond transitions on backends without bond broadcasts
pub const DEFAULT_BOND_POLL_INTERVAL_MS: u64 = 5000;

/// Services scanned for when the configuration does not name any
pub const DEFAULT_SCAN_SERVICES: [Uuid; 3] = [
    UUID_WEIGHT_SCALE_SERVICE,
    UUID_BLOOD_PRESSURE_SERVICE,
    UUID_HEART_RATE_SERVICE,
];
