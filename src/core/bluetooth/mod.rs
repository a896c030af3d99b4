//! Bluetooth functionality for the BLE health bridge
//! This module handles discovery, pairing, connections and measurement
//! delivery for Bluetooth LE health devices.

mod adapter;
#[cfg(feature = "bluest")]
mod bluest_adapter;
mod connection;
mod constants;
mod device;
mod error;
mod events;
mod manager;
pub mod mock;
mod notification;
mod paired_store;
mod pairing;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::{
    BluetoothAdapter, BondEventStream, GattConnection, GattEventStream, GattSession,
    GrantedPermissions, PermissionChecker, ScanStream,
};
#[cfg(feature = "bluest")]
pub use bluest_adapter::BluestAdapter;
pub use connection::{ConnectorFactory, DeviceConnector};
pub use constants::*; // Re-export all constants
pub use device::{BluetoothDevice, PairedDevice};
pub use error::{BluetoothError, BluetoothResult};
pub use events::{EventBus, EventSubscription};
pub use manager::{BleOrchestrator, OrchestratorDeps};
pub use notification::NotificationHandler;
pub use paired_store::PairedDeviceStore;
pub use pairing::PairingNotifier;
pub use scanner::DeviceScanner;
pub use types::{
    BluetoothEvent, BondState, BondStateChange, ConnectorEvent, ConnectorState, GattEvent,
    PairingEvent, Permission, ScanEvent, ScanFailure, ServiceState,
};
