//! Defines shared data structures for the Bluetooth module.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::bluetooth::device::{BluetoothDevice, PairedDevice};
use crate::core::measurement::Measurement;

/// Runtime permissions the subsystem may depend on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    BluetoothScan,
    BluetoothConnect,
    AccessFineLocation,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BluetoothScan => "BLUETOOTH_SCAN",
            Self::BluetoothConnect => "BLUETOOTH_CONNECT",
            Self::AccessFineLocation => "ACCESS_FINE_LOCATION",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason the radio rejected a scan request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanFailure {
    AlreadyStarted,
    ApplicationRegistrationFailed,
    InternalError,
    FeatureUnsupported,
    OutOfHardwareResources,
    ScanningTooFrequently,
    /// A platform-specific code without a named counterpart
    Other(i32),
}

impl ScanFailure {
    /// The numeric code as reported by the platform scanner
    pub fn code(&self) -> i32 {
        match self {
            Self::AlreadyStarted => 1,
            Self::ApplicationRegistrationFailed => 2,
            Self::InternalError => 3,
            Self::FeatureUnsupported => 4,
            Self::OutOfHardwareResources => 5,
            Self::ScanningTooFrequently => 6,
            Self::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::AlreadyStarted,
            2 => Self::ApplicationRegistrationFailed,
            3 => Self::InternalError,
            4 => Self::FeatureUnsupported,
            5 => Self::OutOfHardwareResources,
            6 => Self::ScanningTooFrequently,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (code {})", self, self.code())
    }
}

/// Externally observable mode of the whole subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "payload")]
pub enum ServiceState {
    Idle,
    BluetoothDisabled,
    MissingPermissions(Vec<Permission>),
    /// Scanning, with the current paired-device snapshot
    Scanning(Vec<PairedDevice>),
}

/// Events broadcast to subscribers of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum BluetoothEvent {
    DeviceDiscovered(BluetoothDevice),
    DevicePaired(BluetoothDevice),
    DeviceUnpaired(BluetoothDevice),
    Connected(BluetoothDevice),
    Disconnected(BluetoothDevice),
    MeasurementReceived {
        device: BluetoothDevice,
        measurement: Measurement,
    },
    ScanningFailed(ScanFailure),
}

/// Events emitted by the device scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    DeviceFound(BluetoothDevice),
    Failure(ScanFailure),
}

/// OS-level bond state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// A bond state broadcast delivered by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BondStateChange {
    pub device: BluetoothDevice,
    pub state: BondState,
}

/// Domain events republished by the pairing notifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    DevicePaired(BluetoothDevice),
    DeviceUnpaired(BluetoothDevice),
}

/// Callbacks delivered by a GATT session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connected,
    Disconnected,
    Notification { characteristic: Uuid, value: Vec<u8> },
}

/// Lifecycle of a single device connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Terminal: a disconnected connector can never reconnect
    Disconnected,
}

/// Events emitted by a device connector
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorEvent {
    Connected(BluetoothDevice),
    Disconnected(BluetoothDevice),
    MeasurementReceived {
        device: BluetoothDevice,
        measurement: Measurement,
    },
}
