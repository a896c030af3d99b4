//! Core functionality for the BLE health bridge
//! This module contains the Bluetooth subsystem and the measurement model it delivers.

pub mod bluetooth;
pub mod measurement;

// Re-export commonly used types
pub use bluetooth::{BleOrchestrator, BluetoothEvent, ServiceState};
pub use measurement::{Measurement, MeasurementMapper, StandardMeasurementMapper};
