//! BLE health bridge library
//! Discovers, pairs and connects Bluetooth LE health devices and turns their
//! notifications into measurements.

// Module declarations
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod storage;
pub mod utils;

pub use crate::config::AppConfig;
pub use crate::core::bluetooth::{BleOrchestrator, BluetoothEvent, ServiceState};
pub use crate::state::AppState;
