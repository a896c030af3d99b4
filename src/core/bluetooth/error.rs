//! Error types for the Bluetooth subsystem

use thiserror::Error;

use crate::core::bluetooth::types::ScanFailure;

#[derive(Debug, Clone, Error)]
pub enum BluetoothError {
    /// No adapter is present, or it never became available.
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The radio refused the scan request.
    #[error("Bluetooth scan failed: {0}")]
    ScanFailed(ScanFailure),

    #[error("Failed to connect to {address}: {message}")]
    ConnectionFailed { address: String, message: String },

    /// Service discovery, notification setup or another GATT request failed.
    #[error("GATT operation on {address} failed: {message}")]
    Gatt { address: String, message: String },

    #[error("Bond state query failed: {0}")]
    BondQuery(String),

    /// The orchestrator worker has terminated and no longer accepts commands.
    #[error("Bluetooth service is no longer running")]
    ServiceClosed,
}

impl BluetoothError {
    /// The scan failure code to surface as an event, if this error came from a scan request
    pub fn scan_failure(&self) -> Option<ScanFailure> {
        match self {
            Self::ScanFailed(failure) => Some(*failure),
            Self::AdapterNotFound => Some(ScanFailure::InternalError),
            _ => None,
        }
    }
}

pub type BluetoothResult<T> = std::result::Result<T, BluetoothError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_failure_is_extracted_from_scan_errors_only() {
        let err = BluetoothError::ScanFailed(ScanFailure::OutOfHardwareResources);
        assert_eq!(err.scan_failure(), Some(ScanFailure::OutOfHardwareResources));
        let err = BluetoothError::Gatt {
            address: "AA:BB".into(),
            message: "timeout".into(),
        };
        assert_eq!(err.scan_failure(), None);
    }

    #[test]
    fn display_messages_carry_context() {
        let err = BluetoothError::ConnectionFailed {
            address: "AA:BB".into(),
            message: "refused".into(),
        };
        assert_eq!(err.to_string(), "Failed to connect to AA:BB: refused");
    }
}
