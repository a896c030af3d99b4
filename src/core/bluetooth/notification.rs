//! Characteristic notification handling
//! This module subscribes to the characteristics a mapper recognises and turns
//! incoming payloads into measurement events.

use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

use crate::core::bluetooth::adapter::GattSession;
use crate::core::bluetooth::device::BluetoothDevice;
use crate::core::bluetooth::error::BluetoothResult;
use crate::core::bluetooth::types::ConnectorEvent;
use crate::core::measurement::MeasurementMapper;

/// Notification handler shared by every connector
#[derive(Clone)]
pub struct NotificationHandler {
    mapper: Arc<dyn MeasurementMapper>,
}

impl NotificationHandler {
    /// Create a new NotificationHandler
    pub fn new(mapper: Arc<dyn MeasurementMapper>) -> Self {
        Self { mapper }
    }

    /// Discovers the device's characteristics and enables notifications for every
    /// one the mapper recognises. Returns the characteristics subscribed to.
    ///
    /// A characteristic that refuses notifications is skipped; only a failed
    /// discovery is an error.
    pub async fn setup_notifications(
        &self,
        device: &BluetoothDevice,
        session: &dyn GattSession,
    ) -> BluetoothResult<Vec<Uuid>> {
        info!("Discovering characteristics of {}...", device.address);
        let characteristics = session.discover_characteristics().await?;

        let mut subscribed = Vec::new();
        for characteristic in characteristics {
            if !self.mapper.recognises(characteristic) {
                continue;
            }
            match session.enable_notifications(characteristic).await {
                Ok(()) => {
                    info!("Subscribed to {} on {}", characteristic, device.address);
                    subscribed.push(characteristic);
                }
                Err(e) => warn!("Failed to enable notifications for {}: {}", characteristic, e),
            }
        }
        Ok(subscribed)
    }

    /// Maps one notification payload. Unrecognised payloads are dropped.
    pub fn handle_notification(
        &self,
        device: &BluetoothDevice,
        characteristic: Uuid,
        value: &[u8],
    ) -> Option<ConnectorEvent> {
        match self.mapper.map(characteristic, value) {
            Some(measurement) => {
                debug!("Measurement from {}: {:?}", device.address, measurement);
                Some(ConnectorEvent::MeasurementReceived {
                    device: device.clone(),
                    measurement,
                })
            }
            None => {
                debug!(
                    "Dropping unrecognised notification from {} on {}: {:?}",
                    device.address, characteristic, value
                );
                None
            }
        }
    }
}
