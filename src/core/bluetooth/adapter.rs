//! Seams to the operating system's Bluetooth stack
//!
//! Hardware callbacks are modelled as streams: a scan yields advertisements,
//! a GATT connection yields connected/disconnected/notification callbacks and
//! the bond stream yields OS bond broadcasts. Consumers redispatch those items
//! onto their own tasks before touching shared state.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::device::BluetoothDevice;
use crate::core::bluetooth::error::BluetoothResult;
use crate::core::bluetooth::types::{BondStateChange, GattEvent, Permission};

/// Advertisements matching a scan filter. An `Err` item ends the scan.
pub type ScanStream = BoxStream<'static, BluetoothResult<BluetoothDevice>>;

/// OS bond-state broadcasts
pub type BondEventStream = BoxStream<'static, BondStateChange>;

/// Callbacks of one GATT session
pub type GattEventStream = BoxStream<'static, GattEvent>;

/// Turns a callback channel into a stream; the stream ends once every sender is gone
pub(crate) fn receiver_stream<T: Send + 'static>(rx: mpsc::UnboundedReceiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// A GATT session handle together with its callback stream
pub struct GattConnection {
    pub session: Arc<dyn GattSession>,
    pub events: GattEventStream,
}

/// The OS Bluetooth adapter
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    /// Whether the radio is powered on
    async fn is_enabled(&self) -> bool;

    /// The complete list of devices bonded with this host. Backends that
    /// cannot enumerate bonds return `BluetoothError::BondQuery`.
    async fn bonded_devices(&self) -> BluetoothResult<Vec<BluetoothDevice>>;

    /// Whether this one device is bonded with the host
    async fn is_bonded(&self, device: &BluetoothDevice) -> BluetoothResult<bool> {
        Ok(self
            .bonded_devices()
            .await?
            .iter()
            .any(|bonded| bonded.same_device(device)))
    }

    /// Starts discovery filtered to the given services. Dropping the stream stops the scan.
    async fn start_scan(&self, services: &[Uuid]) -> BluetoothResult<ScanStream>;

    /// Subscribes to bond-state broadcasts. Dropping the stream releases the subscription.
    async fn bond_events(&self) -> BluetoothResult<BondEventStream>;

    /// Requests a GATT connection. `GattEvent::Connected` arrives on the returned stream
    /// once the link is up.
    async fn connect_gatt(&self, device: &BluetoothDevice) -> BluetoothResult<GattConnection>;
}

/// A live GATT session to one device
#[async_trait]
pub trait GattSession: Send + Sync {
    /// Discovers services and returns the UUIDs of every characteristic found
    async fn discover_characteristics(&self) -> BluetoothResult<Vec<Uuid>>;

    /// Enables notifications (or indications) for a characteristic
    async fn enable_notifications(&self, characteristic: Uuid) -> BluetoothResult<()>;

    /// Requests a disconnect; the acknowledgement is `GattEvent::Disconnected`
    async fn disconnect(&self) -> BluetoothResult<()>;
}

/// Runtime permission checks
pub trait PermissionChecker: Send + Sync {
    fn is_granted(&self, permission: Permission) -> bool;

    /// The subset of `required` that has not been granted, in order
    fn missing(&self, required: &[Permission]) -> Vec<Permission> {
        required
            .iter()
            .copied()
            .filter(|permission| !self.is_granted(*permission))
            .collect()
    }
}

/// Checker for platforms without runtime Bluetooth permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantedPermissions;

impl PermissionChecker for GrantedPermissions {
    fn is_granted(&self, _permission: Permission) -> bool {
        true
    }
}
