//! Hardware backend built on `bluest`
//!
//! `bluest` has no bond broadcasts and no bonded-device enumeration. Only
//! connected and previously seen devices can be asked whether they are
//! paired, so the full bond list is reported as unavailable, single devices
//! are answered through `is_paired`, and bond transitions are derived by
//! polling the devices this process knows about.

use async_trait::async_trait;
use bluest::error::ErrorKind;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{
    BluetoothAdapter, BondEventStream, GattConnection, GattSession, ScanStream, receiver_stream,
};
use crate::core::bluetooth::device::BluetoothDevice;
use crate::core::bluetooth::error::{BluetoothError, BluetoothResult};
use crate::core::bluetooth::types::{BondState, BondStateChange, GattEvent, ScanFailure};
use crate::utils::{extract_mac_address, normalize_address};

type KnownDevices = Arc<Mutex<HashMap<String, Device>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn scan_error(e: bluest::Error) -> BluetoothError {
    match e.kind() {
        ErrorKind::AdapterUnavailable => BluetoothError::AdapterNotFound,
        ErrorKind::AlreadyScanning => BluetoothError::ScanFailed(ScanFailure::AlreadyStarted),
        ErrorKind::NotSupported => BluetoothError::ScanFailed(ScanFailure::FeatureUnsupported),
        _ => BluetoothError::ScanFailed(ScanFailure::InternalError),
    }
}

fn gatt_error(address: &str, e: bluest::Error) -> BluetoothError {
    BluetoothError::Gatt {
        address: address.to_string(),
        message: e.to_string(),
    }
}

/// Maps a `bluest` device to our device identity
fn describe(device: &Device, rssi: Option<i16>) -> BluetoothDevice {
    let id = device.id().to_string();
    let address = extract_mac_address(&id).unwrap_or_else(|| normalize_address(&id));
    BluetoothDevice::new(&address, device.name().ok(), rssi)
}

pub struct BluestAdapter {
    adapter: Adapter,
    known: KnownDevices,
    bond_poll_interval: Duration,
}

impl BluestAdapter {
    /// Opens the default adapter and waits until it is usable
    pub async fn new(bond_poll_interval: Duration) -> BluetoothResult<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(BluetoothError::AdapterNotFound)?;
        adapter
            .wait_available()
            .await
            .map_err(|_| BluetoothError::AdapterNotFound)?;
        info!("Bluetooth adapter is available.");
        Ok(Self {
            adapter,
            known: Arc::new(Mutex::new(HashMap::new())),
            bond_poll_interval,
        })
    }

    async fn remember_connected(adapter: &Adapter, known: &KnownDevices) -> BluetoothResult<()> {
        let connected = adapter
            .connected_devices()
            .await
            .map_err(|e| BluetoothError::BondQuery(e.to_string()))?;
        let mut known = lock(known);
        for device in connected {
            known.insert(describe(&device, None).address, device);
        }
        Ok(())
    }

    /// Paired devices among the ones this process has seen
    async fn paired_devices(adapter: &Adapter, known: &KnownDevices) -> BluetoothResult<HashMap<String, BluetoothDevice>> {
        Self::remember_connected(adapter, known).await?;

        let candidates: Vec<Device> = lock(known).values().cloned().collect();
        let mut paired = HashMap::new();
        for device in candidates {
            if device.is_paired().await.unwrap_or(false) {
                let described = describe(&device, None);
                paired.insert(described.address.clone(), described);
            }
        }
        Ok(paired)
    }

    fn lookup(&self, address: &str) -> Option<Device> {
        lock(&self.known).get(address).cloned()
    }
}

#[async_trait]
impl BluetoothAdapter for BluestAdapter {
    async fn is_enabled(&self) -> bool {
        self.adapter.is_available().await.unwrap_or(false)
    }

    async fn bonded_devices(&self) -> BluetoothResult<Vec<BluetoothDevice>> {
        // Devices bonded but not seen since start-up would be missing, and
        // treating a partial list as complete would prune them from storage
        Err(BluetoothError::BondQuery(
            "bluest cannot enumerate bonded devices".into(),
        ))
    }

    async fn is_bonded(&self, device: &BluetoothDevice) -> BluetoothResult<bool> {
        let hw_device = match self.lookup(&device.address) {
            Some(hw_device) => Some(hw_device),
            None => {
                Self::remember_connected(&self.adapter, &self.known).await?;
                self.lookup(&device.address)
            }
        };
        match hw_device {
            Some(hw_device) => hw_device
                .is_paired()
                .await
                .map_err(|e| BluetoothError::BondQuery(e.to_string())),
            None => Ok(false),
        }
    }

    async fn start_scan(&self, services: &[Uuid]) -> BluetoothResult<ScanStream> {
        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let services = services.to_vec();
        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut scan_stream = match adapter.scan(&services).await {
                Ok(stream) => {
                    let _ = started_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = started_tx.send(Err(scan_error(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    discovered = scan_stream.next() => {
                        let Some(discovered) = discovered else {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        };
                        let device = describe(&discovered.device, discovered.rssi);
                        debug!("Found device - {:?}", device);
                        lock(&known).insert(device.address.clone(), discovered.device);
                        if tx.send(Ok(device)).is_err() {
                            break;
                        }
                    }
                    // The consumer dropped the stream: stop the hardware scan
                    _ = tx.closed() => break,
                }
            }
        });

        match started_rx.await {
            Ok(Ok(())) => Ok(receiver_stream(rx)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BluetoothError::ScanFailed(ScanFailure::InternalError)),
        }
    }

    async fn bond_events(&self) -> BluetoothResult<BondEventStream> {
        let adapter = self.adapter.clone();
        let known = self.known.clone();
        let interval = self.bond_poll_interval;
        let mut previous = Self::paired_devices(&adapter, &known).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = tx.closed() => break,
                }
                let current = match Self::paired_devices(&adapter, &known).await {
                    Ok(current) => current,
                    Err(e) => {
                        warn!("Bond poll failed: {}", e);
                        continue;
                    }
                };
                let mut changes = Vec::new();
                for (address, device) in &current {
                    if !previous.contains_key(address) {
                        changes.push(BondStateChange { device: device.clone(), state: BondState::Bonded });
                    }
                }
                for (address, device) in &previous {
                    if !current.contains_key(address) {
                        changes.push(BondStateChange { device: device.clone(), state: BondState::None });
                    }
                }
                previous = current;
                if changes.into_iter().any(|change| tx.send(change).is_err()) {
                    break;
                }
            }
        });

        Ok(receiver_stream(rx))
    }

    async fn connect_gatt(&self, device: &BluetoothDevice) -> BluetoothResult<GattConnection> {
        let address = device.address.clone();
        let hw_device = self.lookup(&address).ok_or_else(|| BluetoothError::ConnectionFailed {
            address: address.clone(),
            message: "device has not been seen by this adapter".into(),
        })?;
        let (tx, rx) = mpsc::unbounded_channel();

        let adapter = self.adapter.clone();
        let connect_device = hw_device.clone();
        let events = tx.clone();
        let connection_task = tokio::spawn(async move {
            if let Err(e) = adapter.connect_device(&connect_device).await {
                warn!("Connecting to {:?} failed: {}", connect_device.id(), e);
                let _ = events.send(GattEvent::Disconnected);
                return;
            }
            let _ = events.send(GattEvent::Connected);

            match adapter.device_connection_events(&connect_device).await {
                Ok(mut connection_events) => {
                    while let Some(event) = connection_events.next().await {
                        if matches!(event, ConnectionEvent::Disconnected) {
                            break;
                        }
                    }
                }
                Err(e) => error!("Cannot watch connection state of {:?}: {}", connect_device.id(), e),
            }
            let _ = events.send(GattEvent::Disconnected);
        });

        let session = BluestGattSession {
            address,
            adapter: self.adapter.clone(),
            device: hw_device,
            events: tx,
            characteristics: Mutex::new(HashMap::new()),
            tasks: Mutex::new(vec![connection_task]),
        };
        Ok(GattConnection {
            session: Arc::new(session),
            events: receiver_stream(rx),
        })
    }
}

struct BluestGattSession {
    address: String,
    adapter: Adapter,
    device: Device,
    events: mpsc::UnboundedSender<GattEvent>,
    characteristics: Mutex<HashMap<Uuid, Characteristic>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl GattSession for BluestGattSession {
    async fn discover_characteristics(&self) -> BluetoothResult<Vec<Uuid>> {
        let services = self
            .device
            .discover_services()
            .await
            .map_err(|e| gatt_error(&self.address, e))?;
        let mut found = Vec::new();
        for service in services {
            let characteristics = match service.discover_characteristics().await {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    warn!("Characteristic discovery for service {} failed: {}", service.uuid(), e);
                    continue;
                }
            };
            for characteristic in characteristics {
                found.push(characteristic.uuid());
                lock(&self.characteristics).insert(characteristic.uuid(), characteristic);
            }
        }
        Ok(found)
    }

    async fn enable_notifications(&self, uuid: Uuid) -> BluetoothResult<()> {
        let characteristic = lock(&self.characteristics)
            .get(&uuid)
            .cloned()
            .ok_or_else(|| BluetoothError::Gatt {
                address: self.address.clone(),
                message: format!("characteristic {} not discovered", uuid),
            })?;
        let events = self.events.clone();
        let (enabled_tx, enabled_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut notifications = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = enabled_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = enabled_tx.send(Err(e));
                    return;
                }
            };
            while let Some(result) = notifications.next().await {
                match result {
                    Ok(value) => {
                        let notification = GattEvent::Notification { characteristic: uuid, value };
                        if events.send(notification).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error in notification stream: {}", e);
                        break;
                    }
                }
            }
        });
        lock(&self.tasks).push(task);

        match enabled_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(gatt_error(&self.address, e)),
            Err(_) => Err(BluetoothError::Gatt {
                address: self.address.clone(),
                message: "notification task ended early".into(),
            }),
        }
    }

    async fn disconnect(&self) -> BluetoothResult<()> {
        self.adapter
            .disconnect_device(&self.device)
            .await
            .map_err(|e| gatt_error(&self.address, e))?;
        let _ = self.events.send(GattEvent::Disconnected);
        Ok(())
    }
}

impl Drop for BluestGattSession {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}
