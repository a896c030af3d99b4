//! Deterministic in-process fakes of the OS Bluetooth stack
//!
//! `MockAdapter` lets tests script every hardware callback the subsystem
//! reacts to (advertisements, scan failures, GATT callbacks, bond broadcasts)
//! and inspect what the subsystem asked of the hardware.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{
    BluetoothAdapter, BondEventStream, GattConnection, GattSession,
    PermissionChecker, ScanStream, receiver_stream,
};
use crate::core::bluetooth::device::BluetoothDevice;
use crate::core::bluetooth::error::{BluetoothError, BluetoothResult};
use crate::core::bluetooth::types::{BondState, BondStateChange, GattEvent, Permission, ScanFailure};
use crate::utils::normalize_address;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A scripted GATT session
pub struct MockGattSession {
    address: String,
    events: mpsc::UnboundedSender<GattEvent>,
    characteristics: Vec<Uuid>,
    enabled: Mutex<Vec<Uuid>>,
    disconnect_requests: AtomicUsize,
    acknowledge_disconnect: bool,
    disconnect_delay: Duration,
}

impl MockGattSession {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Characteristics notifications were enabled for, in request order
    pub fn enabled_notifications(&self) -> Vec<Uuid> {
        lock(&self.enabled).clone()
    }

    pub fn disconnect_requests(&self) -> usize {
        self.disconnect_requests.load(Ordering::SeqCst)
    }

    fn send(&self, event: GattEvent) -> bool {
        self.events.send(event).is_ok()
    }
}

#[async_trait]
impl GattSession for MockGattSession {
    async fn discover_characteristics(&self) -> BluetoothResult<Vec<Uuid>> {
        Ok(self.characteristics.clone())
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> BluetoothResult<()> {
        if !self.characteristics.contains(&characteristic) {
            return Err(BluetoothError::Gatt {
                address: self.address.clone(),
                message: format!("Characteristic {} not found", characteristic),
            });
        }
        lock(&self.enabled).push(characteristic);
        Ok(())
    }

    async fn disconnect(&self) -> BluetoothResult<()> {
        self.disconnect_requests.fetch_add(1, Ordering::SeqCst);
        if !self.disconnect_delay.is_zero() {
            tokio::time::sleep(self.disconnect_delay).await;
        }
        if self.acknowledge_disconnect {
            self.send(GattEvent::Disconnected);
        }
        Ok(())
    }
}

/// A fake Bluetooth adapter driven entirely by the test
pub struct MockAdapter {
    enabled: AtomicBool,
    auto_connect: AtomicBool,
    acknowledge_disconnect: AtomicBool,
    disconnect_delay: Mutex<Duration>,
    bonded: Mutex<Vec<BluetoothDevice>>,
    scan_sender: Mutex<Option<mpsc::UnboundedSender<BluetoothResult<BluetoothDevice>>>>,
    scan_starts: AtomicUsize,
    scanned_services: Mutex<Vec<Uuid>>,
    next_scan_error: Mutex<Option<ScanFailure>>,
    bond_senders: Mutex<Vec<mpsc::UnboundedSender<BondStateChange>>>,
    bond_subscriptions: AtomicUsize,
    bonded_queries_fail: AtomicBool,
    bond_list_enumerable: AtomicBool,
    bond_queries: AtomicUsize,
    characteristics: Mutex<HashMap<String, Vec<Uuid>>>,
    failing_connections: Mutex<HashSet<String>>,
    sessions: Mutex<HashMap<String, Arc<MockGattSession>>>,
    connect_requests: Mutex<Vec<String>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// A powered-on adapter that completes connections immediately
    /// and acknowledges disconnect requests
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            auto_connect: AtomicBool::new(true),
            acknowledge_disconnect: AtomicBool::new(true),
            disconnect_delay: Mutex::new(Duration::ZERO),
            bonded: Mutex::new(Vec::new()),
            scan_sender: Mutex::new(None),
            scan_starts: AtomicUsize::new(0),
            scanned_services: Mutex::new(Vec::new()),
            next_scan_error: Mutex::new(None),
            bond_senders: Mutex::new(Vec::new()),
            bond_subscriptions: AtomicUsize::new(0),
            bonded_queries_fail: AtomicBool::new(false),
            bond_list_enumerable: AtomicBool::new(true),
            bond_queries: AtomicUsize::new(0),
            characteristics: Mutex::new(HashMap::new()),
            failing_connections: Mutex::new(HashSet::new()),
            sessions: Mutex::new(HashMap::new()),
            connect_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// When false, `connect_gatt` succeeds but the connected callback must be
    /// fired with [`MockAdapter::complete_connection`]
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.auto_connect.store(auto_connect, Ordering::SeqCst);
    }

    /// When false, disconnect requests are recorded but never acknowledged
    pub fn set_acknowledge_disconnect(&self, acknowledge: bool) {
        self.acknowledge_disconnect.store(acknowledge, Ordering::SeqCst);
    }

    /// Disconnect requests take this long before they return, like a link
    /// that is slow to go down
    pub fn set_disconnect_delay(&self, delay: Duration) {
        *lock(&self.disconnect_delay) = delay;
    }

    pub fn set_bonded_queries_fail(&self, fail: bool) {
        self.bonded_queries_fail.store(fail, Ordering::SeqCst);
    }

    /// When false, the full bond list cannot be read but single devices can
    /// still be asked about, as with backends that only see nearby devices
    pub fn set_bond_list_enumerable(&self, enumerable: bool) {
        self.bond_list_enumerable.store(enumerable, Ordering::SeqCst);
    }

    /// Number of bond-state queries made so far, list or single device
    pub fn bond_queries(&self) -> usize {
        self.bond_queries.load(Ordering::SeqCst)
    }

    /// Characteristics exposed by the device with this address
    pub fn set_characteristics(&self, address: &str, characteristics: Vec<Uuid>) {
        lock(&self.characteristics).insert(normalize_address(address), characteristics);
    }

    pub fn fail_connections_to(&self, address: &str) {
        lock(&self.failing_connections).insert(normalize_address(address));
    }

    /// Adds a bonded device without broadcasting
    pub fn add_bonded(&self, device: BluetoothDevice) {
        let mut bonded = lock(&self.bonded);
        if !bonded.iter().any(|d| d.same_device(&device)) {
            bonded.push(device);
        }
    }

    /// Bonds a device and broadcasts the transition
    pub fn bond(&self, device: BluetoothDevice) {
        self.add_bonded(device.clone());
        self.broadcast_bond_state(device, BondState::Bonded);
    }

    /// Removes the bond and broadcasts the transition
    pub fn unbond(&self, device: BluetoothDevice) {
        lock(&self.bonded).retain(|d| !d.same_device(&device));
        self.broadcast_bond_state(device, BondState::None);
    }

    pub fn broadcast_bond_state(&self, device: BluetoothDevice, state: BondState) {
        let change = BondStateChange { device, state };
        lock(&self.bond_senders).retain(|sender| sender.send(change.clone()).is_ok());
    }

    /// Makes the next scan request fail with the given code
    pub fn fail_next_scan(&self, failure: ScanFailure) {
        *lock(&self.next_scan_error) = Some(failure);
    }

    /// Delivers an advertisement to the running scan. Returns false if no scan is active.
    pub fn advertise(&self, device: BluetoothDevice) -> bool {
        self.send_scan_item(Ok(device))
    }

    /// Aborts the running scan with a failure
    pub fn fail_running_scan(&self, failure: ScanFailure) -> bool {
        self.send_scan_item(Err(BluetoothError::ScanFailed(failure)))
    }

    fn send_scan_item(&self, item: BluetoothResult<BluetoothDevice>) -> bool {
        lock(&self.scan_sender)
            .as_ref()
            .map(|sender| sender.send(item).is_ok())
            .unwrap_or(false)
    }

    pub fn is_scan_active(&self) -> bool {
        lock(&self.scan_sender)
            .as_ref()
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    pub fn scan_starts(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    pub fn scanned_services(&self) -> Vec<Uuid> {
        lock(&self.scanned_services).clone()
    }

    pub fn bond_subscriptions(&self) -> usize {
        self.bond_subscriptions.load(Ordering::SeqCst)
    }

    /// Number of bond subscriptions that have not been released
    pub fn live_bond_subscriptions(&self) -> usize {
        lock(&self.bond_senders).iter().filter(|s| !s.is_closed()).count()
    }

    /// Number of connection requests made for this address
    pub fn connect_requests(&self, address: &str) -> usize {
        let address = normalize_address(address);
        lock(&self.connect_requests).iter().filter(|a| **a == address).count()
    }

    /// The most recent session opened to this address
    pub fn session(&self, address: &str) -> Option<Arc<MockGattSession>> {
        lock(&self.sessions).get(&normalize_address(address)).cloned()
    }

    /// Fires the connected callback of the latest session to this address
    pub fn complete_connection(&self, address: &str) -> bool {
        self.send_gatt(address, GattEvent::Connected)
    }

    /// Fires the disconnected callback, as if the peripheral went away
    pub fn drop_connection(&self, address: &str) -> bool {
        self.send_gatt(address, GattEvent::Disconnected)
    }

    pub fn notify(&self, address: &str, characteristic: Uuid, value: Vec<u8>) -> bool {
        self.send_gatt(address, GattEvent::Notification { characteristic, value })
    }

    fn send_gatt(&self, address: &str, event: GattEvent) -> bool {
        self.session(address).map(|s| s.send(event)).unwrap_or(false)
    }
}

#[async_trait]
impl BluetoothAdapter for MockAdapter {
    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn bonded_devices(&self) -> BluetoothResult<Vec<BluetoothDevice>> {
        self.bond_queries.fetch_add(1, Ordering::SeqCst);
        if self.bonded_queries_fail.load(Ordering::SeqCst)
            || !self.bond_list_enumerable.load(Ordering::SeqCst)
        {
            return Err(BluetoothError::BondQuery("bond list unavailable".into()));
        }
        Ok(lock(&self.bonded).clone())
    }

    async fn is_bonded(&self, device: &BluetoothDevice) -> BluetoothResult<bool> {
        self.bond_queries.fetch_add(1, Ordering::SeqCst);
        if self.bonded_queries_fail.load(Ordering::SeqCst) {
            return Err(BluetoothError::BondQuery("bond state unavailable".into()));
        }
        Ok(lock(&self.bonded).iter().any(|d| d.same_device(device)))
    }

    async fn start_scan(&self, services: &[Uuid]) -> BluetoothResult<ScanStream> {
        if let Some(failure) = lock(&self.next_scan_error).take() {
            return Err(BluetoothError::ScanFailed(failure));
        }
        if !self.enabled.load(Ordering::SeqCst) {
            return Err(BluetoothError::AdapterNotFound);
        }
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        *lock(&self.scanned_services) = services.to_vec();

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.scan_sender) = Some(tx);
        Ok(receiver_stream(rx))
    }

    async fn bond_events(&self) -> BluetoothResult<BondEventStream> {
        self.bond_subscriptions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.bond_senders).push(tx);
        Ok(receiver_stream(rx))
    }

    async fn connect_gatt(&self, device: &BluetoothDevice) -> BluetoothResult<GattConnection> {
        lock(&self.connect_requests).push(device.address.clone());
        if lock(&self.failing_connections).contains(&device.address) {
            return Err(BluetoothError::ConnectionFailed {
                address: device.address.clone(),
                message: "device unreachable".into(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let characteristics = lock(&self.characteristics)
            .get(&device.address)
            .cloned()
            .unwrap_or_default();
        let session = Arc::new(MockGattSession {
            address: device.address.clone(),
            events: tx,
            characteristics,
            enabled: Mutex::new(Vec::new()),
            disconnect_requests: AtomicUsize::new(0),
            acknowledge_disconnect: self.acknowledge_disconnect.load(Ordering::SeqCst),
            disconnect_delay: *lock(&self.disconnect_delay),
        });
        if self.auto_connect.load(Ordering::SeqCst) {
            session.send(GattEvent::Connected);
        }
        lock(&self.sessions).insert(device.address.clone(), session.clone());

        Ok(GattConnection {
            session,
            events: receiver_stream(rx),
        })
    }
}

/// A permission checker with an explicit deny list
#[derive(Default)]
pub struct MockPermissionChecker {
    denied: Mutex<HashSet<Permission>>,
}

impl MockPermissionChecker {
    pub fn all_granted() -> Self {
        Self::default()
    }

    pub fn denying(permissions: &[Permission]) -> Self {
        Self {
            denied: Mutex::new(permissions.iter().copied().collect()),
        }
    }

    pub fn grant(&self, permission: Permission) {
        lock(&self.denied).remove(&permission);
    }

    pub fn deny(&self, permission: Permission) {
        lock(&self.denied).insert(permission);
    }
}

impl PermissionChecker for MockPermissionChecker {
    fn is_granted(&self, permission: Permission) -> bool {
        !lock(&self.denied).contains(&permission)
    }
}
