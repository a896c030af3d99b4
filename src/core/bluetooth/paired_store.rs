//! Durable set of known devices
//!
//! Membership follows the OS bond list; connection flag and last-seen time are
//! kept locally. Every mutation rewrites the whole persisted list under one
//! lock, so storage always holds a complete, consistent snapshot.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::BluetoothAdapter;
use crate::core::bluetooth::constants::PAIRED_DEVICES_STORAGE_KEY;
use crate::core::bluetooth::device::{BluetoothDevice, PairedDevice};
use crate::core::bluetooth::events::EventSubscription;
use crate::core::bluetooth::pairing::PairingNotifier;
use crate::core::bluetooth::types::PairingEvent;
use crate::storage::{self, KeyValueStorage};

struct Observer {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

struct StoreInner {
    adapter: Arc<dyn BluetoothAdapter>,
    storage: Arc<dyn KeyValueStorage>,
    devices: watch::Sender<Vec<PairedDevice>>,
    update_lock: Mutex<()>,
}

pub struct PairedDeviceStore {
    inner: Arc<StoreInner>,
    notifier: Arc<PairingNotifier>,
    observer: Mutex<Option<Observer>>,
}

impl PairedDeviceStore {
    pub fn new(
        adapter: Arc<dyn BluetoothAdapter>,
        storage: Arc<dyn KeyValueStorage>,
        notifier: Arc<PairingNotifier>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                adapter,
                storage,
                devices: watch::Sender::new(Vec::new()),
                update_lock: Mutex::new(()),
            }),
            notifier,
            observer: Mutex::new(None),
        }
    }

    /// Returns a live view of the known devices.
    ///
    /// The first call after construction (or after [`stop_observing`]) prunes
    /// stored devices the OS no longer has bonded and starts following pairing
    /// events.
    ///
    /// [`stop_observing`]: PairedDeviceStore::stop_observing
    pub async fn observe_paired_devices(&self) -> watch::Receiver<Vec<PairedDevice>> {
        let mut observer = self.observer.lock().await;
        if observer.is_none() {
            // Subscribe before reconciling so a bond change in between is not lost
            let events = self.notifier.subscribe();
            self.inner.reconcile().await;

            let cancel_token = CancellationToken::new();
            let handle = tokio::spawn(Self::follow_pairing_events(
                self.inner.clone(),
                events,
                cancel_token.clone(),
            ));
            *observer = Some(Observer {
                cancel_token,
                handle,
            });
        }
        self.inner.devices.subscribe()
    }

    pub async fn is_observing(&self) -> bool {
        self.observer.lock().await.is_some()
    }

    /// Stops following pairing events. The in-memory view is kept.
    pub async fn stop_observing(&self) {
        let observer = self.observer.lock().await.take();
        if let Some(observer) = observer {
            observer.cancel_token.cancel();
            if let Err(e) = observer.handle.await {
                error!("Paired device observer ended with a join error: {:?}", e);
            }
        }
    }

    async fn follow_pairing_events(
        inner: Arc<StoreInner>,
        mut events: EventSubscription<PairingEvent>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(PairingEvent::DevicePaired(device)) => inner.record_paired(&device).await,
                        Some(PairingEvent::DeviceUnpaired(device)) => inner.forget(&device).await,
                        None => break,
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    /// Records the connection flag of a bonded device; ignores unbonded ones
    pub async fn update_device_connection(&self, device: &BluetoothDevice, connected: bool) {
        if !self.is_paired(device).await {
            debug!(
                "Ignoring connection update for {}: not bonded.",
                device.address
            );
            return;
        }
        let record = PairedDevice::new(device, connected, Utc::now());
        self.inner
            .mutate("connection update", |devices| {
                let name = record
                    .name
                    .clone()
                    .or_else(|| find(devices, &record.address).and_then(|d| d.name.clone()));
                upsert(devices, PairedDevice { name, ..record });
            })
            .await;
    }

    /// Asks the OS whether the device is bonded
    pub async fn is_paired(&self, device: &BluetoothDevice) -> bool {
        self.bond_state(device).await.unwrap_or(false)
    }

    /// Like [`is_paired`](PairedDeviceStore::is_paired), but `None` when the OS could not answer
    pub async fn bond_state(&self, device: &BluetoothDevice) -> Option<bool> {
        match self.inner.adapter.is_bonded(device).await {
            Ok(bonded) => Some(bonded),
            Err(e) => {
                error!("Failed to query bond state of {}: {}", device.address, e);
                None
            }
        }
    }

    /// Marks every known device as disconnected
    pub async fn on_stopped(&self) {
        self.inner
            .mutate("shutdown", |devices| {
                for device in devices.iter_mut() {
                    device.connected = false;
                }
            })
            .await;
    }

    pub fn snapshot(&self) -> Vec<PairedDevice> {
        self.inner.devices.borrow().clone()
    }
}

impl StoreInner {
    async fn load(&self) -> Option<Vec<PairedDevice>> {
        match storage::get_serializable_list(self.storage.as_ref(), PAIRED_DEVICES_STORAGE_KEY).await {
            Ok(devices) => Some(devices),
            Err(e) => {
                error!("Failed to read paired devices: {}", e);
                None
            }
        }
    }

    /// Drops stored devices that are no longer bonded
    async fn reconcile(&self) {
        let _guard = self.update_lock.lock().await;
        let Some(stored) = self.load().await else {
            return;
        };
        let bonded = match self.adapter.bonded_devices().await {
            Ok(bonded) => bonded,
            Err(e) => {
                warn!("Cannot reconcile paired devices, bond list unavailable: {}", e);
                self.devices.send_replace(stored);
                return;
            }
        };

        let before = stored.len();
        let kept: Vec<PairedDevice> = stored
            .into_iter()
            .filter(|d| bonded.iter().any(|b| b.address == d.address))
            .collect();
        if kept.len() != before {
            info!(
                "Dropped {} stored device(s) no longer bonded.",
                before - kept.len()
            );
            if let Err(e) =
                storage::put_serializable(self.storage.as_ref(), PAIRED_DEVICES_STORAGE_KEY, &kept).await
            {
                error!("Failed to persist reconciled paired devices: {}", e);
            }
        }
        self.devices.send_replace(kept);
    }

    async fn record_paired(&self, device: &BluetoothDevice) {
        self.mutate("pairing", |devices| {
            let previous = find(devices, &device.address);
            let connected = previous.map(|d| d.connected).unwrap_or(false);
            let name = device
                .name
                .clone()
                .or_else(|| previous.and_then(|d| d.name.clone()));
            let mut record = PairedDevice::new(device, connected, Utc::now());
            record.name = name;
            upsert(devices, record);
        })
        .await;
    }

    async fn forget(&self, device: &BluetoothDevice) {
        self.mutate("unpairing", |devices| {
            devices.retain(|d| d.address != device.address);
        })
        .await;
    }

    /// Read-modify-write of the full list. On any failure the last good
    /// in-memory state stays published.
    async fn mutate<F>(&self, what: &str, apply: F)
    where
        F: FnOnce(&mut Vec<PairedDevice>),
    {
        let _guard = self.update_lock.lock().await;
        let mut devices = match self.load().await {
            Some(devices) => devices,
            None => self.devices.borrow().clone(),
        };
        apply(&mut devices);

        match storage::put_serializable(self.storage.as_ref(), PAIRED_DEVICES_STORAGE_KEY, &devices).await {
            Ok(()) => {
                debug!("Paired devices updated ({}): {} known.", what, devices.len());
                self.devices.send_replace(devices);
            }
            Err(e) => error!("Failed to persist paired devices ({}): {}", what, e),
        }
    }
}

fn find<'a>(devices: &'a [PairedDevice], address: &str) -> Option<&'a PairedDevice> {
    devices.iter().find(|d| d.address == address)
}

/// Replace-by-address
fn upsert(devices: &mut Vec<PairedDevice>, record: PairedDevice) {
    devices.retain(|d| d.address != record.address);
    devices.push(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::mock::MockAdapter;
    use crate::storage::InMemoryStorage;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        adapter: Arc<MockAdapter>,
        storage: Arc<InMemoryStorage>,
        notifier: Arc<PairingNotifier>,
        store: PairedDeviceStore,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(MockAdapter::new());
        let storage = Arc::new(InMemoryStorage::new());
        let notifier = Arc::new(PairingNotifier::new(adapter.clone()));
        let store = PairedDeviceStore::new(adapter.clone(), storage.clone(), notifier.clone());
        Fixture {
            adapter,
            storage,
            notifier,
            store,
        }
    }

    fn named(address: &str, name: &str) -> BluetoothDevice {
        BluetoothDevice::new(address, Some(name.to_string()), None)
    }

    async fn seed(storage: &InMemoryStorage, devices: &[PairedDevice]) {
        storage::put_serializable(storage, PAIRED_DEVICES_STORAGE_KEY, devices)
            .await
            .unwrap();
    }

    async fn stored(storage: &InMemoryStorage) -> Vec<PairedDevice> {
        storage::get_serializable_list(storage, PAIRED_DEVICES_STORAGE_KEY)
            .await
            .unwrap()
    }

    async fn wait_until<F>(rx: &mut watch::Receiver<Vec<PairedDevice>>, predicate: F)
    where
        F: Fn(&[PairedDevice]) -> bool,
    {
        timeout(Duration::from_secs(1), rx.wait_for(|d| predicate(d)))
            .await
            .expect("timed out waiting for paired devices")
            .expect("store dropped");
    }

    #[tokio::test]
    async fn first_observation_drops_unbonded_devices() {
        let f = fixture();
        let kept = named("AA:BB", "Scale");
        let gone = named("CC:DD", "Cuff");
        seed(
            &f.storage,
            &[
                PairedDevice::new(&kept, false, Utc::now()),
                PairedDevice::new(&gone, false, Utc::now()),
            ],
        )
        .await;
        f.adapter.add_bonded(kept.clone());

        let rx = f.store.observe_paired_devices().await;

        let addresses: Vec<String> = rx.borrow().iter().map(|d| d.address.clone()).collect();
        assert_eq!(addresses, vec!["AA:BB".to_string()]);
        assert_eq!(stored(&f.storage).await.len(), 1);
    }

    #[tokio::test]
    async fn connection_update_is_ignored_for_unbonded_device() {
        let f = fixture();
        f.store
            .update_device_connection(&named("AA:BB", "Scale"), true)
            .await;
        assert!(f.store.snapshot().is_empty());
        assert!(stored(&f.storage).await.is_empty());
    }

    #[tokio::test]
    async fn connection_updates_replace_rather_than_append() {
        let f = fixture();
        let device = named("AA:BB", "Scale");
        f.adapter.add_bonded(device.clone());

        f.store.update_device_connection(&device, true).await;
        f.store.update_device_connection(&device, false).await;
        f.store.update_device_connection(&device, true).await;

        let devices = stored(&f.storage).await;
        assert_eq!(devices.len(), 1);
        assert!(devices[0].connected);
        assert_eq!(devices[0].name.as_deref(), Some("Scale"));
        assert_eq!(f.store.snapshot(), devices);
    }

    #[tokio::test]
    async fn connection_update_keeps_known_name() {
        let f = fixture();
        let device = named("AA:BB", "Scale");
        f.adapter.add_bonded(device.clone());
        f.store.update_device_connection(&device, true).await;

        f.store
            .update_device_connection(&BluetoothDevice::with_address("aa:bb"), false)
            .await;

        let devices = f.store.snapshot();
        assert_eq!(devices[0].name.as_deref(), Some("Scale"));
        assert!(!devices[0].connected);
    }

    #[tokio::test]
    async fn is_paired_follows_os_bond_list() {
        let f = fixture();
        let device = named("AA:BB", "Scale");
        assert!(!f.store.is_paired(&device).await);
        f.adapter.add_bonded(device.clone());
        assert!(f.store.is_paired(&device).await);

        f.adapter.set_bonded_queries_fail(true);
        assert!(!f.store.is_paired(&device).await);
    }

    #[tokio::test]
    async fn on_stopped_marks_everything_disconnected() {
        let f = fixture();
        let a = named("AA:BB", "Scale");
        let b = named("CC:DD", "Cuff");
        f.adapter.add_bonded(a.clone());
        f.adapter.add_bonded(b.clone());
        f.store.update_device_connection(&a, true).await;
        f.store.update_device_connection(&b, true).await;

        f.store.on_stopped().await;

        let devices = stored(&f.storage).await;
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| !d.connected));
    }

    #[tokio::test]
    async fn follows_pairing_events() {
        let f = fixture();
        let mut rx = f.store.observe_paired_devices().await;
        f.notifier.start().await;

        let device = named("AA:BB", "Scale");
        f.adapter.bond(device.clone());
        wait_until(&mut rx, |d| d.len() == 1 && d[0].address == "AA:BB").await;
        assert!(!rx.borrow()[0].connected);

        f.adapter.unbond(device);
        wait_until(&mut rx, |d| d.is_empty()).await;
        assert!(stored(&f.storage).await.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_keeps_last_good_state() {
        let f = fixture();
        let device = named("AA:BB", "Scale");
        f.adapter.add_bonded(device.clone());
        f.store.update_device_connection(&device, true).await;

        f.storage.set_fail_writes(true);
        f.store.update_device_connection(&device, false).await;
        f.store.on_stopped().await;

        let devices = f.store.snapshot();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].connected);
    }

    #[tokio::test]
    async fn unavailable_bond_list_keeps_stored_devices() {
        let f = fixture();
        let device = named("AA:BB", "Scale");
        seed(&f.storage, &[PairedDevice::new(&device, false, Utc::now())]).await;
        f.adapter.set_bonded_queries_fail(true);

        let rx = f.store.observe_paired_devices().await;

        assert_eq!(rx.borrow().len(), 1);
    }

    #[tokio::test]
    async fn partial_bond_view_keeps_stored_devices_and_still_records_connections() {
        let f = fixture();
        let scale = named("AA:BB", "Scale");
        let cuff = named("CC:DD", "Cuff");
        seed(
            &f.storage,
            &[
                PairedDevice::new(&scale, false, Utc::now()),
                PairedDevice::new(&cuff, false, Utc::now()),
            ],
        )
        .await;
        f.adapter.add_bonded(scale.clone());
        f.adapter.set_bond_list_enumerable(false);

        let rx = f.store.observe_paired_devices().await;
        assert_eq!(rx.borrow().len(), 2);
        assert_eq!(stored(&f.storage).await.len(), 2);

        assert!(f.store.is_paired(&scale).await);
        f.store.update_device_connection(&scale, true).await;
        let devices = stored(&f.storage).await;
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().any(|d| d.address == "AA:BB" && d.connected));
    }

    #[tokio::test]
    async fn pairing_flood_ending_in_unpair_leaves_no_stale_record() {
        let f = fixture();
        let mut rx = f.store.observe_paired_devices().await;
        f.notifier.start().await;

        let device = named("AA:BB", "Scale");
        for _ in 0..200 {
            f.adapter.bond(device.clone());
        }
        f.adapter.unbond(device);
        // handled in order, so once the marker shows up the flood is done
        f.adapter.bond(named("FF:FF", "Marker"));

        wait_until(&mut rx, |d| d.iter().any(|d| d.address == "FF:FF")).await;
        let addresses: Vec<String> = rx.borrow().iter().map(|d| d.address.clone()).collect();
        assert_eq!(addresses, vec!["FF:FF".to_string()]);
        assert_eq!(stored(&f.storage).await.len(), 1);
    }

    #[tokio::test]
    async fn observation_starts_once_and_can_restart() {
        let f = fixture();
        let _first = f.store.observe_paired_devices().await;
        let _second = f.store.observe_paired_devices().await;
        assert!(f.store.is_observing().await);

        f.store.stop_observing().await;
        f.store.stop_observing().await;
        assert!(!f.store.is_observing().await);

        let _again = f.store.observe_paired_devices().await;
        assert!(f.store.is_observing().await);
    }
}
