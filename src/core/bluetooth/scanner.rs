use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{BluetoothAdapter, ScanStream};
use crate::core::bluetooth::events::{EventBus, EventSubscription};
use crate::core::bluetooth::types::{ScanEvent, ScanFailure};

/// Drives hardware discovery of advertising peripherals.
///
/// Every advertisement is reported, duplicates included; deduplication is up
/// to the consumer. Scan failures are reported once and never retried here.
pub struct DeviceScanner {
    adapter: Arc<dyn BluetoothAdapter>,
    events: EventBus<ScanEvent>,
    scanning: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
    min_rssi: Option<i16>,
}

impl DeviceScanner {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>) -> Self {
        Self {
            adapter,
            events: EventBus::new(),
            scanning: Arc::new(AtomicBool::new(false)),
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
            min_rssi: None,
        }
    }

    /// Ignore advertisements weaker than this signal strength
    pub fn with_min_rssi(mut self, min_rssi: Option<i16>) -> Self {
        self.min_rssi = min_rssi;
        self
    }

    pub fn subscribe(&self) -> EventSubscription<ScanEvent> {
        self.events.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Starts discovery filtered to `services`. A no-op while already scanning.
    pub async fn start_scanning(&mut self, services: &[Uuid]) {
        if self.is_scanning() {
            debug!("Scan already running, ignoring start request.");
            return;
        }
        // reap a task that ended on its own (stream end or failure)
        if let Some(handle) = self.scan_task_handle.take() {
            if let Err(e) = handle.await {
                error!("Previous scan task ended with a join error: {:?}", e);
            }
        }

        info!("Starting bluetooth scan for {} service(s)", services.len());
        let scan_stream = match self.adapter.start_scan(services).await {
            Ok(stream) => stream,
            Err(e) => {
                let failure = e.scan_failure().unwrap_or(ScanFailure::InternalError);
                warn!("Scan request rejected: {}", e);
                self.events.emit(ScanEvent::Failure(failure));
                return;
            }
        };

        self.scanning.store(true, Ordering::SeqCst);
        self.cancel_token = CancellationToken::new();

        let handle = tokio::spawn(Self::internal_scan_task(
            scan_stream,
            self.events.clone(),
            self.scanning.clone(),
            self.cancel_token.clone(),
            self.min_rssi,
        ));
        self.scan_task_handle = Some(handle);
        info!("Device scan task started.");
    }

    /// Forwards advertisements until cancelled, the stream ends, or the radio reports a failure
    async fn internal_scan_task(
        mut scan_stream: ScanStream,
        events: EventBus<ScanEvent>,
        scanning: Arc<AtomicBool>,
        cancel_token: CancellationToken,
        min_rssi: Option<i16>,
    ) {
        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(Ok(device)) => {
                            debug!("Found device - Address: {}, Name: {:?}, RSSI: {:?}", device.address, device.name, device.rssi);
                            if let (Some(threshold), Some(rssi)) = (min_rssi, device.rssi) {
                                if rssi < threshold {
                                    continue;
                                }
                            }
                            events.emit(ScanEvent::DeviceFound(device));
                        }
                        Some(Err(e)) => {
                            let failure = e.scan_failure().unwrap_or(ScanFailure::InternalError);
                            warn!("Bluetooth scan failed: {}", e);
                            events.emit(ScanEvent::Failure(failure));
                            break;
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        scanning.store(false, Ordering::SeqCst);
    }

    /// Halts discovery. A no-op when not scanning.
    pub async fn stop_scanning(&mut self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            info!("Stopping Bluetooth scan.");
            match handle.await {
                Ok(()) => info!("Scan task finished after cancellation."),
                Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
                Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
            }
        }
        self.scanning.store(false, Ordering::SeqCst);
    }
}

impl Drop for DeviceScanner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::device::BluetoothDevice;
    use crate::core::bluetooth::mock::MockAdapter;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(sub: &mut EventSubscription<ScanEvent>) -> ScanEvent {
        timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for scan event")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn start_is_idempotent_while_scanning() {
        let adapter = Arc::new(MockAdapter::new());
        let mut scanner = DeviceScanner::new(adapter.clone());
        let services = [Uuid::nil()];

        scanner.start_scanning(&services).await;
        scanner.start_scanning(&services).await;

        assert!(scanner.is_scanning());
        assert_eq!(adapter.scan_starts(), 1);
        assert_eq!(adapter.scanned_services(), services.to_vec());
    }

    #[tokio::test]
    async fn reports_duplicate_advertisements() {
        let adapter = Arc::new(MockAdapter::new());
        let mut scanner = DeviceScanner::new(adapter.clone());
        let mut sub = scanner.subscribe();
        scanner.start_scanning(&[]).await;

        let device = BluetoothDevice::with_address("AA:BB");
        assert!(adapter.advertise(device.clone()));
        assert!(adapter.advertise(device.clone()));

        assert_eq!(next(&mut sub).await, ScanEvent::DeviceFound(device.clone()));
        assert_eq!(next(&mut sub).await, ScanEvent::DeviceFound(device));
    }

    #[tokio::test]
    async fn rejected_scan_emits_failure_and_stays_idle() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_next_scan(ScanFailure::ScanningTooFrequently);
        let mut scanner = DeviceScanner::new(adapter.clone());
        let mut sub = scanner.subscribe();

        scanner.start_scanning(&[]).await;

        assert!(!scanner.is_scanning());
        assert_eq!(next(&mut sub).await, ScanEvent::Failure(ScanFailure::ScanningTooFrequently));

        // not retried automatically, but a new request goes through
        assert_eq!(adapter.scan_starts(), 0);
        scanner.start_scanning(&[]).await;
        assert_eq!(adapter.scan_starts(), 1);
    }

    #[tokio::test]
    async fn failure_during_scan_resets_flag() {
        let adapter = Arc::new(MockAdapter::new());
        let mut scanner = DeviceScanner::new(adapter.clone());
        let mut sub = scanner.subscribe();
        scanner.start_scanning(&[]).await;

        adapter.fail_running_scan(ScanFailure::OutOfHardwareResources);
        assert_eq!(next(&mut sub).await, ScanEvent::Failure(ScanFailure::OutOfHardwareResources));
        tokio::task::yield_now().await;
        timeout(Duration::from_secs(1), async {
            while scanner.is_scanning() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("scanning flag never cleared");
    }

    #[tokio::test]
    async fn stop_releases_hardware_scan_and_is_idempotent() {
        let adapter = Arc::new(MockAdapter::new());
        let mut scanner = DeviceScanner::new(adapter.clone());
        scanner.stop_scanning().await;

        scanner.start_scanning(&[]).await;
        assert!(adapter.is_scan_active());

        scanner.stop_scanning().await;
        scanner.stop_scanning().await;
        assert!(!scanner.is_scanning());
        assert!(!adapter.is_scan_active());
    }

    #[tokio::test]
    async fn weak_advertisements_are_filtered() {
        let adapter = Arc::new(MockAdapter::new());
        let mut scanner = DeviceScanner::new(adapter.clone()).with_min_rssi(Some(-70));
        let mut sub = scanner.subscribe();
        scanner.start_scanning(&[]).await;

        adapter.advertise(BluetoothDevice::new("AA:01", None, Some(-90)));
        let near = BluetoothDevice::new("AA:02", None, Some(-40));
        adapter.advertise(near.clone());

        assert_eq!(next(&mut sub).await, ScanEvent::DeviceFound(near));
    }
}
