//! Per-device connection lifecycle
//!
//! A [`DeviceConnector`] owns the GATT session to exactly one device and walks
//! `Unconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
//! `Disconnected` is terminal: the destroyed flag is a single-fire latch, so a
//! connector emits exactly one `Disconnected` event and can never reconnect.

use futures_util::StreamExt;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::core::bluetooth::adapter::{BluetoothAdapter, GattConnection, GattEventStream, GattSession};
use crate::core::bluetooth::device::BluetoothDevice;
use crate::core::bluetooth::events::{EventBus, EventSubscription};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::types::{ConnectorEvent, ConnectorState, GattEvent};
use crate::core::measurement::MeasurementMapper;

/// Builds one connector per device, sharing the adapter and the mapper
#[derive(Clone)]
pub struct ConnectorFactory {
    adapter: Arc<dyn BluetoothAdapter>,
    notification_handler: NotificationHandler,
}

impl ConnectorFactory {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, mapper: Arc<dyn MeasurementMapper>) -> Self {
        Self {
            adapter,
            notification_handler: NotificationHandler::new(mapper),
        }
    }

    pub fn create(&self, device: BluetoothDevice) -> DeviceConnector {
        DeviceConnector {
            device,
            adapter: self.adapter.clone(),
            notification_handler: self.notification_handler.clone(),
            events: EventBus::new(),
            shared: Arc::new(ConnectorShared {
                state: Mutex::new(ConnectorState::Unconnected),
                destroyed: AtomicBool::new(false),
                session: Mutex::new(None),
            }),
            event_task_handle: None,
        }
    }
}

/// State shared between the connector handle and its callback task
struct ConnectorShared {
    state: Mutex<ConnectorState>,
    destroyed: AtomicBool,
    session: Mutex<Option<Arc<dyn GattSession>>>,
}

impl ConnectorShared {
    fn state(&self) -> MutexGuard<'_, ConnectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> MutexGuard<'_, Option<Arc<dyn GattSession>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectorState) {
        *self.state() = state;
    }

    /// Releases the session and emits `Disconnected`, at most once per connector
    fn finish(&self, device: &BluetoothDevice, events: &EventBus<ConnectorEvent>) {
        self.session().take();
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectorState::Disconnected);
        info!("Connector for {} is disconnected.", device.address);
        events.emit(ConnectorEvent::Disconnected(device.clone()));
    }
}

/// Owns the connection to one physical device
pub struct DeviceConnector {
    device: BluetoothDevice,
    adapter: Arc<dyn BluetoothAdapter>,
    notification_handler: NotificationHandler,
    events: EventBus<ConnectorEvent>,
    shared: Arc<ConnectorShared>,
    event_task_handle: Option<JoinHandle<()>>,
}

impl DeviceConnector {
    pub fn device(&self) -> &BluetoothDevice {
        &self.device
    }

    pub fn state(&self) -> ConnectorState {
        *self.shared.state()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> EventSubscription<ConnectorEvent> {
        self.events.subscribe()
    }

    /// Requests the GATT connection. A no-op while connecting or connected,
    /// and forever after the connector has been torn down.
    pub async fn connect(&mut self) {
        if self.is_destroyed() {
            debug!("Connector for {} was torn down; not reconnecting.", self.device.address);
            return;
        }
        {
            let mut state = self.shared.state();
            if *state != ConnectorState::Unconnected {
                debug!("Connector for {} is already {:?}.", self.device.address, *state);
                return;
            }
            *state = ConnectorState::Connecting;
        }

        info!("Initiating connection to {}...", self.device.address);
        match self.adapter.connect_gatt(&self.device).await {
            Ok(GattConnection { session, events }) => {
                *self.shared.session() = Some(session.clone());
                let handle = tokio::spawn(Self::process_gatt_events(
                    events,
                    session,
                    self.device.clone(),
                    self.notification_handler.clone(),
                    self.events.clone(),
                    self.shared.clone(),
                ));
                self.event_task_handle = Some(handle);
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", self.device.address, e);
                self.shared.finish(&self.device, &self.events);
            }
        }
    }

    /// Handles the session's hardware callbacks in arrival order
    async fn process_gatt_events(
        mut gatt_events: GattEventStream,
        session: Arc<dyn GattSession>,
        device: BluetoothDevice,
        notification_handler: NotificationHandler,
        events: EventBus<ConnectorEvent>,
        shared: Arc<ConnectorShared>,
    ) {
        while let Some(event) = gatt_events.next().await {
            match event {
                GattEvent::Connected => {
                    if shared.destroyed.load(Ordering::SeqCst) {
                        continue;
                    }
                    info!("Connected to {}, setting up notifications...", device.address);
                    if let Err(e) = notification_handler
                        .setup_notifications(&device, session.as_ref())
                        .await
                    {
                        warn!("Notification setup for {} failed: {}", device.address, e);
                    }
                    {
                        let mut state = shared.state();
                        if *state == ConnectorState::Connecting {
                            *state = ConnectorState::Connected;
                        }
                    }
                    events.emit(ConnectorEvent::Connected(device.clone()));
                }
                GattEvent::Notification {
                    characteristic,
                    value,
                } => {
                    if let Some(event) =
                        notification_handler.handle_notification(&device, characteristic, &value)
                    {
                        events.emit(event);
                    }
                }
                GattEvent::Disconnected => {
                    info!("Device {} reported disconnect.", device.address);
                    break;
                }
            }
        }
        shared.finish(&device, &events);
    }

    /// Disconnects the device. Without a live session the `Disconnected` event is
    /// emitted immediately. Otherwise the request is sent from a background task
    /// and the event follows the hardware acknowledgement.
    pub fn disconnect(&self) {
        if self.is_destroyed() {
            return;
        }
        let session = self.shared.session().clone();
        match session {
            None => {
                debug!("No session to {}; disconnecting immediately.", self.device.address);
                self.shared.finish(&self.device, &self.events);
            }
            Some(session) => {
                {
                    let mut state = self.shared.state();
                    if *state == ConnectorState::Disconnecting {
                        debug!("Disconnect from {} already requested.", self.device.address);
                        return;
                    }
                    *state = ConnectorState::Disconnecting;
                }
                info!("Requesting disconnect from {}", self.device.address);
                let device = self.device.clone();
                let events = self.events.clone();
                let shared = self.shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = session.disconnect().await {
                        warn!("Disconnect request to {} failed: {}", device.address, e);
                        shared.finish(&device, &events);
                    }
                });
            }
        }
    }
}

impl Drop for DeviceConnector {
    fn drop(&mut self) {
        if let Some(handle) = self.event_task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_WEIGHT_MEASUREMENT;
    use crate::core::bluetooth::mock::MockAdapter;
    use crate::core::measurement::{Measurement, StandardMeasurementMapper};
    use std::time::Duration;
    use tokio::time::timeout;

    fn factory(adapter: &Arc<MockAdapter>) -> ConnectorFactory {
        ConnectorFactory::new(adapter.clone(), Arc::new(StandardMeasurementMapper::new()))
    }

    async fn wait_for_disconnect_requests(adapter: &MockAdapter, address: &str, expected: usize) {
        let session = adapter.session(address).expect("no session");
        timeout(Duration::from_secs(1), async {
            while session.disconnect_requests() < expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("disconnect was never requested");
    }

    async fn next(sub: &mut EventSubscription<ConnectorEvent>) -> ConnectorEvent {
        timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("timed out waiting for connector event")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn connects_and_forwards_measurements() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_characteristics("AA:BB", vec![UUID_WEIGHT_MEASUREMENT]);
        let device = BluetoothDevice::with_address("AA:BB");
        let mut connector = factory(&adapter).create(device.clone());
        let mut sub = connector.subscribe();

        connector.connect().await;
        assert_eq!(next(&mut sub).await, ConnectorEvent::Connected(device.clone()));
        assert_eq!(connector.state(), ConnectorState::Connected);

        adapter.notify("AA:BB", UUID_WEIGHT_MEASUREMENT, vec![0x00, 0x98, 0x3A]);
        match next(&mut sub).await {
            ConnectorEvent::MeasurementReceived { device: from, measurement } => {
                assert_eq!(from, device);
                assert!(matches!(measurement, Measurement::Weight { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_is_noop_while_connecting() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_auto_connect(false);
        let mut connector = factory(&adapter).create(BluetoothDevice::with_address("AA:BB"));

        connector.connect().await;
        connector.connect().await;

        assert_eq!(connector.state(), ConnectorState::Connecting);
        assert_eq!(adapter.connect_requests("AA:BB"), 1);
    }

    #[tokio::test]
    async fn disconnect_without_session_emits_exactly_once() {
        let adapter = Arc::new(MockAdapter::new());
        let device = BluetoothDevice::with_address("AA:BB");
        let mut connector = factory(&adapter).create(device.clone());
        let mut sub = connector.subscribe();

        connector.disconnect();
        // emitted synchronously, before any await on the subscription
        assert_eq!(sub.try_recv(), Some(ConnectorEvent::Disconnected(device)));

        connector.disconnect();
        assert_eq!(sub.try_recv(), None);
        assert!(connector.is_destroyed());
        assert_eq!(connector.state(), ConnectorState::Disconnected);
    }

    #[tokio::test]
    async fn destroyed_connector_never_reconnects() {
        let adapter = Arc::new(MockAdapter::new());
        let mut connector = factory(&adapter).create(BluetoothDevice::with_address("AA:BB"));

        connector.disconnect();
        connector.connect().await;

        assert_eq!(adapter.connect_requests("AA:BB"), 0);
        assert_eq!(connector.state(), ConnectorState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_waits_for_hardware_callback() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_acknowledge_disconnect(false);
        let device = BluetoothDevice::with_address("AA:BB");
        let mut connector = factory(&adapter).create(device.clone());
        let mut sub = connector.subscribe();
        connector.connect().await;
        assert_eq!(next(&mut sub).await, ConnectorEvent::Connected(device.clone()));

        connector.disconnect();
        connector.disconnect();
        assert_eq!(connector.state(), ConnectorState::Disconnecting);
        wait_for_disconnect_requests(&adapter, "AA:BB", 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(adapter.session("AA:BB").unwrap().disconnect_requests(), 1);
        assert_eq!(sub.try_recv(), None);

        adapter.drop_connection("AA:BB");
        assert_eq!(next(&mut sub).await, ConnectorEvent::Disconnected(device));
        assert!(connector.is_destroyed());

        // a late duplicate callback does not produce a second event
        connector.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn unexpected_disconnect_is_reported_once() {
        let adapter = Arc::new(MockAdapter::new());
        let device = BluetoothDevice::with_address("AA:BB");
        let mut connector = factory(&adapter).create(device.clone());
        let mut sub = connector.subscribe();
        connector.connect().await;
        assert_eq!(next(&mut sub).await, ConnectorEvent::Connected(device.clone()));

        adapter.drop_connection("AA:BB");
        assert_eq!(next(&mut sub).await, ConnectorEvent::Disconnected(device));

        connector.disconnect();
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn failed_connect_request_tears_connector_down() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.fail_connections_to("AA:BB");
        let device = BluetoothDevice::with_address("AA:BB");
        let mut connector = factory(&adapter).create(device.clone());
        let mut sub = connector.subscribe();

        connector.connect().await;

        assert_eq!(sub.try_recv(), Some(ConnectorEvent::Disconnected(device)));
        assert!(connector.is_destroyed());
    }

    #[tokio::test]
    async fn disconnect_does_not_wait_for_the_hardware() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_disconnect_delay(Duration::from_secs(30));
        let device = BluetoothDevice::with_address("AA:BB");
        let mut connector = factory(&adapter).create(device.clone());
        let mut sub = connector.subscribe();
        connector.connect().await;
        assert_eq!(next(&mut sub).await, ConnectorEvent::Connected(device.clone()));

        // returns while the request is still in flight
        connector.disconnect();
        assert_eq!(connector.state(), ConnectorState::Disconnecting);
        wait_for_disconnect_requests(&adapter, "AA:BB", 1).await;
        assert!(!connector.is_destroyed());
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn notification_burst_keeps_every_event_in_order() {
        let adapter = Arc::new(MockAdapter::new());
        adapter.set_auto_connect(false);
        adapter.set_characteristics("AA:BB", vec![UUID_WEIGHT_MEASUREMENT]);
        let device = BluetoothDevice::with_address("AA:BB");
        let mut connector = factory(&adapter).create(device.clone());
        let mut sub = connector.subscribe();
        connector.connect().await;

        adapter.complete_connection("AA:BB");
        for _ in 0..500 {
            adapter.notify("AA:BB", UUID_WEIGHT_MEASUREMENT, vec![0x00, 0x98, 0x3A]);
        }
        adapter.drop_connection("AA:BB");

        assert_eq!(next(&mut sub).await, ConnectorEvent::Connected(device.clone()));
        for _ in 0..500 {
            assert!(matches!(
                next(&mut sub).await,
                ConnectorEvent::MeasurementReceived { .. }
            ));
        }
        assert_eq!(next(&mut sub).await, ConnectorEvent::Disconnected(device));
    }
}
