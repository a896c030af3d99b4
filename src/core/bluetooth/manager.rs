//! BLE orchestrator
//! This module composes the scanner, pairing notifier, paired-device store and
//! per-device connectors into one service.
//!
//! All orchestration state lives in a single worker task. The public
//! [`BleOrchestrator`] handle only sends commands to it; scanner, pairing,
//! store and connector events are forwarded into the same task, so the
//! connector map and the service state are only ever touched from one place.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::adapter::{BluetoothAdapter, PermissionChecker};
use crate::core::bluetooth::connection::{ConnectorFactory, DeviceConnector};
use crate::core::bluetooth::device::{BluetoothDevice, PairedDevice};
use crate::core::bluetooth::error::{BluetoothError, BluetoothResult};
use crate::core::bluetooth::events::{EventBus, EventSubscription};
use crate::core::bluetooth::paired_store::PairedDeviceStore;
use crate::core::bluetooth::pairing::PairingNotifier;
use crate::core::bluetooth::scanner::DeviceScanner;
use crate::core::bluetooth::types::{
    BluetoothEvent, ConnectorEvent, PairingEvent, ScanEvent, ServiceState,
};
use crate::core::measurement::MeasurementMapper;
use crate::storage::KeyValueStorage;

const COMMAND_BUFFER: usize = 32;

/// Requests sent from the handle to the worker
enum OrchestratorCommand {
    StartDiscovering {
        services: Vec<Uuid>,
        reply: oneshot::Sender<()>,
    },
    Pair {
        device: BluetoothDevice,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ActiveConnections {
        reply: oneshot::Sender<Vec<String>>,
    },
    PairedDevices {
        reply: oneshot::Sender<Vec<PairedDevice>>,
    },
}

/// Callbacks redispatched onto the worker
enum WorkerInput {
    Scan(ScanEvent),
    Pairing(PairingEvent),
    PairedDevices(Vec<PairedDevice>),
    Connector(ConnectorEvent),
}

/// Everything the orchestrator needs from the outside world
pub struct OrchestratorDeps {
    pub adapter: Arc<dyn BluetoothAdapter>,
    pub permissions: Arc<dyn PermissionChecker>,
    pub mapper: Arc<dyn MeasurementMapper>,
    pub storage: Arc<dyn KeyValueStorage>,
    pub config: BluetoothConfig,
}

/// Cloneable handle to the orchestrator worker.
///
/// The worker shuts down once every handle has been dropped.
#[derive(Clone)]
pub struct BleOrchestrator {
    commands: mpsc::Sender<OrchestratorCommand>,
    events: EventBus<BluetoothEvent>,
    state: watch::Receiver<ServiceState>,
    discovery_enabled: Arc<AtomicBool>,
}

impl BleOrchestrator {
    /// Spawns the worker task. Must be called from within a tokio runtime.
    pub fn new(deps: OrchestratorDeps) -> Self {
        let OrchestratorDeps {
            adapter,
            permissions,
            mapper,
            storage,
            config,
        } = deps;

        let events = EventBus::with_replay(config.event_buffer);
        let (state_tx, state_rx) = watch::channel(ServiceState::Idle);
        let discovery_enabled = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let notifier = Arc::new(PairingNotifier::new(adapter.clone()));
        let store = PairedDeviceStore::new(adapter.clone(), storage, notifier.clone());
        let scanner = DeviceScanner::new(adapter.clone()).with_min_rssi(config.min_rssi);
        let factory = ConnectorFactory::new(adapter.clone(), mapper);

        let worker = OrchestratorWorker {
            adapter,
            permissions,
            config,
            scanner,
            notifier,
            store,
            factory,
            connectors: HashMap::new(),
            bond_cache: HashMap::new(),
            subscriptions: None,
            events: events.clone(),
            state: state_tx,
            discovery_enabled: discovery_enabled.clone(),
            input_tx,
        };
        tokio::spawn(worker.run(command_rx, input_rx));

        Self {
            commands: command_tx,
            events,
            state: state_rx,
            discovery_enabled,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> OrchestratorCommand,
    ) -> BluetoothResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| BluetoothError::ServiceClosed)?;
        reply_rx.await.map_err(|_| BluetoothError::ServiceClosed)
    }

    /// Starts discovery for the given services; an empty list means the
    /// configured ones. Radio and permission problems are reported through
    /// [`BleOrchestrator::state`], not as errors.
    pub async fn start_discovering(&self, services: &[Uuid]) -> BluetoothResult<()> {
        self.discovery_enabled.store(true, Ordering::SeqCst);
        let services = services.to_vec();
        self.request(|reply| OrchestratorCommand::StartDiscovering { services, reply })
            .await
    }

    /// Requests a connection to the device unless one is already active
    pub async fn pair(&self, device: BluetoothDevice) -> BluetoothResult<()> {
        self.request(|reply| OrchestratorCommand::Pair { device, reply })
            .await
    }

    /// Stops discovery and disconnects every device. Discovery-triggered
    /// pairing stops as soon as this is called; disconnects finish in the
    /// background.
    pub async fn stop(&self) -> BluetoothResult<()> {
        self.discovery_enabled.store(false, Ordering::SeqCst);
        self.request(|reply| OrchestratorCommand::Stop { reply }).await
    }

    /// Addresses that currently own a connector
    pub async fn active_connections(&self) -> BluetoothResult<Vec<String>> {
        self.request(|reply| OrchestratorCommand::ActiveConnections { reply })
            .await
    }

    pub async fn paired_devices(&self) -> BluetoothResult<Vec<PairedDevice>> {
        self.request(|reply| OrchestratorCommand::PairedDevices { reply })
            .await
    }

    /// Subscribes to orchestrator events; the latest event is delivered first
    pub fn subscribe(&self) -> EventSubscription<BluetoothEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ServiceState {
        self.state.borrow().clone()
    }
}

struct OrchestratorWorker {
    adapter: Arc<dyn BluetoothAdapter>,
    permissions: Arc<dyn PermissionChecker>,
    config: BluetoothConfig,
    scanner: DeviceScanner,
    notifier: Arc<PairingNotifier>,
    store: PairedDeviceStore,
    factory: ConnectorFactory,
    connectors: HashMap<String, DeviceConnector>,
    /// Bond state per address for the current discovery session
    bond_cache: HashMap<String, bool>,
    /// Cancels the forwarding tasks started by the current discovery session
    subscriptions: Option<CancellationToken>,
    events: EventBus<BluetoothEvent>,
    state: watch::Sender<ServiceState>,
    discovery_enabled: Arc<AtomicBool>,
    input_tx: mpsc::UnboundedSender<WorkerInput>,
}

impl OrchestratorWorker {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<OrchestratorCommand>,
        mut inputs: mpsc::UnboundedReceiver<WorkerInput>,
    ) {
        info!("BLE orchestrator started.");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(input) = inputs.recv() => self.handle_input(input).await,
            }
        }
        self.shutdown().await;
        info!("BLE orchestrator stopped.");
    }

    async fn handle_command(&mut self, command: OrchestratorCommand) {
        match command {
            OrchestratorCommand::StartDiscovering { services, reply } => {
                self.start_discovering(services).await;
                let _ = reply.send(());
            }
            OrchestratorCommand::Pair { device, reply } => {
                self.pair(device).await;
                let _ = reply.send(());
            }
            OrchestratorCommand::Stop { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            OrchestratorCommand::ActiveConnections { reply } => {
                let mut addresses: Vec<String> = self.connectors.keys().cloned().collect();
                addresses.sort();
                let _ = reply.send(addresses);
            }
            OrchestratorCommand::PairedDevices { reply } => {
                let _ = reply.send(self.store.snapshot());
            }
        }
    }

    async fn handle_input(&mut self, input: WorkerInput) {
        match input {
            WorkerInput::Scan(ScanEvent::DeviceFound(device)) => self.on_device_found(device).await,
            WorkerInput::Scan(ScanEvent::Failure(failure)) => {
                warn!("Scanning failed: {}", failure);
                self.events.emit(BluetoothEvent::ScanningFailed(failure));
            }
            WorkerInput::Pairing(PairingEvent::DevicePaired(device)) => {
                self.bond_cache.insert(device.address.clone(), true);
                self.events.emit(BluetoothEvent::DevicePaired(device));
            }
            WorkerInput::Pairing(PairingEvent::DeviceUnpaired(device)) => {
                self.bond_cache.insert(device.address.clone(), false);
                self.events.emit(BluetoothEvent::DeviceUnpaired(device));
            }
            WorkerInput::PairedDevices(devices) => {
                if matches!(*self.state.borrow(), ServiceState::Scanning(_)) {
                    self.set_state(ServiceState::Scanning(devices));
                }
            }
            WorkerInput::Connector(event) => self.on_connector_event(event).await,
        }
    }

    fn set_state(&self, state: ServiceState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Service state: {:?}", state);
            *current = state;
            true
        });
    }

    async fn start_discovering(&mut self, services: Vec<Uuid>) {
        if !self.adapter.is_enabled().await {
            info!("Bluetooth is disabled.");
            self.scanner.stop_scanning().await;
            self.set_state(ServiceState::BluetoothDisabled);
            return;
        }

        let missing = self.permissions.missing(&self.config.required_permissions);
        if !missing.is_empty() {
            info!("Missing Bluetooth permissions: {:?}", missing);
            self.set_state(ServiceState::MissingPermissions(missing));
            return;
        }

        if self.subscriptions.is_none() {
            self.subscriptions = Some(self.subscribe_to_components().await);
        }

        let services = if services.is_empty() {
            self.config.services.clone()
        } else {
            services
        };
        self.scanner.start_scanning(&services).await;
        self.set_state(ServiceState::Scanning(self.store.snapshot()));
    }

    /// Starts the pairing, paired-device and scanner forwarders
    async fn subscribe_to_components(&self) -> CancellationToken {
        let token = CancellationToken::new();

        // The store subscribes to the notifier itself; observe it before the
        // notifier starts so no bond transition is missed.
        let paired_devices = self.store.observe_paired_devices().await;
        tokio::spawn(forward_paired_devices(
            paired_devices,
            self.input_tx.clone(),
            token.clone(),
        ));

        tokio::spawn(forward_events(
            self.notifier.subscribe(),
            self.input_tx.clone(),
            token.clone(),
            WorkerInput::Pairing,
        ));
        self.notifier.start().await;

        tokio::spawn(forward_events(
            self.scanner.subscribe(),
            self.input_tx.clone(),
            token.clone(),
            WorkerInput::Scan,
        ));

        debug!("Component subscriptions started.");
        token
    }

    async fn on_device_found(&mut self, device: BluetoothDevice) {
        if !self.discovery_enabled.load(Ordering::SeqCst) {
            debug!("Discovery stopped; ignoring {}.", device.address);
            return;
        }
        if self.connectors.contains_key(&device.address) {
            return;
        }
        if self.is_paired(&device).await {
            info!("Known device {} found, connecting.", device.address);
            self.pair(device).await;
        } else {
            self.events.emit(BluetoothEvent::DeviceDiscovered(device));
        }
    }

    /// Bond lookup, asking the OS at most once per address and session
    async fn is_paired(&mut self, device: &BluetoothDevice) -> bool {
        if let Some(paired) = self.bond_cache.get(&device.address) {
            return *paired;
        }
        match self.store.bond_state(device).await {
            Some(paired) => {
                self.bond_cache.insert(device.address.clone(), paired);
                paired
            }
            None => false,
        }
    }

    async fn pair(&mut self, device: BluetoothDevice) {
        if self.connectors.contains_key(&device.address) {
            debug!("{} already has a connector.", device.address);
            return;
        }

        let mut connector = self.factory.create(device.clone());
        // Subscribe before connecting so an immediate failure is not lost
        tokio::spawn(forward_events(
            connector.subscribe(),
            self.input_tx.clone(),
            CancellationToken::new(),
            WorkerInput::Connector,
        ));
        connector.connect().await;
        self.connectors.insert(device.address.clone(), connector);
    }

    async fn on_connector_event(&mut self, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Connected(device) => {
                if !self.connectors.contains_key(&device.address) {
                    return;
                }
                self.store.update_device_connection(&device, true).await;
                self.events.emit(BluetoothEvent::Connected(device));
            }
            ConnectorEvent::Disconnected(device) => {
                if self.connectors.remove(&device.address).is_none() {
                    return;
                }
                self.store.update_device_connection(&device, false).await;
                self.events.emit(BluetoothEvent::Disconnected(device));
            }
            ConnectorEvent::MeasurementReceived {
                device,
                measurement,
            } => {
                self.events.emit(BluetoothEvent::MeasurementReceived {
                    device,
                    measurement,
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        self.discovery_enabled.store(false, Ordering::SeqCst);
        self.scanner.stop_scanning().await;
        if let Some(token) = self.subscriptions.take() {
            token.cancel();
        }
        // Connectors leave the map when their Disconnected event comes back
        for connector in self.connectors.values() {
            connector.disconnect();
        }
        self.bond_cache.clear();
        self.notifier.stop().await;
        self.store.stop_observing().await;
        self.store.on_stopped().await;
        self.set_state(ServiceState::Idle);
    }
}

async fn forward_events<E, F>(
    mut events: EventSubscription<E>,
    input_tx: mpsc::UnboundedSender<WorkerInput>,
    cancel_token: CancellationToken,
    wrap: F,
) where
    E: Clone + Send + 'static,
    F: Fn(E) -> WorkerInput + Send + 'static,
{
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if input_tx.send(wrap(event)).is_err() {
                    break;
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}

async fn forward_paired_devices(
    mut devices: watch::Receiver<Vec<PairedDevice>>,
    input_tx: mpsc::UnboundedSender<WorkerInput>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            changed = devices.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = devices.borrow_and_update().clone();
                if input_tx.send(WorkerInput::PairedDevices(snapshot)).is_err() {
                    error!("Orchestrator is gone; dropping paired device update.");
                    break;
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}
