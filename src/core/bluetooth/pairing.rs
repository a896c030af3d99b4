//! OS bond-state translation
//! Listens for bonding transitions and republishes them as pairing events.

use futures_util::StreamExt;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{BluetoothAdapter, BondEventStream};
use crate::core::bluetooth::events::{EventBus, EventSubscription};
use crate::core::bluetooth::types::{BondState, BondStateChange, PairingEvent};

struct Listener {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Republishes OS bond broadcasts as `DevicePaired` / `DeviceUnpaired`.
/// Holds no state besides the OS subscription itself.
pub struct PairingNotifier {
    adapter: Arc<dyn BluetoothAdapter>,
    events: EventBus<PairingEvent>,
    listener: Mutex<Option<Listener>>,
}

impl PairingNotifier {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>) -> Self {
        Self {
            adapter,
            events: EventBus::new(),
            listener: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> EventSubscription<PairingEvent> {
        self.events.subscribe()
    }

    pub async fn is_listening(&self) -> bool {
        self.listener.lock().await.is_some()
    }

    /// Acquires the OS bond subscription. A no-op while already listening.
    pub async fn start(&self) {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return;
        }
        let bond_events = match self.adapter.bond_events().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to subscribe to bond state changes: {}", e);
                return;
            }
        };

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(Self::listen(
            bond_events,
            self.events.clone(),
            cancel_token.clone(),
        ));
        *listener = Some(Listener {
            cancel_token,
            handle,
        });
        info!("Listening for bond state changes.");
    }

    async fn listen(
        mut bond_events: BondEventStream,
        events: EventBus<PairingEvent>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                change = bond_events.next() => {
                    match change {
                        Some(change) => {
                            if let Some(event) = Self::translate(change) {
                                events.emit(event);
                            }
                        }
                        None => break,
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    fn translate(change: BondStateChange) -> Option<PairingEvent> {
        match change.state {
            BondState::Bonded => {
                info!("Device {} paired.", change.device.address);
                Some(PairingEvent::DevicePaired(change.device))
            }
            BondState::None => {
                info!("Device {} unpaired.", change.device.address);
                Some(PairingEvent::DeviceUnpaired(change.device))
            }
            BondState::Bonding => {
                debug!("Device {} is bonding.", change.device.address);
                None
            }
        }
    }

    /// Releases the OS bond subscription. A no-op when not listening.
    pub async fn stop(&self) {
        let listener = self.listener.lock().await.take();
        if let Some(listener) = listener {
            listener.cancel_token.cancel();
            if let Err(e) = listener.handle.await {
                error!("Bond listener ended with a join error: {:?}", e);
            }
            info!("Stopped listening for bond state changes.");
        }
    }
}
