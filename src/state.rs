//! Application state management
//! This module wires the Bluetooth subsystem to its collaborators.

use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::bluetooth::{BleOrchestrator, BluetoothAdapter, OrchestratorDeps, PermissionChecker};
use crate::core::measurement::StandardMeasurementMapper;
use crate::storage::{InMemoryStorage, JsonFileStorage, KeyValueStorage};

/// Top-level application state
pub struct AppState {
    pub config: AppConfig,
    /// The one orchestrator instance; clone the handle to share it
    pub orchestrator: BleOrchestrator,
}

impl AppState {
    /// Creates the orchestrator with storage chosen by the config.
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: AppConfig,
        adapter: Arc<dyn BluetoothAdapter>,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        let storage: Arc<dyn KeyValueStorage> = match config.storage.resolve_path() {
            Some(path) => {
                info!("Paired devices are stored in {:?}", path);
                Arc::new(JsonFileStorage::new(path))
            }
            None => {
                warn!("No data directory available; paired devices will not persist.");
                Arc::new(InMemoryStorage::new())
            }
        };
        Self::with_storage(config, adapter, permissions, storage)
    }

    pub fn with_storage(
        config: AppConfig,
        adapter: Arc<dyn BluetoothAdapter>,
        permissions: Arc<dyn PermissionChecker>,
        storage: Arc<dyn KeyValueStorage>,
    ) -> Self {
        info!("Initializing BLE orchestrator...");
        let orchestrator = BleOrchestrator::new(OrchestratorDeps {
            adapter,
            permissions,
            mapper: Arc::new(StandardMeasurementMapper::new()),
            storage,
            config: config.bluetooth.clone(),
        });
        Self {
            config,
            orchestrator,
        }
    }

    /// Wires the state to the system Bluetooth adapter
    #[cfg(feature = "bluest")]
    pub async fn with_system_adapter(config: AppConfig) -> Result<Self> {
        use crate::core::bluetooth::{BluestAdapter, GrantedPermissions};
        use std::time::Duration;

        let poll_interval = Duration::from_millis(config.bluetooth.bond_poll_interval_ms);
        let adapter = BluestAdapter::new(poll_interval).await?;
        Ok(Self::new(config, Arc::new(adapter), Arc::new(GrantedPermissions)))
    }

    /// Starts discovery for the configured services
    pub async fn start(&self) -> Result<()> {
        self.orchestrator
            .start_discovering(&self.config.bluetooth.services)
            .await?;
        Ok(())
    }
}
