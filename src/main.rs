use anyhow::{Context, Result};
use ble_health_bridge::{AppConfig, AppState, logging};
use log::{error, info};
use std::path::PathBuf;

fn config_path() -> Result<PathBuf> {
    match std::env::args_os().nth(1) {
        Some(path) => Ok(PathBuf::from(path)),
        None => Ok(AppConfig::default_path()?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let path = config_path()?;
    let config = AppConfig::load(&path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    logging::init(&config.logging)?;

    let state = AppState::with_system_adapter(config).await?;
    let orchestrator = state.orchestrator.clone();

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
    });

    state.start().await?;
    info!("Discovering devices; press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    orchestrator.stop().await?;

    drop(orchestrator);
    drop(state);
    printer.abort();
    Ok(())
}
