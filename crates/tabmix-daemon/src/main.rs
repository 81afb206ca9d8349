// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! TabMix Daemon - background coordinator for per-tab volume control.
//!
//! Page agents and front panels connect over a Unix socket and exchange
//! newline-delimited JSON envelopes with the coordinator.

use std::sync::Arc;
use tabmix_daemon::config::ConfigManager;
use tabmix_daemon::storage::{FileArea, StorageArea};
use tabmix_daemon::store::{StorageTiers, Store};
use tabmix_daemon::{actor, server, AgentRegistry, Coordinator, SystemClock};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tabmix_daemon=debug".parse()?),
        )
        .init();

    info!("TabMix Daemon starting...");

    let config_manager = ConfigManager::new()?;
    let config = match config_manager.load_daemon_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid daemon config, using defaults: {}", e);
            Default::default()
        }
    };

    let data_dir = config_manager.data_dir(&config);
    std::fs::create_dir_all(&data_dir)?;
    let quota = Some(config.durable_quota_bytes);
    let synced: Arc<dyn StorageArea> =
        Arc::new(FileArea::open("sync", &data_dir.join("synced.json"), quota));
    let local: Arc<dyn StorageArea> =
        Arc::new(FileArea::open("local", &data_dir.join("local.json"), quota));
    let session: Arc<dyn StorageArea> =
        Arc::new(FileArea::open("session", &data_dir.join("session.json"), None));
    info!("Storage directory: {}", data_dir.display());

    let store = Store::new(StorageTiers {
        synced: Some(synced),
        local: Some(local),
        session: Some(session),
    });
    let agents = Arc::new(AgentRegistry::new(config.agent_timeout()));
    let mut coordinator = Coordinator::new(store, agents.clone(), Arc::new(SystemClock))
        .with_options(config.coordinator_options());
    coordinator.init().await;

    let (handle, coordinator_task) = actor::spawn(coordinator, config.reconcile_interval());

    let socket_path = config_manager.socket_path(&config);
    let listener = server::bind(&socket_path)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server::run(
        listener,
        socket_path,
        handle.clone(),
        agents,
        shutdown_rx,
    ));

    info!("TabMix Daemon ready");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), server_task).await;

    if let Err(e) = handle.shutdown().await {
        error!("Coordinator shutdown failed: {}", e);
    }
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), coordinator_task).await;

    info!("TabMix Daemon stopped");
    Ok(())
}
