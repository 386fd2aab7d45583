//! `pvaultd run`: unlock vaults, serve pairing + sync, schedule rounds.

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use pvault_core::config::PvaultConfig;
use pvault_model::SharedModel;
use pvault_sync::{
    Locator, PairingResponder, Registration, ServerContext, StaticLocator, SyncEvent,
    SyncScheduler, SyncServer, TlsDialer,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::console::{self, ConsoleApprover};
use crate::metrics::{self, HealthState, SyncMetrics};

const EVENT_CAPACITY: usize = 256;

pub async fn run(config: PvaultConfig) -> Result<()> {
    let mut model = crate::open_model(&config)?;

    let vaults = model.get_vaults();
    if vaults.is_empty() {
        warn!("no vaults in store; create one with `pvaultd create-vault` or join with `pvaultd pair`");
    }
    for info in &vaults {
        let password = console::password(&format!("Password for vault {}: ", info.name)).await?;
        match model.unlock_vault(&info.id, &password) {
            Ok(()) => info!(vault = %info.id, name = %info.name, "vault unlocked"),
            Err(e) => warn!(vault = %info.id, name = %info.name, "vault stays locked: {e}"),
        }
    }
    let model: SharedModel = model.into_shared();

    let locator = Arc::new(StaticLocator::from_peers(&config.peers));
    register_nodes(&model, locator.as_ref(), &config).await;

    let (events, _) = broadcast::channel::<SyncEvent>(EVENT_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let sync_metrics = SyncMetrics::default();
    let mut registry = Registry::default();
    sync_metrics.register(&mut registry);
    tokio::spawn(sync_metrics.clone().record(events.subscribe()));

    if let Some(addr) = config.daemon.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            model: model.clone(),
            metrics: sync_metrics,
        };
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, state).await {
                error!("metrics server: {e:#}");
            }
        });
    }

    let pairing = Arc::new(PairingResponder::new(
        model.clone(),
        Box::new(ConsoleApprover),
        Duration::from_secs(config.sync.pairing_timeout_secs),
        Duration::from_secs(config.sync.approval_timeout_secs),
    ));
    let server = SyncServer::new(ServerContext {
        model: model.clone(),
        pairing,
        max_body: config.sync.max_body_bytes,
        events: events.clone(),
    })?;
    let listener = TcpListener::bind(&config.daemon.listen)
        .await
        .with_context(|| format!("binding {}", config.daemon.listen))?;
    let server_task = tokio::spawn(server.run(listener, shutdown_tx.subscribe()));

    let dialer = TlsDialer::new(
        Duration::from_secs(config.sync.connect_timeout_secs),
        config.sync.max_body_bytes,
    )?;
    let scheduler = SyncScheduler::new(
        model.clone(),
        locator,
        Arc::new(dialer),
        Duration::from_secs(config.sync.interval_secs),
        events,
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
    }
    let _ = shutdown_tx.send(());

    match server_task.await {
        Ok(Err(e)) => error!("sync server: {e}"),
        Err(e) => error!("sync server task: {e}"),
        Ok(Ok(())) => {}
    }
    match scheduler_task.await {
        Ok(Err(e)) => error!("scheduler: {e}"),
        Err(e) => error!("scheduler task: {e}"),
        Ok(Ok(())) => {}
    }

    model.lock().await.flush()?;
    info!("pvaultd stopped");
    Ok(())
}

/// Announce this node for every vault it holds.
async fn register_nodes(model: &SharedModel, locator: &dyn Locator, config: &PvaultConfig) {
    let vaults = model.lock().await.get_vaults();
    for info in vaults {
        let registration = Registration {
            node: info.node,
            name: config.daemon.name.clone(),
            vault: info.id,
            vault_name: info.name.clone(),
            address: config.daemon.listen.clone(),
            properties: BTreeMap::new(),
        };
        if let Err(e) = locator.register(registration) {
            warn!(vault = %info.id, "locator registration failed: {e}");
        }
    }
}
