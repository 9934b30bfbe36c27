//! ferryd — runs a local Ferry fleet and its Database peer.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};

use ferry_core::config::FerryConfig;
use ferry_core::{Envelope, ServerId};
use ferry_services::{DatabasePeer, PeerSender, Server, SnapshotStore};

mod demo;
mod dispatch;

use dispatch::FleetRouter;

const STEP_INTERVAL: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = FerryConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FerryConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FerryConfig::default()
    });

    let first = config.identity.server_id();
    let ids: Vec<ServerId> = (0..config.fleet.servers)
        .map(|i| ServerId::new(first.raw().saturating_add(i)))
        .filter(|id| id.is_peer())
        .collect();
    tracing::info!(servers = ids.len(), first = %first, "ferryd starting");

    let router = FleetRouter::new();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // ── Servers ──────────────────────────────────────────────────────────────

    let mut servers = Vec::with_capacity(ids.len());
    let mut inboxes = Vec::with_capacity(ids.len());
    for &id in &ids {
        inboxes.push(router.register(id));
        servers.push(Server::new(
            id,
            demo::kinds(),
            PeerSender::new(id, outbound_tx.clone()),
            &config.executor,
        ));
    }
    let ships = demo::populate(&mut servers, config.fleet.demo_units);
    tracing::info!(ships = ships.len(), units = config.fleet.demo_units, "demo workload queued");

    // ── Database peer ────────────────────────────────────────────────────────

    let database_task = if config.store.enabled {
        let store = SnapshotStore::new(&config.store.path)
            .with_context(|| format!("failed to open store at {}", config.store.path.display()))?;
        tracing::info!(path = %config.store.path.display(), roots = store.count(), "snapshot store ready");

        for (server, ship) in servers.iter_mut().zip(&ships) {
            if let Err(e) = server.persist(*ship) {
                tracing::warn!(error = %e, "initial persist failed");
            }
        }

        let database = DatabasePeer::new(store, PeerSender::new(ServerId::DATABASE, outbound_tx.clone()));
        let mut inbox = router.register(ServerId::DATABASE);
        let mut shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    envelope = inbox.recv() => match envelope {
                        Some(envelope) => {
                            if let Err(e) = database.handle(envelope) {
                                tracing::error!(error = %e, "database peer failed to handle message");
                            }
                        }
                        None => break,
                    },
                }
            }
            tracing::info!(roots = database.store().count(), "database peer stopped");
        }))
    } else {
        None
    };
    drop(outbound_tx);

    // ── Shutdown ─────────────────────────────────────────────────────────────

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Tasks ────────────────────────────────────────────────────────────────

    let router_task = tokio::spawn(router.clone().run(outbound_rx, shutdown_tx.subscribe()));

    let mut server_tasks = Vec::with_capacity(servers.len());
    for (mut server, mut inbox) in servers.into_iter().zip(inboxes) {
        let mut shutdown = shutdown_tx.subscribe();
        server_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(STEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = server.step(&mut inbox) {
                            tracing::error!(server = %server.local(), error = %e, "server stopped on hard failure");
                            break;
                        }
                    }
                }
            }
            server
        }));
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    for task in server_tasks {
        match task.await {
            Ok(server) => {
                let status = server.status();
                match serde_json::to_string(&status) {
                    Ok(json) => tracing::info!(server = %status.server, status = %json, "final status"),
                    Err(e) => tracing::warn!(error = %e, "failed to encode status"),
                }
            }
            Err(e) => tracing::error!(error = %e, "server task panicked"),
        }
    }
    let _ = shutdown_tx.send(());
    if let Err(e) = router_task.await {
        tracing::error!(error = %e, "router task panicked");
    }
    if let Some(task) = database_task {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "database task panicked");
        }
    }

    tracing::info!("shut down");
    Ok(())
}
