// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PizzaPi session relay hub: a process-wide message bus brokering
//! connections between coding-agent runners, viewers, and terminal clients.

pub mod codec;
pub mod config;
pub mod error;
pub mod ids;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod state;
pub mod time;
pub mod transport;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::state::{ConnectionCaps, HubState};
use crate::transport::build_router;
use crate::transport::proxy::ProxyTable;

/// Run the hub until shutdown. Boot order: rehydrate any sessions left on
/// disk from a prior run, spawn the Runner Registry, spawn the Session
/// Registry (handed the rehydrated sessions so it can re-adopt them into
/// `Idle` channels), wire the Runner Registry's back-reference to the
/// Session Registry, then spawn the Terminal Broker.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let addr = config.addr();
    let shutdown = CancellationToken::new();
    let config = Arc::new(config);

    let persistence_enabled = !config.data_dir.as_os_str().is_empty();
    let rehydrated = if persistence_enabled {
        crate::persistence::scan_and_rehydrate(&config.data_dir.join("sessions")).await
    } else {
        Vec::new()
    };
    if !rehydrated.is_empty() {
        tracing::info!(count = rehydrated.len(), "rehydrated sessions from disk");
    }

    let runner_registry = crate::registry::runner::spawn(config.clone(), shutdown.clone());

    let session_registry = crate::registry::session::spawn(
        config.clone(),
        runner_registry.clone(),
        persistence_enabled,
        config.data_dir.clone(),
        shutdown.clone(),
        rehydrated,
    );
    runner_registry.set_session_registry(session_registry.clone()).await;

    let terminal_broker =
        crate::registry::terminal::spawn(config.clone(), runner_registry.clone(), shutdown.clone());

    let state = Arc::new(HubState {
        config: config.clone(),
        shutdown: shutdown.clone(),
        session_registry,
        runner_registry,
        terminal_broker,
        connection_caps: Arc::new(ConnectionCaps::default()),
        proxy_table: ProxyTable::default(),
    });

    spawn_signal_handler(shutdown.clone());
    tokio::spawn(crate::transport::http::spawn_attachment_reaper(state.clone()));

    tracing::info!("pizzapi-hub listening on {addr}");
    let router = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

/// First SIGTERM/SIGINT triggers graceful shutdown (cancels `shutdown`,
/// letting actors flush and `axum::serve` drain in-flight connections); a
/// second forces immediate exit for an operator who doesn't want to wait.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async { if let Some(s) = sigterm.as_mut() { s.recv().await } else { std::future::pending().await } } => {
                tracing::info!("received SIGTERM");
            }
            _ = async { if let Some(s) = sigint.as_mut() { s.recv().await } else { std::future::pending().await } } => {
                tracing::info!("received SIGINT");
            }
        }
        shutdown.cancel();

        tokio::select! {
            _ = async { if let Some(s) = sigterm.as_mut() { s.recv().await } else { std::future::pending().await } } => {
                tracing::info!("received SIGTERM again, forcing exit");
                std::process::exit(1);
            }
            _ = async { if let Some(s) = sigint.as_mut() { s.recv().await } else { std::future::pending().await } } => {
                tracing::info!("received SIGINT again, forcing exit");
                std::process::exit(1);
            }
        }
    });
}
