// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::codec::RunnerFrame;
use crate::config::HubConfig;
use crate::state::ConnectionCaps;
use crate::transport::proxy::ProxyTable;

/// Boots the full router on a real loopback port (a WebSocket upgrade can't
/// be driven through an in-process `axum_test::TestServer`) and returns its
/// `ws://` base URL.
async fn spawn_server() -> (String, Arc<HubState>) {
    let config = Arc::new(HubConfig::parse_from(["pizzapi-hub", "--runner-token", "runner-tok"]));
    let shutdown = CancellationToken::new();
    let runner_registry = crate::registry::runner::spawn(config.clone(), shutdown.clone());
    let session_registry = crate::registry::session::spawn(
        config.clone(),
        runner_registry.clone(),
        false,
        PathBuf::new(),
        shutdown.clone(),
        Vec::new(),
    );
    runner_registry.set_session_registry(session_registry.clone()).await;
    let terminal_broker = crate::registry::terminal::spawn(config.clone(), runner_registry.clone(), shutdown.clone());

    let state = Arc::new(HubState {
        config,
        shutdown,
        session_registry,
        runner_registry,
        terminal_broker,
        connection_caps: Arc::new(ConnectionCaps::default()),
        proxy_table: ProxyTable::default(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = crate::transport::build_router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    (format!("ws://{addr}"), state)
}

#[tokio::test]
async fn unauthorized_runner_is_rejected_before_upgrade() {
    let (base, _state) = spawn_server().await;
    let result = tokio_tungstenite::connect_async(format!("{base}/ws/runner")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn register_runner_round_trips_runner_registered() {
    let (base, state) = spawn_server().await;
    let (mut ws, _resp) =
        tokio_tungstenite::connect_async(format!("{base}/ws/runner?token=runner-tok")).await.unwrap();

    let register = RunnerFrame::RegisterRunner {
        runner_id: "r1".to_owned(),
        runner_secret: "secret".to_owned(),
        name: "laptop".to_owned(),
        roots: Vec::new(),
        skills: Vec::new(),
        terminal_capable: false,
    };
    ws.send(Message::Text(serde_json::to_string(&register).unwrap().into())).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = reply else { panic!("expected text frame") };
    let frame: RunnerFrame = serde_json::from_str(&text).unwrap();
    assert!(matches!(frame, RunnerFrame::RunnerRegistered { runner_id } if runner_id == "r1"));

    let info = state.runner_registry.get(RunnerId::from("r1".to_owned())).await;
    assert!(info.is_some());
}

#[tokio::test]
async fn first_frame_must_be_register_runner() {
    let (base, _state) = spawn_server().await;
    let (mut ws, _resp) =
        tokio_tungstenite::connect_async(format!("{base}/ws/runner?token=runner-tok")).await.unwrap();

    ws.send(Message::Text(serde_json::to_string(&RunnerFrame::Ping).unwrap().into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert!(matches!(reply, Message::Text(_)));
}

#[tokio::test]
async fn ping_is_answered_with_pong_and_touches_runner() {
    let (base, _state) = spawn_server().await;
    let (mut ws, _resp) =
        tokio_tungstenite::connect_async(format!("{base}/ws/runner?token=runner-tok")).await.unwrap();

    let register = RunnerFrame::RegisterRunner {
        runner_id: "r1".to_owned(),
        runner_secret: "secret".to_owned(),
        name: "laptop".to_owned(),
        roots: Vec::new(),
        skills: Vec::new(),
        terminal_capable: false,
    };
    ws.send(Message::Text(serde_json::to_string(&register).unwrap().into())).await.unwrap();
    let _ = ws.next().await.unwrap().unwrap();

    ws.send(Message::Text(serde_json::to_string(&RunnerFrame::Ping).unwrap().into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = reply else { panic!("expected text frame") };
    let frame: RunnerFrame = serde_json::from_str(&text).unwrap();
    assert!(matches!(frame, RunnerFrame::Pong));
}
