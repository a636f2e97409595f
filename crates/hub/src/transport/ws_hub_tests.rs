// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::codec::{HubToViewer, RunnerFrame};
use crate::config::HubConfig;
use crate::ids::{RunnerId, UserId};
use crate::state::ConnectionCaps;
use crate::transport::auth::sign_session_cookie;
use crate::transport::proxy::ProxyTable;

const COOKIE_SECRET: &str = "test-cookie-secret";

async fn spawn_server() -> (String, Arc<HubState>) {
    let config = Arc::new(HubConfig::parse_from([
        "pizzapi-hub",
        "--session-cookie-secret",
        COOKIE_SECRET,
    ]));
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
async fn unauthenticated_connection_is_rejected() {
    let (base, _state) = spawn_server().await;
    let result = tokio_tungstenite::connect_async(format!("{base}/ws/hub")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn authenticated_connection_receives_the_caller_sessions_list() {
    let (base, state) = spawn_server().await;
    let outbox = crate::session::outbox::Outbox::new(8);
    state
        .runner_registry
        .register(
            RunnerId::from("r1".to_owned()),
            "secret".to_owned(),
            UserId::from("owner".to_owned()),
            "laptop".to_owned(),
            Vec::new(),
            Vec::new(),
            false,
            outbox.clone(),
        )
        .await
        .unwrap();

    let sessions = state.session_registry.clone();
    let spawn_task = tokio::spawn(async move {
        sessions.create_session(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, None, None).await
    });
    let dispatched = outbox.recv_batch().await.unwrap();
    let RunnerFrame::NewSession { session_id, .. } = &dispatched[0] else { panic!("expected new_session") };
    state.session_registry.handle_runner_frame(RunnerFrame::SessionReady { session_id: session_id.clone() }).await;
    spawn_task.await.unwrap().unwrap();

    let cookie = sign_session_cookie(COOKIE_SECRET, "owner", false, 3600);
    let (mut ws, _resp) = tokio_tungstenite::connect_async(format!("{base}/ws/hub?token={cookie}")).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = reply else { panic!("expected text frame") };
    let frame: HubToViewer = serde_json::from_str(&text).unwrap();
    let HubToViewer::SessionsList { sessions } = frame else { panic!("expected sessions_list frame") };
    assert_eq!(sessions.len(), 1);
}

#[tokio::test]
async fn stranger_sees_no_sessions_for_another_owner() {
    let (base, state) = spawn_server().await;
    let outbox = crate::session::outbox::Outbox::new(8);
    state
        .runner_registry
        .register(
            RunnerId::from("r1".to_owned()),
            "secret".to_owned(),
            UserId::from("owner".to_owned()),
            "laptop".to_owned(),
            Vec::new(),
            Vec::new(),
            false,
            outbox.clone(),
        )
        .await
        .unwrap();
    let sessions = state.session_registry.clone();
    let spawn_task = tokio::spawn(async move {
        sessions.create_session(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, None, None).await
    });
    let dispatched = outbox.recv_batch().await.unwrap();
    let RunnerFrame::NewSession { session_id, .. } = &dispatched[0] else { panic!("expected new_session") };
    state.session_registry.handle_runner_frame(RunnerFrame::SessionReady { session_id: session_id.clone() }).await;
    spawn_task.await.unwrap().unwrap();

    let cookie = sign_session_cookie(COOKIE_SECRET, "stranger", false, 3600);
    let (mut ws, _resp) = tokio_tungstenite::connect_async(format!("{base}/ws/hub?token={cookie}")).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let Message::Text(text) = reply else { panic!("expected text frame") };
    let frame: HubToViewer = serde_json::from_str(&text).unwrap();
    let HubToViewer::SessionsList { sessions } = frame else { panic!("expected sessions_list frame") };
    assert!(sessions.is_empty());
}
