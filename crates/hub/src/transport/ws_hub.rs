// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/ws/hub` — the index socket a dashboard viewer opens to watch its whole
//! session set rather than one session at a time (spec §4.1 Connection
//! Gateway table, "index" row: "no scope in handshake"). There's no
//! per-session state here, so unlike `/ws/sessions/{id}` there's nothing to
//! attach to in a registry actor; the handler polls
//! `list_sessions_for_user` on an interval and only pushes a frame when the
//! listing actually changed.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::codec::HubToViewer;
use crate::state::{HubState, PeerClass};
use crate::transport::auth;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct HubWsQuery {
    pub token: Option<String>,
}

/// `GET /ws/hub`
pub async fn handler(
    State(state): State<Arc<HubState>>,
    Query(query): Query<HubWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let principal = match auth::resolve_principal(&state.config, &headers, query.token.as_deref()) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let Some(guard) = state.connection_caps.try_acquire(
        &principal.user_id,
        PeerClass::Hub,
        state.config.max_connections_per_principal,
    ) else {
        return (axum::http::StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    };

    ws.on_upgrade(move |socket| {
        let _guard = guard;
        run(socket, state, principal.user_id, principal.is_admin)
    })
    .into_response()
}

async fn run(socket: WebSocket, state: Arc<HubState>, user_id: crate::ids::UserId, is_admin: bool) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last_sent: Option<String> = None;

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            _ = ticker.tick() => {
                let sessions = state.session_registry.list_sessions_for_user(user_id.clone(), is_admin).await;
                let frame = HubToViewer::SessionsList { sessions };
                let Ok(json) = serde_json::to_string(&frame) else { continue };
                if last_sent.as_deref() == Some(json.as_str()) {
                    continue;
                }
                if ws_tx.send(Message::Text(json.clone().into())).await.is_err() {
                    break;
                }
                last_sent = Some(json);
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // No viewer->hub commands are defined; anything incoming
                    // is ignored rather than closing the socket.
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "ws_hub_tests.rs"]
mod tests;
