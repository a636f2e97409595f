// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/ws/terminal/{terminalId}` (spec §4.1, §4.5 Terminal Broker). As with
//! `/ws/sessions/{sessionId}`, one path carries two roles: the viewer that
//! types into the PTY and watches its output, and the runner's producer
//! side that actually owns the PTY. `?role=producer` plus the owning
//! runner's credentials selects the latter; see `transport::ws_session` for
//! the identical pattern and its DESIGN.md rationale.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::codec::TerminalFrame;
use crate::ids::{RunnerId, TerminalId};
use crate::session::outbox::Outbox;
use crate::state::{HubState, PeerClass};
use crate::transport::{auth, send_with_deadline};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalWsQuery {
    pub token: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub runner_id: Option<String>,
    pub runner_secret: Option<String>,
}

/// `GET /ws/terminal/{terminalId}`
pub async fn handler(
    State(state): State<Arc<HubState>>,
    Path(terminal_id): Path<String>,
    Query(query): Query<TerminalWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let terminal_id = TerminalId::from(terminal_id);

    if query.role.as_deref() == Some("producer") {
        let (Some(runner_id), Some(secret)) = (query.runner_id.clone(), query.runner_secret.clone()) else {
            return (axum::http::StatusCode::UNAUTHORIZED, "producer role requires runnerId/runnerSecret")
                .into_response();
        };
        let runner_id = RunnerId::from(runner_id);
        if !state.runner_registry.verify_secret(runner_id, secret).await {
            return (axum::http::StatusCode::FORBIDDEN, "runner secret mismatch").into_response();
        }
        return ws.on_upgrade(move |socket| run_producer(socket, state, terminal_id)).into_response();
    }

    let principal = match auth::resolve_principal(&state.config, &headers, query.token.as_deref()) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let Some(guard) = state.connection_caps.try_acquire(
        &principal.user_id,
        PeerClass::Terminal,
        state.config.max_connections_per_principal,
    ) else {
        return (axum::http::StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    };

    ws.on_upgrade(move |socket| {
        let _guard = guard;
        run_viewer(socket, state, terminal_id, principal.user_id, principal.is_admin)
    })
    .into_response()
}

async fn run_viewer(
    socket: WebSocket,
    state: Arc<HubState>,
    terminal_id: TerminalId,
    user_id: crate::ids::UserId,
    is_admin: bool,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let outbox = Outbox::<TerminalFrame>::new(state.config.send_queue_capacity);
    let flush_deadline = state.config.viewer_send_flush_deadline();
    if let Err(e) =
        state.terminal_broker.attach_viewer(terminal_id.clone(), user_id, is_admin, outbox.clone()).await
    {
        let _ = send_with_deadline(&mut ws_tx, Message::Text(e.to_frame("terminal_error").to_string().into()), flush_deadline).await;
        return;
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            batch = outbox.recv_batch() => {
                match batch {
                    Some(frames) => {
                        for frame in frames {
                            let Ok(json) = serde_json::to_string(&frame) else { continue };
                            if send_with_deadline(&mut ws_tx, Message::Text(json.into()), flush_deadline).await.is_err() {
                                return;
                            }
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<TerminalFrame>(&text) {
                            match &frame {
                                TerminalFrame::TerminalInput { .. }
                                | TerminalFrame::TerminalResize { .. } => {
                                    state.terminal_broker.from_viewer(terminal_id.clone(), frame).await;
                                }
                                TerminalFrame::KillTerminal => {
                                    state.terminal_broker.close_terminal(terminal_id.clone()).await;
                                }
                                _ => tracing::debug!("ignored unexpected terminal viewer frame"),
                            }
                        } else {
                            tracing::debug!("dropped unparseable terminal viewer frame");
                            let body = crate::error::HubError::invalid_frame("unrecognized frame type")
                                .to_frame("terminal_error");
                            if send_with_deadline(&mut ws_tx, Message::Text(body.to_string().into()), flush_deadline).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

/// The runner's PTY-forwarding socket: the producer side of this terminal
/// (spec §3 "Terminal ... one producer side, the runner's PTY").
async fn run_producer(socket: WebSocket, state: Arc<HubState>, terminal_id: TerminalId) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let outbox = Outbox::<TerminalFrame>::new(state.config.send_queue_capacity);
    let flush_deadline = state.config.viewer_send_flush_deadline();
    if let Err(e) = state.terminal_broker.bind_producer(terminal_id.clone(), outbox.clone()).await {
        let _ = send_with_deadline(&mut ws_tx, Message::Text(e.to_frame("terminal_error").to_string().into()), flush_deadline).await;
        let _ = send_with_deadline(&mut ws_tx, Message::Close(None), flush_deadline).await;
        return;
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            batch = outbox.recv_batch() => {
                match batch {
                    Some(frames) => {
                        for frame in frames {
                            let Ok(json) = serde_json::to_string(&frame) else { continue };
                            if send_with_deadline(&mut ws_tx, Message::Text(json.into()), flush_deadline).await.is_err() {
                                return;
                            }
                        }
                    }
                    None => break,
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(frame) = serde_json::from_str::<TerminalFrame>(&text) {
                            state.terminal_broker.from_producer(terminal_id.clone(), frame).await;
                        } else {
                            tracing::debug!("dropped unparseable terminal producer frame");
                            let body = crate::error::HubError::invalid_frame("unrecognized frame type")
                                .to_frame("terminal_error");
                            if send_with_deadline(&mut ws_tx, Message::Text(body.to_string().into()), flush_deadline).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "ws_terminal_tests.rs"]
mod tests;
