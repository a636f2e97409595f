// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/ws/sessions/{sessionId}` (spec §4.1 Connection Gateway table, §2 data
//! flow). Two distinct roles share this path:
//!
//! - **viewer** (the default): a session-cookie or API-key authenticated
//!   observer. Its first frame declares `lastSeq` (spec §4.3 "Replay
//!   path"); the hub answers with `connected` plus replay, then live
//!   fan-out.
//! - **producer**: the worker process the runner spawned for this session
//!   (spec §2 "the worker spawns... and starts emitting events"). It
//!   authenticates with the owning runner's `runnerId`/`runnerSecret`
//!   rather than a viewer principal — the worker has no end-user session of
//!   its own — and the hub verifies that secret against the Runner
//!   Registry entry the Session was dispatched to (spec §4.2
//!   `AttachProducer`: "its `runnerId` must match the one the Session was
//!   spawned on").
//!
//! `?role=producer` selects the second path; its absence (or any other
//! value) selects the first. This query-string role switch is not named
//! explicitly in spec.md — see DESIGN.md for the resolution.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::codec::{HubToViewer, ProducerEvent, ViewerCommand};
use crate::ids::{RunnerId, SessionId};
use crate::session::channel::{SessionChannelHandle, ViewerId, ViewerOutbound};
use crate::session::outbox::Outbox;
use crate::state::{HubState, PeerClass};
use crate::transport::{auth, send_with_deadline};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWsQuery {
    pub token: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub runner_id: Option<String>,
    pub runner_secret: Option<String>,
}

/// `GET /ws/sessions/{sessionId}`
pub async fn handler(
    State(state): State<Arc<HubState>>,
    Path(session_id): Path<String>,
    Query(query): Query<SessionWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session_id = SessionId::from(session_id);

    if query.role.as_deref() == Some("producer") {
        let (Some(runner_id), Some(secret)) = (query.runner_id.clone(), query.runner_secret.clone()) else {
            return (axum::http::StatusCode::UNAUTHORIZED, "producer role requires runnerId/runnerSecret")
                .into_response();
        };
        let runner_id = RunnerId::from(runner_id);
        if !state.runner_registry.verify_secret(runner_id.clone(), secret).await {
            return (axum::http::StatusCode::FORBIDDEN, "runner secret mismatch").into_response();
        }
        return ws.on_upgrade(move |socket| run_producer(socket, state, session_id, runner_id)).into_response();
    }

    let principal = match auth::resolve_principal(&state.config, &headers, query.token.as_deref()) {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let Some(guard) = state.connection_caps.try_acquire(
        &principal.user_id,
        PeerClass::Viewer,
        state.config.max_connections_per_principal,
    ) else {
        return (axum::http::StatusCode::TOO_MANY_REQUESTS, "too many connections").into_response();
    };

    ws.on_upgrade(move |socket| {
        let _guard = guard;
        run_viewer(socket, state, session_id, principal.user_id, principal.is_admin)
    })
    .into_response()
}

async fn run_viewer(
    socket: WebSocket,
    state: Arc<HubState>,
    session_id: SessionId,
    user_id: crate::ids::UserId,
    is_admin: bool,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Mandatory first frame declares `lastSeq` (0 on a fresh attach) via
    // `resync` (spec §4.3 unifies both onto one frame kind; see codec.rs).
    let last_seq = match ws_rx.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ViewerCommand>(&text) {
            Ok(ViewerCommand::Resync { last_seq }) => last_seq,
            _ => 0,
        },
        _ => return,
    };

    let outbox = Outbox::<ViewerOutbound>::new(state.config.send_queue_capacity);
    let attached = state
        .session_registry
        .attach_viewer(session_id.clone(), user_id, is_admin, last_seq, outbox.clone())
        .await;

    let (channel, viewer_id): (SessionChannelHandle, ViewerId) = match attached {
        Ok(pair) => pair,
        Err(e) => {
            let deadline = state.config.viewer_send_flush_deadline();
            let _ = send_with_deadline(&mut ws_tx, Message::Text(e.to_frame("cli_error").to_string().into()), deadline).await;
            return;
        }
    };
    let flush_deadline = state.config.viewer_send_flush_deadline();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            batch = outbox.recv_batch() => {
                match batch {
                    Some(items) => {
                        for item in items {
                            if send_outbound(&mut ws_tx, item, flush_deadline).await.is_err() {
                                channel.detach_viewer(viewer_id).await;
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
                        if let Some(body) = handle_viewer_frame(&channel, viewer_id, &text).await {
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

    channel.detach_viewer(viewer_id).await;
}

async fn send_outbound(
    ws_tx: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    item: ViewerOutbound,
    deadline: std::time::Duration,
) -> Result<(), ()> {
    let json = match item {
        ViewerOutbound::Connected { is_active, session_name, last_seq } => {
            serde_json::to_string(&HubToViewer::Connected { is_active, session_name, last_seq })
        }
        ViewerOutbound::Events(events) => serde_json::to_string(&events),
        ViewerOutbound::Error(value) => serde_json::to_string(&value),
    };
    match json {
        Ok(text) => send_with_deadline(ws_tx, Message::Text(text.into()), deadline).await,
        Err(_) => Ok(()),
    }
}

/// Returns a `cli_error` frame body to send back when the frame's `type` is
/// unrecognized (spec §4.6 "must reject unknown type values with a
/// cli_error response frame"); returns `None` otherwise, including on a
/// successfully handled frame.
async fn handle_viewer_frame(
    channel: &SessionChannelHandle,
    viewer_id: ViewerId,
    text: &str,
) -> Option<serde_json::Value> {
    let command: ViewerCommand = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(_) => {
            tracing::debug!("dropped unparseable viewer frame");
            return Some(crate::error::HubError::invalid_frame("unrecognized frame type").to_frame("cli_error"));
        }
    };

    match command {
        ViewerCommand::Resync { last_seq } => {
            let _ = channel.resync(viewer_id, last_seq).await;
        }
        ViewerCommand::Input { .. } | ViewerCommand::Exec { .. } => {
            let _ = channel.forward_to_producer(command).await;
        }
    }
    None
}

/// The worker's own producer-role connection. Ingests every `ProducerEvent`
/// frame it sends, assigning `seq` via the Session Channel (spec §4.3
/// "Ingest path"); forwards `ViewerCommand`s (`input`/`exec`) pushed by the
/// channel back down to the worker.
async fn run_producer(socket: WebSocket, state: Arc<HubState>, session_id: SessionId, runner_id: RunnerId) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let outbox = Outbox::<ViewerCommand>::new(state.config.send_queue_capacity);
    let bound = state.session_registry.attach_producer(session_id.clone(), runner_id, outbox.clone()).await;
    let (channel, conn_id) = match bound {
        Ok(pair) => pair,
        Err(e) => {
            let deadline = state.config.viewer_send_flush_deadline();
            let _ = send_with_deadline(&mut ws_tx, Message::Text(e.to_frame("session_error").to_string().into()), deadline).await;
            let _ = send_with_deadline(&mut ws_tx, Message::Close(None), deadline).await;
            return;
        }
    };
    let flush_deadline = state.config.viewer_send_flush_deadline();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            batch = outbox.recv_batch() => {
                match batch {
                    Some(commands) => {
                        for command in commands {
                            let Ok(json) = serde_json::to_string(&command) else { continue };
                            if send_with_deadline(&mut ws_tx, Message::Text(json.into()), flush_deadline).await.is_err() {
                                channel.unbind_producer(conn_id).await;
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
                        if let Some(body) = handle_producer_frame(&channel, conn_id, &text).await {
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

    channel.unbind_producer(conn_id).await;
}

/// A producer frame on the wire: the tagged `ProducerEvent` plus the
/// producer's own `ts`, which `Event::ts` carries but never trusts for
/// ordering (spec §3 "Event" invariant) — `seq`/`ingestTs` are hub-assigned
/// on ingest and never accepted from the wire.
#[derive(serde::Deserialize)]
struct IncomingProducerFrame {
    #[serde(default)]
    ts: Option<i64>,
    #[serde(flatten)]
    kind: ProducerEvent,
}

async fn handle_producer_frame(
    channel: &SessionChannelHandle,
    conn_id: u64,
    text: &str,
) -> Option<serde_json::Value> {
    let frame = match serde_json::from_str::<IncomingProducerFrame>(text) {
        Ok(f) => f,
        Err(_) => {
            tracing::debug!("dropped unparseable producer frame");
            return Some(crate::error::HubError::invalid_frame("unrecognized frame type").to_frame("cli_error"));
        }
    };
    if let Err(e) = channel.ingest(conn_id, frame.kind, frame.ts).await {
        tracing::debug!(err = %e, "producer ingest rejected");
    }
    None
}

#[cfg(test)]
#[path = "ws_session_tests.rs"]
mod tests;
