// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `/ws/runner` — the control socket a runner daemon opens once and keeps
//! open for its process lifetime (spec §4.1 Connection Gateway table).
//!
//! The first frame a runner sends must be `register_runner`; everything
//! after that is ping/pong liveness, session lifecycle replies
//! (`session_ready`/`session_error`/`session_killed`), and the proxied-RPC
//! plumbing (`proxy_response`) for the read-only runner endpoints in spec
//! §6. Hub -> runner frames (`new_session`, `kill_session`, `new_terminal`,
//! `proxy_request`) are pushed onto this connection's [`Outbox`] by the
//! Runner/Session/Terminal registries and drained here.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::StreamExt;
use serde::Deserialize;

use crate::codec::RunnerFrame;
use crate::ids::{RunnerId, UserId};
use crate::session::outbox::Outbox;
use crate::state::HubState;
use crate::transport::{auth, send_with_deadline};

#[derive(Debug, Deserialize)]
pub struct RunnerWsQuery {
    pub token: Option<String>,
}

/// `GET /ws/runner`
pub async fn handler(
    State(state): State<Arc<HubState>>,
    Query(query): Query<RunnerWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !auth::runner_control_authorized(&state.config, &headers, query.token.as_deref()) {
        return (axum::http::StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    // A principal carried via cookie/API key becomes the owner recorded
    // against the runner (spec §9 Open Question, resolved SPEC_FULL §4.2);
    // a bare legacy runner token has no such principal, so the runner owns
    // itself.
    let owner = auth::resolve_principal(&state.config, &headers, query.token.as_deref())
        .map(|p| p.user_id)
        .ok();

    ws.on_upgrade(move |socket| run(socket, state, owner)).into_response()
}

async fn run(socket: WebSocket, state: Arc<HubState>, owner_hint: Option<UserId>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // First frame must be `register_runner`.
    let Some(Ok(Message::Text(first))) = ws_rx.next().await else { return };
    let Ok(RunnerFrame::RegisterRunner { runner_id, runner_secret, name, roots, skills, terminal_capable }) =
        serde_json::from_str::<RunnerFrame>(&first)
    else {
        let _ = send_with_deadline(
            &mut ws_tx,
            Message::Text(
                crate::error::HubError::invalid_frame("first frame must be register_runner")
                    .to_frame("cli_error")
                    .to_string()
                    .into(),
            ),
            state.config.viewer_send_flush_deadline(),
        )
        .await;
        return;
    };

    let runner_id = RunnerId::from(runner_id);
    let owner_user_id = owner_hint.unwrap_or_else(|| UserId::from(format!("runner:{}", runner_id.as_str())));
    let outbox = Outbox::<RunnerFrame>::new(state.config.send_queue_capacity);
    let flush_deadline = state.config.viewer_send_flush_deadline();

    let registered = state
        .runner_registry
        .register(
            runner_id.clone(),
            runner_secret,
            owner_user_id,
            name,
            roots,
            skills,
            terminal_capable,
            outbox.clone(),
        )
        .await;

    if let Err(e) = registered {
        let _ = send_with_deadline(&mut ws_tx, Message::Text(e.to_frame("cli_error").to_string().into()), flush_deadline).await;
        let _ = send_with_deadline(&mut ws_tx, Message::Close(None), flush_deadline).await;
        return;
    }

    if send_with_deadline(
        &mut ws_tx,
        Message::Text(
            serde_json::to_string(&RunnerFrame::RunnerRegistered { runner_id: runner_id.to_string() })
                .unwrap_or_default()
                .into(),
        ),
        flush_deadline,
    )
    .await
    .is_err()
    {
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
                                state.runner_registry.disconnect(runner_id.clone()).await;
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
                        handle_frame(&state, &runner_id, &text, &mut ws_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.runner_registry.disconnect(runner_id).await;
}

async fn handle_frame(
    state: &Arc<HubState>,
    runner_id: &RunnerId,
    text: &str,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) {
    let flush_deadline = state.config.viewer_send_flush_deadline();
    let frame: RunnerFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            tracing::debug!(runner_id = %runner_id, "dropped unparseable runner frame");
            let body = crate::error::HubError::invalid_frame("unrecognized frame type").to_frame("cli_error");
            let _ = send_with_deadline(ws_tx, Message::Text(body.to_string().into()), flush_deadline).await;
            return;
        }
    };

    match frame {
        RunnerFrame::Ping => {
            state.runner_registry.touch(runner_id.clone()).await;
            let _ = send_with_deadline(
                ws_tx,
                Message::Text(serde_json::to_string(&RunnerFrame::Pong).unwrap_or_default().into()),
                flush_deadline,
            )
            .await;
        }
        RunnerFrame::Pong => {
            state.runner_registry.touch(runner_id.clone()).await;
        }
        RunnerFrame::SessionReady { .. } | RunnerFrame::SessionError { .. } | RunnerFrame::SessionKilled { .. } => {
            state.session_registry.handle_runner_frame(frame).await;
        }
        RunnerFrame::SessionsList { .. } => {
            // Informational only; the hub tracks sessions itself via the
            // registry rather than trusting a runner-reported list.
        }
        RunnerFrame::ProxyResponse { request_id, result, error } => {
            let outcome = match result {
                Some(value) => Ok(value),
                None => Err(error.unwrap_or_else(|| "proxy request failed".to_owned())),
            };
            state.proxy_table.resolve(&request_id, outcome);
        }
        _ => {
            tracing::debug!(runner_id = %runner_id, kind = frame.type_name(), "ignored unexpected frame on runner control socket");
        }
    }
}

#[cfg(test)]
#[path = "ws_runner_tests.rs"]
mod tests;
