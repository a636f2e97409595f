// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the relay hub (spec §6 "External
//! interfaces").

pub mod auth;
pub mod http;
pub mod proxy;
pub mod ws_hub;
pub mod ws_runner;
pub mod ws_session;
pub mod ws_terminal;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use futures_util::Sink;
use futures_util::SinkExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::HubState;

/// Send one frame on a WS sink, bounded by `deadline` (spec §5 "Cancellation
/// & timeouts", `viewerSendFlushDeadline`). A peer that stops draining its
/// receive buffer would otherwise leave this connection's task blocked
/// forever on a single `.send()`, holding the session/terminal/runner outbox
/// it's drained from open indefinitely; timing out and reporting failure
/// lets the caller tear the connection down instead.
pub async fn send_with_deadline<S, Item>(sink: &mut S, item: Item, deadline: Duration) -> Result<(), ()>
where
    S: Sink<Item> + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(item)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}

/// Build the axum `Router` with every REST and WebSocket route the hub
/// serves. Auth is per-handler (each extracts `Principal` or checks a
/// runner token itself) rather than a blanket middleware layer, since the
/// four peer classes in spec §4.1's table each authenticate differently.
pub fn build_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/api/runners/spawn", post(http::spawn_session))
        .route("/api/runners/terminal", post(http::create_terminal))
        .route("/api/runners", get(http::list_runners))
        .route("/api/runners/{id}/recent-folders", get(http::recent_folders))
        .route("/api/runners/{id}/files", post(http::list_files))
        .route("/api/runners/{id}/read-file", post(http::read_file))
        .route("/api/runners/{id}/git-status", post(http::git_status))
        .route("/api/runners/{id}/git-diff", post(http::git_diff))
        .route("/api/sessions", get(http::list_sessions))
        .route("/api/sessions/{id}/attachments", post(http::upload_attachments))
        .route("/ws/runner", get(ws_runner::handler))
        .route("/ws/sessions/{session_id}", get(ws_session::handler))
        .route("/ws/terminal/{terminal_id}", get(ws_terminal::handler))
        .route("/ws/hub", get(ws_hub::handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
