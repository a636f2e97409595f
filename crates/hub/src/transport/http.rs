// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! REST handlers (spec §6 "External interfaces" table).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::codec::{ModelRef, RunnerFrame};
use crate::error::{HubError, HubResult};
use crate::ids::{AttachmentId, RunnerId, SessionId, UserId};
use crate::state::HubState;
use crate::time::epoch_ms;
use crate::transport::auth::Principal;

// -- Request/response bodies --------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub runner_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model: Option<ModelRef>,
}

#[derive(Debug, Serialize)]
pub struct SpawnResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalRequest {
    pub runner_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub shell: Option<String>,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTerminalResponse {
    pub terminal_id: String,
    pub runner_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerListResponse {
    pub runners: Vec<RunnerSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSummary {
    pub runner_id: String,
    pub name: String,
    pub roots: Vec<String>,
    pub session_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<crate::model::Session>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentsResponse {
    pub attachments: Vec<AttachmentInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentInfo {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub expires_at: u64,
}

// -- Handlers ------------------------------------------------------------------

/// `POST /api/runners/spawn`
pub async fn spawn_session(
    State(state): State<Arc<HubState>>,
    principal: Principal,
    Json(req): Json<SpawnRequest>,
) -> impl IntoResponse {
    let result = state
        .session_registry
        .create_session(
            principal.user_id,
            RunnerId::from(req.runner_id),
            req.cwd,
            req.prompt,
            req.model,
        )
        .await;

    match result {
        Ok(session_id) => Json(SpawnResponse { session_id: session_id.to_string() }).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /api/runners/terminal`
pub async fn create_terminal(
    State(state): State<Arc<HubState>>,
    principal: Principal,
    Json(req): Json<CreateTerminalRequest>,
) -> impl IntoResponse {
    let runner_id = RunnerId::from(req.runner_id);
    let result = state
        .terminal_broker
        .create_terminal(principal.user_id, runner_id.clone(), req.cwd, req.cols, req.rows, req.shell)
        .await;

    match result {
        Ok(terminal_id) => {
            Json(CreateTerminalResponse { terminal_id: terminal_id.to_string(), runner_id: runner_id.to_string() })
                .into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /api/runners`
pub async fn list_runners(State(state): State<Arc<HubState>>, _principal: Principal) -> impl IntoResponse {
    let runners = state.runner_registry.list().await;
    Json(RunnerListResponse {
        runners: runners
            .into_iter()
            .map(|r| RunnerSummary {
                runner_id: r.runner_id.to_string(),
                name: r.name,
                roots: r.roots,
                session_count: r.session_count,
            })
            .collect(),
    })
}

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<Arc<HubState>>, principal: Principal) -> impl IntoResponse {
    let sessions = state.session_registry.list_sessions_for_user(principal.user_id, principal.is_admin).await;
    Json(SessionListResponse { sessions })
}

/// `GET /api/runners/{id}/recent-folders`
pub async fn recent_folders(
    State(state): State<Arc<HubState>>,
    Path(runner_id): Path<String>,
    _principal: Principal,
) -> impl IntoResponse {
    proxy_to_runner(&state, RunnerId::from(runner_id), "recent_folders", serde_json::Value::Null).await
}

/// `POST /api/runners/{id}/files`
pub async fn list_files(
    State(state): State<Arc<HubState>>,
    Path(runner_id): Path<String>,
    _principal: Principal,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    proxy_to_runner(&state, RunnerId::from(runner_id), "files", body).await
}

/// `POST /api/runners/{id}/read-file`
pub async fn read_file(
    State(state): State<Arc<HubState>>,
    Path(runner_id): Path<String>,
    _principal: Principal,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    proxy_to_runner(&state, RunnerId::from(runner_id), "read_file", body).await
}

/// `POST /api/runners/{id}/git-status`
pub async fn git_status(
    State(state): State<Arc<HubState>>,
    Path(runner_id): Path<String>,
    _principal: Principal,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    proxy_to_runner(&state, RunnerId::from(runner_id), "git_status", body).await
}

/// `POST /api/runners/{id}/git-diff`
pub async fn git_diff(
    State(state): State<Arc<HubState>>,
    Path(runner_id): Path<String>,
    _principal: Principal,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    proxy_to_runner(&state, RunnerId::from(runner_id), "git_diff", body).await
}

/// Round-trips a named method through the runner's control socket via
/// `ProxyRequest`/`ProxyResponse` (spec §6 "Proxied to runner"), bounded by
/// the 60 s exec round-trip deadline (spec §5).
async fn proxy_to_runner(
    state: &HubState,
    runner_id: RunnerId,
    method: &str,
    params: serde_json::Value,
) -> axum::response::Response {
    if state.runner_registry.get(runner_id.clone()).await.is_none() {
        return HubError::NotFound.into_response();
    }

    let (request_id, rx) = state.proxy_table.register();
    let dispatch = state
        .runner_registry
        .dispatch(runner_id, RunnerFrame::ProxyRequest { request_id, method: method.to_owned(), params })
        .await;
    if let Err(e) = dispatch {
        return e.into_response();
    }

    match tokio::time::timeout(state.config.exec_round_trip_deadline(), rx).await {
        Ok(Ok(Ok(value))) => Json(value).into_response(),
        Ok(Ok(Err(message))) => HubError::internal(message).into_response(),
        Ok(Err(_)) | Err(_) => HubError::RunnerUnavailable.into_response(),
    }
}

/// `POST /api/sessions/{id}/attachments` — multipart upload, content-addressed
/// by a hub-generated `attachmentId` (spec §9 design note, §6 response shape).
pub async fn upload_attachments(
    State(state): State<Arc<HubState>>,
    Path(session_id): Path<String>,
    principal: Principal,
    mut multipart: Multipart,
) -> impl IntoResponse {
    if let Err(e) = authorize_session(&state, &session_id, &principal).await {
        return e.into_response();
    }

    let dir = state.config.data_dir.join("attachments");
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        tracing::warn!(err = %e, "failed to create attachments dir");
        return HubError::internal("attachment storage unavailable").into_response();
    }

    let mut attachments = Vec::new();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return HubError::invalid_frame(e.to_string()).into_response(),
        };

        let filename = field.file_name().unwrap_or("upload").to_owned();
        let mime_type = field.content_type().unwrap_or("application/octet-stream").to_owned();
        let bytes = match field.bytes().await {
            Ok(b) => b,
            Err(e) => return HubError::invalid_frame(e.to_string()).into_response(),
        };
        if bytes.len() > state.config.max_attachment_bytes {
            return HubError::invalid_frame("attachment exceeds max_attachment_bytes").into_response();
        }

        let attachment_id = AttachmentId::from_content(&bytes);
        let path = dir.join(attachment_id.as_str());
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            tracing::warn!(err = %e, "failed to write attachment");
            return HubError::internal("attachment write failed").into_response();
        }

        attachments.push(AttachmentInfo {
            attachment_id: attachment_id.to_string(),
            filename,
            mime_type,
            size: bytes.len() as u64,
            expires_at: epoch_ms() + state.config.attachment_ttl_secs * 1000,
        });
    }

    Json(AttachmentsResponse { attachments }).into_response()
}

async fn authorize_session(state: &HubState, session_id: &str, principal: &Principal) -> HubResult<()> {
    let session_id = SessionId::from(session_id.to_owned());
    let sessions = state.session_registry.list_sessions_for_user(principal.user_id.clone(), principal.is_admin).await;
    if sessions.iter().any(|s| s.session_id == session_id) {
        Ok(())
    } else {
        Err(HubError::NotFound)
    }
}

/// Periodically deletes attachment files past their TTL. A best-effort
/// background sweep, not a correctness guarantee — a late reaper pass just
/// means a slightly longer-lived file on disk, never a dangling reference
/// (consumers only ever see an `attachmentId` that existed at upload time).
pub async fn spawn_attachment_reaper(state: Arc<HubState>) {
    let mut tick = tokio::time::interval(Duration::from_secs(300));
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            _ = tick.tick() => reap_expired_attachments(&state).await,
        }
    }
}

async fn reap_expired_attachments(state: &HubState) {
    let dir = state.config.data_dir.join("attachments");
    let ttl = Duration::from_secs(state.config.attachment_ttl_secs);
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else { return };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else { continue };
        let Ok(age) = metadata.modified().and_then(|m| m.elapsed()) else { continue };
        if age > ttl {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
