// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error kinds for the relay hub (spec §7), generalizing the reverse-proxy's
//! narrower `MuxError` into the kinds the relay surfaces to clients.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Error kinds surfaced to clients as `cli_error` / `session_error` /
/// `terminal_error` frames, or as HTTP error bodies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HubError {
    #[error("authentication required")]
    AuthRequired,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("invalid frame: {message}")]
    InvalidFrame { message: String },
    #[error("runner unavailable")]
    RunnerUnavailable,
    #[error("cwd outside runner roots")]
    CwdOutsideRoots,
    #[error("backpressure: viewer queue overflowed")]
    Backpressure,
    #[error("session already has a bound producer")]
    AlreadyBound,
    #[error("runner mismatch")]
    RunnerMismatch,
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HubError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    pub fn invalid_frame(message: impl Into<String>) -> Self {
        Self::InvalidFrame { message: message.into() }
    }

    /// HTTP status code for REST responses.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidFrame { .. } => StatusCode::BAD_REQUEST,
            Self::RunnerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::CwdOutsideRoots => StatusCode::BAD_REQUEST,
            Self::Backpressure => StatusCode::OK, // never an HTTP response in practice
            Self::AlreadyBound => StatusCode::CONFLICT,
            Self::RunnerMismatch => StatusCode::CONFLICT,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AuthRequired",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "NotFound",
            Self::InvalidFrame { .. } => "InvalidFrame",
            Self::RunnerUnavailable => "RunnerUnavailable",
            Self::CwdOutsideRoots => "CwdOutsideRoots",
            Self::Backpressure => "Backpressure",
            Self::AlreadyBound => "AlreadyBound",
            Self::RunnerMismatch => "RunnerMismatch",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Which side a `RunnerUnavailable`/`RunnerMismatch` failure traces back
    /// to (spec §7 "Error kinds" `source?`). `None` when the hub itself is
    /// the source, which is the common case and not worth naming.
    fn source(&self) -> Option<&'static str> {
        match self {
            Self::RunnerUnavailable | Self::RunnerMismatch => Some("runner"),
            _ => None,
        }
    }

    /// Render as a wire-format error body under the given frame discriminator
    /// (`cli_error`, `session_error`, `terminal_error`): `{type, message,
    /// source?}` (spec §7 "Error kinds").
    pub fn to_frame(&self, frame_type: &'static str) -> serde_json::Value {
        let mut frame = serde_json::json!({
            "type": frame_type,
            "message": self.to_string(),
        });
        if let Some(source) = self.source() {
            frame["source"] = serde_json::Value::String(source.to_owned());
        }
        frame
    }
}

/// REST error envelope: `{error: "<code>"}` (spec §8 Scenario D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let body = ErrorResponse { error: self.code().to_owned() };
        (status, Json(body)).into_response()
    }
}

pub type HubResult<T> = Result<T, HubError>;
