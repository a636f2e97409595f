// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the relay hub process (spec §6 "Environment").
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "pizzapi-hub", about = "PizzaPi session relay hub")]
pub struct HubConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "PIZZAPI_RELAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 7420, env = "PIZZAPI_RELAY_PORT")]
    pub port: u16,

    /// Static API key accepted from runners and viewers alongside session
    /// cookies. If unset, bearer-token auth is disabled (cookie auth only).
    #[arg(long, env = "PIZZAPI_API_KEY")]
    pub api_key: Option<String>,

    /// Legacy runner bearer token, accepted only on `/ws/runner`.
    #[arg(long, env = "PIZZAPI_RUNNER_TOKEN")]
    pub runner_token: Option<String>,

    /// HMAC secret used to sign and verify session cookies carrying the
    /// authenticated principal. Required for cookie-based viewer auth.
    #[arg(long, env = "PIZZAPI_SESSION_COOKIE_SECRET")]
    pub session_cookie_secret: Option<String>,

    /// Root directory for append-only session transcripts (spec §4.7).
    #[arg(long, default_value = "./data", env = "PIZZAPI_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Per-connection outbound send queue capacity before backpressure kicks
    /// in (spec §4.1 "Backpressure").
    #[arg(long, default_value_t = 1024, env = "PIZZAPI_SEND_QUEUE_CAPACITY")]
    pub send_queue_capacity: usize,

    /// Coalescing flush cadence for `message_update` deltas (spec §9 design
    /// note on streaming delta coalescing, made concrete in SPEC_FULL §4.3).
    #[arg(long, default_value_t = 16, env = "PIZZAPI_COALESCE_MS")]
    pub coalesce_ms: u64,

    /// Max concurrent connections per principal per peer class.
    #[arg(long, default_value_t = 32, env = "PIZZAPI_MAX_CONNECTIONS_PER_PRINCIPAL")]
    pub max_connections_per_principal: usize,

    /// Terminal scrollback ring buffer size in bytes (spec §4.5 "Buffering").
    #[arg(long, default_value_t = 65536, env = "PIZZAPI_TERMINAL_SCROLLBACK_BYTES")]
    pub terminal_scrollback_bytes: usize,

    /// Default time-to-live for uploaded attachments (spec §6
    /// `/api/sessions/{id}/attachments`, design note on content-addressed
    /// attachment storage).
    #[arg(long, default_value_t = 86_400, env = "PIZZAPI_ATTACHMENT_TTL_SECS")]
    pub attachment_ttl_secs: u64,

    /// Max accepted size of a single uploaded attachment, in bytes.
    #[arg(long, default_value_t = 25 * 1024 * 1024, env = "PIZZAPI_MAX_ATTACHMENT_BYTES")]
    pub max_attachment_bytes: usize,
}

impl HubConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }

    // -- Deadlines named in spec §5 "Cancellation & timeouts" --------------

    pub fn spawn_reply_deadline(&self) -> Duration {
        Duration::from_secs(30)
    }

    pub fn exec_round_trip_deadline(&self) -> Duration {
        Duration::from_secs(60)
    }

    pub fn heartbeat_idle_deadline(&self) -> Duration {
        Duration::from_secs(30)
    }

    pub fn heartbeat_terminate_deadline(&self) -> Duration {
        Duration::from_secs(60)
    }

    pub fn runner_ping_deadline(&self) -> Duration {
        Duration::from_secs(45)
    }

    pub fn runner_reconnect_grace(&self) -> Duration {
        Duration::from_secs(60)
    }

    pub fn viewer_send_flush_deadline(&self) -> Duration {
        Duration::from_secs(5)
    }

    pub fn end_session_grace(&self) -> Duration {
        Duration::from_secs(10)
    }

    pub fn terminal_kill_deadline(&self) -> Duration {
        Duration::from_secs(10)
    }

    pub fn snapshot_interval_events(&self) -> u64 {
        64
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
