// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event taxonomy & codec (spec §4.6): a closed, tagged-union wire schema
//! shared by every peer class, JSON on the wire and strongly typed in
//! memory.
//!
//! Every frame is a UTF-8 JSON object with a required `type` discriminator.
//! Unknown fields within a known `type` are tolerated (forward
//! compatibility — we simply don't `deny_unknown_fields`); an unrecognized
//! `type` fails to deserialize into any of these enums and the caller turns
//! that into a `cli_error`/`session_error`/`terminal_error` response frame
//! without advancing session state (spec §4.1 "Framing").

use serde::{Deserialize, Serialize};

use crate::model::Session;

/// A provider + model identifier, e.g. `{provider: "anthropic", id: "claude"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    pub done: bool,
}

/// Reference to a previously uploaded attachment (spec §9 design note:
/// attachments live in a content-addressed store; events only carry this).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub attachment_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// How a viewer's `input` frame should be delivered to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliverAs {
    Steer,
    FollowUp,
}

/// Named restart signals, replacing the magic exit codes 43 (worker
/// restart) and 42 (runner restart) named in spec §6/§9 Open Questions.
/// The numeric exit code is parsed into this enum at exactly one site (the
/// runner's reported exit status); everywhere else in the hub this is the
/// vocabulary used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerSignal {
    WorkerRestart,
    RunnerRestart,
}

impl RunnerSignal {
    /// Parse a worker/runner process exit code into a named signal, if any.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            43 => Some(Self::WorkerRestart),
            42 => Some(Self::RunnerRestart),
            _ => None,
        }
    }
}

// -- Runner control (runner <-> hub) on /ws/runner ---------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum RunnerFrame {
    RegisterRunner {
        runner_id: String,
        runner_secret: String,
        name: String,
        #[serde(default)]
        roots: Vec<String>,
        #[serde(default)]
        skills: Vec<String>,
        #[serde(default)]
        terminal_capable: bool,
    },
    RunnerRegistered {
        runner_id: String,
    },
    NewSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<ModelRef>,
    },
    SessionReady {
        session_id: String,
    },
    SessionError {
        session_id: String,
        message: String,
    },
    KillSession {
        session_id: String,
    },
    SessionKilled {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    ListSessions,
    SessionsList {
        sessions: Vec<String>,
    },
    Ping,
    Pong,
    Restart {
        signal: RunnerSignal,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Hub -> runner: spawn a PTY. Flows over the runner control socket;
    /// the byte stream itself is carried on a separate producer-role
    /// attachment to `/ws/terminal/{terminalId}` (see `transport::ws_terminal`).
    NewTerminal {
        terminal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        cols: u16,
        rows: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
    },
    /// Generic request/response RPC used for the proxied REST endpoints in
    /// spec §6 (`recent-folders`, `files`, `read-file`, `git-status`,
    /// `git-diff`): the hub stamps a `request_id`, the runner echoes it.
    ProxyRequest {
        request_id: String,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
    ProxyResponse {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl RunnerFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::RegisterRunner { .. } => "register_runner",
            Self::RunnerRegistered { .. } => "runner_registered",
            Self::NewSession { .. } => "new_session",
            Self::SessionReady { .. } => "session_ready",
            Self::SessionError { .. } => "session_error",
            Self::KillSession { .. } => "kill_session",
            Self::SessionKilled { .. } => "session_killed",
            Self::ListSessions => "list_sessions",
            Self::SessionsList { .. } => "sessions_list",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Restart { .. } => "restart",
            Self::NewTerminal { .. } => "new_terminal",
            Self::ProxyRequest { .. } => "proxy_request",
            Self::ProxyResponse { .. } => "proxy_response",
        }
    }
}

// -- Session events (worker -> hub -> viewer), logged with a `seq` ----------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ProducerEvent {
    SessionActive {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Present on hub-synthesized `session_active` frames (restart
        /// adoption, `resync` gap recovery): the compacted fold of the log
        /// up to this point (spec §4.3.1). Absent on a producer's own
        /// `session_active` emission, which carries no payload.
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<SessionSnapshot>,
    },
    AgentEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    MessageStart {
        message_id: String,
        role: String,
    },
    MessageUpdate {
        message_id: String,
        partial: serde_json::Value,
    },
    MessageEnd {
        message_id: String,
    },
    TurnEnd {
        #[serde(skip_serializing_if = "Option::is_none")]
        turn_id: Option<String>,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolExecutionUpdate {
        tool_call_id: String,
        #[serde(default)]
        partial: serde_json::Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        #[serde(default)]
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    Heartbeat {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<ModelRef>,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_level: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending_question: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        todo_list: Option<Vec<TodoItem>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_usage: Option<serde_json::Value>,
    },
    Capabilities {
        #[serde(default)]
        skills: Vec<String>,
        #[serde(default)]
        terminal: bool,
    },
    ModelSelect {
        model: ModelRef,
    },
    ModelSetResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    TodoUpdate {
        todo_list: Vec<TodoItem>,
    },
    CliError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    ExecResult {
        command: String,
        #[serde(default)]
        result: serde_json::Value,
        #[serde(default = "default_true")]
        ok: bool,
    },
    /// Synthetic event the channel inserts itself (never sent by a real
    /// producer) when a heartbeat gap is detected (spec §4.3 "Heartbeat").
    Disconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

/// The fold of every event seen so far for a session (spec §4.3.1): enough
/// to bootstrap a new viewer or resynchronize one that detected a gap,
/// without replaying the entire log. Recomputed incrementally on ingest by
/// `session::snapshot::fold`, never constructed by hand elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_question: Option<serde_json::Value>,
    #[serde(default)]
    pub todo_list: Vec<TodoItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_usage: Option<serde_json::Value>,
    /// In-flight and completed messages, keyed by `messageId`, in first-seen
    /// order. Each entry is the last `partial` payload observed for that id.
    #[serde(default)]
    pub messages: Vec<SnapshotMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMessage {
    pub message_id: String,
    pub role: String,
    pub ended: bool,
    #[serde(default)]
    pub partial: serde_json::Value,
}

impl ProducerEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SessionActive { .. } => "session_active",
            Self::AgentEnd { .. } => "agent_end",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::TurnEnd { .. } => "turn_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionUpdate { .. } => "tool_execution_update",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Capabilities { .. } => "capabilities",
            Self::ModelSelect { .. } => "model_select",
            Self::ModelSetResult { .. } => "model_set_result",
            Self::TodoUpdate { .. } => "todo_update",
            Self::CliError { .. } => "cli_error",
            Self::ExecResult { .. } => "exec_result",
            Self::Disconnected { .. } => "disconnected",
        }
    }

    /// Whether this event updates `heartbeat`/`capabilities`/`model_select`
    /// header fields and so is a "source of truth for the next viewer to
    /// attach" (spec §4.3 ingest step 3).
    pub fn updates_header(&self) -> bool {
        matches!(self, Self::Heartbeat { .. } | Self::Capabilities { .. } | Self::ModelSelect { .. })
    }
}

/// A single logged item in a session's event log (spec §3 "Event").
///
/// `seq` and `ingest_ts` are hub-assigned on ingest; the producer never
/// chooses them. `ts` is the producer-supplied wall clock, carried but
/// never trusted for ordering (spec §3 invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    pub ingest_ts: u64,
    #[serde(flatten)]
    pub kind: ProducerEvent,
}

// -- Viewer -> worker (via hub), on /ws/sessions/{id} ------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ViewerCommand {
    Input {
        text: String,
        #[serde(default)]
        attachments: Vec<AttachmentRef>,
        deliver_as: DeliverAs,
    },
    Exec {
        command: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    /// Declares `lastSeq`; doubles as both the mandatory first frame on
    /// fresh attach (`lastSeq = 0`) and the gap-recovery request (spec
    /// §4.3 "Replay path" / "Gap recovery" — unified onto one frame kind,
    /// see DESIGN.md).
    Resync {
        last_seq: u64,
    },
}

/// Hub -> viewer control frame sent once per attach, before replay begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubToViewer {
    Connected {
        is_active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        last_seq: u64,
    },
    /// Pushed on attach and again whenever the caller's session set
    /// changes, on `/ws/hub` (spec §4.1 table, "index" row). Carries the
    /// same listing `GET /api/sessions` returns so a dashboard client can
    /// stay current without polling.
    SessionsList {
        sessions: Vec<Session>,
    },
}

// -- Terminal frames, on /ws/terminal/{id} -----------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum TerminalFrame {
    TerminalConnected {
        terminal_id: String,
    },
    TerminalReady {
        cols: u16,
        rows: u16,
    },
    /// Base64-encoded bytes typed by the viewer.
    TerminalInput {
        data: String,
    },
    TerminalResize {
        cols: u16,
        rows: u16,
    },
    /// Base64-encoded bytes produced by the PTY.
    TerminalData {
        data: String,
    },
    TerminalExit {
        exit_code: i32,
    },
    TerminalError {
        message: String,
    },
    KillTerminal,
}

impl TerminalFrame {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TerminalConnected { .. } => "terminal_connected",
            Self::TerminalReady { .. } => "terminal_ready",
            Self::TerminalInput { .. } => "terminal_input",
            Self::TerminalResize { .. } => "terminal_resize",
            Self::TerminalData { .. } => "terminal_data",
            Self::TerminalExit { .. } => "terminal_exit",
            Self::TerminalError { .. } => "terminal_error",
            Self::KillTerminal => "kill_terminal",
        }
    }
}

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;
