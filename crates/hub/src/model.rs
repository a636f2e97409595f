// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core data model (spec §3): Session, Runner, Terminal and the states they
//! move through.

use serde::{Deserialize, Serialize};

use crate::codec::ModelRef;
use crate::ids::{RunnerId, SessionId, TerminalId, UserId};

/// Lifecycle state of a Session (spec §3 "Session" invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// `spawn` accepted, `new_session` dispatched, no `session_ready` yet.
    Pending,
    /// Producer attached and emitting events.
    Live,
    /// Producer detached (may still return — worker restart, runner blip).
    Idle,
    /// `EndSession` requested; waiting for the producer to detach or the
    /// grace deadline, whichever comes first (spec §4.2 "EndSession").
    Ending,
    /// Fatal exit, the `Ending` grace elapsed (or had nothing to wait for),
    /// or `expiresAt` passed.
    Terminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

/// A logical agent conversation (spec §3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub runner_id: RunnerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_name: Option<String>,
    pub is_ephemeral: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    pub state: SessionState,
}

impl Session {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.is_ephemeral && self.expires_at.is_some_and(|exp| now_ms >= exp)
    }
}

/// A registered worker host (spec §3 "Runner").
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInfo {
    pub runner_id: RunnerId,
    /// The principal that completed `register_runner`. Used to resolve the
    /// unscoped-roots policy in [`cwd_allowed`] — never serialized to the
    /// public `/api/runners` listing.
    #[serde(skip)]
    pub owner_user_id: UserId,
    pub name: String,
    pub roots: Vec<String>,
    pub skills: Vec<String>,
    pub terminal_capable: bool,
    pub registered_at: u64,
    pub session_count: usize,
}

/// A PTY session (spec §3 "Terminal").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Terminal {
    pub terminal_id: TerminalId,
    pub user_id: UserId,
    pub runner_id: RunnerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    pub created_at: u64,
}

/// Whether a `cwd` is permitted under a runner's advertised `roots` (spec
/// §3 Runner attribute, enforced by `CreateSession`/`CreateTerminal`).
///
/// An empty `roots` list means the runner itself is unscoped. Whether that
/// lets *any* principal spawn with an arbitrary `cwd` is the Open Question
/// spec §9 declines to resolve; SPEC_FULL §4.2 resolves it as owner-only, so
/// this function alone is deliberately *not* the full policy — callers use
/// [`cwd_allowed`], which also takes the requesting principal into account.
fn cwd_within_roots(cwd: Option<&str>, roots: &[String]) -> bool {
    let Some(cwd) = cwd else { return true };
    roots.iter().any(|root| cwd == root || cwd.starts_with(&format!("{root}/")))
}

/// Full `cwd` authorization policy for `CreateSession`/`CreateTerminal`
/// (spec §3 + §9 Open Question, resolved in SPEC_FULL §4.2): a runner with
/// non-empty `roots` enforces them for everyone; a runner with empty
/// (unscoped) `roots` only allows an arbitrary `cwd` for its own registering
/// principal — any other caller is still restricted to an empty allow-list,
/// so they can only omit `cwd` entirely.
pub fn cwd_allowed(cwd: Option<&str>, roots: &[String], is_runner_owner: bool) -> bool {
    if !roots.is_empty() {
        return cwd_within_roots(cwd, roots);
    }
    is_runner_owner || cwd.is_none()
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
