// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runner Registry (spec §4.4): the process-wide index of connected
//! runners, one serializer guarding a single map, the same actor shape as
//! `session::channel` scaled up from "one session" to "every runner".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::RunnerFrame;
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::ids::{RunnerId, UserId};
use crate::model::RunnerInfo;
use crate::registry::session::SessionRegistryHandle;
use crate::session::outbox::Outbox;
use crate::time::epoch_ms;

enum Command {
    Register {
        runner_id: RunnerId,
        runner_secret: String,
        owner_user_id: UserId,
        name: String,
        roots: Vec<String>,
        skills: Vec<String>,
        terminal_capable: bool,
        outbox: Arc<Outbox<RunnerFrame>>,
        reply: oneshot::Sender<HubResult<()>>,
    },
    Dispatch {
        runner_id: RunnerId,
        frame: RunnerFrame,
        reply: oneshot::Sender<HubResult<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<RunnerInfo>>,
    },
    Get {
        runner_id: RunnerId,
        reply: oneshot::Sender<Option<RunnerInfo>>,
    },
    VerifySecret {
        runner_id: RunnerId,
        secret: String,
        reply: oneshot::Sender<bool>,
    },
    Touch {
        runner_id: RunnerId,
    },
    Disconnect {
        runner_id: RunnerId,
    },
    AdjustSessionCount {
        runner_id: RunnerId,
        delta: i64,
    },
    SetSessionRegistry {
        handle: SessionRegistryHandle,
    },
}

/// Clonable handle to the Runner Registry actor.
#[derive(Clone)]
pub struct RunnerRegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RunnerRegistryHandle {
    /// `Register` (spec §4.4): a matching `runnerSecret` on an existing
    /// `runnerId` supersedes the old control connection without touching
    /// that runner's sessions (adoption happens at the Session Channel
    /// level, not here). A mismatched secret is rejected.
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        runner_id: RunnerId,
        runner_secret: String,
        owner_user_id: UserId,
        name: String,
        roots: Vec<String>,
        skills: Vec<String>,
        terminal_capable: bool,
        outbox: Arc<Outbox<RunnerFrame>>,
    ) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            runner_id,
            runner_secret,
            owner_user_id,
            name,
            roots,
            skills,
            terminal_capable,
            outbox,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::internal("runner registry dropped reply"))?
    }

    /// Non-blocking enqueue onto the runner's control-socket outbox.
    pub async fn dispatch(&self, runner_id: RunnerId, frame: RunnerFrame) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dispatch { runner_id, frame, reply }).await?;
        rx.await.map_err(|_| HubError::internal("runner registry dropped reply"))?
    }

    pub async fn list(&self) -> Vec<RunnerInfo> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get(&self, runner_id: RunnerId) -> Option<RunnerInfo> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Get { runner_id, reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Checks a presented `runnerSecret` against the one the runner
    /// registered with, without exposing the secret itself outside this
    /// actor. Used to authenticate a worker's own producer socket on
    /// `/ws/sessions/{sessionId}` and a PTY's producer socket on
    /// `/ws/terminal/{terminalId}` — both reuse the runner's control-socket
    /// secret rather than minting a second credential (spec §3 Runner
    /// invariant: one secret proves identity on reconnect).
    pub async fn verify_secret(&self, runner_id: RunnerId, secret: String) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::VerifySecret { runner_id, secret, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn touch(&self, runner_id: RunnerId) {
        let _ = self.tx.send(Command::Touch { runner_id }).await;
    }

    /// Notifies the registry that a runner's control socket closed, so the
    /// 60s reconnect grace (spec §4.4 "Runner health") starts immediately
    /// instead of waiting out the 45s ping deadline first. A no-op if the
    /// runner already re-registered (e.g. a fresh socket raced the old
    /// one's close detection) since that clears `disconnected_at` again.
    pub async fn disconnect(&self, runner_id: RunnerId) {
        let _ = self.tx.send(Command::Disconnect { runner_id }).await;
    }

    pub async fn adjust_session_count(&self, runner_id: RunnerId, delta: i64) {
        let _ = self.tx.send(Command::AdjustSessionCount { runner_id, delta }).await;
    }

    /// Wires the Session Registry handle in after both actors are spawned
    /// (they hold mutual handles, not an `Arc` cycle).
    pub async fn set_session_registry(&self, handle: SessionRegistryHandle) {
        let _ = self.tx.send(Command::SetSessionRegistry { handle }).await;
    }

    async fn send(&self, cmd: Command) -> HubResult<()> {
        self.tx.send(cmd).await.map_err(|_| HubError::internal("runner registry closed"))
    }
}

struct RunnerEntry {
    info: RunnerInfo,
    runner_secret: String,
    outbox: Arc<Outbox<RunnerFrame>>,
    last_ping_at: Instant,
    disconnected_at: Option<Instant>,
}

pub fn spawn(config: Arc<HubConfig>, shutdown: CancellationToken) -> RunnerRegistryHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = RunnerRegistry { runners: HashMap::new(), session_registry: None, config };
    tokio::spawn(actor.run(rx, shutdown));
    RunnerRegistryHandle { tx }
}

struct RunnerRegistry {
    runners: HashMap<RunnerId, RunnerEntry>,
    session_registry: Option<SessionRegistryHandle>,
    config: Arc<HubConfig>,
}

impl RunnerRegistry {
    async fn run(mut self, mut mailbox: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        let mut deadline_tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = mailbox.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }
                _ = deadline_tick.tick() => self.check_deadlines().await,
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register {
                runner_id,
                runner_secret,
                owner_user_id,
                name,
                roots,
                skills,
                terminal_capable,
                outbox,
                reply,
            } => {
                let result = self.register(
                    runner_id,
                    runner_secret,
                    owner_user_id,
                    name,
                    roots,
                    skills,
                    terminal_capable,
                    outbox,
                );
                let _ = reply.send(result);
            }
            Command::Dispatch { runner_id, frame, reply } => {
                let result = self.dispatch(&runner_id, frame);
                let _ = reply.send(result);
            }
            Command::List { reply } => {
                let _ = reply.send(self.runners.values().map(|e| e.info.clone()).collect());
            }
            Command::Get { runner_id, reply } => {
                let _ = reply.send(self.runners.get(&runner_id).map(|e| e.info.clone()));
            }
            Command::VerifySecret { runner_id, secret, reply } => {
                let ok = self
                    .runners
                    .get(&runner_id)
                    .is_some_and(|e| crate::transport::auth::constant_time_eq(&e.runner_secret, &secret));
                let _ = reply.send(ok);
            }
            Command::Touch { runner_id } => {
                if let Some(entry) = self.runners.get_mut(&runner_id) {
                    entry.last_ping_at = Instant::now();
                    entry.disconnected_at = None;
                }
            }
            Command::Disconnect { runner_id } => {
                if let Some(entry) = self.runners.get_mut(&runner_id) {
                    if entry.disconnected_at.is_none() {
                        entry.disconnected_at = Some(Instant::now());
                    }
                }
            }
            Command::AdjustSessionCount { runner_id, delta } => {
                if let Some(entry) = self.runners.get_mut(&runner_id) {
                    entry.info.session_count = entry.info.session_count.saturating_add_signed(delta as isize);
                }
            }
            Command::SetSessionRegistry { handle } => {
                self.session_registry = Some(handle);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &mut self,
        runner_id: RunnerId,
        runner_secret: String,
        owner_user_id: UserId,
        name: String,
        roots: Vec<String>,
        skills: Vec<String>,
        terminal_capable: bool,
        outbox: Arc<Outbox<RunnerFrame>>,
    ) -> HubResult<()> {
        if let Some(entry) = self.runners.get_mut(&runner_id) {
            if !crate::transport::auth::constant_time_eq(&entry.runner_secret, &runner_secret) {
                return Err(HubError::Forbidden);
            }
            entry.info.name = name;
            entry.info.roots = roots;
            entry.info.skills = skills;
            entry.info.terminal_capable = terminal_capable;
            entry.info.owner_user_id = owner_user_id;
            entry.outbox = outbox;
            entry.last_ping_at = Instant::now();
            entry.disconnected_at = None;
            return Ok(());
        }

        let info = RunnerInfo {
            runner_id: runner_id.clone(),
            owner_user_id,
            name,
            roots,
            skills,
            terminal_capable,
            registered_at: epoch_ms(),
            session_count: 0,
        };
        self.runners.insert(
            runner_id,
            RunnerEntry { info, runner_secret, outbox, last_ping_at: Instant::now(), disconnected_at: None },
        );
        Ok(())
    }

    fn dispatch(&self, runner_id: &RunnerId, frame: RunnerFrame) -> HubResult<()> {
        let entry = self.runners.get(runner_id).ok_or(HubError::RunnerUnavailable)?;
        entry.outbox.push(frame);
        Ok(())
    }

    /// Runner health (spec §4.4): 45s ping gap closes the control socket;
    /// 60s further grace (no reconnect) terminates that runner's sessions.
    async fn check_deadlines(&mut self) {
        let mut to_remove = Vec::new();

        for (runner_id, entry) in self.runners.iter_mut() {
            if entry.disconnected_at.is_none()
                && entry.last_ping_at.elapsed() >= self.config.runner_ping_deadline()
            {
                entry.outbox.close();
                entry.disconnected_at = Some(Instant::now());
            }
            if let Some(disconnected_at) = entry.disconnected_at {
                if disconnected_at.elapsed() >= self.config.runner_reconnect_grace() {
                    to_remove.push(runner_id.clone());
                }
            }
        }

        for runner_id in to_remove {
            self.runners.remove(&runner_id);
            if let Some(session_registry) = &self.session_registry {
                session_registry.notify_runner_gone(runner_id).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
