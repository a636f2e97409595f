// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Registry (spec §4.2): the process-wide index of live Sessions.
//! Owns `CreateSession`/`EndSession`/attach routing; the event log itself
//! lives one level down, in each session's own `session::channel` actor.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{ModelRef, RunnerFrame, RunnerSignal, SessionSnapshot, ViewerCommand};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::ids::{RunnerId, SessionId, UserId};
use crate::model::{cwd_allowed, Session, SessionState};
use crate::persistence::{PersistenceHandle, RehydratedSession};
use crate::registry::runner::RunnerRegistryHandle;
use crate::session::channel::{self, SessionChannelHandle, ViewerId, ViewerOutbound};
use crate::session::outbox::Outbox;
use crate::time::epoch_ms;

enum Command {
    CreateSession {
        user_id: UserId,
        runner_id: RunnerId,
        cwd: Option<String>,
        prompt: Option<String>,
        model: Option<ModelRef>,
        reply: oneshot::Sender<HubResult<SessionId>>,
    },
    EndSession {
        session_id: SessionId,
        actor: UserId,
        is_admin: bool,
        reply: oneshot::Sender<HubResult<()>>,
    },
    ListSessionsForUser {
        user_id: UserId,
        is_admin: bool,
        reply: oneshot::Sender<Vec<Session>>,
    },
    AttachViewer {
        session_id: SessionId,
        user_id: UserId,
        is_admin: bool,
        last_seq: u64,
        outbox: Arc<Outbox<ViewerOutbound>>,
        reply: oneshot::Sender<HubResult<(SessionChannelHandle, ViewerId)>>,
    },
    AttachProducer {
        session_id: SessionId,
        runner_id: RunnerId,
        outbox: Arc<Outbox<ViewerCommand>>,
        reply: oneshot::Sender<HubResult<(SessionChannelHandle, u64)>>,
    },
    RunnerFrame {
        frame: RunnerFrame,
    },
    RunnerGone {
        runner_id: RunnerId,
    },
}

/// Clonable handle to the Session Registry actor.
#[derive(Clone)]
pub struct SessionRegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionRegistryHandle {
    /// `CreateSession` (spec §4.2): mints an id, dispatches `new_session`
    /// to the runner, and does not reply until the runner's `session_ready`
    /// / `session_error` arrives (or the 30s spawn-reply deadline elapses).
    pub async fn create_session(
        &self,
        user_id: UserId,
        runner_id: RunnerId,
        cwd: Option<String>,
        prompt: Option<String>,
        model: Option<ModelRef>,
    ) -> HubResult<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateSession { user_id, runner_id, cwd, prompt, model, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session registry dropped reply"))?
    }

    pub async fn end_session(&self, session_id: SessionId, actor: UserId, is_admin: bool) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::EndSession { session_id, actor, is_admin, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session registry dropped reply"))?
    }

    pub async fn list_sessions_for_user(&self, user_id: UserId, is_admin: bool) -> Vec<Session> {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::ListSessionsForUser { user_id, is_admin, reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// `AttachViewer` (spec §4.2): an unauthorized or nonexistent session
    /// both yield `NotFound`, never `Forbidden` (avoids id enumeration).
    pub async fn attach_viewer(
        &self,
        session_id: SessionId,
        user_id: UserId,
        is_admin: bool,
        last_seq: u64,
        outbox: Arc<Outbox<ViewerOutbound>>,
    ) -> HubResult<(SessionChannelHandle, ViewerId)> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AttachViewer { session_id, user_id, is_admin, last_seq, outbox, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session registry dropped reply"))?
    }

    pub async fn attach_producer(
        &self,
        session_id: SessionId,
        runner_id: RunnerId,
        outbox: Arc<Outbox<ViewerCommand>>,
    ) -> HubResult<(SessionChannelHandle, u64)> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AttachProducer { session_id, runner_id, outbox, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session registry dropped reply"))?
    }

    /// Relays a control-socket frame from `/ws/runner` (`session_ready`,
    /// `session_error`, `session_killed`) into the registry's mailbox.
    pub async fn handle_runner_frame(&self, frame: RunnerFrame) {
        let _ = self.tx.send(Command::RunnerFrame { frame }).await;
    }

    /// Called by the Runner Registry once a runner's 60s reconnect grace
    /// elapses without it coming back (spec §4.4 "Runner health").
    pub async fn notify_runner_gone(&self, runner_id: RunnerId) {
        let _ = self.tx.send(Command::RunnerGone { runner_id }).await;
    }

    async fn send(&self, cmd: Command) -> HubResult<()> {
        self.tx.send(cmd).await.map_err(|_| HubError::internal("session registry closed"))
    }
}

struct SessionEntry {
    user_id: UserId,
    runner_id: RunnerId,
    channel: SessionChannelHandle,
}

struct PendingSpawn {
    reply: oneshot::Sender<HubResult<SessionId>>,
    requested_at: Instant,
    runner_id: RunnerId,
}

#[allow(clippy::too_many_arguments)]
pub fn spawn(
    config: Arc<HubConfig>,
    runner_registry: RunnerRegistryHandle,
    persistence_enabled: bool,
    data_dir: PathBuf,
    shutdown: CancellationToken,
    rehydrated: Vec<RehydratedSession>,
) -> SessionRegistryHandle {
    let mut sessions = HashMap::new();
    for r in rehydrated {
        let mut header = r.header;
        header.state = SessionState::Idle;
        let persistence = if persistence_enabled {
            PersistenceHandle::spawn(data_dir.join("sessions"), header.session_id.clone(), shutdown.clone())
        } else {
            PersistenceHandle::disabled()
        };
        let channel = channel::spawn(header.clone(), r.events, r.snapshot, config.clone(), persistence, shutdown.clone());
        sessions.insert(
            header.session_id.clone(),
            SessionEntry { user_id: header.user_id, runner_id: header.runner_id, channel },
        );
    }

    let (tx, rx) = mpsc::channel(256);
    let actor = SessionRegistry {
        sessions,
        pending_spawns: HashMap::new(),
        runner_registry,
        config,
        persistence_enabled,
        data_dir,
        shutdown: shutdown.clone(),
    };
    tokio::spawn(actor.run(rx, shutdown));
    SessionRegistryHandle { tx }
}

struct SessionRegistry {
    sessions: HashMap<SessionId, SessionEntry>,
    pending_spawns: HashMap<SessionId, PendingSpawn>,
    runner_registry: RunnerRegistryHandle,
    config: Arc<HubConfig>,
    persistence_enabled: bool,
    data_dir: PathBuf,
    shutdown: CancellationToken,
}

impl SessionRegistry {
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
            Command::CreateSession { user_id, runner_id, cwd, prompt, model, reply } => {
                self.create_session(user_id, runner_id, cwd, prompt, model, reply).await;
            }
            Command::EndSession { session_id, actor, is_admin, reply } => {
                let result = self.end_session(&session_id, &actor, is_admin).await;
                let _ = reply.send(result);
            }
            Command::ListSessionsForUser { user_id, is_admin, reply } => {
                let result = self.list_sessions_for_user(&user_id, is_admin).await;
                let _ = reply.send(result);
            }
            Command::AttachViewer { session_id, user_id, is_admin, last_seq, outbox, reply } => {
                let result = self.attach_viewer(&session_id, &user_id, is_admin, last_seq, outbox).await;
                let _ = reply.send(result);
            }
            Command::AttachProducer { session_id, runner_id, outbox, reply } => {
                let result = self.attach_producer(&session_id, runner_id, outbox).await;
                let _ = reply.send(result);
            }
            Command::RunnerFrame { frame } => self.handle_runner_frame(frame).await,
            Command::RunnerGone { runner_id } => self.runner_gone(&runner_id).await,
        }
    }

    async fn create_session(
        &mut self,
        user_id: UserId,
        runner_id: RunnerId,
        cwd: Option<String>,
        prompt: Option<String>,
        model: Option<ModelRef>,
        reply: oneshot::Sender<HubResult<SessionId>>,
    ) {
        let Some(runner) = self.runner_registry.get(runner_id.clone()).await else {
            let _ = reply.send(Err(HubError::NotFound));
            return;
        };
        let is_owner = runner.owner_user_id == user_id;
        if !cwd_allowed(cwd.as_deref(), &runner.roots, is_owner) {
            let _ = reply.send(Err(HubError::CwdOutsideRoots));
            return;
        }

        let session_id = SessionId::new();
        let header = Session {
            session_id: session_id.clone(),
            user_id: user_id.clone(),
            runner_id: runner_id.clone(),
            cwd: cwd.clone(),
            started_at: epoch_ms(),
            model: model.clone(),
            session_name: None,
            is_ephemeral: false,
            expires_at: None,
            state: SessionState::Pending,
        };

        let persistence = if self.persistence_enabled {
            PersistenceHandle::spawn(self.data_dir.join("sessions"), session_id.clone(), self.shutdown.clone())
        } else {
            PersistenceHandle::disabled()
        };
        let channel_handle = channel::spawn(
            header,
            Vec::new(),
            SessionSnapshot::default(),
            self.config.clone(),
            persistence,
            self.shutdown.clone(),
        );
        self.sessions.insert(
            session_id.clone(),
            SessionEntry { user_id, runner_id: runner_id.clone(), channel: channel_handle.clone() },
        );

        let dispatch = self.runner_registry.dispatch(
            runner_id.clone(),
            RunnerFrame::NewSession {
                session_id: session_id.to_string(),
                cwd,
                prompt,
                model,
            },
        ).await;

        if let Err(e) = dispatch {
            self.sessions.remove(&session_id);
            channel_handle.end_session().await;
            let _ = reply.send(Err(e));
            return;
        }

        self.runner_registry.adjust_session_count(runner_id.clone(), 1).await;
        self.pending_spawns.insert(session_id, PendingSpawn { reply, requested_at: Instant::now(), runner_id });
    }

    async fn end_session(&mut self, session_id: &SessionId, actor: &UserId, is_admin: bool) -> HubResult<()> {
        let entry = self.sessions.get(session_id).ok_or(HubError::NotFound)?;
        if &entry.user_id != actor && !is_admin {
            return Err(HubError::Forbidden);
        }
        entry.channel.end_session().await;
        Ok(())
    }

    async fn list_sessions_for_user(&self, user_id: &UserId, is_admin: bool) -> Vec<Session> {
        let mut out = Vec::new();
        for entry in self.sessions.values() {
            if &entry.user_id != user_id && !is_admin {
                continue;
            }
            if let Ok((header, _snapshot, _tail)) = entry.channel.snapshot().await {
                out.push(header);
            }
        }
        out
    }

    async fn attach_viewer(
        &self,
        session_id: &SessionId,
        user_id: &UserId,
        is_admin: bool,
        last_seq: u64,
        outbox: Arc<Outbox<ViewerOutbound>>,
    ) -> HubResult<(SessionChannelHandle, ViewerId)> {
        let entry = self.sessions.get(session_id).ok_or(HubError::NotFound)?;
        if &entry.user_id != user_id && !is_admin {
            return Err(HubError::NotFound);
        }
        let viewer_id = entry.channel.attach_viewer(last_seq, outbox).await?;
        Ok((entry.channel.clone(), viewer_id))
    }

    async fn attach_producer(
        &self,
        session_id: &SessionId,
        runner_id: RunnerId,
        outbox: Arc<Outbox<ViewerCommand>>,
    ) -> HubResult<(SessionChannelHandle, u64)> {
        let entry = self.sessions.get(session_id).ok_or(HubError::NotFound)?;
        let conn_id = entry.channel.bind_producer(runner_id, outbox).await?;
        Ok((entry.channel.clone(), conn_id))
    }

    async fn handle_runner_frame(&mut self, frame: RunnerFrame) {
        match frame {
            RunnerFrame::SessionReady { session_id } => {
                let session_id = SessionId::from(session_id);
                if let Some(pending) = self.pending_spawns.remove(&session_id) {
                    let _ = pending.reply.send(Ok(session_id));
                }
            }
            RunnerFrame::SessionError { session_id, message } => {
                let session_id = SessionId::from(session_id);
                if let Some(pending) = self.pending_spawns.remove(&session_id) {
                    if let Some(entry) = self.sessions.remove(&session_id) {
                        entry.channel.end_session().await;
                        self.runner_registry.adjust_session_count(pending.runner_id, -1).await;
                    }
                    let _ = pending.reply.send(Err(HubError::internal(message)));
                } else if let Some(entry) = self.sessions.get(&session_id) {
                    entry.channel.end_session().await;
                }
            }
            RunnerFrame::SessionKilled { session_id, exit_code } => {
                let session_id = SessionId::from(session_id);
                let Some(entry) = self.sessions.get(&session_id) else { return };
                match exit_code.and_then(RunnerSignal::from_exit_code) {
                    Some(RunnerSignal::WorkerRestart) => entry.channel.restart_notice().await,
                    _ => entry.channel.end_session().await,
                }
            }
            _ => {}
        }
    }

    async fn runner_gone(&mut self, runner_id: &RunnerId) {
        for entry in self.sessions.values() {
            if &entry.runner_id == runner_id {
                entry.channel.end_session().await;
            }
        }
    }

    async fn check_deadlines(&mut self) {
        let deadline = self.config.spawn_reply_deadline();
        let timed_out: Vec<SessionId> = self
            .pending_spawns
            .iter()
            .filter(|(_, p)| p.requested_at.elapsed() >= deadline)
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in timed_out {
            if let Some(pending) = self.pending_spawns.remove(&session_id) {
                if let Some(entry) = self.sessions.remove(&session_id) {
                    entry.channel.end_session().await;
                }
                self.runner_registry.adjust_session_count(pending.runner_id, -1).await;
                let _ = pending.reply.send(Err(HubError::RunnerUnavailable));
            }
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
