// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Terminal Broker (spec §4.5): a single serializer owning every terminal's
//! pairing between a viewer socket and a runner-hosted PTY. Unlike Session
//! Channels, there is exactly one Terminal Broker actor for the whole
//! process (spec §5); the scrollback ring buffer is small enough that a
//! per-terminal actor would just add bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{RunnerFrame, TerminalFrame};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::ids::{RunnerId, TerminalId, UserId};
use crate::registry::runner::RunnerRegistryHandle;
use crate::session::outbox::Outbox;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

enum Command {
    CreateTerminal {
        user_id: UserId,
        runner_id: RunnerId,
        cwd: Option<String>,
        cols: u16,
        rows: u16,
        shell: Option<String>,
        reply: oneshot::Sender<HubResult<TerminalId>>,
    },
    AttachViewer {
        terminal_id: TerminalId,
        user_id: UserId,
        is_admin: bool,
        outbox: Arc<Outbox<TerminalFrame>>,
        reply: oneshot::Sender<HubResult<()>>,
    },
    BindProducer {
        terminal_id: TerminalId,
        outbox: Arc<Outbox<TerminalFrame>>,
        reply: oneshot::Sender<HubResult<()>>,
    },
    FromViewer {
        terminal_id: TerminalId,
        frame: TerminalFrame,
    },
    FromProducer {
        terminal_id: TerminalId,
        frame: TerminalFrame,
    },
    CloseTerminal {
        terminal_id: TerminalId,
    },
}

/// Clonable handle to the Terminal Broker actor.
#[derive(Clone)]
pub struct TerminalBrokerHandle {
    tx: mpsc::Sender<Command>,
}

impl TerminalBrokerHandle {
    /// `CreateTerminal` (spec §4.5): stages a pending entry and sends
    /// `new_terminal` to the runner. The runner may defer PTY spawn until
    /// the viewer's first `terminal_resize` (spec §4.5 "Sizing").
    pub async fn create_terminal(
        &self,
        user_id: UserId,
        runner_id: RunnerId,
        cwd: Option<String>,
        cols: u16,
        rows: u16,
        shell: Option<String>,
    ) -> HubResult<TerminalId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CreateTerminal { user_id, runner_id, cwd, cols, rows, shell, reply }).await?;
        rx.await.map_err(|_| HubError::internal("terminal broker dropped reply"))?
    }

    /// Attaches the viewer's outbox. Flushes the scrollback ring buffer as
    /// a `terminal_data` frame before returning.
    pub async fn attach_viewer(
        &self,
        terminal_id: TerminalId,
        user_id: UserId,
        is_admin: bool,
        outbox: Arc<Outbox<TerminalFrame>>,
    ) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AttachViewer { terminal_id, user_id, is_admin, outbox, reply }).await?;
        rx.await.map_err(|_| HubError::internal("terminal broker dropped reply"))?
    }

    /// Binds the runner's PTY-forwarding socket as this terminal's producer.
    pub async fn bind_producer(&self, terminal_id: TerminalId, outbox: Arc<Outbox<TerminalFrame>>) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BindProducer { terminal_id, outbox, reply }).await?;
        rx.await.map_err(|_| HubError::internal("terminal broker dropped reply"))?
    }

    pub async fn from_viewer(&self, terminal_id: TerminalId, frame: TerminalFrame) {
        let _ = self.tx.send(Command::FromViewer { terminal_id, frame }).await;
    }

    pub async fn from_producer(&self, terminal_id: TerminalId, frame: TerminalFrame) {
        let _ = self.tx.send(Command::FromProducer { terminal_id, frame }).await;
    }

    pub async fn close_terminal(&self, terminal_id: TerminalId) {
        let _ = self.tx.send(Command::CloseTerminal { terminal_id }).await;
    }

    async fn send(&self, cmd: Command) -> HubResult<()> {
        self.tx.send(cmd).await.map_err(|_| HubError::internal("terminal broker closed"))
    }
}

struct TerminalEntry {
    user_id: UserId,
    runner_id: RunnerId,
    cols: u16,
    rows: u16,
    viewer: Option<Arc<Outbox<TerminalFrame>>>,
    producer: Option<Arc<Outbox<TerminalFrame>>>,
    scrollback: VecDeque<u8>,
    geometry_set: bool,
    kill_requested_at: Option<Instant>,
}

pub fn spawn(
    config: Arc<HubConfig>,
    runner_registry: RunnerRegistryHandle,
    shutdown: CancellationToken,
) -> TerminalBrokerHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = TerminalBroker { terminals: HashMap::new(), runner_registry, config };
    tokio::spawn(actor.run(rx, shutdown));
    TerminalBrokerHandle { tx }
}

struct TerminalBroker {
    terminals: HashMap<TerminalId, TerminalEntry>,
    runner_registry: RunnerRegistryHandle,
    config: Arc<HubConfig>,
}

impl TerminalBroker {
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
                _ = deadline_tick.tick() => self.check_deadlines(),
            }
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::CreateTerminal { user_id, runner_id, cwd, cols, rows, shell, reply } => {
                let result = self.create_terminal(user_id, runner_id, cwd, cols, rows, shell).await;
                let _ = reply.send(result);
            }
            Command::AttachViewer { terminal_id, user_id, is_admin, outbox, reply } => {
                let result = self.attach_viewer(&terminal_id, &user_id, is_admin, outbox);
                let _ = reply.send(result);
            }
            Command::BindProducer { terminal_id, outbox, reply } => {
                let result = self.bind_producer(&terminal_id, outbox);
                let _ = reply.send(result);
            }
            Command::FromViewer { terminal_id, frame } => self.from_viewer(&terminal_id, frame),
            Command::FromProducer { terminal_id, frame } => self.from_producer(&terminal_id, frame),
            Command::CloseTerminal { terminal_id } => self.close_terminal(&terminal_id),
        }
    }

    async fn create_terminal(
        &mut self,
        user_id: UserId,
        runner_id: RunnerId,
        cwd: Option<String>,
        cols: u16,
        rows: u16,
        shell: Option<String>,
    ) -> HubResult<TerminalId> {
        let Some(runner) = self.runner_registry.get(runner_id.clone()).await else {
            return Err(HubError::NotFound);
        };
        let is_owner = runner.owner_user_id == user_id;
        if !crate::model::cwd_allowed(cwd.as_deref(), &runner.roots, is_owner) {
            return Err(HubError::CwdOutsideRoots);
        }
        if !runner.terminal_capable {
            return Err(HubError::RunnerUnavailable);
        }

        let terminal_id = TerminalId::new();
        self.runner_registry
            .dispatch(
                runner_id.clone(),
                RunnerFrame::NewTerminal {
                    terminal_id: terminal_id.to_string(),
                    cwd,
                    cols,
                    rows,
                    shell,
                },
            )
            .await?;

        self.terminals.insert(
            terminal_id.clone(),
            TerminalEntry {
                user_id,
                runner_id,
                cols,
                rows,
                viewer: None,
                producer: None,
                scrollback: VecDeque::with_capacity(self.config.terminal_scrollback_bytes.min(65536)),
                geometry_set: false,
                kill_requested_at: None,
            },
        );
        Ok(terminal_id)
    }

    fn attach_viewer(
        &mut self,
        terminal_id: &TerminalId,
        user_id: &UserId,
        is_admin: bool,
        outbox: Arc<Outbox<TerminalFrame>>,
    ) -> HubResult<()> {
        let entry = self.terminals.get_mut(terminal_id).ok_or(HubError::NotFound)?;
        if &entry.user_id != user_id && !is_admin {
            return Err(HubError::NotFound);
        }
        outbox.push(TerminalFrame::TerminalConnected { terminal_id: terminal_id.to_string() });
        if entry.geometry_set {
            outbox.push(TerminalFrame::TerminalReady { cols: entry.cols, rows: entry.rows });
        }
        if !entry.scrollback.is_empty() {
            let bytes: Vec<u8> = entry.scrollback.iter().copied().collect();
            outbox.push(TerminalFrame::TerminalData { data: BASE64.encode(bytes) });
        }
        entry.viewer = Some(outbox);
        Ok(())
    }

    fn bind_producer(&mut self, terminal_id: &TerminalId, outbox: Arc<Outbox<TerminalFrame>>) -> HubResult<()> {
        let entry = self.terminals.get_mut(terminal_id).ok_or(HubError::NotFound)?;
        entry.producer = Some(outbox);
        Ok(())
    }

    fn from_viewer(&mut self, terminal_id: &TerminalId, frame: TerminalFrame) {
        let Some(entry) = self.terminals.get_mut(terminal_id) else { return };
        if let TerminalFrame::TerminalResize { cols, rows } = &frame {
            entry.cols = *cols;
            entry.rows = *rows;
            entry.geometry_set = true;
        }
        if matches!(frame, TerminalFrame::KillTerminal) {
            entry.kill_requested_at = Some(Instant::now());
        }
        if let Some(producer) = &entry.producer {
            producer.push(frame);
        }
    }

    fn from_producer(&mut self, terminal_id: &TerminalId, frame: TerminalFrame) {
        let Some(entry) = self.terminals.get_mut(terminal_id) else { return };
        if let TerminalFrame::TerminalData { data } = &frame {
            if let Ok(bytes) = BASE64.decode(data) {
                entry.scrollback.extend(bytes);
                let cap = self.config.terminal_scrollback_bytes;
                while entry.scrollback.len() > cap {
                    entry.scrollback.pop_front();
                }
            }
        }
        if let Some(viewer) = &entry.viewer {
            viewer.push(frame.clone());
        }
        if matches!(frame, TerminalFrame::TerminalExit { .. }) {
            self.terminals.remove(terminal_id);
        }
    }

    fn close_terminal(&mut self, terminal_id: &TerminalId) {
        let Some(entry) = self.terminals.get_mut(terminal_id) else { return };
        if let Some(producer) = &entry.producer {
            producer.push(TerminalFrame::KillTerminal);
        }
        entry.kill_requested_at = Some(Instant::now());
    }

    /// 10s kill deadline (spec §4.5 "CloseTerminal ... frees buffers after
    /// `terminal_exit` or a 10 s deadline").
    fn check_deadlines(&mut self) {
        let deadline = self.config.terminal_kill_deadline();
        let expired: Vec<TerminalId> = self
            .terminals
            .iter()
            .filter(|(_, e)| e.kill_requested_at.is_some_and(|at| at.elapsed() >= deadline))
            .map(|(id, _)| id.clone())
            .collect();
        for terminal_id in expired {
            if let Some(entry) = self.terminals.remove(&terminal_id) {
                if let Some(viewer) = &entry.viewer {
                    viewer.push(TerminalFrame::TerminalExit { exit_code: -1 });
                    viewer.close();
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "terminal_tests.rs"]
mod tests;
