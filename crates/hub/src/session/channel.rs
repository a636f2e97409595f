// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session Channel (spec §4.3): one actor per live session, the single
//! serializer that owns the event log, sequence numbering, viewer fan-out,
//! replay cursor, and heartbeat state. Every mutation — producer ingest,
//! viewer attach/detach/resync, and timer ticks — flows through one mpsc
//! mailbox, so `seq` assignment and fan-out are race-free without locks
//! (spec §5), the same single-writer-actor shape the teacher uses for its
//! credential refresh loop and `WsBridge`'s upstream multiplexer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::{Event, ProducerEvent, SessionSnapshot, ViewerCommand};
use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::ids::RunnerId;
use crate::model::{Session, SessionState};
use crate::persistence::PersistenceHandle;
use crate::session::coalesce::Coalescer;
use crate::session::outbox::Outbox;
use crate::session::snapshot;
use crate::time::epoch_ms;

/// Frames the channel pushes to a viewer's outbox. Encoded on the wire as:
/// `Connected` -> one JSON object (the `connected` frame); `Events` -> one
/// JSON array of event objects, even for a single element, so coalesced and
/// uncoalesced delivery share one decode shape on the client; `Error` -> one
/// JSON object (already wire-shaped by `HubError::to_frame`).
#[derive(Debug, Clone)]
pub enum ViewerOutbound {
    Connected { is_active: bool, session_name: Option<String>, last_seq: u64 },
    Events(Vec<Event>),
    Error(serde_json::Value),
}

pub type ViewerId = u64;

struct Subscriber {
    last_seq_delivered: u64,
    outbox: Arc<Outbox<ViewerOutbound>>,
}

struct ProducerBinding {
    conn_id: u64,
    runner_id: RunnerId,
    outbox: Arc<Outbox<ViewerCommand>>,
}

enum Command {
    Ingest {
        conn_id: u64,
        kind: ProducerEvent,
        ts: Option<i64>,
        reply: oneshot::Sender<HubResult<()>>,
    },
    AttachViewer {
        last_seq: u64,
        outbox: Arc<Outbox<ViewerOutbound>>,
        reply: oneshot::Sender<ViewerId>,
    },
    DetachViewer {
        viewer_id: ViewerId,
    },
    Resync {
        viewer_id: ViewerId,
        last_seq: u64,
    },
    ForwardToProducer {
        command: ViewerCommand,
        reply: oneshot::Sender<HubResult<()>>,
    },
    BindProducer {
        runner_id: RunnerId,
        outbox: Arc<Outbox<ViewerCommand>>,
        reply: oneshot::Sender<HubResult<u64>>,
    },
    UnbindProducer {
        conn_id: u64,
    },
    EndSession {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<(Session, SessionSnapshot, u64)>,
    },
    RestartNotice,
}

/// Clonable handle to a running `SessionChannel` actor. All state access
/// goes through the mailbox; there is no shared-lock path into the actor.
#[derive(Clone)]
pub struct SessionChannelHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionChannelHandle {
    /// Ingest one frame from the bound producer (spec §4.3 "Ingest path").
    /// `conn_id` must match the currently bound producer connection or the
    /// frame is rejected — this is what makes a displaced/stale producer
    /// socket's writes inert instead of corrupting a newer binding.
    pub async fn ingest(&self, conn_id: u64, kind: ProducerEvent, ts: Option<i64>) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Ingest { conn_id, kind, ts, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session channel dropped reply"))?
    }

    /// Attach a viewer at `last_seq` (0 on fresh attach). Pushes the
    /// `connected` frame and any replay directly onto `outbox` before
    /// returning the new subscription's id.
    pub async fn attach_viewer(
        &self,
        last_seq: u64,
        outbox: Arc<Outbox<ViewerOutbound>>,
    ) -> HubResult<ViewerId> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AttachViewer { last_seq, outbox, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session channel dropped reply"))
    }

    pub async fn detach_viewer(&self, viewer_id: ViewerId) {
        let _ = self.tx.send(Command::DetachViewer { viewer_id }).await;
    }

    /// Gap recovery (spec §4.3 "Gap recovery"): resend a compacted
    /// `session_active` snapshot, then resume live fan-out.
    pub async fn resync(&self, viewer_id: ViewerId, last_seq: u64) -> HubResult<()> {
        self.send(Command::Resync { viewer_id, last_seq }).await
    }

    pub async fn forward_to_producer(&self, command: ViewerCommand) -> HubResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ForwardToProducer { command, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session channel dropped reply"))?
    }

    /// `AttachProducer` (spec §4.2): binds a new producer connection.
    /// Returns the assigned `conn_id`, used to scope subsequent `ingest`
    /// calls and to detect a stale `unbind`.
    pub async fn bind_producer(
        &self,
        runner_id: RunnerId,
        outbox: Arc<Outbox<ViewerCommand>>,
    ) -> HubResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::BindProducer { runner_id, outbox, reply }).await?;
        rx.await.map_err(|_| HubError::internal("session channel dropped reply"))?
    }

    pub async fn unbind_producer(&self, conn_id: u64) {
        let _ = self.tx.send(Command::UnbindProducer { conn_id }).await;
    }

    pub async fn end_session(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::EndSession { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Read-only snapshot of header + compacted state + log tail, used by
    /// `ListSessionsForUser` and REST status endpoints.
    pub async fn snapshot(&self) -> HubResult<(Session, SessionSnapshot, u64)> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| HubError::internal("session channel dropped reply"))
    }

    /// Worker restart adoption (spec §4.2 "Restart semantics"): the runner
    /// respawned the worker under the same `sessionId` after exit code 43.
    /// Injects the synthetic `cli_error` -> `session_active` pair subscribers
    /// see across the gap, without requiring a producer to be bound yet.
    pub async fn restart_notice(&self) {
        let _ = self.tx.send(Command::RestartNotice).await;
    }

    async fn send(&self, cmd: Command) -> HubResult<()> {
        self.tx.send(cmd).await.map_err(|_| HubError::internal("session channel closed"))
    }
}

/// Spawn a `SessionChannel` actor and return a handle to it.
///
/// `initial_log`/`initial_snapshot` seed state rehydrated from disk (spec
/// §4.7); pass an empty log and `SessionSnapshot::default()` for a brand
/// new session.
pub fn spawn(
    header: Session,
    initial_log: Vec<Event>,
    initial_snapshot: SessionSnapshot,
    config: Arc<HubConfig>,
    persistence: PersistenceHandle,
    shutdown: CancellationToken,
) -> SessionChannelHandle {
    let (tx, rx) = mpsc::channel(256);
    let actor = SessionChannel {
        header,
        log: initial_log,
        snapshot: initial_snapshot,
        subscribers: HashMap::new(),
        next_viewer_id: 1,
        producer: None,
        next_conn_id: 1,
        last_heartbeat_at: None,
        ending_since: None,
        coalescer: Coalescer::new(),
        persistence,
        config,
    };
    tokio::spawn(actor.run(rx, shutdown));
    SessionChannelHandle { tx }
}

struct SessionChannel {
    header: Session,
    log: Vec<Event>,
    snapshot: SessionSnapshot,
    subscribers: HashMap<ViewerId, Subscriber>,
    next_viewer_id: ViewerId,
    producer: Option<ProducerBinding>,
    next_conn_id: u64,
    last_heartbeat_at: Option<Instant>,
    /// When the current `Ending` grace window started (spec §4.2
    /// `EndSession`); `None` outside that state.
    ending_since: Option<Instant>,
    coalescer: Coalescer,
    persistence: PersistenceHandle,
    config: Arc<HubConfig>,
}

impl SessionChannel {
    async fn run(mut self, mut mailbox: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        // Seed a `.snap` immediately so a rehydration after a crash before
        // the first 64-event boundary still finds a header (spec §4.7).
        self.persistence.snapshot(self.log.len() as u64, self.header.clone(), self.snapshot.clone());

        let mut coalesce_tick = tokio::time::interval(self.config.coalesce_interval());
        coalesce_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
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
                _ = coalesce_tick.tick() => self.flush_coalesced(),
                _ = deadline_tick.tick() => self.check_deadlines(),
            }
            if self.header.state.is_terminal() {
                break;
            }
        }

        self.flush_coalesced();
        self.persist_snapshot();
        self.close_all_subscribers();
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Ingest { conn_id, kind, ts, reply } => {
                let result = self.ingest(conn_id, kind, ts);
                let _ = reply.send(result);
            }
            Command::AttachViewer { last_seq, outbox, reply } => {
                let id = self.attach_viewer(last_seq, outbox);
                let _ = reply.send(id);
            }
            Command::DetachViewer { viewer_id } => {
                self.subscribers.remove(&viewer_id);
            }
            Command::Resync { viewer_id, last_seq } => {
                self.resync(viewer_id, last_seq);
            }
            Command::ForwardToProducer { command, reply } => {
                let result = self.forward_to_producer(command);
                let _ = reply.send(result);
            }
            Command::BindProducer { runner_id, outbox, reply } => {
                let result = self.bind_producer(runner_id, outbox);
                let _ = reply.send(result);
            }
            Command::UnbindProducer { conn_id } => {
                self.unbind_producer(conn_id);
            }
            Command::EndSession { reply } => {
                self.end_session();
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send((self.header.clone(), self.snapshot.clone(), self.log.len() as u64));
            }
            Command::RestartNotice => self.restart_notice(),
        }
    }

    fn ingest(&mut self, conn_id: u64, kind: ProducerEvent, ts: Option<i64>) -> HubResult<()> {
        match &self.producer {
            Some(p) if p.conn_id == conn_id => {}
            _ => return Err(HubError::Forbidden),
        }

        let seq = self.log.len() as u64 + 1;
        let event = Event { seq, ts, ingest_ts: epoch_ms(), kind };

        if event.kind.updates_header() {
            self.apply_header_update(&event.kind);
        }
        snapshot::apply(&mut self.snapshot, &event);
        // `sessionName` is last-writer-wins across `heartbeat` and
        // `exec_result{command:"set_session_name"}` (spec §9 Open Question,
        // resolved SPEC_FULL §9.3): the snapshot fold above already applies
        // whichever one this event was, so the header just mirrors it.
        if self.snapshot.session_name.is_some() {
            self.header.session_name = self.snapshot.session_name.clone();
        }
        self.persistence.append(event.clone());
        self.log.push(event.clone());

        if self.log.len() as u64 % self.config.snapshot_interval_events() == 0 {
            self.persist_snapshot();
        }

        if matches!(event.kind, ProducerEvent::Heartbeat { .. }) {
            self.last_heartbeat_at = Some(Instant::now());
        }

        if self.coalescer.push(event) {
            self.flush_coalesced();
        }
        Ok(())
    }

    fn apply_header_update(&mut self, kind: &ProducerEvent) {
        match kind {
            ProducerEvent::Heartbeat { active, .. } => {
                self.header.state =
                    if *active { SessionState::Live } else { self.header.state };
            }
            ProducerEvent::ModelSelect { model } => {
                self.header.model = Some(model.clone());
            }
            ProducerEvent::Capabilities { .. } => {}
            _ => {}
        }
    }

    fn attach_viewer(&mut self, last_seq: u64, outbox: Arc<Outbox<ViewerOutbound>>) -> ViewerId {
        let id = self.next_viewer_id;
        self.next_viewer_id += 1;

        let tail = self.log.len() as u64;
        outbox.push(ViewerOutbound::Connected {
            is_active: self.snapshot.is_active,
            session_name: self.header.session_name.clone(),
            last_seq: tail,
        });

        let delivered = if last_seq < tail {
            let from = last_seq as usize;
            outbox.push(ViewerOutbound::Events(self.log[from..].to_vec()));
            tail
        } else {
            last_seq.min(tail)
        };

        self.subscribers.insert(id, Subscriber { last_seq_delivered: delivered, outbox });
        id
    }

    /// The synthetic `session_active` frame is informational, not a new
    /// event of its own, so it's stamped with the viewer's own `lastSeq`
    /// (clamped to `tail`) rather than minting or reusing a log `seq` —
    /// otherwise it would collide with the real event already occupying
    /// `seq == tail` once that gets resent below, duplicating a `seq` the
    /// viewer would see (spec §8 property 1).
    fn resync(&mut self, viewer_id: ViewerId, last_seq: u64) {
        let Some(sub) = self.subscribers.get_mut(&viewer_id) else { return };
        let tail = self.log.len() as u64;
        let synthetic_seq = last_seq.min(tail);
        sub.outbox.push(ViewerOutbound::Events(vec![Event {
            seq: synthetic_seq,
            ts: None,
            ingest_ts: epoch_ms(),
            kind: ProducerEvent::SessionActive { reason: None, snapshot: Some(self.snapshot.clone()) },
        }]));
        if last_seq < tail {
            let from = last_seq as usize;
            if from < self.log.len() {
                sub.outbox.push(ViewerOutbound::Events(self.log[from..].to_vec()));
            }
        }
        sub.last_seq_delivered = tail;
    }

    fn forward_to_producer(&self, command: ViewerCommand) -> HubResult<()> {
        let Some(producer) = &self.producer else { return Err(HubError::RunnerUnavailable) };
        producer.outbox.push(command);
        Ok(())
    }

    fn bind_producer(&mut self, runner_id: RunnerId, outbox: Arc<Outbox<ViewerCommand>>) -> HubResult<u64> {
        if self.header.runner_id != runner_id {
            return Err(HubError::RunnerMismatch);
        }
        if self.producer.is_some() {
            return Err(HubError::AlreadyBound);
        }
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        self.producer = Some(ProducerBinding { conn_id, runner_id, outbox });
        self.header.state = SessionState::Live;
        self.last_heartbeat_at = Some(Instant::now());
        Ok(conn_id)
    }

    fn unbind_producer(&mut self, conn_id: u64) {
        if self.producer.as_ref().is_some_and(|p| p.conn_id == conn_id) {
            self.producer = None;
            // The producer detaching is one of the two ways out of the
            // `EndSession` grace window (spec §4.2): it already happened, so
            // there's nothing left to wait out.
            if self.header.state == SessionState::Ending {
                self.header.state = SessionState::Terminated;
            } else if !self.header.state.is_terminal() {
                self.header.state = SessionState::Idle;
            }
        }
    }

    /// `EndSession` (spec §4.2): transitions to `terminated` once the
    /// producer detaches or the grace deadline elapses, whichever comes
    /// first — not synchronously, so a producer mid-flush gets a chance to
    /// wind down instead of having its session torn out from under it.
    fn end_session(&mut self) {
        if let Some(producer) = &self.producer {
            producer.outbox.push(ViewerCommand::Exec {
                command: "end_session".to_owned(),
                args: serde_json::Value::Null,
            });
            self.header.state = SessionState::Ending;
            self.ending_since = Some(Instant::now());
        } else {
            self.header.state = SessionState::Terminated;
        }
    }

    /// Heartbeat deadline checks (spec §4.3 "Heartbeat"): 30s gap -> idle +
    /// synthetic `disconnected`; 60s further (producer socket already gone)
    /// -> terminate. Also the other half of `EndSession`'s grace window
    /// (spec §4.2): if the producer hasn't detached on its own within
    /// `end_session_grace()`, terminate anyway.
    fn check_deadlines(&mut self) {
        if let Some(ending_since) = self.ending_since {
            if self.header.state == SessionState::Ending
                && ending_since.elapsed() >= self.config.end_session_grace()
            {
                self.header.state = SessionState::Terminated;
            }
        }

        let Some(last) = self.last_heartbeat_at else { return };
        let elapsed = last.elapsed();

        if elapsed >= self.config.heartbeat_idle_deadline()
            && self.header.state == SessionState::Live
        {
            self.header.state = SessionState::Idle;
            self.snapshot.is_active = false;
            let seq = self.log.len() as u64 + 1;
            let event = Event {
                seq,
                ts: None,
                ingest_ts: epoch_ms(),
                kind: ProducerEvent::Disconnected { reason: Some("heartbeat timeout".to_owned()) },
            };
            self.log.push(event.clone());
            self.persistence.append(event.clone());
            self.broadcast_immediate(vec![event]);
        }

        if elapsed >= self.config.heartbeat_terminate_deadline() && self.producer.is_none() {
            self.header.state = SessionState::Terminated;
        }

        if let Some(expires_at) = self.header.expires_at {
            if self.header.is_ephemeral && epoch_ms() >= expires_at {
                self.header.state = SessionState::Terminated;
            }
        }
    }

    fn flush_coalesced(&mut self) {
        if self.coalescer.is_empty() {
            return;
        }
        let batch = self.coalescer.drain();
        self.broadcast_immediate(batch);
    }

    /// Deliver `batch` to every subscriber: caught-up subscribers get the
    /// batch itself; anyone behind gets their full missing range from the
    /// authoritative log instead (a superset, never a gap).
    fn broadcast_immediate(&mut self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let batch_start = batch[0].seq;
        let batch_end = batch[batch.len() - 1].seq;

        for sub in self.subscribers.values_mut() {
            if sub.last_seq_delivered + 1 == batch_start {
                sub.outbox.push(ViewerOutbound::Events(batch.clone()));
                sub.last_seq_delivered = batch_end;
            } else if sub.last_seq_delivered < batch_end {
                let from = sub.last_seq_delivered as usize;
                if from < self.log.len() {
                    sub.outbox.push(ViewerOutbound::Events(self.log[from..].to_vec()));
                }
                sub.last_seq_delivered = batch_end;
            }
        }
    }

    /// Restart adoption (spec §4.2 "Restart semantics", §8 Scenario C): the
    /// runner respawned the worker under this session's id after exit code
    /// 43. Appends a synthetic `cli_error` immediately followed by a
    /// `session_active` carrying the current compacted snapshot, so viewers
    /// see the gap and resume without a resync round trip. No producer
    /// needs to be bound yet — the worker's real `bind_producer` call
    /// follows once its control socket reconnects.
    fn restart_notice(&mut self) {
        let error_seq = self.log.len() as u64 + 1;
        let error_event = Event {
            seq: error_seq,
            ts: None,
            ingest_ts: epoch_ms(),
            kind: ProducerEvent::CliError {
                message: "worker restarted".to_owned(),
                source: Some("runner".to_owned()),
            },
        };
        self.log.push(error_event.clone());
        self.persistence.append(error_event.clone());

        let active_seq = error_seq + 1;
        let active_event = Event {
            seq: active_seq,
            ts: None,
            ingest_ts: epoch_ms(),
            kind: ProducerEvent::SessionActive {
                reason: Some("restart".to_owned()),
                snapshot: Some(self.snapshot.clone()),
            },
        };
        self.log.push(active_event.clone());
        self.persistence.append(active_event.clone());

        self.header.state = SessionState::Idle;
        self.snapshot.is_active = false;
        self.last_heartbeat_at = Some(Instant::now());
        self.broadcast_immediate(vec![error_event, active_event]);
    }

    fn persist_snapshot(&self) {
        self.persistence.snapshot(self.log.len() as u64, self.header.clone(), self.snapshot.clone());
    }

    fn close_all_subscribers(&self) {
        for sub in self.subscribers.values() {
            sub.outbox.close();
        }
        if let Some(producer) = &self.producer {
            producer.outbox.close();
        }
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
