// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistence shim (spec §4.7): append-only `<sessionId>.log` JSONL
//! transcripts plus a periodic `<sessionId>.snap` compacted snapshot, so a
//! restarted hub can rehydrate sessions into `Idle` and serve viewers in
//! replay-only mode until a producer returns.
//!
//! Writes are asynchronous and may lag the in-memory log by up to the
//! snapshot interval (spec §5): a crash loses at most the unpersisted tail,
//! which replay semantics already tolerate. A slow disk must never block
//! ingest, so the `SessionChannel` actor only ever enqueues onto an
//! unbounded mpsc here and moves on.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec::{Event, SessionSnapshot};
use crate::ids::SessionId;
use crate::model::Session;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct PersistedSnapshot {
    seq: u64,
    header: Session,
    snapshot: SessionSnapshot,
}

enum PersistMsg {
    Append(Box<Event>),
    Snapshot(Box<PersistedSnapshot>),
}

/// Handle the `SessionChannel` actor holds to enqueue writes. Cloning is
/// cheap; `disabled()` gives a no-op handle for tests that don't care about
/// disk state.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: Option<mpsc::UnboundedSender<PersistMsg>>,
}

impl PersistenceHandle {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Spawn the writer task for one session's pair of files and return a
    /// handle to it. The task exits once `shutdown` fires and the queue
    /// drains, or once every sender handle is dropped.
    pub fn spawn(dir: PathBuf, session_id: SessionId, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(dir, session_id, rx, shutdown));
        Self { tx: Some(tx) }
    }

    pub fn append(&self, event: Event) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(PersistMsg::Append(Box::new(event)));
        }
    }

    pub fn snapshot(&self, seq: u64, header: Session, snapshot: SessionSnapshot) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(PersistMsg::Snapshot(Box::new(PersistedSnapshot {
                seq,
                header,
                snapshot,
            })));
        }
    }
}

async fn run_writer(
    dir: PathBuf,
    session_id: SessionId,
    mut rx: mpsc::UnboundedReceiver<PersistMsg>,
    shutdown: CancellationToken,
) {
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        tracing::warn!(session_id = %session_id, err = %e, "failed to create persistence dir");
        return;
    }
    let log_path = log_path(&dir, &session_id);
    let snap_path = snap_path(&dir, &session_id);

    let mut log_file = match tokio::fs::OpenOptions::new().create(true).append(true).open(&log_path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(session_id = %session_id, err = %e, "failed to open session log");
            return;
        }
    };

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    PersistMsg::Append(event) => {
                        if let Ok(mut line) = serde_json::to_vec(&event) {
                            line.push(b'\n');
                            if let Err(e) = log_file.write_all(&line).await {
                                tracing::warn!(session_id = %session_id, err = %e, "session log append failed");
                            }
                        }
                    }
                    PersistMsg::Snapshot(snap) => {
                        write_snapshot_atomic(&snap_path, &snap).await;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                rx.close();
                while let Ok(msg) = rx.try_recv() {
                    if let PersistMsg::Append(event) = msg {
                        if let Ok(mut line) = serde_json::to_vec(&event) {
                            line.push(b'\n');
                            let _ = log_file.write_all(&line).await;
                        }
                    }
                }
                let _ = log_file.flush().await;
                break;
            }
        }
    }
}

async fn write_snapshot_atomic(path: &Path, snap: &PersistedSnapshot) {
    let Ok(bytes) = serde_json::to_vec_pretty(snap) else { return };
    let tmp = path.with_extension("snap.tmp");
    if tokio::fs::write(&tmp, &bytes).await.is_ok() {
        let _ = tokio::fs::rename(&tmp, path).await;
    }
}

fn log_path(dir: &Path, session_id: &SessionId) -> PathBuf {
    dir.join(format!("{}.log", session_id.as_str()))
}

fn snap_path(dir: &Path, session_id: &SessionId) -> PathBuf {
    dir.join(format!("{}.snap", session_id.as_str()))
}

/// A session rehydrated from disk at boot, not yet adopted into the
/// registry (spec §4.7 "On boot the hub scans the directory...").
pub struct RehydratedSession {
    pub header: Session,
    pub events: Vec<Event>,
    pub snapshot: SessionSnapshot,
}

/// Scan `<dataDir>/sessions` for `.log`/`.snap` pairs and rehydrate each
/// into an `Idle` session (no producer bound). Sessions whose `.meta`
/// (carried inside `.snap`) can't be read are logged and skipped — a single
/// corrupt session quarantines itself, not the whole boot (spec §7
/// "Process-fatal errors ... the affected session is quarantined").
pub async fn scan_and_rehydrate(dir: &Path) -> Vec<RehydratedSession> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(_) => return out,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        let session_id = SessionId::from(stem.to_owned());

        let events = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_jsonl(&contents),
            Err(e) => {
                tracing::warn!(session_id = %session_id, err = %e, "failed to read session log");
                continue;
            }
        };

        let snap_path = snap_path(dir, &session_id);
        let persisted: Option<PersistedSnapshot> = match tokio::fs::read(&snap_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).ok(),
            Err(_) => None,
        };

        let (header, snapshot) = match persisted {
            Some(p) if p.seq as usize == events.len() => (p.header, p.snapshot),
            Some(p) => (p.header, crate::session::snapshot::fold_all(&events)),
            None => {
                tracing::warn!(session_id = %session_id, "no snapshot header found, skipping orphaned log");
                continue;
            }
        };

        out.push(RehydratedSession { header, events, snapshot });
    }

    out
}

fn parse_jsonl(contents: &str) -> Vec<Event> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[cfg(test)]
#[path = "persistence_tests.rs"]
mod tests;
