// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Correlates the proxied REST endpoints (spec §6 `recent-folders`, `files`,
//! `read-file`, `git-status`, `git-diff`) with their `proxy_response` on the
//! runner's control socket. The hub stamps a fresh `request_id` per call and
//! parks a oneshot here; `transport::ws_runner` resolves it when the
//! matching `ProxyResponse` frame arrives, or it's dropped unresolved after
//! the 60 s exec round-trip deadline (spec §5 "Cancellation & timeouts").

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use uuid::Uuid;

pub type ProxyOutcome = Result<serde_json::Value, String>;

#[derive(Default)]
pub struct ProxyTable {
    pending: Mutex<HashMap<String, oneshot::Sender<ProxyOutcome>>>,
}

impl ProxyTable {
    /// Mint a fresh `request_id` and park a receiver for its eventual reply.
    pub fn register(&self) -> (String, oneshot::Receiver<ProxyOutcome>) {
        let request_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(request_id.clone(), tx);
        (request_id, rx)
    }

    /// Resolve a pending request. A no-op if the caller already timed out
    /// and dropped its receiver, or `request_id` is unknown.
    pub fn resolve(&self, request_id: &str, outcome: ProxyOutcome) {
        if let Some(tx) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(request_id) {
            let _ = tx.send(outcome);
        }
    }
}
