// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared state handed to every Axum handler: the three registry handles
//! plus cross-cutting concerns (config, shutdown, connection caps) that
//! don't belong to any one registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;
use crate::ids::UserId;
use crate::registry::runner::RunnerRegistryHandle;
use crate::registry::session::SessionRegistryHandle;
use crate::registry::terminal::TerminalBrokerHandle;
use crate::transport::proxy::ProxyTable;

/// The peer class a connection slot is counted against (spec §4.1
/// "Backpressure" implies distinct limits per surface; each class gets its
/// own counter bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerClass {
    Viewer,
    Terminal,
    Hub,
}

impl PeerClass {
    fn label(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Terminal => "terminal",
            Self::Hub => "hub",
        }
    }
}

/// Per-principal, per-peer-class concurrent connection limiter (spec §6
/// `PIZZAPI_MAX_CONNECTIONS_PER_PRINCIPAL`). A guard decrements on drop so a
/// socket that closes for any reason — clean close, panic, IO error — always
/// frees its slot.
#[derive(Default)]
pub struct ConnectionCaps {
    counts: Mutex<HashMap<(String, &'static str), usize>>,
}

pub struct ConnectionGuard {
    caps: Arc<ConnectionCaps>,
    key: (String, &'static str),
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut counts = self.caps.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = counts.get_mut(&self.key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.remove(&self.key);
            }
        }
    }
}

impl ConnectionCaps {
    /// Attempts to reserve a slot for `user_id` in `class`, failing once
    /// `max` concurrent connections of that class are already open for that
    /// principal.
    pub fn try_acquire(
        self: &Arc<Self>,
        user_id: &UserId,
        class: PeerClass,
        max: usize,
    ) -> Option<ConnectionGuard> {
        let key = (user_id.as_str().to_owned(), class.label());
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let entry = counts.entry(key.clone()).or_insert(0);
        if *entry >= max {
            return None;
        }
        *entry += 1;
        Some(ConnectionGuard { caps: self.clone(), key })
    }
}

/// Shared hub state (spec §4 "Components").
pub struct HubState {
    pub config: Arc<HubConfig>,
    pub shutdown: CancellationToken,
    pub session_registry: SessionRegistryHandle,
    pub runner_registry: RunnerRegistryHandle,
    pub terminal_broker: TerminalBrokerHandle,
    pub connection_caps: Arc<ConnectionCaps>,
    pub proxy_table: ProxyTable,
}
