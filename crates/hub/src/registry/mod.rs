// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The three process-wide serializers (spec §5): Runner Registry, Session
//! Registry, Terminal Broker. Each owns one global map behind a single
//! `mpsc` mailbox, the same shape `session::channel` uses per-session.

pub mod runner;
pub mod session;
pub mod terminal;
