// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Hub wall-clock helpers. Every deadline in spec §5 is server-wall-clock,
//! not dependent on peer timestamps, so this is the single place that reads
//! the system clock for event `ingestTs` stamping and expiry checks.

/// Current epoch milliseconds.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
