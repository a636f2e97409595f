// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::Parser;

fn parse(args: &[&str]) -> HubConfig {
    HubConfig::parse_from(std::iter::once("pizzapi-hub").chain(args.iter().copied()))
}

#[test]
fn defaults_bind_to_configured_port() {
    let cfg = parse(&[]);
    assert_eq!(cfg.port, 7420);
    assert_eq!(cfg.addr(), "0.0.0.0:7420");
}

#[test]
fn coalesce_interval_matches_configured_ms() {
    let cfg = parse(&["--coalesce-ms", "8"]);
    assert_eq!(cfg.coalesce_interval().as_millis(), 8);
}

#[test]
fn deadlines_match_spec_section_5() {
    let cfg = parse(&[]);
    assert_eq!(cfg.spawn_reply_deadline().as_secs(), 30);
    assert_eq!(cfg.exec_round_trip_deadline().as_secs(), 60);
    assert_eq!(cfg.heartbeat_idle_deadline().as_secs(), 30);
    assert_eq!(cfg.heartbeat_terminate_deadline().as_secs(), 60);
    assert_eq!(cfg.runner_ping_deadline().as_secs(), 45);
    assert_eq!(cfg.viewer_send_flush_deadline().as_secs(), 5);
    assert_eq!(cfg.end_session_grace().as_secs(), 10);
    assert_eq!(cfg.terminal_kill_deadline().as_secs(), 10);
}
