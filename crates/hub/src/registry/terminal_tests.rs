// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use base64::Engine as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::session::outbox::Outbox;

fn test_config() -> Arc<HubConfig> {
    Arc::new(HubConfig::parse_from(["pizzapi-hub"]))
}

/// Runner Registry + Terminal Broker wired together, with one
/// terminal-capable runner (`r1`, owned by `owner`, scoped to `/home/owner`)
/// already registered.
async fn spawn_test() -> (TerminalBrokerHandle, RunnerRegistryHandle) {
    let config = test_config();
    let shutdown = CancellationToken::new();
    let runner_registry = crate::registry::runner::spawn(config.clone(), shutdown.clone());
    let terminal_broker = spawn(config, runner_registry.clone(), shutdown);

    let outbox = Outbox::new(8);
    runner_registry
        .register(
            RunnerId::from("r1".to_owned()),
            "secret".to_owned(),
            UserId::from("owner".to_owned()),
            "laptop".to_owned(),
            vec!["/home/owner".to_owned()],
            Vec::new(),
            true,
            outbox,
        )
        .await
        .unwrap();

    (terminal_broker, runner_registry)
}

#[tokio::test]
async fn create_terminal_against_non_terminal_capable_runner_is_rejected() {
    let config = test_config();
    let shutdown = CancellationToken::new();
    let runner_registry = crate::registry::runner::spawn(config.clone(), shutdown.clone());
    let terminal_broker = spawn(config, runner_registry.clone(), shutdown);

    let outbox = Outbox::new(8);
    runner_registry
        .register(
            RunnerId::from("r1".to_owned()),
            "secret".to_owned(),
            UserId::from("owner".to_owned()),
            "laptop".to_owned(),
            Vec::new(),
            Vec::new(),
            false,
            outbox,
        )
        .await
        .unwrap();

    let result = terminal_broker
        .create_terminal(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, 80, 24, None)
        .await;
    assert!(matches!(result, Err(HubError::RunnerUnavailable)));
}

#[tokio::test]
async fn create_terminal_rejects_cwd_outside_roots() {
    let (terminals, _runners) = spawn_test().await;
    let result = terminals
        .create_terminal(
            UserId::from("owner".to_owned()),
            RunnerId::from("r1".to_owned()),
            Some("/etc".to_owned()),
            80,
            24,
            None,
        )
        .await;
    assert!(matches!(result, Err(HubError::CwdOutsideRoots)));
}

#[tokio::test]
async fn attach_viewer_flushes_scrollback_accumulated_from_producer() {
    let (terminals, _runners) = spawn_test().await;
    let terminal_id = terminals
        .create_terminal(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, 80, 24, None)
        .await
        .unwrap();

    let producer_outbox = Outbox::new(8);
    terminals.bind_producer(terminal_id.clone(), producer_outbox).await.unwrap();
    terminals
        .from_producer(terminal_id.clone(), TerminalFrame::TerminalData { data: BASE64.encode(b"hello") })
        .await;

    let viewer_outbox = Outbox::new(8);
    terminals.attach_viewer(terminal_id, UserId::from("owner".to_owned()), false, viewer_outbox.clone()).await.unwrap();

    let batch = viewer_outbox.recv_batch().await.unwrap();
    assert!(matches!(batch[0], TerminalFrame::TerminalConnected { .. }));
    let TerminalFrame::TerminalData { data } = &batch[1] else { panic!("expected scrollback data frame") };
    assert_eq!(BASE64.decode(data).unwrap(), b"hello");
}

#[tokio::test]
async fn attach_viewer_on_unknown_terminal_is_not_found() {
    let (terminals, _runners) = spawn_test().await;
    let outbox = Outbox::new(8);
    let result = terminals
        .attach_viewer(TerminalId::from("t_ghost".to_owned()), UserId::from("owner".to_owned()), false, outbox)
        .await;
    assert!(matches!(result, Err(HubError::NotFound)));
}

#[tokio::test]
async fn viewer_resize_updates_geometry_and_forwards_to_producer() {
    let (terminals, _runners) = spawn_test().await;
    let terminal_id = terminals
        .create_terminal(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, 80, 24, None)
        .await
        .unwrap();

    let producer_outbox = Outbox::new(8);
    terminals.bind_producer(terminal_id.clone(), producer_outbox.clone()).await.unwrap();

    terminals.from_viewer(terminal_id.clone(), TerminalFrame::TerminalResize { cols: 120, rows: 40 }).await;
    let batch = producer_outbox.recv_batch().await.unwrap();
    assert!(matches!(batch[0], TerminalFrame::TerminalResize { cols: 120, rows: 40 }));

    let viewer_outbox = Outbox::new(8);
    terminals.attach_viewer(terminal_id, UserId::from("owner".to_owned()), false, viewer_outbox.clone()).await.unwrap();
    let batch = viewer_outbox.recv_batch().await.unwrap();
    assert!(matches!(batch[1], TerminalFrame::TerminalReady { cols: 120, rows: 40 }));
}

#[tokio::test]
async fn terminal_exit_from_producer_frees_the_terminal() {
    let (terminals, _runners) = spawn_test().await;
    let terminal_id = terminals
        .create_terminal(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, 80, 24, None)
        .await
        .unwrap();

    let producer_outbox = Outbox::new(8);
    terminals.bind_producer(terminal_id.clone(), producer_outbox).await.unwrap();
    terminals.from_producer(terminal_id.clone(), TerminalFrame::TerminalExit { exit_code: 0 }).await;
    tokio::task::yield_now().await;

    let outbox = Outbox::new(8);
    let result = terminals.attach_viewer(terminal_id, UserId::from("owner".to_owned()), false, outbox).await;
    assert!(matches!(result, Err(HubError::NotFound)));
}
