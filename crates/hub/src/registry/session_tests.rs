// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::session::outbox::Outbox;

fn test_config() -> Arc<HubConfig> {
    Arc::new(HubConfig::parse_from(["pizzapi-hub", "--coalesce-ms", "5"]))
}

/// Spins up a real Runner Registry plus Session Registry wired together, the
/// same boot order `lib::run` uses, and registers one runner (`r1`, owned by
/// `owner`, scoped to `/home/owner`).
async fn spawn_test() -> (SessionRegistryHandle, RunnerRegistryHandle) {
    let config = test_config();
    let shutdown = CancellationToken::new();
    let runner_registry = crate::registry::runner::spawn(config.clone(), shutdown.clone());
    let session_registry = spawn(config, runner_registry.clone(), false, PathBuf::new(), shutdown, Vec::new());
    runner_registry.set_session_registry(session_registry.clone()).await;

    let outbox = Outbox::new(8);
    runner_registry
        .register(
            RunnerId::from("r1".to_owned()),
            "secret".to_owned(),
            UserId::from("owner".to_owned()),
            "laptop".to_owned(),
            vec!["/home/owner".to_owned()],
            Vec::new(),
            false,
            outbox,
        )
        .await
        .unwrap();

    (session_registry, runner_registry)
}

#[tokio::test]
async fn create_session_against_unknown_runner_is_not_found() {
    let (sessions, _runners) = spawn_test().await;
    let result = sessions
        .create_session(UserId::from("owner".to_owned()), RunnerId::from("ghost".to_owned()), None, None, None)
        .await;
    assert!(matches!(result, Err(HubError::NotFound)));
}

#[tokio::test]
async fn create_session_rejects_cwd_outside_roots_for_non_owner() {
    let (sessions, _runners) = spawn_test().await;
    let result = sessions
        .create_session(
            UserId::from("someone-else".to_owned()),
            RunnerId::from("r1".to_owned()),
            Some("/etc".to_owned()),
            None,
            None,
        )
        .await;
    assert!(matches!(result, Err(HubError::CwdOutsideRoots)));
}

#[tokio::test]
async fn create_session_resolves_once_runner_sends_session_ready() {
    let config = Arc::new(HubConfig::parse_from(["pizzapi-hub", "--coalesce-ms", "5"]));
    let shutdown = CancellationToken::new();
    let runner_registry = crate::registry::runner::spawn(config.clone(), shutdown.clone());
    let sessions = spawn(config, runner_registry.clone(), false, PathBuf::new(), shutdown, Vec::new());
    runner_registry.set_session_registry(sessions.clone()).await;

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
            outbox.clone(),
        )
        .await
        .unwrap();

    let sessions2 = sessions.clone();
    let spawn_task = tokio::spawn(async move {
        sessions2.create_session(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, None, None).await
    });

    // The runner's control socket receives the `new_session` dispatch.
    let dispatched = outbox.recv_batch().await.unwrap();
    let RunnerFrame::NewSession { session_id, .. } = &dispatched[0] else { panic!("expected new_session") };
    sessions.handle_runner_frame(RunnerFrame::SessionReady { session_id: session_id.clone() }).await;

    let result = spawn_task.await.unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn session_error_reply_removes_pending_session_and_decrements_count() {
    let (sessions, runners) = spawn_test().await;

    let sessions2 = sessions.clone();
    let spawn_task = tokio::spawn(async move {
        sessions2.create_session(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, None, None).await
    });

    tokio::task::yield_now().await;
    let listed = sessions.list_sessions_for_user(UserId::from("owner".to_owned()), false).await;
    let session_id = listed[0].session_id.clone();

    sessions.handle_runner_frame(RunnerFrame::SessionError {
        session_id: session_id.to_string(),
        message: "spawn failed".to_owned(),
    }).await;

    let result = spawn_task.await.unwrap();
    assert!(result.is_err());

    let info = runners.get(RunnerId::from("r1".to_owned())).await.unwrap();
    assert_eq!(info.session_count, 0);
}

#[tokio::test]
async fn list_sessions_for_user_is_scoped_to_owner_unless_admin() {
    let (sessions, _runners) = spawn_test().await;

    let sessions2 = sessions.clone();
    tokio::spawn(async move {
        let _ = sessions2
            .create_session(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, None, None)
            .await;
    });
    tokio::task::yield_now().await;

    let as_owner = sessions.list_sessions_for_user(UserId::from("owner".to_owned()), false).await;
    assert_eq!(as_owner.len(), 1);

    let as_stranger = sessions.list_sessions_for_user(UserId::from("stranger".to_owned()), false).await;
    assert!(as_stranger.is_empty());

    let as_admin = sessions.list_sessions_for_user(UserId::from("stranger".to_owned()), true).await;
    assert_eq!(as_admin.len(), 1);
}

#[tokio::test]
async fn attach_viewer_on_unknown_session_is_not_found() {
    let (sessions, _runners) = spawn_test().await;
    let outbox = Outbox::new(8);
    let result = sessions
        .attach_viewer(SessionId::from("s_ghost".to_owned()), UserId::from("owner".to_owned()), false, 0, outbox)
        .await;
    assert!(matches!(result, Err(HubError::NotFound)));
}

#[tokio::test]
async fn attach_producer_requires_runner_id_match() {
    let (sessions, _runners) = spawn_test().await;

    let sessions2 = sessions.clone();
    tokio::spawn(async move {
        let _ = sessions2
            .create_session(UserId::from("owner".to_owned()), RunnerId::from("r1".to_owned()), None, None, None)
            .await;
    });
    tokio::task::yield_now().await;

    let listed = sessions.list_sessions_for_user(UserId::from("owner".to_owned()), false).await;
    let session_id = listed[0].session_id.clone();

    let outbox = Outbox::new(8);
    let result = sessions.attach_producer(session_id, RunnerId::from("wrong-runner".to_owned()), outbox).await;
    assert!(matches!(result, Err(HubError::RunnerMismatch)));
}
