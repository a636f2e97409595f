// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn restricted_runner_rejects_outside_cwd() {
    let roots = vec!["/home/alice/project".to_string()];
    assert!(cwd_within_roots(Some("/home/alice/project"), &roots));
    assert!(cwd_within_roots(Some("/home/alice/project/src"), &roots));
    assert!(!cwd_within_roots(Some("/home/alice/project-evil"), &roots));
    assert!(!cwd_within_roots(Some("/home/bob"), &roots));
}

#[test]
fn restricted_runner_allows_missing_cwd() {
    assert!(cwd_within_roots(None, &["/tmp".to_string()]));
}

#[test]
fn unscoped_runner_allows_owner_any_cwd() {
    assert!(cwd_allowed(Some("/anywhere"), &[], true));
    assert!(cwd_allowed(None, &[], true));
}

#[test]
fn unscoped_runner_restricts_non_owner_to_no_cwd() {
    assert!(cwd_allowed(None, &[], false));
    assert!(!cwd_allowed(Some("/etc"), &[], false));
}

#[test]
fn scoped_runner_policy_ignores_ownership() {
    let roots = vec!["/tmp".to_string()];
    assert!(cwd_allowed(Some("/tmp/work"), &roots, false));
    assert!(!cwd_allowed(Some("/etc"), &roots, true));
}

#[test]
fn ephemeral_session_expires_after_deadline() {
    let session = Session {
        session_id: SessionId::new(),
        user_id: UserId::from("u1".to_string()),
        runner_id: RunnerId::from("alpha".to_string()),
        cwd: None,
        started_at: 1_000,
        model: None,
        session_name: None,
        is_ephemeral: true,
        expires_at: Some(2_000),
        state: SessionState::Live,
    };
    assert!(!session.is_expired(1_999));
    assert!(session.is_expired(2_000));
}

#[test]
fn non_ephemeral_session_never_expires() {
    let session = Session {
        session_id: SessionId::new(),
        user_id: UserId::from("u1".to_string()),
        runner_id: RunnerId::from("alpha".to_string()),
        cwd: None,
        started_at: 1_000,
        model: None,
        session_name: None,
        is_ephemeral: false,
        expires_at: None,
        state: SessionState::Live,
    };
    assert!(!session.is_expired(u64::MAX));
}
