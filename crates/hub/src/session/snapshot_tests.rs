// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::codec::ModelRef;

fn ev(seq: u64, kind: ProducerEvent) -> Event {
    Event { seq, ts: None, ingest_ts: seq, kind }
}

#[test]
fn replay_equivalence_split_at_any_point() {
    let events = vec![
        ev(1, ProducerEvent::Heartbeat {
            active: true,
            model: Some(ModelRef { provider: "anthropic".into(), id: "claude".into() }),
            thinking_level: None,
            token_usage: None,
            session_name: Some("first".into()),
            pending_question: None,
            todo_list: None,
            provider_usage: None,
        }),
        ev(2, ProducerEvent::MessageStart { message_id: "m1".into(), role: "assistant".into() }),
        ev(3, ProducerEvent::MessageUpdate {
            message_id: "m1".into(),
            partial: serde_json::json!({"type": "text_delta", "content": "Hel"}),
        }),
        ev(4, ProducerEvent::MessageUpdate {
            message_id: "m1".into(),
            partial: serde_json::json!({"type": "text_delta", "content": "Hello"}),
        }),
        ev(5, ProducerEvent::MessageEnd { message_id: "m1".into() }),
        ev(6, ProducerEvent::TodoUpdate {
            todo_list: vec![crate::codec::TodoItem { text: "write tests".into(), done: false }],
        }),
        ev(7, ProducerEvent::AgentEnd { exit_code: Some(0) }),
    ];

    let full = fold_all(&events);

    for split in 0..=events.len() {
        let (prefix, suffix) = events.split_at(split);
        let sigma = fold_all(prefix);
        let mut incremental = sigma.clone();
        for event in suffix {
            apply(&mut incremental, event);
        }
        assert_eq!(incremental, full, "split at {split} diverged from full fold");
    }
}

#[test]
fn message_update_after_end_still_merges_but_message_stays_ended() {
    let mut snap = SessionSnapshot::default();
    apply(&mut snap, &ev(1, ProducerEvent::MessageStart { message_id: "m1".into(), role: "assistant".into() }));
    apply(&mut snap, &ev(2, ProducerEvent::MessageEnd { message_id: "m1".into() }));
    assert!(snap.messages[0].ended);
}

#[test]
fn heartbeat_active_flag_tracks_latest() {
    let mut snap = SessionSnapshot::default();
    apply(&mut snap, &ev(1, ProducerEvent::Heartbeat {
        active: true,
        model: None,
        thinking_level: None,
        token_usage: None,
        session_name: None,
        pending_question: None,
        todo_list: None,
        provider_usage: None,
    }));
    assert!(snap.is_active);
    apply(&mut snap, &ev(2, ProducerEvent::Disconnected { reason: Some("heartbeat timeout".into()) }));
    assert!(!snap.is_active);
}

#[test]
fn set_session_name_last_writer_wins() {
    let mut snap = SessionSnapshot::default();
    apply(&mut snap, &ev(1, ProducerEvent::Heartbeat {
        active: true,
        model: None,
        thinking_level: None,
        token_usage: None,
        session_name: Some("from-heartbeat".into()),
        pending_question: None,
        todo_list: None,
        provider_usage: None,
    }));
    assert_eq!(snap.session_name.as_deref(), Some("from-heartbeat"));

    apply(&mut snap, &ev(2, ProducerEvent::ExecResult {
        command: "set_session_name".into(),
        result: serde_json::json!({"sessionName": "from-exec"}),
        ok: true,
    }));
    assert_eq!(snap.session_name.as_deref(), Some("from-exec"));

    // A later heartbeat without a name change must not clobber it back.
    apply(&mut snap, &ev(3, ProducerEvent::Heartbeat {
        active: true,
        model: None,
        thinking_level: None,
        token_usage: None,
        session_name: None,
        pending_question: None,
        todo_list: None,
        provider_usage: None,
    }));
    assert_eq!(snap.session_name.as_deref(), Some("from-exec"));
}
