// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn event_flattens_seq_alongside_tagged_payload() {
    let event = Event {
        seq: 7,
        ts: Some(1_700_000_000),
        ingest_ts: 1_700_000_001,
        kind: ProducerEvent::Heartbeat {
            active: true,
            model: Some(ModelRef { provider: "anthropic".into(), id: "claude".into() }),
            thinking_level: None,
            token_usage: None,
            session_name: Some("fix-flaky-test".into()),
            pending_question: None,
            todo_list: None,
            provider_usage: None,
        },
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["seq"], 7);
    assert_eq!(value["type"], "heartbeat");
    assert_eq!(value["sessionName"], "fix-flaky-test");
    assert!(value.get("thinkingLevel").is_none());

    let round_tripped: Event = serde_json::from_value(value).unwrap();
    assert_eq!(round_tripped.seq, 7);
    assert_eq!(round_tripped.kind.type_name(), "heartbeat");
}

#[test]
fn unrecognized_frame_type_fails_to_deserialize() {
    let raw = serde_json::json!({"type": "not_a_real_kind", "foo": "bar"});
    let parsed: Result<ProducerEvent, _> = serde_json::from_value(raw);
    assert!(parsed.is_err());
}

#[test]
fn unknown_extra_fields_are_tolerated() {
    let raw = serde_json::json!({
        "type": "message_start",
        "messageId": "m1",
        "role": "assistant",
        "futureField": {"nested": true},
    });
    let parsed: ProducerEvent = serde_json::from_value(raw).expect("unknown fields are ignored");
    match parsed {
        ProducerEvent::MessageStart { message_id, role } => {
            assert_eq!(message_id, "m1");
            assert_eq!(role, "assistant");
        }
        other => panic!("unexpected variant: {other:?}"),
    }
}

#[test]
fn viewer_resync_round_trips_last_seq() {
    let raw = serde_json::json!({"type": "resync", "lastSeq": 42});
    let cmd: ViewerCommand = serde_json::from_value(raw).unwrap();
    match cmd {
        ViewerCommand::Resync { last_seq } => assert_eq!(last_seq, 42),
        other => panic!("unexpected variant: {other:?}"),
    }
}

#[test]
fn viewer_input_requires_deliver_as() {
    let raw = serde_json::json!({"type": "input", "text": "go"});
    let parsed: Result<ViewerCommand, _> = serde_json::from_value(raw);
    assert!(parsed.is_err(), "deliverAs has no default and must be explicit");
}

#[test]
fn runner_signal_maps_named_exit_codes() {
    assert_eq!(RunnerSignal::from_exit_code(43), Some(RunnerSignal::WorkerRestart));
    assert_eq!(RunnerSignal::from_exit_code(42), Some(RunnerSignal::RunnerRestart));
    assert_eq!(RunnerSignal::from_exit_code(1), None);
}

#[test]
fn terminal_frame_type_names_match_taxonomy() {
    assert_eq!(TerminalFrame::TerminalConnected { terminal_id: "t_1".into() }.type_name(), "terminal_connected");
    assert_eq!(TerminalFrame::KillTerminal.type_name(), "kill_terminal");
}

#[test]
fn producer_event_header_updating_kinds() {
    assert!(ProducerEvent::Capabilities { skills: vec![], terminal: false }.updates_header());
    assert!(!ProducerEvent::TurnEnd { turn_id: None }.updates_header());
}
