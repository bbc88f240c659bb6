use super::*;
use crate::event::PositionEvent;
use crate::state::test_helpers;
use serde_json::json;
use tokio::time::{Duration, timeout};

async fn assert_channel_has_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

fn command(event: &str, payload: serde_json::Value) -> (SyncCommand, Data) {
    let data = payload.as_object().cloned().expect("object payload");
    let frame = Frame::new(event, data.clone());
    (SyncCommand::from_frame(&frame).expect("valid command"), data)
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

#[tokio::test]
async fn join_creates_session_and_is_idempotent() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;

    assert_eq!(join_session(&state, "X", client).await.expect("join"), 1);
    assert_eq!(join_session(&state, "X", client).await.expect("rejoin"), 1);
    assert_eq!(current_session(&state, client).await.as_deref(), Some("X"));
    assert!(state.sessions.read().await.contains_key("X"));
}

#[tokio::test]
async fn join_unregistered_client_fails() {
    let state = test_helpers::test_app_state();
    let err = join_session(&state, "X", Uuid::new_v4()).await.expect_err("unknown");
    assert!(matches!(err, SessionError::UnknownClient(_)));
    assert!(state.sessions.read().await.is_empty());
}

#[tokio::test]
async fn joining_another_session_parts_the_previous_one() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;

    join_session(&state, "X", client).await.expect("join X");
    join_session(&state, "Y", client).await.expect("join Y");

    let sessions = state.sessions.read().await;
    assert!(sessions["X"].members.is_empty());
    assert!(sessions["Y"].members.contains_key(&client));
}

#[tokio::test]
async fn leave_removes_member_but_keeps_session() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", client).await.expect("join");

    assert!(leave_session(&state, "X", client).await);
    assert!(!leave_session(&state, "X", client).await);
    assert_eq!(current_session(&state, client).await, None);
    assert!(state.sessions.read().await["X"].members.is_empty());
}

#[tokio::test]
async fn disconnect_removes_member_and_keeps_dedup_record() {
    let state = test_helpers::test_app_state();
    let (leader, _rx_leader) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", leader).await.expect("join");

    let (cmd, data) = command("syncLine", json!({"sessionId": "X", "lineIndex": 1, "id": "L1"}));
    dispatch(&state, cmd, data).await;
    disconnect(&state, leader).await;

    assert!(state.clients.read().await.is_empty());
    let sessions = state.sessions.read().await;
    let session = &sessions["X"];
    assert!(session.members.is_empty());
    assert!(session.dedup.contains(&EventId::from("L1")));
}

// =============================================================================
// DISPATCH
// =============================================================================

#[tokio::test]
async fn dispatch_broadcasts_payload_unchanged_to_all_members() {
    let state = test_helpers::test_app_state();
    let (leader, mut rx_leader) = test_helpers::connect_client(&state).await;
    let (follower, mut rx_follower) = test_helpers::connect_client(&state).await;
    let (outsider, mut rx_outsider) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", leader).await.expect("join");
    join_session(&state, "X", follower).await.expect("join");
    join_session(&state, "Y", outsider).await.expect("join");

    let (cmd, data) = command(
        "syncLine",
        json!({"sessionId": "X", "lineIndex": 2, "id": "L1", "timestamp": 10, "extra": "kept"}),
    );
    let result = dispatch(&state, cmd, data.clone()).await;

    assert_eq!(result.status, AckStatus::Broadcasted);
    assert_eq!(result.recipients, 2);
    assert_eq!(result.sync_id.as_str(), "L1");

    for rx in [&mut rx_leader, &mut rx_follower] {
        let frame = assert_channel_has_frame(rx).await;
        assert_eq!(frame.event, "lineUpdated");
        assert_eq!(frame.data, data);
    }
    assert_channel_empty(&mut rx_outsider).await;
}

#[tokio::test]
async fn hedge_and_retransmit_are_not_rebroadcast() {
    let state = test_helpers::test_app_state();
    let (follower, mut rx) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", follower).await.expect("join");

    let (original, data) = command("syncLine", json!({"sessionId": "X", "lineIndex": 2, "id": "L1"}));
    let (hedge, hedge_data) = command(
        "syncLine",
        json!({"sessionId": "X", "lineIndex": 2, "id": "L1_backup", "isBackup": true}),
    );

    assert_eq!(dispatch(&state, original.clone(), data.clone()).await.status, AckStatus::Broadcasted);
    let hedged = dispatch(&state, hedge, hedge_data).await;
    assert_eq!(hedged.status, AckStatus::DuplicateBackup);
    assert_eq!(hedged.recipients, 0);
    let retransmit = dispatch(&state, original, data).await;
    assert_eq!(retransmit.status, AckStatus::Duplicate);

    let frame = assert_channel_has_frame(&mut rx).await;
    assert_eq!(frame.data.get("lineIndex"), Some(&json!(2)));
    assert_channel_empty(&mut rx).await;
}

#[tokio::test]
async fn hedge_arriving_first_wins() {
    let state = test_helpers::test_app_state();
    let (follower, mut rx) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", follower).await.expect("join");

    let (hedge, hedge_data) = command(
        "syncWord",
        json!({"sessionId": "X", "lineIndex": 0, "wordIndex": 1, "id": "W1_backup", "isBackup": true}),
    );
    let (original, data) = command("syncWord", json!({"sessionId": "X", "lineIndex": 0, "wordIndex": 1, "id": "W1"}));

    assert_eq!(dispatch(&state, hedge, hedge_data).await.status, AckStatus::Broadcasted);
    assert_eq!(dispatch(&state, original, data).await.status, AckStatus::Duplicate);

    let frame = assert_channel_has_frame(&mut rx).await;
    assert_eq!(frame.event, "wordUpdated");
    assert_channel_empty(&mut rx).await;
}

#[tokio::test]
async fn missing_id_is_stamped_before_broadcast() {
    let state = test_helpers::test_app_state();
    let (follower, mut rx) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", follower).await.expect("join");

    let (cmd, data) = command("updateAutoScrollSpeed", json!({"sessionId": "X", "speedSeconds": 5}));
    assert!(cmd.meta.is_none());
    let result = dispatch(&state, cmd, data).await;

    assert!(result.sync_id.as_str().starts_with("speed_update_"));
    let frame = assert_channel_has_frame(&mut rx).await;
    assert_eq!(frame.event, "autoScrollSpeedUpdated");
    assert_eq!(frame.str_field("id"), Some(result.sync_id.as_str()));
    assert!(frame.data.get("timestamp").and_then(serde_json::Value::as_i64).is_some());
}

#[tokio::test]
async fn dispatch_to_unknown_session_reaches_nobody() {
    let state = test_helpers::test_app_state();
    let (cmd, data) = command("syncLine", json!({"sessionId": "ghost", "lineIndex": 0, "id": "L1"}));

    let result = dispatch(&state, cmd, data).await;
    assert_eq!(result.recipients, 0);
    assert!(state.sessions.read().await.is_empty());
}

#[tokio::test]
async fn dedup_window_evicts_oldest_per_session() {
    let state = test_helpers::test_app_state();
    let (follower, _rx) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", follower).await.expect("join");

    for n in 0..=50 {
        let (cmd, data) = command("syncLine", json!({"sessionId": "X", "lineIndex": 0, "id": format!("e{n}")}));
        dispatch(&state, cmd, data).await;
    }
    let (again, data) = command("syncLine", json!({"sessionId": "X", "lineIndex": 0, "id": "e0"}));
    assert_eq!(dispatch(&state, again, data).await.status, AckStatus::Broadcasted);
}

// =============================================================================
// TERMINATION
// =============================================================================

#[tokio::test]
async fn end_session_broadcasts_then_clears_state() {
    let state = test_helpers::test_app_state();
    let (leader, mut rx_leader) = test_helpers::connect_client(&state).await;
    let (follower, mut rx_follower) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", leader).await.expect("join");
    join_session(&state, "X", follower).await.expect("join");

    let meta = EventMeta { id: EventId::from("E1"), timestamp: 1, is_backup: false };
    let frame = PositionEvent::SessionEnd.command_frame("X", &meta);
    let cmd = SyncCommand::from_frame(&frame).expect("valid");
    let result = dispatch(&state, cmd, frame.data.clone()).await;
    assert_eq!(result.recipients, 2);

    for rx in [&mut rx_leader, &mut rx_follower] {
        let ended = assert_channel_has_frame(rx).await;
        assert_eq!(ended.event, "sessionEnded");
        assert_eq!(ended.session_id(), Some("X"));
    }
    assert!(!state.sessions.read().await.contains_key("X"));
    assert_eq!(current_session(&state, follower).await, None);

    let hedge = PositionEvent::SessionEnd.command_frame("X", &meta.hedge());
    let cmd = SyncCommand::from_frame(&hedge).expect("valid");
    assert_eq!(dispatch(&state, cmd, hedge.data.clone()).await.recipients, 0);
    assert_channel_empty(&mut rx_follower).await;
}

#[tokio::test]
async fn terminate_unknown_session_is_noop() {
    let state = test_helpers::test_app_state();
    assert_eq!(terminate(&state, "ghost").await, 0);
}

#[tokio::test]
async fn rejoin_after_termination_starts_fresh() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;
    join_session(&state, "X", client).await.expect("join");
    let (cmd, data) = command("syncLine", json!({"sessionId": "X", "lineIndex": 0, "id": "L1"}));
    dispatch(&state, cmd.clone(), data.clone()).await;

    terminate(&state, "X").await;
    join_session(&state, "X", client).await.expect("rejoin");

    assert_eq!(dispatch(&state, cmd, data).await.status, AckStatus::Broadcasted);
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

#[tokio::test]
async fn snapshot_lists_sessions_sorted() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (b, _rx_b) = test_helpers::connect_client(&state).await;
    join_session(&state, "beta", a).await.expect("join");
    join_session(&state, "alpha", b).await.expect("join");

    let snap = snapshot(&state).await;
    assert_eq!(snap.connected, 2);
    let ids: Vec<&str> = snap.sessions.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);

    let json = serde_json::to_value(&snap).expect("serialize");
    assert_eq!(json["sessions"][0]["recordedEvents"], 0);
    assert_eq!(json["sessions"][0]["members"], 1);
}
