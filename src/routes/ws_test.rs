use super::*;
use crate::state::test_helpers;
use serde_json::json;
use tokio::time::{Duration, timeout};

async fn recv_broadcast(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("broadcast receive timed out")
        .expect("broadcast channel closed unexpectedly")
}

async fn assert_no_broadcast(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no broadcast frame"
    );
}

async fn send(state: &AppState, client_id: Uuid, value: serde_json::Value) -> Frame {
    let mut replies = process_inbound_text(state, client_id, &value.to_string()).await;
    assert_eq!(replies.len(), 1, "every inbound frame gets exactly one reply");
    replies.remove(0)
}

#[tokio::test]
async fn invalid_json_gets_error_reply() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;

    let replies = process_inbound_text(&state, client, "{not json").await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].event, "error");
    assert_eq!(replies[0].str_field("code"), Some("E_MALFORMED_EVENT"));
}

#[tokio::test]
async fn join_replies_with_member_count() {
    let state = test_helpers::test_app_state();
    let (a, _rx_a) = test_helpers::connect_client(&state).await;
    let (b, _rx_b) = test_helpers::connect_client(&state).await;

    let first = send(&state, a, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;
    assert_eq!(first.event, "sessionJoined");
    assert_eq!(first.session_id(), Some("X"));
    assert_eq!(first.data.get("memberCount"), Some(&json!(1)));

    let second = send(&state, b, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;
    assert_eq!(second.data.get("memberCount"), Some(&json!(2)));
}

#[tokio::test]
async fn join_without_session_id_is_error() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;

    let reply = send(&state, client, json!({"event": "joinSession", "data": {}})).await;
    assert_eq!(reply.event, "error");
    assert_eq!(reply.str_field("code"), Some("E_MALFORMED_EVENT"));
    assert!(state.sessions.read().await.is_empty());
}

#[tokio::test]
async fn sync_line_is_acked_and_broadcast_to_session() {
    let state = test_helpers::test_app_state();
    let (leader, mut rx_leader) = test_helpers::connect_client(&state).await;
    let (follower, mut rx_follower) = test_helpers::connect_client(&state).await;
    send(&state, leader, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;
    send(&state, follower, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;

    let ack = send(
        &state,
        leader,
        json!({"event": "syncLine", "data": {"sessionId": "X", "lineIndex": 2, "id": "L1", "timestamp": 1}}),
    )
    .await;
    assert_eq!(ack.event, "ack");
    assert_eq!(ack.str_field("status"), Some("broadcasted"));
    assert_eq!(ack.str_field("syncId"), Some("L1"));
    assert_eq!(ack.data.get("recipients"), Some(&json!(2)));

    let seen = recv_broadcast(&mut rx_follower).await;
    assert_eq!(seen.event, "lineUpdated");
    assert_eq!(seen.data.get("lineIndex"), Some(&json!(2)));
    assert_eq!(recv_broadcast(&mut rx_leader).await.event, "lineUpdated");
}

#[tokio::test]
async fn hedge_is_acked_as_duplicate_backup() {
    let state = test_helpers::test_app_state();
    let (leader, _rx) = test_helpers::connect_client(&state).await;
    let (follower, mut rx_follower) = test_helpers::connect_client(&state).await;
    send(&state, leader, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;
    send(&state, follower, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;

    send(&state, leader, json!({"event": "syncLine", "data": {"sessionId": "X", "lineIndex": 2, "id": "L1"}})).await;
    let hedge_ack = send(
        &state,
        leader,
        json!({"event": "syncLine", "data": {"sessionId": "X", "lineIndex": 2, "id": "L1_backup", "isBackup": true}}),
    )
    .await;
    assert_eq!(hedge_ack.str_field("status"), Some("duplicate_backup"));
    assert_eq!(hedge_ack.data.get("success"), Some(&json!(true)));

    let retransmit_ack = send(
        &state,
        leader,
        json!({"event": "syncLine", "data": {"sessionId": "X", "lineIndex": 2, "id": "L1"}}),
    )
    .await;
    assert_eq!(retransmit_ack.str_field("status"), Some("duplicate"));

    recv_broadcast(&mut rx_follower).await;
    assert_no_broadcast(&mut rx_follower).await;
}

#[tokio::test]
async fn malformed_sync_is_rejected_and_not_broadcast() {
    let state = test_helpers::test_app_state();
    let (leader, _rx) = test_helpers::connect_client(&state).await;
    let (follower, mut rx_follower) = test_helpers::connect_client(&state).await;
    send(&state, follower, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;

    let reply = send(&state, leader, json!({"event": "syncWord", "data": {"sessionId": "X", "lineIndex": 1}})).await;
    assert_eq!(reply.event, "error");
    assert_eq!(reply.str_field("code"), Some("E_MALFORMED_EVENT"));
    assert_eq!(reply.data.get("success"), Some(&json!(false)));
    assert_no_broadcast(&mut rx_follower).await;
}

#[tokio::test]
async fn unknown_event_is_rejected() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;

    let reply = send(&state, client, json!({"event": "teleport", "data": {}})).await;
    assert_eq!(reply.str_field("code"), Some("E_UNKNOWN_EVENT"));
}

#[tokio::test]
async fn end_session_notifies_members_and_clears_session() {
    let state = test_helpers::test_app_state();
    let (leader, _rx_leader) = test_helpers::connect_client(&state).await;
    let (follower, mut rx_follower) = test_helpers::connect_client(&state).await;
    send(&state, leader, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;
    send(&state, follower, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;

    let ack = send(&state, leader, json!({"event": "endSession", "data": {"sessionId": "X"}})).await;
    assert_eq!(ack.event, "ack");

    let ended = recv_broadcast(&mut rx_follower).await;
    assert_eq!(ended.event, "sessionEnded");
    assert_eq!(ended.session_id(), Some("X"));
    assert!(state.sessions.read().await.is_empty());
}

#[tokio::test]
async fn leave_session_reports_membership() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;
    send(&state, client, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;

    let left = send(&state, client, json!({"event": "leaveSession", "data": {"sessionId": "X"}})).await;
    assert_eq!(left.event, "sessionLeft");
    assert_eq!(left.data.get("wasMember"), Some(&json!(true)));
}

#[tokio::test]
async fn ping_reports_current_session() {
    let state = test_helpers::test_app_state();
    let (client, _rx) = test_helpers::connect_client(&state).await;
    send(&state, client, json!({"event": "joinSession", "data": {"sessionId": "X"}})).await;

    let pong = send(&state, client, json!({"event": "ping"})).await;
    assert_eq!(pong.event, "pong");
    assert_eq!(pong.str_field("connectionId"), Some(client.to_string().as_str()));
    assert_eq!(pong.data.get("sessions"), Some(&json!(["X"])));
}
