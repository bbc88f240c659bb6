//! End-to-end: a real hub on a loopback port with real participant
//! connections.

use std::sync::Arc;
use std::time::Duration;

use rehearsal_sync::catalog::{MemoryCatalog, Song, SongCatalog, Word};
use rehearsal_sync::config::HubConfig;
use rehearsal_sync::frame::AckStatus;
use rehearsal_sync::net::connection::{Backoff, Connection, ConnectionConfig, ConnectionStatus, Streams};
use rehearsal_sync::net::reliable::{HedgePolicy, ReliableEmitter};
use rehearsal_sync::net::reply::Reply;
use rehearsal_sync::position::PositionState;
use rehearsal_sync::position::follower::Follower;
use rehearsal_sync::position::leader::{Leader, LeaderCommand};
use rehearsal_sync::routes;
use rehearsal_sync::state::AppState;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;

const SESSION: &str = "current-rehearsal";
const WAIT: Duration = Duration::from_secs(5);

async fn serve(listener: TcpListener) {
    let app = routes::app(AppState::new(HubConfig::default()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("hub");
    });
}

async fn spawn_hub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    serve(listener).await;
    format!("ws://{addr}/api/ws")
}

fn catalog() -> Arc<dyn SongCatalog> {
    let line = |words: &[&str]| words.iter().map(|w| Word::new(*w)).collect::<Vec<_>>();
    Arc::new(MemoryCatalog::new().with_song(Song::new(
        "hey_jude",
        vec![line(&["Hey", "Jude"]), line(&["don't", "make", "it", "bad"])],
    )))
}

fn config(url: &str) -> ConnectionConfig {
    ConnectionConfig {
        url: url.to_owned(),
        token: Some("band-token".into()),
        session_id: Some(SESSION.into()),
        ..ConnectionConfig::default()
    }
}

/// Connect and wait until the hub confirms the session join.
async fn join(url: &str) -> (Connection, Streams) {
    let mut conn = Connection::connect(config(url)).expect("connect");
    let mut streams = conn.take_streams().expect("streams");
    timeout(WAIT, async {
        while let Some(reply) = streams.replies.recv().await {
            if matches!(reply, Reply::Joined { .. }) {
                return;
            }
        }
        panic!("reply stream closed before join");
    })
    .await
    .expect("joined");
    (conn, streams)
}

async fn wait_state(rx: &mut watch::Receiver<PositionState>, want: impl FnMut(&PositionState) -> bool) -> PositionState {
    timeout(WAIT, rx.wait_for(want)).await.expect("state reached").expect("follower alive").clone()
}

#[tokio::test]
async fn handshake_without_credential_is_unauthorized() {
    let url = spawn_hub().await;
    let err = tokio_tungstenite::connect_async(url.as_str()).await.expect_err("must be rejected");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("unexpected error: {other}"),
    }

    let with_query = format!("{url}?token=abc");
    assert!(tokio_tungstenite::connect_async(with_query.as_str()).await.is_ok());
}

#[tokio::test]
async fn followers_mirror_leader_and_stop_on_session_end() {
    let url = spawn_hub().await;

    let mut followers = Vec::new();
    for _ in 0..2 {
        let (conn, streams) = join(&url).await;
        let follower = Follower::new(catalog());
        let rx = follower.subscribe();
        let task = tokio::spawn(follower.run(streams.positions));
        followers.push((conn, rx, task));
    }

    let (leader_conn, _leader_streams) = join(&url).await;
    let emitter = ReliableEmitter::new(leader_conn.handle(), SESSION, HedgePolicy::default());
    let mut leader = Leader::new(emitter, catalog());

    leader.handle(LeaderCommand::Speed(5.0)).await.expect("speed");
    leader.handle(LeaderCommand::SelectSong("hey_jude".into())).await.expect("song");
    leader.handle(LeaderCommand::SelectWord { line: 1, word: 2 }).await.expect("word");

    for (_, rx, _) in &mut followers {
        let state = wait_state(rx, |s| s.active_line_index == Some(1) && s.active_word_index == 2).await;
        assert!((state.auto_scroll_speed_seconds - 5.0).abs() < f64::EPSILON);
        assert_eq!(state.selected_song_id.as_deref(), Some("hey_jude"));
        assert_eq!(&state, leader.state());
    }

    leader.handle(LeaderCommand::EndSession).await.expect("end");
    for (_, _, task) in followers {
        timeout(WAIT, task).await.expect("follower stops").expect("join");
    }
}

#[tokio::test]
async fn hedge_copy_is_acked_as_duplicate_and_not_rebroadcast() {
    let url = spawn_hub().await;
    let (_follower_conn, mut follower_streams) = join(&url).await;
    let (leader_conn, mut leader_streams) = join(&url).await;

    let mut emitter = ReliableEmitter::new(leader_conn.handle(), SESSION, HedgePolicy::default());
    let meta = emitter.emit(&rehearsal_sync::event::PositionEvent::SpeedUpdate { speed_seconds: 7.0 });

    let mut statuses = Vec::new();
    timeout(WAIT, async {
        while statuses.len() < 2 {
            if let Some(Reply::Ack { sync_id, status, .. }) = leader_streams.replies.recv().await {
                statuses.push((sync_id, status));
            }
        }
    })
    .await
    .expect("two acks");
    assert_eq!(statuses[0], (Some(meta.id.as_str().to_owned()), AckStatus::Broadcasted));
    assert_eq!(statuses[1], (Some(meta.id.hedge().as_str().to_owned()), AckStatus::DuplicateBackup));

    let first = timeout(WAIT, follower_streams.positions.recv()).await.expect("broadcast").expect("open");
    assert_eq!(first.meta.map(|m| m.id), Some(meta.id));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(follower_streams.positions.try_recv().is_err(), "hedge must not be rebroadcast");
}

#[tokio::test]
async fn debug_endpoint_lists_session_members() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    serve(listener).await;
    let url = format!("ws://{addr}/api/ws");

    let _a = join(&url).await;
    let _b = join(&url).await;

    let body: serde_json::Value = reqwest::get(format!("http://{addr}/api/debug/sessions"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["connected"], 2);
    assert_eq!(body["sessions"][0]["sessionId"], SESSION);
    assert_eq!(body["sessions"][0]["members"], 2);
}

#[tokio::test]
async fn exhausted_connection_recovers_on_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let url = format!("ws://{addr}/api/ws");

    let conn = Connection::connect(ConnectionConfig {
        backoff: Backoff { base: Duration::from_millis(5), max: Duration::from_millis(20), max_attempts: 2 },
        ..config(&url)
    })
    .expect("connect");
    let handle = conn.handle();
    let parked = timeout(WAIT, handle.wait_connected()).await.expect("parks");
    assert!(parked.is_err());
    assert_eq!(handle.status(), ConnectionStatus::Exhausted);

    serve(TcpListener::bind(addr).await.expect("rebind")).await;
    handle.retry();
    timeout(WAIT, handle.wait_for_status(|s| s == ConnectionStatus::Connected))
        .await
        .expect("reconnects")
        .expect("driver alive");
    assert!(handle.connected());
}
