use super::*;
use tokio::time::timeout;

fn config_for(url: &str) -> ConnectionConfig {
    ConnectionConfig {
        url: url.to_string(),
        token: Some("secret".into()),
        backoff: Backoff { base: Duration::from_millis(5), max: Duration::from_millis(10), max_attempts: 2 },
        ..ConnectionConfig::default()
    }
}

async fn unused_local_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    format!("ws://127.0.0.1:{port}/api/ws")
}

#[test]
fn backoff_doubles_up_to_cap() {
    let backoff = Backoff::default();
    let delays: Vec<u128> = (1..=5).map(|n| backoff.delay(n).as_millis()).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 5000, 5000]);
    assert_eq!(backoff.delay(40), Duration::from_millis(5000));
    assert_eq!(backoff.max_attempts, 10);
}

#[test]
fn connect_without_credential_fails_before_network() {
    let err = Connection::connect(ConnectionConfig::default()).expect_err("no token");
    assert!(matches!(err, ConnectionError::MissingCredential));
    assert!(err.is_authentication());

    let blank = ConnectionConfig { token: Some("  ".into()), ..ConnectionConfig::default() };
    assert!(matches!(Connection::connect(blank), Err(ConnectionError::MissingCredential)));
}

#[test]
fn connect_rejects_unusable_url() {
    let err = Connection::connect(config_for("not a url")).expect_err("bad url");
    assert!(matches!(err, ConnectionError::InvalidUrl(_)));
    assert!(!err.is_authentication());
}

#[test]
fn error_codes() {
    use crate::frame::ErrorCode;
    assert_eq!(ConnectionError::Rejected.error_code(), "E_AUTHENTICATION");
    assert_eq!(ConnectionError::Exhausted.error_code(), "E_CONNECTION_EXHAUSTED");
    assert!(ConnectionError::Exhausted.retryable());
    assert!(!ConnectionError::Rejected.retryable());
}

#[tokio::test]
async fn unreachable_hub_ends_exhausted() {
    let conn = Connection::connect(config_for(&unused_local_url().await)).expect("connect");
    let result = timeout(Duration::from_secs(5), conn.handle().wait_connected())
        .await
        .expect("driver should park");
    assert!(matches!(result, Err(ConnectionError::Exhausted)));
    assert_eq!(conn.status(), ConnectionStatus::Exhausted);
    assert!(!conn.connected());
}

#[tokio::test]
async fn retry_after_exhaustion_starts_a_new_cycle() {
    let conn = Connection::connect(config_for(&unused_local_url().await)).expect("connect");
    let handle = conn.handle();
    timeout(Duration::from_secs(5), handle.wait_for_status(|s| s == ConnectionStatus::Exhausted))
        .await
        .expect("exhausted");

    let mut status = handle.status.clone();
    status.mark_unchanged();
    conn.retry();
    timeout(Duration::from_secs(5), status.changed())
        .await
        .expect("status should change after retry")
        .expect("driver alive");
    let ended = timeout(Duration::from_secs(5), handle.wait_connected()).await.expect("parks again");
    assert!(matches!(ended, Err(ConnectionError::Exhausted)));
}

#[tokio::test]
async fn streams_are_handed_out_once() {
    let mut conn = Connection::connect(config_for(&unused_local_url().await)).expect("connect");
    assert!(conn.take_streams().is_ok());
    assert!(matches!(conn.take_streams(), Err(ConnectionError::StreamsTaken)));
}

#[tokio::test]
async fn dropped_connection_reports_disconnected() {
    let conn = Connection::connect(config_for(&unused_local_url().await)).expect("connect");
    let handle = conn.handle();
    drop(conn);
    timeout(Duration::from_secs(1), async {
        while !handle.outbound.is_closed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("driver should stop");
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    assert!(!handle.send(Frame::bare("ping")));
}

#[tokio::test]
async fn loopback_send_follows_status() {
    let mut lb = test_helpers::loopback();
    assert!(lb.handle.send(Frame::bare("ping")));
    assert_eq!(lb.sent.recv().await.map(|f| f.event), Some("ping".to_owned()));

    lb.status.send_replace(ConnectionStatus::Disconnected);
    assert!(!lb.handle.send(Frame::bare("ping")));
    assert!(lb.sent.try_recv().is_err());
}
