//! One persistent WebSocket per participant.
//!
//! DESIGN
//! ======
//! `Connection::connect` spawns a driver task that owns the socket. Callers
//! talk to it through a cloneable `ConnectionHandle` (send, status, retry)
//! and read inbound traffic from `Streams`, handed out exactly once.
//!
//! Position broadcasts share one stream so that cross-kind order survives
//! (`lineUpdated` must land before the `wordUpdated` that follows it).
//!
//! RECONNECT
//! =========
//! On an unexpected disconnect the driver retries with capped exponential
//! backoff. After `max_attempts` consecutive failures it parks in
//! `Exhausted` until `retry()` resets the counter. An HTTP 401/403 on the
//! handshake parks in `Rejected` without retrying. Every successful
//! (re)connect re-joins the configured session, and re-sends the join once
//! if no `sessionJoined` arrives within `join_timeout`.

use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_HUB_URL;
use crate::event::{EventKind, ReceivedEvent};
use crate::frame::{Frame, JOIN_SESSION};
use crate::net::reply::Reply;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_STREAM_BUFFER: usize = 256;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("authentication credential required")]
    MissingCredential,
    #[error("credential is not a valid header value")]
    InvalidCredential,
    #[error("hub rejected the credential")]
    Rejected,
    #[error("reconnect attempts exhausted")]
    Exhausted,
    #[error("invalid hub url: {0}")]
    InvalidUrl(String),
    #[error("inbound streams already taken")]
    StreamsTaken,
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
    #[error("frame encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ConnectionError {
    /// True for the failures that retrying cannot fix.
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::MissingCredential | Self::InvalidCredential | Self::Rejected)
    }
}

impl crate::frame::ErrorCode for ConnectionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingCredential | Self::InvalidCredential | Self::Rejected => "E_AUTHENTICATION",
            Self::Exhausted => "E_CONNECTION_EXHAUSTED",
            Self::InvalidUrl(_) => "E_INVALID_URL",
            Self::StreamsTaken => "E_STREAMS_TAKEN",
            Self::Closed | Self::WebSocket(_) => "E_CONNECTION",
            Self::Encode(_) => "E_ENCODE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Closed | Self::WebSocket(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Gave up reconnecting; needs `retry()`.
    Exhausted,
    /// Handshake refused the credential; needs `retry()`.
    Rejected,
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(1000), max: Duration::from_millis(5000), max_attempts: 10 }
    }
}

impl Backoff {
    /// Delay before reconnect attempt `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1_u32 << exp).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub url: String,
    pub token: Option<String>,
    /// Session to (re)join after every connect.
    pub session_id: Option<String>,
    pub backoff: Backoff,
    pub join_timeout: Duration,
    pub buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_HUB_URL.to_string(),
            token: None,
            session_id: None,
            backoff: Backoff::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

/// Inbound traffic, in receipt order.
#[derive(Debug)]
pub struct Streams {
    pub positions: mpsc::Receiver<ReceivedEvent>,
    pub replies: mpsc::Receiver<Reply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Retry,
    Reconnect,
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Owns the driver task; dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    streams: Option<Streams>,
    driver: JoinHandle<()>,
}

impl Connection {
    /// Start connecting. Returns immediately; watch `status()` for progress.
    ///
    /// # Errors
    ///
    /// Returns `MissingCredential` if no token is configured and `InvalidUrl`
    /// if the hub URL cannot form a WebSocket request. Nothing is attempted
    /// on the network in either case.
    pub fn connect(config: ConnectionConfig) -> Result<Self, ConnectionError> {
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConnectionError::MissingCredential)?
            .to_owned();
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| ConnectionError::InvalidCredential)?;
        config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;

        let buffer = config.buffer.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (positions_tx, positions_rx) = mpsc::channel(buffer);
        let (replies_tx, replies_rx) = mpsc::channel(buffer);

        let driver = Driver { config, token, outbound_rx, control_rx, status_tx, positions_tx, replies_tx };
        let driver = tokio::spawn(driver.run());

        Ok(Self {
            handle: ConnectionHandle { outbound: outbound_tx, status: status_rx, control: control_tx },
            streams: Some(Streams { positions: positions_rx, replies: replies_rx }),
            driver,
        })
    }

    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Hand out the inbound streams. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// Returns `StreamsTaken` on every call after the first.
    pub fn take_streams(&mut self) -> Result<Streams, ConnectionError> {
        self.streams.take().ok_or(ConnectionError::StreamsTaken)
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        self.handle.connected()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// Reset the attempt counter and reconnect now if parked.
    pub fn retry(&self) {
        self.handle.retry();
    }

    /// Tear down the current socket and open a fresh one.
    pub fn reconnect(&self) {
        self.handle.reconnect();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// =============================================================================
// HANDLE
// =============================================================================

#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Frame>,
    status: watch::Receiver<ConnectionStatus>,
    control: mpsc::Sender<Control>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        if self.outbound.is_closed() {
            return ConnectionStatus::Disconnected;
        }
        *self.status.borrow()
    }

    #[must_use]
    pub fn connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Best-effort send. Returns false when the frame was not queued.
    pub fn send(&self, frame: Frame) -> bool {
        if !self.connected() {
            debug!(event = %frame.event, "send skipped: not connected");
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "send dropped: outbound queue unavailable");
                false
            }
        }
    }

    pub fn retry(&self) {
        if self.control.try_send(Control::Retry).is_err() {
            debug!("retry ignored: driver busy or gone");
        }
    }

    pub fn reconnect(&self) {
        if self.control.try_send(Control::Reconnect).is_err() {
            debug!("reconnect ignored: driver busy or gone");
        }
    }

    /// Wait until the status satisfies `want`. `None` once the driver is gone.
    pub async fn wait_for_status(&self, mut want: impl FnMut(ConnectionStatus) -> bool) -> Option<ConnectionStatus> {
        let mut rx = self.status.clone();
        rx.wait_for(|s| want(*s)).await.ok().map(|s| *s)
    }

    /// Wait for the first outcome of a connect cycle.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` or `Exhausted` when the driver parks, and `Closed`
    /// if the connection was dropped.
    pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
        let status = self
            .wait_for_status(|s| {
                matches!(s, ConnectionStatus::Connected | ConnectionStatus::Exhausted | ConnectionStatus::Rejected)
            })
            .await;
        match status {
            Some(ConnectionStatus::Connected) => Ok(()),
            Some(ConnectionStatus::Exhausted) => Err(ConnectionError::Exhausted),
            Some(ConnectionStatus::Rejected) => Err(ConnectionError::Rejected),
            _ => Err(ConnectionError::Closed),
        }
    }
}

// =============================================================================
// DRIVER
// =============================================================================

enum Exit {
    /// Every handle is gone.
    Dropped,
    /// Socket closed or errored.
    Lost,
    /// Caller asked for a fresh socket.
    Reconnect,
}

struct Driver {
    config: ConnectionConfig,
    token: String,
    outbound_rx: mpsc::Receiver<Frame>,
    control_rx: mpsc::Receiver<Control>,
    status_tx: watch::Sender<ConnectionStatus>,
    positions_tx: mpsc::Sender<ReceivedEvent>,
    replies_tx: mpsc::Sender<Reply>,
}

impl Driver {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            self.set_status(ConnectionStatus::Connecting);
            match open(&self.config.url, &self.token).await {
                Ok(stream) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);
                    info!(url = %self.config.url, "connected to hub");
                    match self.run_connected(stream).await {
                        Exit::Dropped => return,
                        Exit::Reconnect => continue,
                        Exit::Lost => {
                            self.set_status(ConnectionStatus::Disconnected);
                            // Frames queued for the dead socket are stale by now.
                            while self.outbound_rx.try_recv().is_ok() {}
                            warn!(url = %self.config.url, "connection to hub lost");
                        }
                    }
                }
                Err(ConnectionError::Rejected) => {
                    warn!(url = %self.config.url, "hub rejected credential; not retrying");
                    self.set_status(ConnectionStatus::Rejected);
                    if !self.wait_for_retry().await {
                        return;
                    }
                    attempt = 0;
                    continue;
                }
                Err(e) => {
                    self.set_status(ConnectionStatus::Disconnected);
                    warn!(attempt, error = %e, "connect failed");
                }
            }

            attempt = attempt.saturating_add(1);
            if attempt > self.config.backoff.max_attempts {
                warn!(attempts = self.config.backoff.max_attempts, "reconnect attempts exhausted");
                self.set_status(ConnectionStatus::Exhausted);
                if !self.wait_for_retry().await {
                    return;
                }
                attempt = 0;
                continue;
            }

            let delay = self.config.backoff.delay(attempt);
            debug!(attempt, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "reconnecting after backoff");
            tokio::select! {
                () = sleep(delay) => {}
                ctrl = self.control_rx.recv() => {
                    if ctrl.is_none() {
                        return;
                    }
                    attempt = 0;
                }
            }
        }
    }

    async fn run_connected(&mut self, stream: WsStream) -> Exit {
        let (mut write, mut read) = stream.split();

        let mut join_deadline: Option<Instant> = None;
        let mut join_resent = false;
        if let Some(session_id) = self.config.session_id.clone() {
            if send_text(&mut write, &join_frame(&session_id)).await.is_err() {
                return Exit::Lost;
            }
            join_deadline = Some(Instant::now() + self.config.join_timeout);
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    let Some(Ok(msg)) = msg else { return Exit::Lost };
                    match msg {
                        Message::Text(text) => {
                            if self.route_inbound(text.as_str()) {
                                join_deadline = None;
                            }
                        }
                        Message::Close(_) => return Exit::Lost,
                        _ => {}
                    }
                }
                outbound = self.outbound_rx.recv() => {
                    let Some(frame) = outbound else { return Exit::Dropped };
                    if send_text(&mut write, &frame).await.is_err() {
                        return Exit::Lost;
                    }
                }
                () = sleep_until(join_deadline.unwrap_or_else(Instant::now)), if join_deadline.is_some() => {
                    join_deadline = None;
                    if !join_resent {
                        join_resent = true;
                        if let Some(session_id) = self.config.session_id.clone() {
                            warn!(%session_id, "no sessionJoined; resending join");
                            if send_text(&mut write, &join_frame(&session_id)).await.is_err() {
                                return Exit::Lost;
                            }
                        }
                    }
                }
                ctrl = self.control_rx.recv() => match ctrl {
                    None => return Exit::Dropped,
                    Some(Control::Reconnect) => {
                        if let Err(e) = write.close().await {
                            debug!(error = %e, "close during reconnect failed");
                        }
                        return Exit::Reconnect;
                    }
                    Some(Control::Retry) => {}
                },
            }
        }
    }

    /// Route one inbound frame. Returns true when it confirmed the join.
    fn route_inbound(&self, text: &str) -> bool {
        let frame = match Frame::from_text(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "invalid frame from hub");
                return false;
            }
        };

        if EventKind::from_broadcast(&frame.event).is_some() {
            match ReceivedEvent::from_frame(&frame) {
                Ok(event) => match self.positions_tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!(event = %frame.event, "position stream full; event dropped"),
                    Err(TrySendError::Closed(_)) => debug!(event = %frame.event, "position stream closed"),
                },
                Err(e) => warn!(event = %frame.event, error = %e, "malformed broadcast from hub"),
            }
            return false;
        }

        let Some(reply) = Reply::from_frame(&frame) else {
            debug!(event = %frame.event, "ignoring unknown frame");
            return false;
        };
        let joined = matches!(reply, Reply::Joined { .. });
        if let Reply::Error { code, message, .. } = &reply {
            warn!(code = code.as_deref().unwrap_or("-"), %message, "hub reported error");
        }
        if self.replies_tx.try_send(reply).is_err() {
            debug!(event = %frame.event, "reply stream full or closed");
        }
        joined
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    /// Park until `retry()`/`reconnect()`. False once every handle is gone.
    async fn wait_for_retry(&mut self) -> bool {
        self.control_rx.recv().await.is_some()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn join_frame(session_id: &str) -> Frame {
    Frame::bare(JOIN_SESSION).with_session_id(session_id)
}

async fn open(url: &str, token: &str) -> Result<WsStream, ConnectionError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| ConnectionError::InvalidCredential)?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    match connect_async(request).await {
        Ok((stream, _)) => Ok(stream),
        Err(tungstenite::Error::Http(response))
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            Err(ConnectionError::Rejected)
        }
        Err(e) => Err(ConnectionError::WebSocket(Box::new(e))),
    }
}

async fn send_text(write: &mut WsWrite, frame: &Frame) -> Result<(), ConnectionError> {
    let text = frame.to_text()?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| ConnectionError::WebSocket(Box::new(e)))
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
