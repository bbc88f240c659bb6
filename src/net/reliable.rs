//! Reliable emit: send a command now, then hedge it shortly after.
//!
//! Every emitted command gets a fresh event id. After `delay` a copy marked
//! `isBackup` with id `<id>_backup` goes out, but only while the connection
//! is still up. Receivers keep whichever copy lands first; there is no
//! ack-driven retry.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{DEFAULT_HEDGE_COUNT, DEFAULT_HEDGE_DELAY_MS};
use crate::event::{EventMeta, PositionEvent};
use crate::net::connection::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HedgePolicy {
    pub delay: Duration,
    /// Hedge copies per command. Zero disables hedging.
    pub count: u32,
}

impl Default for HedgePolicy {
    fn default() -> Self {
        Self { delay: Duration::from_millis(DEFAULT_HEDGE_DELAY_MS), count: DEFAULT_HEDGE_COUNT }
    }
}

/// Pending hedges are aborted when the emitter is dropped.
pub struct ReliableEmitter {
    conn: ConnectionHandle,
    session_id: String,
    policy: HedgePolicy,
    pending: Vec<JoinHandle<()>>,
}

impl ReliableEmitter {
    pub fn new(conn: ConnectionHandle, session_id: impl Into<String>, policy: HedgePolicy) -> Self {
        Self { conn, session_id: session_id.into(), policy, pending: Vec::new() }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }

    /// Send `event` and schedule its hedge copies. Returns the envelope used.
    pub fn emit(&mut self, event: &PositionEvent) -> EventMeta {
        let meta = EventMeta::fresh(event.kind());
        let sent = self.conn.send(event.command_frame(&self.session_id, &meta));
        debug!(sync_id = %meta.id, event = event.kind().command(), sent, "emit");

        self.pending.retain(|task| !task.is_finished());
        if self.policy.count > 0 {
            let hedge = event.command_frame(&self.session_id, &meta.hedge());
            let conn = self.conn.clone();
            let policy = self.policy;
            self.pending.push(tokio::spawn(async move {
                for _ in 0..policy.count {
                    tokio::time::sleep(policy.delay).await;
                    if !conn.connected() {
                        debug!(event = %hedge.event, "hedge skipped: disconnected");
                        return;
                    }
                    conn.send(hedge.clone());
                }
            }));
        }
        meta
    }

    /// Hedges scheduled but not yet sent.
    #[must_use]
    pub fn pending_hedges(&self) -> usize {
        self.pending.iter().filter(|task| !task.is_finished()).count()
    }

    pub fn cancel_pending(&mut self) {
        for task in self.pending.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ReliableEmitter {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

#[cfg(test)]
#[path = "reliable_test.rs"]
mod tests;
